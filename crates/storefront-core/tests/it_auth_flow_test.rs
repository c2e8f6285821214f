//! Integration tests for login, registration, logout and profile flows

use std::sync::Arc;

use mockito::{Matcher, Server};
use serde_json::json;
use storefront_core::api::RegisterRequest;
use storefront_core::{
    ApiClient, ApiError, ClientConfig, LoginRequest, MemorySessionStore, SessionEvent, SessionStore,
    UserProfile,
};

fn client(base_url: &str) -> (ApiClient, Arc<MemorySessionStore>) {
    let store = Arc::new(MemorySessionStore::new());
    let api = ApiClient::new(ClientConfig::new(base_url), store.clone()).expect("Failed to build client");
    (api, store)
}

#[tokio::test]
async fn login_stores_session() {
    //* Given
    let mut server = Server::new_async().await;

    let login = server
        .mock("POST", "/api/auth/login")
        .match_header("authorization", Matcher::Missing)
        .match_body(Matcher::Json(json!({"email": "jo@example.com", "password": "secret"})))
        .with_status(200)
        .with_body(
            r#"{"accessToken": "T1", "refreshToken": "R1",
                "user": {"id": 12, "email": "jo@example.com", "name": "Jo"}}"#,
        )
        .expect(1)
        .create_async()
        .await;

    let (api, store) = client(&server.url());

    //* When
    let session = api
        .login(&LoginRequest::new("jo@example.com", "secret"))
        .await
        .expect("Login failed");

    //* Then
    login.assert_async().await;
    assert_eq!(session.access_token, "T1");
    assert_eq!(store.access_token().as_deref(), Some("T1"));
    assert_eq!(store.refresh_token().as_deref(), Some("R1"));
    assert_eq!(store.user().and_then(|u| u.id).as_deref(), Some("12"));
    assert!(api.is_authenticated());
}

#[tokio::test]
async fn rejected_credentials_do_not_trigger_refresh() {
    //* Given
    let mut server = Server::new_async().await;

    let login = server
        .mock("POST", "/api/auth/login")
        .with_status(401)
        .with_body(r#"{"error": {"message": "Invalid email or password"}}"#)
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/api/auth/refresh")
        .expect(0)
        .create_async()
        .await;

    let (api, store) = client(&server.url());

    //* When
    let err = api
        .login(&LoginRequest::new("jo@example.com", "wrong"))
        .await
        .expect_err("Login should fail");

    //* Then
    login.assert_async().await;
    refresh.assert_async().await;
    assert_eq!(err.status(), Some(401));
    assert_eq!(err.user_message(), "Invalid email or password");
    assert!(store.snapshot().is_none());
}

#[tokio::test]
async fn invalid_login_input_never_reaches_server() {
    //* Given
    let mut server = Server::new_async().await;

    let login = server
        .mock("POST", "/api/auth/login")
        .expect(0)
        .create_async()
        .await;

    let (api, _store) = client(&server.url());

    //* When
    let err = api
        .login(&LoginRequest::new("", ""))
        .await
        .expect_err("Validation should fail");

    //* Then
    login.assert_async().await;
    match err {
        ApiError::ValidationError(errors) => {
            assert_eq!(errors.errors().len(), 2);
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn register_without_user_fetches_profile() {
    //* Given
    let mut server = Server::new_async().await;

    let register = server
        .mock("POST", "/api/auth/register")
        .match_body(Matcher::PartialJson(json!({"firstName": "Jo", "lastName": "Doe"})))
        .with_status(201)
        .with_body(r#"{"accessToken": "T1", "refreshToken": "R1"}"#)
        .expect(1)
        .create_async()
        .await;
    let profile = server
        .mock("GET", "/api/user/profile")
        .match_header("authorization", "Bearer T1")
        .with_status(200)
        .with_body(r#"{"user": {"id": "c-1", "email": "jo@example.com"}}"#)
        .expect(1)
        .create_async()
        .await;

    let (api, store) = client(&server.url());
    let details = RegisterRequest {
        email: "jo@example.com".into(),
        password: "secret".into(),
        first_name: "Jo".into(),
        last_name: "Doe".into(),
    };

    //* When
    let session = api.register(&details).await.expect("Registration failed");

    //* Then
    register.assert_async().await;
    profile.assert_async().await;
    assert_eq!(
        session.user.and_then(|u| u.email).as_deref(),
        Some("jo@example.com")
    );
    assert!(store.is_authenticated());
}

#[tokio::test]
async fn logout_revokes_and_clears_session() {
    //* Given
    let mut server = Server::new_async().await;

    let logout = server
        .mock("POST", "/api/auth/logout")
        .match_header("authorization", "Bearer T1")
        .match_body(Matcher::Json(json!({"refreshToken": "R1"})))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let (api, store) = client(&server.url());
    store
        .set_session("T1".into(), Some("R1".into()), Some(UserProfile::default()))
        .unwrap();
    let mut events = api.subscribe();

    //* When
    api.logout().await;

    //* Then
    logout.assert_async().await;
    assert!(store.snapshot().is_none());
    assert_eq!(events.try_recv().unwrap(), SessionEvent::LoggedOut);
}

#[tokio::test]
async fn logout_clears_session_even_when_server_fails() {
    //* Given
    let mut server = Server::new_async().await;

    let logout = server
        .mock("POST", "/api/auth/logout")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let (api, store) = client(&server.url());
    store
        .set_session("T1".into(), Some("R1".into()), Some(UserProfile::default()))
        .unwrap();

    //* When
    api.logout().await;

    //* Then
    logout.assert_async().await;
    assert!(!store.is_authenticated());
}

#[tokio::test]
async fn update_profile_stores_returned_profile() {
    //* Given
    let mut server = Server::new_async().await;

    let update = server
        .mock("PUT", "/api/user/profile")
        .match_body(Matcher::Json(json!({"name": "Jo Doe"})))
        .with_status(200)
        .with_body(r#"{"id": "c-1", "name": "Jo Doe", "newsletter": true}"#)
        .expect(1)
        .create_async()
        .await;

    let (api, store) = client(&server.url());
    store
        .set_session("T1".into(), Some("R1".into()), Some(UserProfile::default()))
        .unwrap();

    //* When
    let profile = api
        .update_profile(&json!({"name": "Jo Doe"}))
        .await
        .expect("Profile update failed");

    //* Then
    update.assert_async().await;
    assert_eq!(profile.display_name(), "Jo Doe");
    assert_eq!(store.user(), Some(profile));
    assert_eq!(store.access_token().as_deref(), Some("T1"));
}

#[tokio::test]
async fn failed_profile_fetch_after_login_keeps_no_session() {
    //* Given
    let mut server = Server::new_async().await;

    let login = server
        .mock("POST", "/api/auth/login")
        .with_status(200)
        .with_body(r#"{"accessToken": "T1", "refreshToken": "R1"}"#)
        .expect(1)
        .create_async()
        .await;
    let profile = server
        .mock("GET", "/api/user/profile")
        .match_header("authorization", "Bearer T1")
        .with_status(500)
        .with_body(r#"{"message": "Profile service unavailable"}"#)
        .expect(1)
        .create_async()
        .await;

    let (api, store) = client(&server.url());

    //* When
    let err = api
        .login(&LoginRequest::new("jo@example.com", "secret"))
        .await
        .expect_err("Login should fail without a profile");

    //* Then
    login.assert_async().await;
    profile.assert_async().await;
    assert_eq!(err.status(), Some(500));
    assert!(store.snapshot().is_none());
    assert!(!api.is_authenticated());
}
