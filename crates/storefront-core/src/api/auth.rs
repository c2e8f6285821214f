//! Login, registration, logout and profile flows.
//!
//! These are the only places besides the refresh handshake that write the
//! session.

use std::fmt;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::{Session, SessionEvent, UserProfile};
use crate::validation::ValidationErrors;

use super::request::{PendingRequest, RequestOptions};
use super::{ApiClient, ApiError};

#[derive(Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        check_email(&mut errors, &self.email);
        errors.require("password", &self.password, "Password is required");
        errors.into_result()
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        check_email(&mut errors, &self.email);
        errors.require("password", &self.password, "Password is required");
        errors.require("firstName", &self.first_name, "First name is required");
        errors.require("lastName", &self.last_name, "Last name is required");
        errors.into_result()
    }
}

impl fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("email", &self.email)
            .field("password", &"***")
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .finish()
    }
}

fn check_email(errors: &mut ValidationErrors, email: &str) {
    let email = email.trim();
    if email.is_empty() {
        errors.add("email", "Email is required");
    } else if !email.contains('@') {
        errors.add("email", "Enter a valid email address");
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    user: Option<UserProfile>,
}

/// Profile endpoints answer with the bare profile or `{"user": {..}}`
#[derive(Deserialize)]
#[serde(untagged)]
enum ProfileResponse {
    Wrapped { user: UserProfile },
    Bare(UserProfile),
}

impl ProfileResponse {
    fn into_profile(self) -> UserProfile {
        match self {
            ProfileResponse::Wrapped { user } => user,
            ProfileResponse::Bare(user) => user,
        }
    }
}

impl ApiClient {
    /// Exchange credentials for a session and store it
    pub async fn login(&self, credentials: &LoginRequest) -> Result<Session, ApiError> {
        credentials.validate()?;
        let body = Self::encode(credentials)?;
        let path = self.config().endpoints.login.clone();
        let session = self.authenticate(&path, body).await?;
        let user = session.user.as_ref().map(|u| u.display_name()).unwrap_or("unknown");
        info!(user = %user, "Logged in");
        Ok(session)
    }

    /// Create an account; the BFF signs the new customer in directly
    pub async fn register(&self, details: &RegisterRequest) -> Result<Session, ApiError> {
        details.validate()?;
        let body = Self::encode(details)?;
        let path = self.config().endpoints.register.clone();
        let session = self.authenticate(&path, body).await?;
        info!("Registered new account");
        Ok(session)
    }

    /// POST to an auth endpoint without bearer or refresh handling, then
    /// store the returned session
    async fn authenticate(&self, path: &str, body: Value) -> Result<Session, ApiError> {
        let pending = PendingRequest::new(Method::POST, path, Some(body), RequestOptions::default());
        let response = Self::check_response(self.send(&pending, None).await?).await?;
        let auth: AuthResponse = Self::decode(Self::read_json(response).await?)?;
        if auth.access_token.is_empty() {
            return Err(ApiError::InvalidResponse("Auth response has no access token".to_string()));
        }

        let needs_profile = auth.user.is_none();
        if let Err(e) = self
            .session()
            .set_session(auth.access_token, auth.refresh_token, auth.user)
        {
            warn!(error = %e, "Failed to persist session");
        }

        // A login is all or nothing: no tokens are kept without a profile
        if needs_profile {
            if let Err(e) = self.fetch_profile().await {
                warn!(error = %e, "Profile fetch after sign-in failed");
                if let Err(clear) = self.session().clear_session() {
                    warn!(error = %clear, "Failed to clear partial session");
                }
                return Err(e);
            }
        }

        self.session()
            .snapshot()
            .ok_or_else(|| ApiError::AuthenticationError("Session was cleared during login".to_string()))
    }

    /// Tell the BFF to revoke the refresh token, then forget the session.
    /// The server call is best-effort: the local session is always cleared.
    pub async fn logout(&self) {
        let session = self.session();
        if let Some(refresh_token) = session.refresh_token() {
            let path = self.config().endpoints.logout.clone();
            let pending = PendingRequest::new(
                Method::POST,
                &path,
                Some(json!({ "refreshToken": refresh_token })),
                RequestOptions::default(),
            );
            let token = session.access_token();
            match self.send(&pending, token.as_deref()).await {
                Ok(response) if !response.status().is_success() => {
                    warn!(status = response.status().as_u16(), "Logout rejected by server");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Logout request failed"),
            }
        }

        if let Err(e) = session.clear_session() {
            warn!(error = %e, "Failed to clear stored session");
        }
        info!("Logged out");
        self.emit(SessionEvent::LoggedOut);
    }

    /// Load the signed-in customer's profile and store it
    pub async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        let path = self.config().endpoints.profile.clone();
        let response: ProfileResponse = self.get(&path).await?;
        self.store_profile(response.into_profile())
    }

    /// Send profile changes and store the profile the BFF returns
    pub async fn update_profile(&self, changes: &Value) -> Result<UserProfile, ApiError> {
        let path = self.config().endpoints.profile.clone();
        let response: ProfileResponse = self.put(&path, changes).await?;
        self.store_profile(response.into_profile())
    }

    fn store_profile(&self, user: UserProfile) -> Result<UserProfile, ApiError> {
        if let Err(e) = self.session().set_user(user.clone()) {
            warn!(error = %e, "Failed to persist profile");
        }
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_validation() {
        assert!(LoginRequest::new("jo@example.com", "secret").validate().is_ok());

        let errors = LoginRequest::new("jo.example.com", "").validate().unwrap_err();
        assert_eq!(
            errors.for_field("email").collect::<Vec<_>>(),
            vec!["Enter a valid email address"]
        );
        assert_eq!(
            errors.for_field("password").collect::<Vec<_>>(),
            vec!["Password is required"]
        );
    }

    #[test]
    fn test_register_validation_uses_wire_field_names() {
        let request = RegisterRequest {
            email: "jo@example.com".into(),
            password: "secret".into(),
            first_name: " ".into(),
            last_name: "Doe".into(),
        };
        let errors = request.validate().unwrap_err();
        assert_eq!(errors.errors().len(), 1);
        assert_eq!(errors.errors()[0].field, "firstName");

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["firstName"], " ");
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", LoginRequest::new("jo@example.com", "hunter2"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_profile_response_shapes() {
        let wrapped: ProfileResponse =
            serde_json::from_str(r#"{"user": {"id": "u1", "email": "jo@example.com"}}"#).unwrap();
        assert_eq!(wrapped.into_profile().id.as_deref(), Some("u1"));

        let bare: ProfileResponse = serde_json::from_str(r#"{"id": 7, "name": "Jo"}"#).unwrap();
        let profile = bare.into_profile();
        assert_eq!(profile.id.as_deref(), Some("7"));
        assert_eq!(profile.name.as_deref(), Some("Jo"));
    }
}
