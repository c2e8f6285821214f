//! API client for the storefront Backend-for-Frontend.
//!
//! Every call carries the stored bearer token and a fresh correlation id.
//! A 401 on the first attempt recovers the session (joining or starting the
//! single-flight refresh) and resends the call exactly once.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::refresh::{self, RefreshFailure, RefreshOutcome};
use crate::auth::{SessionEvent, SessionStore};
use crate::config::ClientConfig;

use super::request::{PendingRequest, RequestOptions};
use super::ApiError;

/// Lagging subscribers lose the oldest events beyond this
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Authenticated client for the storefront BFF.
/// Clone is cheap: the connection pool, session store and event channel
/// are shared.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    config: Arc<ClientConfig>,
    correlation_header: HeaderName,
    session: Arc<dyn SessionStore>,
    events: broadcast::Sender<SessionEvent>,
}

impl ApiClient {
    pub fn new(config: ClientConfig, session: Arc<dyn SessionStore>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let correlation_header = HeaderName::from_bytes(config.correlation_header.as_bytes())
            .with_context(|| format!("Invalid correlation header name: {}", config.correlation_header))?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            client,
            config: Arc::new(config),
            correlation_header,
            session,
            events,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.session)
    }

    /// Session lifecycle events. `SessionEvent::Expired` means the user has
    /// to log in again.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ===== Public request API =====

    /// Send a request and return the parsed JSON body (`Value::Null` for an
    /// empty body).
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        let response = self
            .execute(PendingRequest::new(method, path, body, options))
            .await?;
        Self::read_json(response).await
    }

    /// `request`, deserialized into `T`
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let value = self.request(method, path, body, options).await?;
        Self::decode(value)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request_as(Method::GET, path, None, RequestOptions::default())
            .await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = Self::encode(body)?;
        self.request_as(Method::POST, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = Self::encode(body)?;
        self.request_as(Method::PUT, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = Self::encode(body)?;
        self.request_as(Method::PATCH, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request_as(Method::DELETE, path, None, RequestOptions::default())
            .await
    }

    // ===== Request pipeline =====

    /// Run a logical call: send, and on a first 401 recover the session and
    /// send once more.
    async fn execute(&self, request: PendingRequest) -> Result<Response, ApiError> {
        let mut pending = request;
        let mut token = self.session.access_token();

        loop {
            let response = self.send(&pending, token.as_deref()).await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Self::check_response(response).await;
            }

            if pending.is_retry() {
                warn!(
                    method = %pending.method(),
                    path = pending.path(),
                    "Request rejected again after session recovery"
                );
                let reason = "Request rejected after token refresh";
                self.expire_session(reason);
                return Err(ApiError::AuthenticationError(reason.to_string()));
            }

            debug!(path = pending.path(), "Access token rejected, recovering session");
            pending = pending.retry();
            let fresh = self.recover_session(token.as_deref()).await?;
            token = Some(fresh);
        }
    }

    /// Get a usable access token after `sent_token` was rejected
    async fn recover_session(&self, sent_token: Option<&str>) -> Result<String, ApiError> {
        let outcome = self
            .session
            .refresh_coordinator()
            .refresh_or_join(
                || {
                    self.session
                        .access_token()
                        .filter(|current| Some(current.as_str()) != sent_token)
                },
                || {
                    let refresh_token = self
                        .session
                        .refresh_token()
                        .ok_or(RefreshFailure::MissingRefreshToken)?;
                    Ok(self.refresh_handshake(refresh_token))
                },
            )
            .await;

        match outcome {
            Ok(token) => Ok(token),
            Err(RefreshFailure::MissingRefreshToken) => {
                let reason = RefreshFailure::MissingRefreshToken.to_string();
                self.expire_session(&reason);
                Err(ApiError::AuthenticationError(reason))
            }
            // The handshake task already cleared the session
            Err(failure) => Err(ApiError::AuthenticationError(format!(
                "Session expired: {}",
                failure
            ))),
        }
    }

    /// The refresh handshake as a self-contained future, so it can outlive
    /// the request that started it. It persists the outcome itself.
    fn refresh_handshake(
        &self,
        refresh_token: String,
    ) -> impl Future<Output = RefreshOutcome> + Send + 'static {
        let client = self.client.clone();
        let url = self.url(&self.config.endpoints.refresh);
        let correlation_header = self.correlation_header.clone();
        let timeout = self.config.refresh_timeout;
        let session = Arc::clone(&self.session);
        let events = self.events.clone();

        async move {
            let result =
                refresh::request_tokens(&client, &url, &correlation_header, &refresh_token, timeout)
                    .await;

            match result {
                Ok(tokens) => {
                    let rotated = tokens.refresh_token.is_some();
                    if let Err(e) =
                        session.update_tokens(tokens.access_token.clone(), tokens.refresh_token)
                    {
                        warn!(error = %e, "Failed to persist refreshed session");
                    }
                    info!(rotated, "Access token refreshed");
                    let _ = events.send(SessionEvent::Refreshed);
                    Ok(tokens.access_token)
                }
                Err(failure) => {
                    warn!(error = %failure, "Token refresh failed");
                    expire(session.as_ref(), &events, &failure.to_string());
                    Err(failure)
                }
            }
        }
    }

    pub(crate) fn expire_session(&self, reason: &str) {
        expire(self.session.as_ref(), &self.events, reason);
    }

    fn request_headers(
        &self,
        pending: &PendingRequest,
        token: Option<&str>,
        correlation_id: &str,
    ) -> Result<HeaderMap, ApiError> {
        let mut headers = pending.options().headers.clone();
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                ApiError::InvalidRequest("Access token is not a valid header value".to_string())
            })?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }
        let correlation = HeaderValue::from_str(correlation_id)
            .map_err(|e| ApiError::InvalidRequest(format!("Invalid correlation id: {}", e)))?;
        headers.insert(self.correlation_header.clone(), correlation);
        Ok(headers)
    }

    /// One HTTP exchange. Only transport failures are errors here; status
    /// handling belongs to the caller.
    pub(crate) async fn send(
        &self,
        pending: &PendingRequest,
        token: Option<&str>,
    ) -> Result<Response, ApiError> {
        let correlation_id = Uuid::new_v4().to_string();
        let headers = self.request_headers(pending, token, &correlation_id)?;

        let mut builder = self
            .client
            .request(pending.method().clone(), self.url(pending.path()))
            .headers(headers);
        if !pending.options().query.is_empty() {
            builder = builder.query(&pending.options().query);
        }
        if let Some(body) = pending.body() {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(
                method = %pending.method(),
                path = pending.path(),
                correlation_id = %correlation_id,
                error = %e,
                "Request did not reach the server"
            );
            ApiError::NetworkError(e)
        })?;

        debug!(
            method = %pending.method(),
            path = pending.path(),
            status = response.status().as_u16(),
            attempt = pending.attempt(),
            correlation_id = %correlation_id,
            "Response received"
        );
        Ok(response)
    }

    /// Check if response is successful, returning an error with body if not.
    pub(crate) async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(
                status = status.as_u16(),
                body = %ApiError::truncate_body(&body),
                "Request failed"
            );
            Err(ApiError::from_status(status, &body))
        }
    }

    pub(crate) async fn read_json(response: Response) -> Result<Value, ApiError> {
        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            let body = String::from_utf8_lossy(&bytes);
            ApiError::InvalidResponse(format!("{}: {}", e, ApiError::truncate_body(&body)))
        })
    }

    pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
        serde_json::from_value(value)
            .map_err(|e| ApiError::InvalidResponse(format!("Unexpected response shape: {}", e)))
    }

    pub(crate) fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Value, ApiError> {
        serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to serialize request body: {}", e)))
    }
}

/// Clear the session and tell subscribers. Only the caller that actually
/// removed a session emits, so racing failures produce one event.
fn expire(session: &dyn SessionStore, events: &broadcast::Sender<SessionEvent>, reason: &str) {
    let had_session = match session.take_session() {
        Ok(previous) => previous.is_some(),
        Err(e) => {
            warn!(error = %e, "Failed to clear stored session");
            true
        }
    };

    if had_session {
        info!(reason, "Session expired");
        let _ = events.send(SessionEvent::Expired {
            reason: reason.to_string(),
        });
    }
}
