//! Core library for the storefront client.
//!
//! - `api`: the authenticated `ApiClient` for the Backend-for-Frontend
//! - `auth`: sessions, session stores and the single-flight token refresh
//! - `config`: client settings and the persisted user config
//! - `validation`: client-side field errors raised before a request is sent

pub mod api;
pub mod auth;
pub mod config;
pub mod validation;

pub use api::{ApiClient, ApiError, LoginRequest, RegisterRequest, RequestOptions};
pub use auth::{
    DurableSessionStore, FileBackend, KeyringBackend, MemorySessionStore, Session, SessionEvent,
    SessionStore, UserProfile,
};
pub use config::{ClientConfig, Config, Endpoints, SessionBackendKind};
pub use validation::{FieldError, ValidationErrors};
