//! REST API client module for the storefront Backend-for-Frontend.
//!
//! This module provides the `ApiClient` for calling the BFF's JSON
//! endpoints (products, cart, orders, returns, user) plus the auth flows
//! that create and destroy the session.
//!
//! Calls use bearer token authentication. An expired access token is
//! recovered through a single-flight refresh and the call is retried once.

pub mod auth;
pub mod client;
pub mod error;
pub mod request;

pub use auth::{LoginRequest, RegisterRequest};
pub use client::ApiClient;
pub use error::ApiError;
pub use request::{PendingRequest, RequestOptions};
pub use reqwest::Method;
