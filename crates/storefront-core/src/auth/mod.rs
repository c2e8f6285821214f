//! Authentication module for managing customer sessions.
//!
//! This module provides:
//! - `Session`, `UserProfile`: the tokens and identity of the signed-in customer
//! - `SessionStore`: the injected holder of the current session, with
//!   in-memory and durable (`FileBackend`, `KeyringBackend`) implementations
//! - `RefreshCoordinator`: the single-flight access-token refresh
//! - `SessionEvent`: lifecycle notifications for the application shell

pub mod credentials;
pub mod refresh;
pub mod session;
pub mod store;

pub use credentials::KeyringBackend;
pub use refresh::{RefreshCoordinator, RefreshFailure, TokenPair};
pub use session::{FileBackend, Session, SessionEvent, UserProfile};
pub use store::{DurableSessionStore, MemorySessionStore, SessionBackend, SessionStore};
