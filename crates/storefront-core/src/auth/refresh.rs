//! Single-flight token refresh.
//!
//! The first request to hit a 401 starts the handshake in its own task and
//! publishes a shared future; every other 401 seen while it runs awaits
//! that same future. The task owns the outcome: dropping a waiting request
//! never cancels the handshake.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::HeaderName;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Why a refresh did not produce a new access token.
///
/// `Clone` because one outcome is handed to every waiting request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("refresh rejected with status {0}")]
    Rejected(u16),

    #[error("refresh request failed: {0}")]
    Transport(String),

    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),

    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

/// New access token, or why there is none
pub type RefreshOutcome = Result<String, RefreshFailure>;

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Tokens returned by the refresh endpoint. The refresh token is only
/// present when the backend rotates it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

struct InFlight {
    id: u64,
    future: SharedRefresh,
}

#[derive(Default)]
pub struct RefreshCoordinator {
    in_flight: Arc<Mutex<Option<InFlight>>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// Await the refresh in flight, or start one.
    ///
    /// Under the slot lock, in order: join a handshake already running;
    /// otherwise return `newer_token()` if the session moved on since the
    /// caller's request was sent; otherwise spawn the future built by
    /// `start`. The spawned task clears the slot when it finishes, after the
    /// handshake has updated the session, so a caller arriving later sees
    /// the newer token instead of starting again.
    pub async fn refresh_or_join<C, S, F>(&self, newer_token: C, start: S) -> RefreshOutcome
    where
        C: FnOnce() -> Option<String>,
        S: FnOnce() -> Result<F, RefreshFailure>,
        F: Future<Output = RefreshOutcome> + Send + 'static,
    {
        let shared = {
            let mut slot = lock(&self.in_flight);
            if let Some(in_flight) = slot.as_ref() {
                debug!(refresh_id = in_flight.id, "Joining token refresh in flight");
                in_flight.future.clone()
            } else if let Some(token) = newer_token() {
                debug!("Access token already refreshed by another request");
                return Ok(token);
            } else {
                let handshake = start()?;
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let slot_handle = Arc::clone(&self.in_flight);

                let task = tokio::spawn(async move {
                    let outcome = handshake.await;
                    let mut slot = lock(&slot_handle);
                    if slot.as_ref().map(|f| f.id) == Some(id) {
                        *slot = None;
                    }
                    outcome
                });

                let future = task
                    .map(|joined| match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(error = %e, "Token refresh task failed");
                            Err(RefreshFailure::Aborted(e.to_string()))
                        }
                    })
                    .boxed()
                    .shared();

                debug!(refresh_id = id, "Starting token refresh");
                *slot = Some(InFlight {
                    id,
                    future: future.clone(),
                });
                future
            }
        };

        shared.await
    }
}

/// POST the refresh token and parse the new token pair, bounded by `timeout`
pub async fn request_tokens(
    client: &Client,
    url: &str,
    correlation_header: &HeaderName,
    refresh_token: &str,
    timeout: Duration,
) -> Result<TokenPair, RefreshFailure> {
    let exchange = async {
        let response = client
            .post(url)
            .header(correlation_header.clone(), Uuid::new_v4().to_string())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshFailure::Rejected(status.as_u16()));
        }

        let tokens: TokenPair = response
            .json()
            .await
            .map_err(|e| RefreshFailure::InvalidResponse(e.to_string()))?;
        if tokens.access_token.is_empty() {
            return Err(RefreshFailure::InvalidResponse("empty access token".to_string()));
        }
        Ok(tokens)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .unwrap_or(Err(RefreshFailure::TimedOut(timeout)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_handshake() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let started = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            let started = Arc::clone(&started);
            handles.push(tokio::spawn(async move {
                coordinator
                    .refresh_or_join(
                        || None,
                        || {
                            Ok(async move {
                                started.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                let outcome: RefreshOutcome = Ok("fresh".to_string());
                                outcome
                            })
                        },
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("fresh".to_string()));
        }
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_in_flight());
    }

    #[tokio::test]
    async fn test_newer_token_skips_handshake() {
        let coordinator = RefreshCoordinator::new();
        let outcome = coordinator
            .refresh_or_join(
                || Some("already-new".to_string()),
                || -> Result<futures::future::Ready<RefreshOutcome>, RefreshFailure> {
                    panic!("handshake must not start")
                },
            )
            .await;
        assert_eq!(outcome, Ok("already-new".to_string()));
    }

    #[tokio::test]
    async fn test_start_failure_is_returned() {
        let coordinator = RefreshCoordinator::new();
        let outcome = coordinator
            .refresh_or_join(
                || None,
                || -> Result<futures::future::Ready<RefreshOutcome>, RefreshFailure> {
                    Err(RefreshFailure::MissingRefreshToken)
                },
            )
            .await;
        assert_eq!(outcome, Err(RefreshFailure::MissingRefreshToken));
        assert!(!coordinator.is_in_flight());
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_handshake() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let finished = Arc::new(AtomicBool::new(false));

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                coordinator
                    .refresh_or_join(
                        || None,
                        || {
                            Ok(async move {
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                finished.store(true, Ordering::SeqCst);
                                let outcome: RefreshOutcome = Ok("fresh".to_string());
                                outcome
                            })
                        },
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coordinator.is_in_flight());
        waiter.abort();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(!coordinator.is_in_flight());
    }

    #[tokio::test]
    async fn test_next_refresh_starts_after_completion() {
        let coordinator = RefreshCoordinator::new();
        let started = Arc::new(AtomicUsize::new(0));

        for expected in 1..=2 {
            let counter = Arc::clone(&started);
            let outcome = coordinator
                .refresh_or_join(
                    || None,
                    || {
                        Ok(async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            let outcome: RefreshOutcome = Err(RefreshFailure::Rejected(401));
                            outcome
                        })
                    },
                )
                .await;
            assert_eq!(outcome, Err(RefreshFailure::Rejected(401)));
            assert_eq!(started.load(Ordering::SeqCst), expected);
        }
    }
}
