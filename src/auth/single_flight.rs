use super::types::{AuthError, Token};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Collapses concurrent token refreshes into one.
///
/// The first caller runs the refresh while holding the gate. Callers that
/// arrive while it is in flight queue on the same lock and, once it is
/// released, receive the stored outcome instead of refreshing again.
#[derive(Default)]
pub struct RefreshGate {
    /// Bumped (under the lock) every time a refresh finishes
    generation: AtomicU64,
    last: Mutex<Option<Result<Token, AuthError>>>,
}

impl RefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `refresh` unless one is already in flight, in which case await
    /// and share its outcome
    pub async fn run<F, Fut>(&self, refresh: F) -> Result<Token, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Token, AuthError>>,
    {
        let observed = self.generation.load(Ordering::Acquire);
        let mut last = self.last.lock().await;

        if self.generation.load(Ordering::Acquire) != observed {
            if let Some(outcome) = last.as_ref() {
                debug!("Joined in-flight token refresh");
                return outcome.clone();
            }
        }

        let outcome = refresh().await;
        *last = Some(outcome.clone());
        self.generation.fetch_add(1, Ordering::Release);
        outcome
    }

    /// Number of refreshes that have run to completion
    pub fn completed(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
