//! Single-flight coordination of token refreshes
//!
//! Every 401 that needs a refresh goes through [`RefreshGate::claim_or_join`].
//! The first caller spawns the refresh as its own task and parks a [`Shared`]
//! handle to it in the gate; any caller arriving while it is still pending
//! awaits a clone of that handle instead of starting another refresh. The
//! task runs to completion even when every caller stops waiting.

use crate::error::AuthFailure;
use crate::types::TokenPair;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// Failure of a refresh, cloned to every waiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RefreshFailure {
    pub reason: AuthFailure,
    pub detail: String,
}

impl RefreshFailure {
    pub fn new(reason: AuthFailure, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

pub(crate) type RefreshOutcome = Result<TokenPair, RefreshFailure>;

pub(crate) type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Role of a caller in the refresh it is about to await
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Leader,
    Follower,
}

#[derive(Default)]
struct State {
    generation: u64,
    pending: Option<(u64, SharedRefresh)>,
}

/// Per-client refresh state
#[derive(Default)]
pub(crate) struct RefreshGate {
    state: Arc<Mutex<State>>,
}

/// Clears the pending refresh of one generation when the refresh task ends,
/// whether it returns, panics or is torn down with the runtime
struct SettleOnDrop {
    state: Arc<Mutex<State>>,
    generation: u64,
}

impl Drop for SettleOnDrop {
    fn drop(&mut self) {
        settle(&self.state, self.generation);
    }
}

fn settle(state: &Mutex<State>, generation: u64) {
    let mut state = state.lock();
    if matches!(state.pending, Some((current, _)) if current == generation) {
        state.pending = None;
    }
}

impl RefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the pending refresh, or spawn a new one built by `start`
    ///
    /// `start` only builds the future: nothing is polled while the lock is
    /// held. The spawned task owns the future and clears the gate once it
    /// finishes, so the gate is free again before any waiter resumes. Must
    /// be called from within a tokio runtime.
    pub fn claim_or_join<F>(&self, start: F) -> (SharedRefresh, Role)
    where
        F: FnOnce() -> BoxFuture<'static, RefreshOutcome>,
    {
        let mut state = self.state.lock();
        if let Some((_, pending)) = state.pending.as_ref() {
            return (pending.clone(), Role::Follower);
        }

        state.generation += 1;
        let generation = state.generation;
        let guard = SettleOnDrop {
            state: Arc::clone(&self.state),
            generation,
        };
        let refresh = start();
        let task = tokio::spawn(async move {
            let _guard = guard;
            refresh.await
        });

        let shared = async move {
            task.await.unwrap_or_else(|e| {
                warn!(error = %e, "Token refresh task did not complete");
                Err(RefreshFailure::new(
                    AuthFailure::RefreshFailed,
                    format!("refresh task did not complete: {e}"),
                ))
            })
        }
        .boxed()
        .shared();
        state.pending = Some((generation, shared.clone()));
        (shared, Role::Leader)
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.lock().pending.is_some()
    }
}
