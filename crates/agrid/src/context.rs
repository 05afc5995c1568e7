//! Caller-supplied cancellation/deadline context for outbound calls.
//!
//! Every network call in the pipeline is raced against the context. When the
//! token fires or the deadline passes, the in-flight future is dropped (which
//! aborts the HTTP request and releases its connection) and the call returns
//! `AgriError::Cancelled` tagged with the stage that was running.

use agri_common::{AgriError, AgriResult, Stage};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Bound the context by a relative timeout (keeps an earlier deadline)
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token,
            deadline: Some(deadline),
        }
    }

    /// Child context: cancelled when this one is, cancellable on its own
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Run `fut` unless the context is cancelled or expires first
    pub async fn run<T, F>(&self, stage: Stage, fut: F) -> AgriResult<T>
    where
        F: Future<Output = AgriResult<T>>,
    {
        if self.is_done() {
            return Err(AgriError::cancelled(stage));
        }

        let expiry = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(AgriError::cancelled(stage)),
            _ = expiry => Err(AgriError::cancelled(stage)),
            result = fut => result,
        }
    }
}
