use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why an [`ExecContext`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The context's deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The owner of the context's token cancelled it.
    #[error("context cancelled")]
    Cancelled,
}

/// Cancellation scope handed to every execution.
///
/// Cancelling a parent token cancels every context derived from it; a derived
/// deadline never extends the parent's.
#[derive(Debug, Clone)]
pub struct ExecContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::background()
    }
}

impl ExecContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self { token: CancellationToken::new(), deadline: None }
    }

    /// A context that is done once `token` is cancelled.
    pub fn new(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    /// Derive a child context that is also done after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self { token: self.token.child_token(), deadline: Some(deadline) }
    }

    /// The effective deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The token observed by this context.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once the context is cancelled or its deadline elapses.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// `DeadlineExceeded` takes priority over `Cancelled`.
    pub fn err(&self) -> Option<ContextError> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(ContextError::DeadlineExceeded)
        } else if self.token.is_cancelled() {
            Some(ContextError::Cancelled)
        } else {
            None
        }
    }

    /// True once [`err`](Self::err) would return `Some`.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_is_never_done() {
        let ctx = ExecContext::background();
        assert!(ctx.err().is_none());
        let waited = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn timeout_reports_deadline_exceeded() {
        let ctx = ExecContext::background().with_timeout(Duration::from_millis(10));
        ctx.done().await;
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn parent_cancel_propagates_to_child() {
        let token = CancellationToken::new();
        let parent = ExecContext::new(token.clone());
        let child = parent.with_timeout(Duration::from_secs(60));
        token.cancel();
        child.done().await;
        assert_eq!(child.err(), Some(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn tighter_deadline_wins() {
        let parent = ExecContext::background().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());

        let child = parent.with_timeout(Duration::from_millis(1));
        assert!(child.deadline() < parent.deadline());
    }
}
