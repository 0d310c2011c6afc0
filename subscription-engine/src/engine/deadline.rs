//! Caller deadlines.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::EngineError;

/// Point in time by which an engine call must finish.
///
/// Each store call commits atomically, so abandoning an operation at the
/// deadline never leaves a half-applied change behind. Multi-step operations
/// (renewal) pick up where they stopped when retried with the same inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// Time left, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Run `fut`, failing with `DeadlineExceeded` when the deadline passes first.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        match self.0 {
            None => fut.await,
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| EngineError::DeadlineExceeded { operation })?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unbounded_deadline_runs_to_completion() {
        let result = Deadline::none().run("noop", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_is_retryable() {
        let deadline = Deadline::after(Duration::from_millis(10));
        let result: Result<(), EngineError> = deadline
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            EngineError::DeadlineExceeded { operation: "slow" }
        ));
        assert!(err.is_retryable());
        assert!(deadline.is_expired());
    }
}
