//! Fixed-interval readiness polling with a hard deadline

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

/// A boolean condition polled until it holds
#[async_trait]
pub trait Check: Send + Sync {
    /// One observation of the condition. Ok(false) means "not yet";
    /// Err means the observation itself failed and the wait aborts.
    async fn check(&self) -> anyhow::Result<bool>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Timed out waiting for {description} after {waited:?}")]
    Timeout { description: String, waited: Duration },

    #[error("Readiness check for {description} failed: {source}")]
    Check {
        description: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Wait for {0} was cancelled")]
    Cancelled(String),
}

/// A single readiness wait: poll a check at a fixed interval until it
/// holds, the deadline passes, or the run is cancelled.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    /// What is being waited on, for logs and errors
    pub description: String,
    /// Interval between polls
    pub interval: Duration,
    /// Hard deadline measured from the start of the wait
    pub deadline: Duration,
}

impl ReadinessProbe {
    pub fn new(description: impl Into<String>, interval: Duration, deadline: Duration) -> Self {
        Self {
            description: description.into(),
            interval,
            deadline,
        }
    }

    /// Poll until the check holds. Returns the elapsed wait on success.
    ///
    /// The check runs once immediately, then at each interval tick. The
    /// deadline is evaluated after every failed observation, so a check
    /// that becomes true exactly at the deadline still succeeds.
    pub async fn wait(
        &self,
        cancel: &AtomicBool,
        check: &dyn Check,
    ) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(ProbeError::Cancelled(self.description.clone()));
            }

            attempt += 1;
            let ready = check.check().await.map_err(|source| ProbeError::Check {
                description: self.description.clone(),
                source,
            })?;

            let waited = started.elapsed();
            if ready {
                debug!(
                    target = %self.description,
                    attempt,
                    waited_ms = waited.as_millis() as u64,
                    "Readiness check passed"
                );
                return Ok(waited);
            }

            if waited >= self.deadline {
                return Err(ProbeError::Timeout {
                    description: self.description.clone(),
                    waited,
                });
            }

            debug!(target = %self.description, attempt, "Not ready yet, waiting");
            let remaining = self.deadline - waited;
            tokio::time::sleep(self.interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Becomes true after a fixed number of polls
    struct ReadyAfter {
        polls: AtomicU32,
        threshold: u32,
    }

    impl ReadyAfter {
        fn new(threshold: u32) -> Self {
            Self {
                polls: AtomicU32::new(0),
                threshold,
            }
        }
    }

    #[async_trait]
    impl Check for ReadyAfter {
        async fn check(&self) -> anyhow::Result<bool> {
            let seen = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(seen >= self.threshold)
        }
    }

    struct NeverReady;

    #[async_trait]
    impl Check for NeverReady {
        async fn check(&self) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    struct FailingCheck;

    #[async_trait]
    impl Check for FailingCheck {
        async fn check(&self) -> anyhow::Result<bool> {
            anyhow::bail!("connection refused")
        }
    }

    fn probe(interval_ms: u64, deadline_ms: u64) -> ReadinessProbe {
        ReadinessProbe::new(
            "test condition",
            Duration::from_millis(interval_ms),
            Duration::from_millis(deadline_ms),
        )
    }

    #[tokio::test]
    async fn test_succeeds_once_check_holds() {
        let cancel = AtomicBool::new(false);
        let check = ReadyAfter::new(3);

        let waited = probe(5, 1000).wait(&cancel, &check).await.unwrap();
        assert!(waited >= Duration::from_millis(10));
        assert_eq!(check.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_immediate_success_skips_sleeping() {
        let cancel = AtomicBool::new(false);
        let check = ReadyAfter::new(1);

        let waited = probe(1000, 5000).wait(&cancel, &check).await.unwrap();
        assert!(waited < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_times_out_when_never_ready() {
        let cancel = AtomicBool::new(false);

        let err = probe(5, 30).wait(&cancel, &NeverReady).await.unwrap_err();
        match err {
            ProbeError::Timeout { waited, .. } => assert!(waited >= Duration::from_millis(30)),
            other => panic!("Expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_check_error_aborts_wait() {
        let cancel = AtomicBool::new(false);

        let err = probe(5, 1000).wait(&cancel, &FailingCheck).await.unwrap_err();
        assert!(matches!(err, ProbeError::Check { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_poll() {
        let cancel = AtomicBool::new(true);

        let err = probe(5, 1000).wait(&cancel, &NeverReady).await.unwrap_err();
        assert!(matches!(err, ProbeError::Cancelled(_)));
    }
}
