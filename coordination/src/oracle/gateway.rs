//! Oracle Gateway: transport retries and cancellation around `generate`
//!
//! The gateway never looks at the text it returns. Transient failures and
//! per-call timeouts are retried with exponential backoff; permanent
//! failures surface immediately. Cancellation is observed during every
//! attempt and every backoff sleep, and no lock is held while waiting.

use super::retry::RetryPolicy;
use super::{OracleError, SharedOracle};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("oracle unavailable after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("oracle rejected the request: {0}")]
    Permanent(String),

    #[error("oracle call cancelled")]
    Cancelled,
}

pub struct OracleGateway {
    oracle: SharedOracle,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl OracleGateway {
    pub fn new(oracle: SharedOracle, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            oracle,
            retry,
            call_timeout,
        }
    }

    pub async fn generate(
        &self,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                let backoff = self.retry.backoff_duration(attempt);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            let call = tokio::time::timeout(self.call_timeout, self.oracle.generate(context));
            let last = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                result = call => match result {
                    Ok(Ok(text)) => {
                        debug!(attempt, bytes = text.len(), "Oracle call succeeded");
                        return Ok(text);
                    }
                    Ok(Err(OracleError::Permanent(message))) => {
                        return Err(GatewayError::Permanent(message));
                    }
                    Ok(Err(OracleError::Transient(message))) => message,
                    Err(_) => format!(
                        "oracle call timed out after {}s",
                        self.call_timeout.as_secs()
                    ),
                },
            };

            if !self.retry.should_retry(attempt) {
                return Err(GatewayError::Exhausted {
                    attempts: attempt + 1,
                    last,
                });
            }
            attempt += 1;
            warn!(
                attempt,
                max_retries = self.retry.max_retries,
                backoff_ms = self.retry.backoff_ms(attempt),
                error = %last,
                "Transient oracle failure, retrying"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{Oracle, ScriptedOracle};
    use async_trait::async_trait;
    use std::sync::Arc;

    fn gateway(oracle: Arc<ScriptedOracle>, max_retries: u32) -> OracleGateway {
        OracleGateway::new(
            oracle,
            RetryPolicy {
                max_retries,
                ..RetryPolicy::default()
            },
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Err(OracleError::Transient("503".into())),
            Err(OracleError::Transient("connection reset".into())),
            Ok("plan".into()),
        ]));
        let text = gateway(oracle.clone(), 2)
            .generate("ctx", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "plan");
        assert_eq!(oracle.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_reports_attempts() {
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Err(OracleError::Transient("429".into())),
            Err(OracleError::Transient("429".into())),
        ]));
        let err = gateway(oracle, 1)
            .generate("ctx", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::Exhausted {
                attempts: 2,
                last: "429".into()
            }
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let oracle = Arc::new(ScriptedOracle::new(vec![Err(OracleError::Permanent(
            "400 bad request".into(),
        ))]));
        let err = gateway(oracle.clone(), 3)
            .generate("ctx", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Permanent(_)));
        assert_eq!(oracle.calls(), 1);
    }

    struct HangingOracle;

    #[async_trait]
    impl Oracle for HangingOracle {
        async fn generate(&self, _context: &str) -> Result<String, OracleError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_transient() {
        let gateway = OracleGateway::new(
            Arc::new(HangingOracle),
            RetryPolicy::none(),
            Duration::from_secs(2),
        );
        let err = gateway
            .generate("ctx", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Exhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_cancellation_abandons_call() {
        let gateway = OracleGateway::new(
            Arc::new(HangingOracle),
            RetryPolicy::default(),
            Duration::from_secs(600),
        );
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        assert_eq!(
            gateway.generate("ctx", &token).await,
            Err(GatewayError::Cancelled)
        );
    }
}
