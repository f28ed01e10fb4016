//! Oracle boundary
//!
//! The oracle is a black box `generate(context) -> text`. Implementations
//! classify their own failures as transient (retry) or permanent (give up);
//! the [`OracleGateway`] owns retries, timeouts and cancellation.

pub mod gateway;
pub mod retry;

pub use gateway::{GatewayError, OracleGateway};
pub use retry::RetryPolicy;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// Worth retrying (rate limits, 5xx, connection resets, timeouts)
    #[error("transient oracle failure: {0}")]
    Transient(String),

    /// Retrying will not help (bad request, auth, malformed response)
    #[error("permanent oracle failure: {0}")]
    Permanent(String),
}

impl OracleError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn generate(&self, context: &str) -> Result<String, OracleError>;
}

/// Shared oracle handle
pub type SharedOracle = Arc<dyn Oracle>;

/// Deterministic oracle that replays scripted responses in order.
///
/// After the script runs out it keeps returning the fallback response, or a
/// permanent error when none is set. Every prompt it receives is recorded.
#[derive(Default)]
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Result<String, OracleError>>>,
    fallback: Option<Result<String, OracleError>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicU32,
}

impl ScriptedOracle {
    pub fn new(script: Vec<Result<String, OracleError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Oracle that answers every call with `text`
    pub fn always(text: impl Into<String>) -> Self {
        Self::default().with_fallback(Ok(text.into()))
    }

    pub fn with_fallback(mut self, response: Result<String, OracleError>) -> Self {
        self.fallback = Some(response);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far, oldest first
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn generate(&self, context: &str) -> Result<String, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(context.to_string());
        }
        let next = self
            .script
            .lock()
            .map_err(|_| OracleError::Permanent("script lock poisoned".into()))?
            .pop_front();
        match next.or_else(|| self.fallback.clone()) {
            Some(response) => response,
            None => Err(OracleError::Permanent("script exhausted".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let oracle = ScriptedOracle::new(vec![Ok("first".into())]).with_fallback(Ok("rest".into()));
        assert_eq!(oracle.generate("a").await.unwrap(), "first");
        assert_eq!(oracle.generate("b").await.unwrap(), "rest");
        assert_eq!(oracle.generate("c").await.unwrap(), "rest");
        assert_eq!(oracle.calls(), 3);
        assert_eq!(oracle.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_exhausted_script_is_permanent() {
        let oracle = ScriptedOracle::new(vec![]);
        let err = oracle.generate("x").await.unwrap_err();
        assert!(!err.is_transient());
    }
}
