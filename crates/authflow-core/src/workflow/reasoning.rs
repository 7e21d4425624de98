//! Reasoning call contract and its retry/timeout boundary.
//!
//! The engine never talks to a reasoning provider directly. Nodes call
//! `ReasoningBoundary::reason::<T>()`, which derives the JSON schema of `T`,
//! calls the configured `ReasoningCapability` under a timeout, and only
//! returns output that deserializes into `T`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::EngineError;
use super::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// ReasoningCapability contract
// ---------------------------------------------------------------------------

/// Failure reported by a reasoning provider.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReasoningError {
    #[error("reasoning provider unavailable: {0}")]
    Unavailable(String),

    #[error("reasoning provider error: {0}")]
    Provider(String),
}

/// Structured-output reasoning provider.
///
/// Implementations must return JSON intended to conform to `schema`; the
/// boundary verifies it.
pub trait ReasoningCapability: Send + Sync {
    fn reason(
        &self,
        prompt: &str,
        schema: &Value,
    ) -> impl Future<Output = Result<Value, ReasoningError>> + Send;
}

/// Object-safe version of [`ReasoningCapability`] with boxed futures.
pub trait ReasoningCapabilityDyn: Send + Sync {
    fn reason_boxed<'a>(
        &'a self,
        prompt: &'a str,
        schema: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ReasoningError>> + Send + 'a>>;
}

impl<T: ReasoningCapability> ReasoningCapabilityDyn for T {
    fn reason_boxed<'a>(
        &'a self,
        prompt: &'a str,
        schema: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ReasoningError>> + Send + 'a>> {
        Box::pin(self.reason(prompt, schema))
    }
}

/// Type-erased reasoning provider.
pub struct BoxReasoning {
    inner: Box<dyn ReasoningCapabilityDyn>,
}

impl BoxReasoning {
    pub fn new<T: ReasoningCapability + 'static>(capability: T) -> Self {
        Self {
            inner: Box::new(capability),
        }
    }

    pub async fn reason(&self, prompt: &str, schema: &Value) -> Result<Value, ReasoningError> {
        self.inner.reason_boxed(prompt, schema).await
    }
}

// ---------------------------------------------------------------------------
// ReasoningBoundary
// ---------------------------------------------------------------------------

/// Timeout, schema enforcement and bounded retries around a reasoning provider.
pub struct ReasoningBoundary {
    capability: BoxReasoning,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ReasoningBoundary {
    pub fn new(capability: BoxReasoning, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            capability,
            retry,
            timeout,
        }
    }

    /// Ask for a structured answer of type `T`.
    ///
    /// Each attempt fails on timeout, provider error, or output that does not
    /// deserialize into `T` (a schema violation). After the last attempt the
    /// call fails with `ReasoningExhausted`, which is fatal to the node.
    pub async fn reason<T>(&self, prompt: &str) -> Result<T, EngineError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema = serde_json::to_value(schemars::schema_for!(T))
            .map_err(|e| EngineError::Validation(format!("schema generation failed: {e}")))?;

        let mut attempt = 1;
        loop {
            let error = match self.attempt::<T>(prompt, &schema).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !self.retry.should_retry(attempt) {
                tracing::warn!(attempt, error = %error, "reasoning attempts exhausted");
                return Err(EngineError::ReasoningExhausted {
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            }

            let delay = self.retry.delay(attempt);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "reasoning attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        prompt: &str,
        schema: &Value,
    ) -> Result<T, EngineError> {
        let output = tokio::time::timeout(self.timeout, self.capability.reason(prompt, schema))
            .await
            .map_err(|_| {
                EngineError::NodeFailed {
                    node: "reasoning".to_string(),
                    message: format!("timed out after {}s", self.timeout.as_secs_f64()),
                }
            })?
            .map_err(|e| EngineError::NodeFailed {
                node: "reasoning".to_string(),
                message: e.to_string(),
            })?;

        serde_json::from_value(output).map_err(|e| EngineError::SchemaViolation(e.to_string()))
    }
}

impl std::fmt::Debug for ReasoningBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningBoundary")
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use authflow_types::decision::{ReasoningResult, RecommendedAction};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Replays scripted replies; `None` sleeps past any timeout.
    struct Scripted {
        replies: Mutex<Vec<Option<Result<Value, ReasoningError>>>>,
        calls: Arc<AtomicU32>,
        last_schema: Arc<Mutex<Option<Value>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Option<Result<Value, ReasoningError>>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: Arc::new(AtomicU32::new(0)),
                last_schema: Arc::new(Mutex::new(None)),
            }
        }
    }

    impl ReasoningCapability for Scripted {
        async fn reason(&self, _prompt: &str, schema: &Value) -> Result<Value, ReasoningError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_schema.lock().unwrap() = Some(schema.clone());
            let reply = {
                let mut replies = self.replies.lock().unwrap();
                if replies.is_empty() {
                    Some(Err(ReasoningError::Provider("script exhausted".to_string())))
                } else {
                    replies.remove(0)
                }
            };
            match reply {
                Some(r) => r,
                None => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(ReasoningError::Unavailable("unreachable".to_string()))
                }
            }
        }
    }

    fn boundary(script: Scripted) -> ReasoningBoundary {
        ReasoningBoundary::new(
            BoxReasoning::new(script),
            RetryPolicy::new(3, Duration::from_millis(1)),
            Duration::from_millis(50),
        )
    }

    fn valid() -> Value {
        json!({
            "recommended_action": "APPEAL",
            "confidence": 0.9,
            "justification": "criteria met"
        })
    }

    #[tokio::test]
    async fn test_valid_output_first_try() {
        let script = Scripted::new(vec![Some(Ok(valid()))]);
        let schema = script.last_schema.clone();
        let result: ReasoningResult = boundary(script).reason("analyze denial").await.unwrap();
        assert_eq!(result.recommended_action, RecommendedAction::Appeal);
        let schema = schema.lock().unwrap().clone().unwrap();
        assert!(schema["properties"]["confidence"].is_object());
    }

    #[tokio::test]
    async fn test_schema_violation_then_success() {
        let script = Scripted::new(vec![
            Some(Ok(json!({"recommended_action": "MAYBE", "confidence": 0.9}))),
            Some(Ok(valid())),
        ]);
        let calls = script.calls.clone();
        let result: ReasoningResult = boundary(script).reason("analyze").await.unwrap();
        assert!((result.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_after_three_attempts() {
        let script = Scripted::new(vec![
            Some(Ok(json!({"nope": true}))),
            Some(Err(ReasoningError::Unavailable("overloaded".to_string()))),
            Some(Ok(json!("text"))),
            Some(Ok(valid())),
        ]);
        let calls = script.calls.clone();
        let err = boundary(script)
            .reason::<ReasoningResult>("analyze")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ReasoningExhausted { attempts: 3, .. }));
        assert!(err.is_instance_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let script = Scripted::new(vec![None, Some(Ok(valid()))]);
        let calls = script.calls.clone();
        let result: ReasoningResult = boundary(script).reason("analyze").await.unwrap();
        assert_eq!(result.recommended_action, RecommendedAction::Appeal);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
