//! Tool invocation contract and the guarded invoker the engine hands to nodes.
//!
//! `ToolInvoker` is the external collaborator (document search, coverage
//! lookups, payer submission, status checks). `GuardedToolInvoker` wraps it
//! with the rules every call must obey:
//! - protected-data calls carry a justification and are audited first
//! - submission-style calls carry an idempotency key
//! - transient failures are retried with backoff

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use authflow_types::audit::{AuditRecord, MIN_JUSTIFICATION_LEN, PhiAccess};
use serde_json::Value;

use super::error::EngineError;
use super::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// ToolError
// ---------------------------------------------------------------------------

/// Failure reported by a tool.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    /// Worth retrying (timeouts, throttling, 5xx).
    #[error("transient tool failure: {0}")]
    Transient(String),

    #[error("tool failure: {0}")]
    Permanent(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

impl ToolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// ToolInvoker contract
// ---------------------------------------------------------------------------

/// External tool collaborator.
///
/// Uses RPITIT; wrap in [`BoxToolInvoker`] for dynamic dispatch.
pub trait ToolInvoker: Send + Sync {
    fn invoke(
        &self,
        tool: &str,
        args: &Value,
        idempotency_key: Option<&str>,
    ) -> impl Future<Output = Result<Value, ToolError>> + Send;
}

/// Object-safe version of [`ToolInvoker`] with boxed futures.
pub trait ToolInvokerDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        tool: &'a str,
        args: &'a Value,
        idempotency_key: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;
}

impl<T: ToolInvoker> ToolInvokerDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        tool: &'a str,
        args: &'a Value,
        idempotency_key: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>> {
        Box::pin(self.invoke(tool, args, idempotency_key))
    }
}

/// Type-erased tool invoker.
pub struct BoxToolInvoker {
    inner: Box<dyn ToolInvokerDyn>,
}

impl BoxToolInvoker {
    pub fn new<T: ToolInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Box::new(invoker),
        }
    }

    pub async fn invoke(
        &self,
        tool: &str,
        args: &Value,
        idempotency_key: Option<&str>,
    ) -> Result<Value, ToolError> {
        self.inner.invoke_boxed(tool, args, idempotency_key).await
    }
}

// ---------------------------------------------------------------------------
// Audit sink
// ---------------------------------------------------------------------------

/// Receives a record of every protected-data access before it happens.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Writes audit records to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        tracing::info!(
            target: "audit",
            actor_id = record.actor_id.as_str(),
            resource_type = record.resource_type.as_str(),
            resource_id = record.resource_id.as_str(),
            tool = record.tool_name.as_str(),
            justification = record.justification.as_str(),
            timestamp = %record.timestamp,
            "protected data access"
        );
    }
}

// ---------------------------------------------------------------------------
// ToolCall
// ---------------------------------------------------------------------------

/// One request to a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    pub args: Value,
    pub phi: Option<PhiAccess>,
    pub idempotency_key: Option<String>,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
            phi: None,
            idempotency_key: None,
        }
    }

    /// Mark the call as touching protected data.
    pub fn with_phi(mut self, access: PhiAccess) -> Self {
        self.phi = Some(access);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

// ---------------------------------------------------------------------------
// GuardedToolInvoker
// ---------------------------------------------------------------------------

/// Tool invoker enforcing audit, idempotency and retry rules.
pub struct GuardedToolInvoker {
    inner: BoxToolInvoker,
    audit: Arc<dyn AuditSink>,
    retry: RetryPolicy,
    submission_tools: HashSet<String>,
}

impl GuardedToolInvoker {
    pub fn new(inner: BoxToolInvoker, audit: Arc<dyn AuditSink>, retry: RetryPolicy) -> Self {
        Self {
            inner,
            audit,
            retry,
            submission_tools: HashSet::new(),
        }
    }

    /// Tools whose calls produce real-world side effects and need an idempotency key.
    pub fn with_submission_tools<I, T>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.submission_tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn is_submission_tool(&self, tool: &str) -> bool {
        self.submission_tools.contains(tool)
    }

    /// Run a tool call, retrying transient failures.
    pub async fn invoke(&self, call: ToolCall) -> Result<Value, EngineError> {
        if let Some(access) = &call.phi {
            if !access.is_justified() {
                return Err(EngineError::Validation(format!(
                    "call to '{}' touches protected data and needs a justification of at least {MIN_JUSTIFICATION_LEN} characters",
                    call.tool
                )));
            }
            self.audit.record(&AuditRecord::for_access(access, &call.tool));
        }

        if self.is_submission_tool(&call.tool) && call.idempotency_key.is_none() {
            return Err(EngineError::Validation(format!(
                "submission tool '{}' requires an idempotency key",
                call.tool
            )));
        }

        let mut attempt = 1;
        loop {
            match self
                .inner
                .invoke(&call.tool, &call.args, call.idempotency_key.as_deref())
                .await
            {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        tool = call.tool.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient tool failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(EngineError::Tool(e)),
            }
        }
    }
}

impl std::fmt::Debug for GuardedToolInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedToolInvoker")
            .field("retry", &self.retry)
            .field("submission_tools", &self.submission_tools)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
