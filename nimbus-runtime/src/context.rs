//! Per-invocation state container.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use nimbus_protocol::Invocation;

use crate::error::{Result, RuntimeError};
use crate::scope::ResolverScope;

type AnyValue = Box<dyn Any + Send + Sync>;

/// Mutable working state for exactly one invocation.
///
/// Exclusively owned by the in-flight invocation; never shared across
/// two invocations. The resolver scope is released exactly once on
/// every exit path: explicitly via [`dispose`](Self::dispose), or by
/// the `Drop` fallback when the context is torn down early.
pub struct InvocationContext {
    invocation_id: String,
    trace_id: Option<String>,
    function_arn: Option<String>,
    deadline: DateTime<Utc>,
    raw_event: Vec<u8>,
    typed_event: Option<AnyValue>,
    response: Option<Vec<u8>>,
    response_set: bool,
    token: CancellationToken,
    properties: HashMap<String, AnyValue>,
    scope: Option<Box<dyn ResolverScope>>,
    stages_entered: Vec<bool>,
}

impl InvocationContext {
    /// Build the context for one polled invocation.
    pub fn new(
        invocation: Invocation,
        token: CancellationToken,
        scope: Box<dyn ResolverScope>,
    ) -> Self {
        Self {
            invocation_id: invocation.id,
            trace_id: invocation.trace_id,
            function_arn: invocation.function_arn,
            deadline: invocation.deadline,
            raw_event: invocation.payload,
            typed_event: None,
            response: None,
            response_set: false,
            token,
            properties: HashMap::new(),
            scope: Some(scope),
            stages_entered: Vec::new(),
        }
    }

    /// Opaque id of this invocation.
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Opaque trace id, if the control plane sent one.
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Identity of the invoked function, if the control plane sent one.
    pub fn function_arn(&self) -> Option<&str> {
        self.function_arn.as_deref()
    }

    /// Absolute deadline for this invocation.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Raw event payload as received from the control plane.
    pub fn raw_event(&self) -> &[u8] {
        &self.raw_event
    }

    /// Cancellation token derived from the invocation deadline.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Install the deserialized event. Typically done by an
    /// envelope-parsing middleware before the handler runs.
    pub fn set_typed_event(&mut self, event: AnyValue) {
        self.typed_event = Some(event);
    }

    /// Typed view of the installed event.
    pub fn event_as<T: 'static>(&self) -> Result<&T> {
        let event = self.typed_event.as_ref().ok_or_else(|| {
            RuntimeError::InvalidState("no typed event has been installed".into())
        })?;
        event.downcast_ref::<T>().ok_or_else(|| {
            RuntimeError::TypeMismatch(format!(
                "event is not a {}",
                type_name::<T>()
            ))
        })
    }

    /// Store the serialized response. Single assignment: a second call
    /// fails with `InvalidState`.
    pub fn set_response(&mut self, body: Vec<u8>) -> Result<()> {
        if self.response_set {
            return Err(RuntimeError::InvalidState(
                "response already set for this invocation".into(),
            ));
        }
        self.response = Some(body);
        self.response_set = true;
        Ok(())
    }

    /// Replace the current response, returning the previous one.
    /// Intended for middleware that inspects and rewrites the response
    /// after calling `next`.
    pub fn swap_response(&mut self, body: Vec<u8>) -> Option<Vec<u8>> {
        self.response_set = true;
        self.response.replace(body)
    }

    /// Whether a response has been assigned.
    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Take the response for reporting.
    pub fn take_response(&mut self) -> Option<Vec<u8>> {
        self.response.take()
    }

    /// Store an arbitrary per-invocation value under a key.
    pub fn insert_property<T: Send + Sync + 'static>(&mut self, key: impl Into<String>, value: T) {
        self.properties.insert(key.into(), Box::new(value));
    }

    /// Typed property lookup. `Ok(None)` when absent; `TypeMismatch`
    /// when present with a different type.
    pub fn property<T: 'static>(&self, key: &str) -> Result<Option<&T>> {
        match self.properties.get(key) {
            None => Ok(None),
            Some(value) => value.downcast_ref::<T>().map(Some).ok_or_else(|| {
                RuntimeError::TypeMismatch(format!(
                    "property {key:?} is not a {}",
                    type_name::<T>()
                ))
            }),
        }
    }

    /// Release the resolver scope. Safe to call repeatedly; the scope
    /// is disposed at most once.
    pub fn dispose(&mut self) {
        if let Some(mut scope) = self.scope.take() {
            scope.dispose();
        }
    }

    /// Mark a pipeline stage as entered, rejecting re-entry within the
    /// same invocation.
    pub(crate) fn enter_stage(&mut self, index: usize, total: usize) -> Result<()> {
        if self.stages_entered.len() < total {
            self.stages_entered.resize(total, false);
        }
        if self.stages_entered[index] {
            return Err(RuntimeError::InvalidPipelineUsage(index));
        }
        self.stages_entered[index] = true;
        Ok(())
    }
}

impl Drop for InvocationContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("invocation_id", &self.invocation_id)
            .field("trace_id", &self.trace_id)
            .field("deadline", &self.deadline)
            .field("event_len", &self.raw_event.len())
            .field("has_response", &self.response.is_some())
            .field("cancelled", &self.token.is_cancelled())
            .field("property_count", &self.properties.len())
            .field("scope_open", &self.scope.is_some())
            .finish()
    }
}
