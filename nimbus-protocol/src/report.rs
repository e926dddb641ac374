//! Structured failure payloads reported to the control plane.

use std::error::Error;

use serde::{Deserialize, Serialize};

/// Error type used for nested causes whose concrete type is erased.
pub const CAUSE_ERROR_TYPE: &str = "Nimbus.Cause";

/// Cause chains are bounded by the original error chain depth, and
/// additionally capped so a pathological chain cannot balloon a report.
const MAX_CAUSE_DEPTH: usize = 8;

/// Structured failure payload, serialized to the control plane on the
/// error-report endpoints and surfaced to test callers by the emulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Coarse classification, e.g. `Nimbus.TimeoutError`.
    pub error_type: String,
    /// Human-readable description of the failure.
    pub error_message: String,
    /// Ordered stack frames, outermost first. May be empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<String>,
    /// Nested cause. Acyclic by construction: built by walking a
    /// finite `source()` chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorReport>>,
}

impl ErrorReport {
    /// New report with no stack frames and no cause.
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: Vec::new(),
            cause: None,
        }
    }

    /// Attach ordered stack frames.
    pub fn with_stack(mut self, frames: Vec<String>) -> Self {
        self.stack_trace = frames;
        self
    }

    /// Attach a nested cause.
    pub fn with_cause(mut self, cause: ErrorReport) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Build a report from an error, walking its `source()` chain into
    /// the nested cause list.
    pub fn from_error(error_type: &str, err: &(dyn Error + 'static)) -> Self {
        Self {
            error_type: error_type.to_string(),
            error_message: err.to_string(),
            stack_trace: Vec::new(),
            cause: cause_chain(err, MAX_CAUSE_DEPTH),
        }
    }

    /// Depth of the cause chain, the report itself included.
    pub fn depth(&self) -> usize {
        1 + self.cause.as_ref().map_or(0, |cause| cause.depth())
    }
}

fn cause_chain(err: &(dyn Error + 'static), remaining: usize) -> Option<Box<ErrorReport>> {
    if remaining == 0 {
        return None;
    }
    let source = err.source()?;
    Some(Box::new(ErrorReport {
        error_type: CAUSE_ERROR_TYPE.to_string(),
        error_message: source.to_string(),
        stack_trace: Vec::new(),
        cause: cause_chain(source, remaining - 1),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failed")]
    struct Outer {
        #[source]
        inner: Inner,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("inner failed")]
    struct Inner;

    #[test]
    fn wire_shape_is_camel_case_with_optional_fields_elided() {
        let report = ErrorReport::new("Nimbus.HandlerError", "boom");
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(
            value,
            json!({"errorType": "Nimbus.HandlerError", "errorMessage": "boom"})
        );
    }

    #[test]
    fn wire_shape_includes_stack_and_recursive_cause() {
        let report = ErrorReport::new("Nimbus.HandlerError", "boom")
            .with_stack(vec!["frame-0".into(), "frame-1".into()])
            .with_cause(ErrorReport::new(CAUSE_ERROR_TYPE, "root"));
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(
            value,
            json!({
                "errorType": "Nimbus.HandlerError",
                "errorMessage": "boom",
                "stackTrace": ["frame-0", "frame-1"],
                "cause": {"errorType": CAUSE_ERROR_TYPE, "errorMessage": "root"},
            })
        );
    }

    #[test]
    fn from_error_walks_the_source_chain() {
        let err = Outer { inner: Inner };
        let report = ErrorReport::from_error("Nimbus.HandlerError", &err);
        assert_eq!(report.error_message, "outer failed");
        let cause = report.cause.as_deref().unwrap();
        assert_eq!(cause.error_type, CAUSE_ERROR_TYPE);
        assert_eq!(cause.error_message, "inner failed");
        assert!(cause.cause.is_none());
        assert_eq!(report.depth(), 2);
    }

    #[test]
    fn deserializes_reports_without_optional_fields() {
        let report: ErrorReport =
            serde_json::from_value(json!({"errorType": "X", "errorMessage": "y"})).unwrap();
        assert!(report.stack_trace.is_empty());
        assert!(report.cause.is_none());
    }
}
