//! Runtime error taxonomy and conversions to wire-level reports.

use nimbus_protocol::codec::CodecError;
use nimbus_protocol::report::{CAUSE_ERROR_TYPE, ErrorReport};
use thiserror::Error;

/// Result alias for the runtime core.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Failures produced by the runtime core.
///
/// Invocation-scoped variants are caught at the bootstrap-loop boundary
/// and converted to an [`ErrorReport`]; only `Protocol` and transport
/// failures terminate the loop.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A startup hook failed; the host never starts serving.
    #[error("initialization failed: {0}")]
    Init(String),

    /// The handler or a middleware failed during an invocation.
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    /// The invocation's cancellation token fired before completion.
    #[error("invocation cancelled: deadline exceeded")]
    Timeout,

    /// One or more shutdown hooks failed; all hooks still ran.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    /// Malformed or out-of-sequence control-plane interaction. Fatal to
    /// the bootstrap loop.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A typed accessor was asked for an incompatible type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// An operation was attempted in a state that forbids it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A pipeline stage was entered more than once within a single
    /// invocation.
    #[error("middleware stage {0} entered more than once in a single invocation")]
    InvalidPipelineUsage(usize),

    /// Payload encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The control-plane connection failed at the transport level.
    #[error("control-plane transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl RuntimeError {
    /// Convert into the wire-level report posted to the control plane.
    pub fn to_report(&self) -> ErrorReport {
        match self {
            RuntimeError::Init(_) => ErrorReport::new("Nimbus.InitError", self.to_string()),
            RuntimeError::Handler(err) => report_from_anyhow("Nimbus.HandlerError", err),
            RuntimeError::Timeout => ErrorReport::new("Nimbus.TimeoutError", self.to_string()),
            RuntimeError::Shutdown(err) => {
                let mut report = ErrorReport::new("Nimbus.ShutdownError", err.to_string());
                report.stack_trace = err
                    .failures
                    .iter()
                    .map(|failure| failure.error_message.clone())
                    .collect();
                report
            }
            RuntimeError::Protocol(_) => ErrorReport::new("Nimbus.ProtocolError", self.to_string()),
            RuntimeError::TypeMismatch(_) => {
                ErrorReport::new("Nimbus.TypeMismatch", self.to_string())
            }
            RuntimeError::InvalidState(_) => {
                ErrorReport::new("Nimbus.InvalidState", self.to_string())
            }
            RuntimeError::InvalidPipelineUsage(_) => {
                ErrorReport::new("Nimbus.InvalidPipelineUsage", self.to_string())
            }
            RuntimeError::Codec(err) => ErrorReport::from_error("Nimbus.SerializationError", err),
            RuntimeError::Transport(err) => ErrorReport::from_error("Nimbus.TransportError", err),
        }
    }
}

impl From<anyhow::Error> for RuntimeError {
    fn from(err: anyhow::Error) -> Self {
        RuntimeError::Handler(err)
    }
}

/// Aggregate of every shutdown hook failure, in completion order.
#[derive(Debug, Error)]
#[error("{} shutdown hook(s) failed", .failures.len())]
pub struct ShutdownError {
    /// One captured report per failed hook, completion order.
    pub failures: Vec<ErrorReport>,
}

/// Build a report from an `anyhow::Error`, folding its chain into
/// nested causes.
pub fn report_from_anyhow(error_type: &str, err: &anyhow::Error) -> ErrorReport {
    let mut cause = None;
    let messages: Vec<String> = err.chain().skip(1).take(8).map(ToString::to_string).collect();
    for message in messages.into_iter().rev() {
        cause = Some(Box::new(ErrorReport {
            error_type: CAUSE_ERROR_TYPE.to_string(),
            error_message: message,
            stack_trace: Vec::new(),
            cause,
        }));
    }
    let mut report = ErrorReport::new(error_type, err.to_string());
    report.cause = cause;
    report
}
