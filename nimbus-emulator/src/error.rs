//! Emulator error taxonomy.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use nimbus_protocol::CodecError;
use nimbus_runtime::{InitOutcome, RuntimeError, ShutdownError};

/// Everything that can go wrong inside the emulator or be surfaced
/// from the hosted runtime.
#[derive(Debug, Error)]
pub enum EmulatorError {
    /// An operation was attempted in a server state that forbids it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A completion referenced an invocation id the emulator never
    /// dispatched (or already completed).
    #[error("unknown invocation id: {0}")]
    UnknownInvocation(String),

    /// The hosted runtime failed to initialize.
    #[error("runtime initialization failed")]
    InitFailed(InitOutcome),

    /// Binding or driving the loopback listener failed.
    #[error("wire listener error")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// One or more shutdown hooks failed while stopping.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    /// The hosted runtime's serve loop failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The host task went away while an invocation was in flight.
    #[error("the dispatch channel closed unexpectedly")]
    ChannelClosed,
}

impl EmulatorError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidState(_) | Self::UnknownInvocation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EmulatorError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "message": self.to_string() }));
        (status, body).into_response()
    }
}
