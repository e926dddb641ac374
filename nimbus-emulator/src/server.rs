//! Axum surface speaking the control-plane wire protocol over a
//! loopback listener.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use nimbus_protocol::invocation::{
    HEADER_DEADLINE_MS, HEADER_FUNCTION_ARN, HEADER_INVOCATION_ID, HEADER_TRACE_ID,
    INIT_ERROR_PATH, INVOCATION_NEXT_PATH,
};
use nimbus_protocol::ErrorReport;

use crate::core::{Completion, DispatchCore};
use crate::error::EmulatorError;

/// Build the wire router over a shared dispatch core.
pub fn wire_router(core: Arc<DispatchCore>) -> Router {
    Router::new()
        .route(INVOCATION_NEXT_PATH, get(next_invocation))
        .route("/runtime/invocation/{id}/response", post(post_response))
        .route("/runtime/invocation/{id}/error", post(post_error))
        .route(INIT_ERROR_PATH, post(post_init_error))
        .layer(TraceLayer::new_for_http())
        .with_state(core)
}

/// Bind the wire protocol on an ephemeral loopback port.
///
/// Returns the bound address, a token that stops the listener, and the
/// serve task's handle.
pub async fn bind_wire(
    core: Arc<DispatchCore>,
) -> Result<(SocketAddr, CancellationToken, JoinHandle<()>), EmulatorError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let token = CancellationToken::new();
    let router = wire_router(core);
    let shutdown = token.clone();
    let task = tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned());
        if let Err(err) = serve.await {
            debug!(error = %err, "wire listener terminated with an error");
        }
    });
    info!(%addr, "control-plane wire bound");
    Ok((addr, token, task))
}

async fn next_invocation(
    State(core): State<Arc<DispatchCore>>,
) -> Result<Response, EmulatorError> {
    let Some(invocation) = core.next().await else {
        // Queue closed: the emulator is tearing down.
        return Ok(StatusCode::SERVICE_UNAVAILABLE.into_response());
    };
    debug!(invocation_id = %invocation.id, "invocation leased");
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static(HEADER_INVOCATION_ID),
        header_value(&invocation.id)?,
    );
    headers.insert(
        HeaderName::from_static(HEADER_DEADLINE_MS),
        header_value(&invocation.deadline_ms().to_string())?,
    );
    if let Some(trace_id) = &invocation.trace_id {
        headers.insert(HeaderName::from_static(HEADER_TRACE_ID), header_value(trace_id)?);
    }
    if let Some(arn) = &invocation.function_arn {
        headers.insert(HeaderName::from_static(HEADER_FUNCTION_ARN), header_value(arn)?);
    }
    Ok((StatusCode::OK, headers, invocation.payload).into_response())
}

async fn post_response(
    State(core): State<Arc<DispatchCore>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, EmulatorError> {
    core.complete(&id, Completion::Response(body.to_vec()))?;
    Ok(StatusCode::ACCEPTED)
}

async fn post_error(
    State(core): State<Arc<DispatchCore>>,
    Path(id): Path<String>,
    axum::Json(report): axum::Json<ErrorReport>,
) -> Result<StatusCode, EmulatorError> {
    core.complete(&id, Completion::Error(report))?;
    Ok(StatusCode::ACCEPTED)
}

async fn post_init_error(
    State(core): State<Arc<DispatchCore>>,
    axum::Json(report): axum::Json<ErrorReport>,
) -> Result<StatusCode, EmulatorError> {
    core.record_init_error(report)?;
    Ok(StatusCode::ACCEPTED)
}

fn header_value(value: &str) -> Result<HeaderValue, EmulatorError> {
    HeaderValue::from_str(value)
        .map_err(|_| EmulatorError::InvalidState(format!("non-ascii header value: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_value_rejects_control_characters() {
        assert!(header_value("inv\n1").is_err());
        assert!(header_value("inv-1").is_ok());
    }
}
