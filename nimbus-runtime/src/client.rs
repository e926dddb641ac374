//! HTTP client for the control-plane protocol.

use reqwest::{Response, StatusCode, header::HeaderMap};
use tracing::trace;

use nimbus_protocol::invocation::{
    HEADER_DEADLINE_MS, HEADER_FUNCTION_ARN, HEADER_INVOCATION_ID, HEADER_TRACE_ID,
    INIT_ERROR_PATH, INVOCATION_NEXT_PATH, invocation_error_path, invocation_response_path,
};
use nimbus_protocol::{ErrorReport, Invocation};

use crate::error::{Result, RuntimeError};

/// Thin wrapper over the control-plane HTTP API.
///
/// Header values are retained verbatim and echoed back; the client
/// interprets nothing beyond the deadline. The poll call has no request
/// timeout: it blocks until the control plane has work.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base: String,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    /// Client for the given endpoint, e.g. `http://127.0.0.1:9001`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let mut base = endpoint.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    /// Endpoint this client talks to.
    pub fn endpoint(&self) -> &str {
        &self.base
    }

    /// Block until the control plane dispatches the next invocation.
    pub async fn next_invocation(&self) -> Result<Invocation> {
        let response = self
            .http
            .get(format!("{}{INVOCATION_NEXT_PATH}", self.base))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(RuntimeError::Protocol(format!(
                "next-invocation poll returned {}",
                response.status()
            )));
        }

        let headers = response.headers();
        let id = required_header(headers, HEADER_INVOCATION_ID)?;
        let deadline_ms: i64 = required_header(headers, HEADER_DEADLINE_MS)?
            .parse()
            .map_err(|_| {
                RuntimeError::Protocol(format!("{HEADER_DEADLINE_MS} is not an integer"))
            })?;
        let deadline = Invocation::deadline_from_ms(deadline_ms).ok_or_else(|| {
            RuntimeError::Protocol(format!("{HEADER_DEADLINE_MS} is out of range: {deadline_ms}"))
        })?;
        let trace_id = optional_header(headers, HEADER_TRACE_ID)?;
        let function_arn = optional_header(headers, HEADER_FUNCTION_ARN)?;

        let payload = response.bytes().await?.to_vec();
        trace!(invocation_id = %id, payload_len = payload.len(), "invocation received");

        Ok(Invocation {
            id,
            deadline,
            payload,
            trace_id,
            function_arn,
        })
    }

    /// Report a successful invocation.
    pub async fn post_response(&self, id: &str, body: Vec<u8>) -> Result<()> {
        let response = self
            .http
            .post(format!("{}{}", self.base, invocation_response_path(id)))
            .body(body)
            .send()
            .await?;
        expect_accepted(&response, "invocation response")
    }

    /// Report a failed invocation.
    pub async fn post_error(&self, id: &str, report: &ErrorReport) -> Result<()> {
        let response = self
            .http
            .post(format!("{}{}", self.base, invocation_error_path(id)))
            .json(report)
            .send()
            .await?;
        expect_accepted(&response, "invocation error")
    }

    /// Report a startup failure. Only valid before the first poll.
    pub async fn post_init_error(&self, report: &ErrorReport) -> Result<()> {
        let response = self
            .http
            .post(format!("{}{INIT_ERROR_PATH}", self.base))
            .json(report)
            .send()
            .await?;
        expect_accepted(&response, "init error")
    }
}

fn expect_accepted(response: &Response, what: &str) -> Result<()> {
    if response.status() == StatusCode::ACCEPTED {
        Ok(())
    } else {
        Err(RuntimeError::Protocol(format!(
            "{what} report returned {}",
            response.status()
        )))
    }
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String> {
    optional_header(headers, name)?
        .ok_or_else(|| RuntimeError::Protocol(format!("missing required header {name}")))
}

fn optional_header(headers: &HeaderMap, name: &str) -> Result<Option<String>> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|value| Some(value.to_string()))
            .map_err(|_| RuntimeError::Protocol(format!("header {name} is not valid UTF-8"))),
    }
}
