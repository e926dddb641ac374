//! Invocation metadata and the control-plane wire constants.
//!
//! Header values are opaque pass-through data: the runtime retains them
//! from the poll response and echoes them back when reporting, without
//! interpreting anything beyond the deadline.

use chrono::{DateTime, TimeZone, Utc};

/// Poll endpoint: blocks until the control plane has work.
pub const INVOCATION_NEXT_PATH: &str = "/runtime/invocation/next";

/// Startup-failure endpoint, only valid before the first poll.
pub const INIT_ERROR_PATH: &str = "/runtime/init/error";

/// Header carrying the opaque invocation id.
pub const HEADER_INVOCATION_ID: &str = "nimbus-runtime-invocation-id";

/// Header carrying the absolute invocation deadline in epoch milliseconds.
pub const HEADER_DEADLINE_MS: &str = "nimbus-runtime-deadline-ms";

/// Header carrying the opaque trace id.
pub const HEADER_TRACE_ID: &str = "nimbus-runtime-trace-id";

/// Header carrying the identity of the invoked function.
pub const HEADER_FUNCTION_ARN: &str = "nimbus-runtime-function-arn";

/// Response-report path for one invocation id.
pub fn invocation_response_path(id: &str) -> String {
    format!("/runtime/invocation/{id}/response")
}

/// Error-report path for one invocation id.
pub fn invocation_error_path(id: &str) -> String {
    format!("/runtime/invocation/{id}/error")
}

/// One unit of work dispatched by the control plane, bounded by an
/// absolute deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Opaque id used to correlate the response or error report.
    pub id: String,
    /// Absolute time by which the outcome must be reported.
    pub deadline: DateTime<Utc>,
    /// Raw event payload, exactly as received.
    pub payload: Vec<u8>,
    /// Opaque trace id, echoed back untouched.
    pub trace_id: Option<String>,
    /// Identity of the invoked function.
    pub function_arn: Option<String>,
}

impl Invocation {
    /// Wire form of the deadline.
    pub fn deadline_ms(&self) -> i64 {
        self.deadline.timestamp_millis()
    }

    /// Parse a wire deadline. `None` for values chrono cannot represent.
    pub fn deadline_from_ms(ms: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(ms).single()
    }
}
