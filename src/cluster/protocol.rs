//! Wire format for the agent ↔ master connection.
//!
//! Every call is a text frame `{"type":"call","id","event","payload"}` and is
//! answered by exactly one `{"type":"ack","id","payload"}`. A payload of
//! `{"isError": true, "message": ...}` marks an application-level failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{LockRequest, RunToken};
use crate::error::ClusterError;

/// Path the agent namespace is served under.
pub const NAMESPACE_AGENT: &str = "/agent";

pub const EVENT_IDENTIFY: &str = "identify";
pub const EVENT_REGISTER_JOB: &str = "register-job";
pub const EVENT_HANDLE_LOCKS: &str = "handle-locks";
pub const EVENT_JOB_END: &str = "job-end";

/// A single message on the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Call {
        id: u64,
        event: String,
        #[serde(default)]
        payload: Value,
    },
    Ack {
        id: u64,
        #[serde(default)]
        payload: Value,
    },
}

#[derive(Debug, Serialize)]
pub struct RegisterJobPayload<'a> {
    pub job_name: &'a str,
    pub agent_name: &'a str,
}

#[derive(Debug, Serialize)]
pub struct HandleLocksPayload<'a> {
    pub agent_name: &'a str,
    pub job_name: &'a str,
    pub lock_data: &'a [LockRequest],
}

#[derive(Debug, Serialize)]
pub struct JobEndPayload<'a> {
    pub id: &'a RunToken,
    pub lock_data: &'a [LockRequest],
}

/// Build the acknowledgement payload a master sends on failure.
#[cfg(test)]
pub(crate) fn error_payload(message: impl Into<String>) -> Value {
    serde_json::json!({ "isError": true, "message": message.into() })
}

/// Turn an ack payload into the call's result.
pub fn ack_result(event: &str, payload: Value) -> Result<Value, ClusterError> {
    let is_error = payload
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if is_error {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(ClusterError::Remote {
            event: event.to_string(),
            message,
        });
    }

    Ok(payload)
}
