// SPDX-License-Identifier: Apache-2.0

//! Control-channel JSON message shapes (spec.md §4.4, §6.2).
//!
//! The control channel is line-oriented JSON: one object per line. Requests
//! are not tagged by a single `serde(tag = ...)` discriminant because the
//! wire format itself isn't tagged that way (a query is recognized by the
//! presence of a `query` key, a worker command by `cmd`) — so parsing goes
//! through a small dispatcher, `parse`, that mirrors the original
//! `_checkQuery` / `lineReceived` branching in
//! `examples/original_source/veles/server.py`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The two supported informational queries (spec.md §4.4 "query").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Nodes,
    Endpoints,
}

impl QueryKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "nodes" => Some(Self::Nodes),
            "endpoints" => Some(Self::Endpoints),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct QueryWire {
    query: String,
    workflow: Option<String>,
}

/// A validated `query` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub kind: QueryKind,
    pub workflow_checksum: String,
}

/// `{cmd: "handshake", ...}` (spec.md §4.4).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HandshakeRequest {
    pub checksum: Option<String>,
    pub id: Option<String>,
    pub power: Option<f64>,
    pub mid: Option<String>,
    pub pid: Option<u32>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub argv: Option<Vec<String>>,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default, rename = "PYTHONPATH")]
    pub python_path: Option<String>,
}

/// `{cmd: "change_power", power: <float>}` (spec.md §4.4).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChangePowerRequest {
    pub power: Option<f64>,
}

/// A parsed, not-yet-validated control-channel line.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    Query(RawQuery),
    Handshake(HandshakeRequest),
    ChangePower(ChangePowerRequest),
    /// `cmd` was present but not one this master responds to.
    UnknownCommand(String),
}

/// A `query` request prior to checksum validation (the caller still needs
/// to compare `workflow_checksum` against the master's own checksum; see
/// `validate`).
#[derive(Debug, Clone)]
pub struct RawQuery {
    pub query_name: String,
    pub workflow_checksum: Option<String>,
}

impl RawQuery {
    /// Validate the checksum and query name, producing a `QueryRequest` or
    /// the exact error string the original master would send.
    pub fn validate(&self, our_checksum: &str) -> Result<QueryRequest, ControlError> {
        let checksum = self
            .workflow_checksum
            .clone()
            .ok_or(ControlError::MissingWorkflowChecksum)?;
        if checksum != our_checksum {
            return Err(ControlError::ChecksumMismatchShort(our_checksum.to_string()));
        }
        let kind = QueryKind::parse(&self.query_name)
            .ok_or_else(|| ControlError::UnsupportedQuery(self.query_name.clone()))?;
        Ok(QueryRequest { kind, workflow_checksum: checksum })
    }
}

/// Errors that become `{"error": ...}` replies on the control channel.
/// Message text matches `server.py` verbatim where the spec quotes it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Workflow checksum was not specified")]
    MissingWorkflowChecksum,
    #[error("{0} query is not supported")]
    UnsupportedQuery(String),
    #[error("Workflow checksum mismatch: mine is {0}")]
    ChecksumMismatchShort(String),
    #[error("Workflow checksum is missing")]
    HandshakeChecksumMissing,
    #[error("Workflow checksum mismatch: expected {expected}, got {got}")]
    HandshakeChecksumMismatch { expected: String, got: String },
    #[error("I need your computing power")]
    MissingPower,
    #[error("I need your machine id")]
    MissingMid,
    #[error("I need your process id")]
    MissingPid,
    #[error("no 'power' key in the message")]
    MissingPowerForChangePower,
    #[error("No responder exists for command {0}")]
    NoResponder(String),
    #[error("You must reconnect as a slave to send commands")]
    NotASlave,
    #[error(transparent)]
    Json(#[from] JsonLineError),
}

/// Wrapper so `serde_json::Error` can derive `Clone`/`PartialEq` via its
/// string rendering — the original only ever surfaces the message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct JsonLineError(pub String);

/// Parse one control-channel line into a dispatchable request.
///
/// Returns `Ok(None)` for a query-shaped message so the caller can validate
/// and reply without ever constructing a `ControlRequest` for it (queries
/// mark the session `not_a_slave` as a side effect the caller applies).
pub fn parse(line: &str) -> Result<ControlRequest, ControlError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| JsonLineError(e.to_string()))?;
    if !value.is_object() {
        return Err(JsonLineError("expected a JSON object".to_string()).into());
    }
    if let Some(query) = value.get("query").and_then(|v| v.as_str()) {
        let workflow_checksum =
            value.get("workflow").and_then(|v| v.as_str()).map(|s| s.to_string());
        return Ok(ControlRequest::Query(RawQuery {
            query_name: query.to_string(),
            workflow_checksum,
        }));
    }
    let cmd = value.get("cmd").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    match cmd.as_str() {
        "handshake" => {
            let req: HandshakeRequest =
                serde_json::from_value(value).map_err(|e| JsonLineError(e.to_string()))?;
            Ok(ControlRequest::Handshake(req))
        }
        "change_power" => {
            let req: ChangePowerRequest =
                serde_json::from_value(value).map_err(|e| JsonLineError(e.to_string()))?;
            Ok(ControlRequest::ChangePower(req))
        }
        other => Ok(ControlRequest::UnknownCommand(other.to_string())),
    }
}

/// Successful handshake acceptance reply (spec.md §6.2).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HandshakeAccepted {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub endpoint: String,
    pub data: serde_json::Value,
    pub log_id: String,
}

/// `{"reconnect": "ok"}` reply for a known id (spec.md §6.2).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReconnectOk {
    pub reconnect: &'static str,
}

impl Default for ReconnectOk {
    fn default() -> Self {
        Self { reconnect: "ok" }
    }
}

/// `{"error": <string>}` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReply {
    pub error: String,
}

impl ErrorReply {
    pub fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
