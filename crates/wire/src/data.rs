// SPDX-License-Identifier: Apache-2.0

//! Data-channel wire format (spec.md §6.3): 4 frames
//! `[routing, node_id, command, payload]`.
//!
//! `veld-wire` only knows how to encode/decode the `payload` frame for each
//! command; framing the 4-tuple itself, and the shared-memory fast path,
//! belong to `veld-transport`'s Router (C2), which is the only component
//! that talks to the socket layer.

use thiserror::Error;

/// The three data-channel commands (spec.md §4.2, §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Job,
    Update,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Job => "job",
            Command::Update => "update",
            Command::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "job" => Some(Command::Job),
            "update" => Some(Command::Update),
            "error" => Some(Command::Error),
            _ => None,
        }
    }
}

/// Literal sentinel payload for "try again after your next update"
/// (spec.md §4.5 "postpone_job").
pub const NEED_UPDATE: &[u8] = b"NEED_UPDATE";
/// Literal payload for an accepted update ack (spec.md §6.3).
pub const UPDATE_ACCEPTED: &[u8] = b"1";
/// Literal payload for a rejected update ack (spec.md §6.3).
pub const UPDATE_REJECTED: &[u8] = b"0";
/// Literal payload for a refused job (spec.md §4.5 "refuse_job"): the
/// worker-side protocol represents this as a boolean `false`, encoded here
/// as the single JSON token so it round-trips through any payload codec.
pub const JOB_REFUSED: &[u8] = b"false";
/// An empty job *request* frame, sent worker -> master (spec.md §6.3).
pub const EMPTY_REQUEST: &[u8] = b"";

/// Master -> worker reply on the `"job"` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReply {
    /// A job was generated; ship the bytes.
    Data(Vec<u8>),
    /// Ask the worker to send its pending update first (spec.md
    /// "postpone_job").
    NeedUpdate,
    /// The workflow refused to ever give this node a job.
    Refused,
}

impl JobReply {
    pub fn encode(&self) -> &[u8] {
        match self {
            JobReply::Data(bytes) => bytes,
            JobReply::NeedUpdate => NEED_UPDATE,
            JobReply::Refused => JOB_REFUSED,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            JobReply::Data(bytes) => bytes,
            JobReply::NeedUpdate => NEED_UPDATE.to_vec(),
            JobReply::Refused => JOB_REFUSED.to_vec(),
        }
    }
}

/// Master -> worker reply on the `"update"` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReply {
    Accepted,
    Rejected,
}

impl UpdateReply {
    pub fn from_accepted(accepted: bool) -> Self {
        if accepted {
            UpdateReply::Accepted
        } else {
            UpdateReply::Rejected
        }
    }

    pub fn encode(&self) -> &'static [u8] {
        match self {
            UpdateReply::Accepted => UPDATE_ACCEPTED,
            UpdateReply::Rejected => UPDATE_REJECTED,
        }
    }
}

/// A fully parsed inbound data-channel header, before the payload is
/// interpreted (spec.md §4.2 "parse incoming headers").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub routing_token: Vec<u8>,
    pub node_id: String,
    pub command: Command,
}

/// Errors raised while parsing a raw multipart frame sequence.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataWireError {
    #[error("Invalid message")]
    InvalidMessage,
    #[error("Unknown command")]
    UnknownCommand,
}

/// Parse the first three frames of an inbound multipart message
/// (spec.md §4.2: "Header shorter than 3 frames -> Invalid message").
pub fn parse_header(frames: &[Vec<u8>]) -> Result<Header, DataWireError> {
    if frames.len() < 3 {
        return Err(DataWireError::InvalidMessage);
    }
    let routing_token = frames[0].clone();
    let node_id = String::from_utf8_lossy(&frames[1]).into_owned();
    let command_str = String::from_utf8_lossy(&frames[2]).into_owned();
    let command = Command::parse(&command_str).ok_or(DataWireError::UnknownCommand)?;
    Ok(Header { routing_token, node_id, command })
}

#[cfg(test)]
#[path = "data_tests.rs"]
mod tests;
