// SPDX-License-Identifier: Apache-2.0

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! veld-wire: the two wire formats the master speaks.
//!
//! `control` is the line-JSON handshake/query/command protocol (spec.md
//! §4.4, §6.2); `data` is the 4-frame multipart job/update protocol
//! (spec.md §4.2, §6.3). `framing` provides the newline-delimited line
//! codec the control channel runs over.

pub mod control;
pub mod data;
pub mod framing;

pub use control::{
    ChangePowerRequest, ControlError, ControlRequest, ErrorReply, HandshakeAccepted,
    HandshakeRequest, QueryKind, QueryRequest, RawQuery, ReconnectOk,
};
pub use data::{
    Command, DataWireError, Header, JobReply, UpdateReply, EMPTY_REQUEST, JOB_REFUSED,
    NEED_UPDATE, UPDATE_ACCEPTED, UPDATE_REJECTED,
};
pub use framing::{read_line, write_line, FramingError};
