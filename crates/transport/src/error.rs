// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors raised by the data-channel transport (C1 endpoint binding, C2
/// router dispatch, the shared-memory fast path).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {endpoint}: {source}")]
    BindFailed { endpoint: String, source: String },
    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),
    #[error("shared memory buffer for node {node_id} could not be grown: {reason}")]
    ShmemGrowFailed { node_id: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
