// SPDX-License-Identifier: Apache-2.0

//! C2: the data-channel router (spec.md §4.2).
//!
//! Wraps a single `zeromq::RouterSocket` bound to all three transports.
//! Every inbound multipart message is `[routing_token, node_id, command,
//! payload]`; the router remembers the routing token for the last message
//! seen on each `(command, node_id)` pair so a reply — sent later, after an
//! `await` into the workflow — can still find its way back to the right
//! peer. A token is consumed (popped) the moment a reply goes out on that
//! channel, matching `server.py`'s `self.routing[channel].pop(node_id)`.
//!
//! Unlike the original, a missing routing-table entry does not silently
//! drop `"error"` replies: `server.py` only pre-seeds `self.routing` with
//! `job`/`update` keys, so its own `reply(node_id, b'error', ...)` calls
//! always raise and are swallowed by the blanket `except KeyError` — the
//! peer never actually hears about its own unknown-node/unknown-command
//! mistake. Since every inbound message's token is captured under its own
//! raw command string before that string is even validated, the same table
//! serves `"error"` replies too, so a confused peer gets an answer rather
//! than a dead letter.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};
use zeromq::{RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use veld_wire::{Command, JobReply, UpdateReply};

use crate::endpoints::{self, Endpoints};
use crate::error::TransportError;
use crate::shmem::SharedJobBuffer;

/// Compression applied to `"job"`/`"update"` payloads on non-ipc transports
/// (spec.md §4.2: "on non-ipc transports, job/update payloads may be
/// compressed using a configurable compression algorithm; on ipc, no
/// compression"). The ipc shared-memory fast path is already zero-copy, so
/// `reply_job`/`reply_update` never compress when `is_ipc` is set regardless
/// of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

impl Default for Compression {
    /// Matches the level `zstd` itself treats as its balanced default.
    fn default() -> Self {
        Compression::Zstd { level: 3 }
    }
}

impl Compression {
    fn encode(self, payload: &[u8]) -> Vec<u8> {
        match self {
            Compression::None => payload.to_vec(),
            Compression::Zstd { level } => {
                zstd::encode_all(payload, level).unwrap_or_else(|err| {
                    warn!(%err, "zstd compression failed, sending payload uncompressed");
                    payload.to_vec()
                })
            }
        }
    }
}

/// One structurally valid inbound message: 4 frames, payload present. The
/// `command` is the raw string from the wire — callers validate it against
/// `veld_wire::Command` themselves, since an unrecognized command is still
/// addressable for an `"error"` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub node_id: String,
    pub command: String,
    pub payload: Vec<u8>,
}

pub struct Router {
    socket: RouterSocket,
    endpoints: Endpoints,
    routing: HashMap<(String, String), Vec<u8>>,
    shmem: HashMap<String, SharedJobBuffer>,
    use_shmem: bool,
    compression: Compression,
}

impl Router {
    /// Bind a fresh router to all three transports (spec.md §4.1).
    pub async fn bind(
        master_id: &str,
        ipc_dir: &Path,
        tcp_port_range: std::ops::RangeInclusive<u16>,
        use_shmem: bool,
    ) -> Result<Self, TransportError> {
        let mut socket = RouterSocket::new();
        let endpoints = endpoints::bind(&mut socket, master_id, ipc_dir, tcp_port_range).await?;
        Ok(Self {
            socket,
            endpoints,
            routing: HashMap::new(),
            shmem: HashMap::new(),
            use_shmem,
            compression: Compression::default(),
        })
    }

    /// Override the non-ipc compression algorithm (spec.md §4.2; defaults to
    /// `Compression::default()`).
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Receive and structurally validate one message. Returns `Ok(None)`
    /// when the message was malformed and already handled internally (an
    /// `"error"` reply sent, or nothing at all if even the node id couldn't
    /// be recovered) — the caller just loops back to `recv` again.
    pub async fn recv(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        let multipart = self.socket.recv().await?;
        let frames: Vec<Vec<u8>> = multipart.into_vec().into_iter().map(|b| b.to_vec()).collect();

        if frames.len() < 3 {
            warn!(frame_count = frames.len(), "malformed message with no recoverable node id, dropping");
            return Ok(None);
        }
        let token = frames[0].clone();
        let node_id = String::from_utf8_lossy(&frames[1]).into_owned();
        let command = String::from_utf8_lossy(&frames[2]).into_owned();
        debug!(%node_id, %command, "received data-channel message");
        self.routing.insert((command.clone(), node_id.clone()), token.clone());

        if frames.len() < 4 {
            self.routing.remove(&(command.clone(), node_id.clone()));
            self.send_raw(token, node_id.as_bytes(), Command::Error.as_str(), b"Invalid message".to_vec())
                .await?;
            return Ok(None);
        }
        Ok(Some(InboundMessage { node_id, command, payload: frames[3].clone() }))
    }

    /// Reply with `"error"` on behalf of `(command, node_id)`, reusing the
    /// token captured when that message was received. A missing token
    /// means the peer has already been answered or disconnected; logged
    /// and otherwise ignored, matching the original's tolerant behavior.
    pub async fn reply_error(
        &mut self,
        node_id: &str,
        command: &str,
        message: &str,
    ) -> Result<(), TransportError> {
        let Some(token) = self.routing.remove(&(command.to_string(), node_id.to_string())) else {
            warn!(%node_id, %command, "could not find routing token for error reply");
            return Ok(());
        };
        self.send_raw(token, node_id.as_bytes(), Command::Error.as_str(), message.as_bytes().to_vec())
            .await
    }

    /// Reply on the `"job"` channel, using the per-node shared buffer when
    /// `use_shmem` is set and the peer is reached over ipc (spec.md §4.2;
    /// only the job channel ever uses the buffer).
    pub async fn reply_job(
        &mut self,
        node_id: &str,
        reply: JobReply,
        is_ipc: bool,
    ) -> Result<(), TransportError> {
        let Some(token) = self.routing.remove(&(Command::Job.as_str().to_string(), node_id.to_string())) else {
            warn!(%node_id, "could not find routing token for job reply");
            return Ok(());
        };
        let payload = reply.into_bytes();
        if self.use_shmem && is_ipc {
            self.send_job_via_shmem(node_id, &token, &payload).await?;
        } else {
            let payload = if is_ipc { payload } else { self.compression.encode(&payload) };
            self.send_raw(token, node_id.as_bytes(), Command::Job.as_str(), payload).await?;
        }
        Ok(())
    }

    /// Reply on the `"update"` channel (never uses the shared buffer; spec.md
    /// §4.2 compression applies here too on non-ipc transports).
    pub async fn reply_update(
        &mut self,
        node_id: &str,
        reply: UpdateReply,
        is_ipc: bool,
    ) -> Result<(), TransportError> {
        let Some(token) = self.routing.remove(&(Command::Update.as_str().to_string(), node_id.to_string()))
        else {
            warn!(%node_id, "could not find routing token for update reply");
            return Ok(());
        };
        let payload = reply.encode().to_vec();
        let payload = if is_ipc { payload } else { self.compression.encode(&payload) };
        self.send_raw(token, node_id.as_bytes(), Command::Update.as_str(), payload).await
    }

    async fn send_job_via_shmem(
        &mut self,
        node_id: &str,
        token: &[u8],
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let overflowed = match self.shmem.get_mut(node_id) {
            Some(buf) => buf.try_reuse(payload).is_err(),
            None => true,
        };
        if overflowed {
            self.shmem.insert(
                node_id.to_string(),
                SharedJobBuffer::with_capacity_for(format!("veld-job-{node_id}"), payload.len()),
            );
            if let Some(buf) = self.shmem.get_mut(node_id) {
                // Freshly allocated for exactly this payload; cannot overflow.
                let _ = buf.try_reuse(payload);
            }
        }
        self.send_raw(token.to_vec(), node_id.as_bytes(), Command::Job.as_str(), payload.to_vec()).await
    }

    async fn send_raw(
        &mut self,
        token: Vec<u8>,
        node_id: &[u8],
        command: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut multipart = ZmqMessage::from(token);
        multipart.push_back(node_id.to_vec().into());
        multipart.push_back(command.as_bytes().to_vec().into());
        multipart.push_back(payload.into());
        self.socket.send(multipart).await?;
        Ok(())
    }

    /// Drop any per-node state (routing tokens, shared buffer) kept for a
    /// node that has left (spec.md §4.3 `drop`).
    pub fn forget_node(&mut self, node_id: &str) {
        self.routing.retain(|(_, n), _| n != node_id);
        self.shmem.remove(node_id);
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
