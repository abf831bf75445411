// SPDX-License-Identifier: Apache-2.0

//! C1: endpoint binding (spec.md §4.1, §6.1).
//!
//! A master binds the same `RouterSocket` to three transports and
//! advertises all three so a connecting node can pick the most local one
//! it shares with the master: `inproc` if it's in the same process,
//! `ipc` if it's on the same host, `tcp` otherwise.

use std::ops::RangeInclusive;
use std::path::Path;

use rand::Rng;
use tracing::{info, warn};
use zeromq::{RouterSocket, Socket};

use crate::error::TransportError;

/// TCP ports the master tries to claim a random one from, mirroring the
/// original `rndtcp://*:1024:65535` endpoint (spec.md §6.1).
pub const DEFAULT_TCP_PORT_RANGE: RangeInclusive<u16> = 1024..=65535;

const BIND_ATTEMPTS: u32 = 20;

/// The three transports a master advertises (spec.md §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub inproc: String,
    pub ipc: String,
    pub tcp: String,
}

impl Endpoints {
    /// Pick the most local transport two peers share (spec.md §4.1
    /// locality rule: same process beats same host beats cross-host).
    pub fn select_for(&self, same_process: bool, same_host: bool) -> &str {
        if same_process {
            &self.inproc
        } else if same_host {
            &self.ipc
        } else {
            &self.tcp
        }
    }
}

/// Bind `socket` to all three transports and return the endpoint map to
/// advertise. Binding is fatal on failure: a master that cannot open its
/// transports cannot run (spec.md §7 "bind failure is fatal").
pub async fn bind(
    socket: &mut RouterSocket,
    master_id: &str,
    ipc_dir: &Path,
    tcp_port_range: RangeInclusive<u16>,
) -> Result<Endpoints, TransportError> {
    let inproc = format!("inproc://veld-{master_id}");
    bind_one(socket, &inproc).await?;

    let ipc_path = ipc_dir.join(format!("veld-{master_id}.ipc"));
    if ipc_path.exists() {
        // A stale socket file from a prior crashed run blocks bind; this
        // path is freshly random per master id, so it's never someone
        // else's live socket.
        if let Err(err) = std::fs::remove_file(&ipc_path) {
            warn!(path = %ipc_path.display(), %err, "failed to remove stale ipc socket file");
        }
    }
    let ipc = format!("ipc://{}", ipc_path.display());
    bind_one(socket, &ipc).await?;

    let tcp = bind_tcp_in_range(socket, tcp_port_range).await?;

    info!(%inproc, %ipc, %tcp, "router bound to all transports");
    Ok(Endpoints { inproc, ipc, tcp })
}

async fn bind_one(socket: &mut RouterSocket, endpoint: &str) -> Result<(), TransportError> {
    socket.bind(endpoint).await.map_err(|e| TransportError::BindFailed {
        endpoint: endpoint.to_string(),
        source: e.to_string(),
    })
}

async fn bind_tcp_in_range(
    socket: &mut RouterSocket,
    range: RangeInclusive<u16>,
) -> Result<String, TransportError> {
    let mut last_err = None;
    for _ in 0..BIND_ATTEMPTS {
        let port = rand::thread_rng().gen_range(range.clone());
        let endpoint = format!("tcp://0.0.0.0:{port}");
        match socket.bind(&endpoint).await {
            Ok(()) => return Ok(endpoint),
            Err(e) => {
                warn!(port, error = %e, "tcp bind attempt failed, retrying");
                last_err = Some(e.to_string());
            }
        }
    }
    Err(TransportError::BindFailed {
        endpoint: format!("tcp://0.0.0.0:* (range {}-{})", range.start(), range.end()),
        source: last_err.unwrap_or_else(|| "no candidate ports tried".to_string()),
    })
}

#[cfg(test)]
#[path = "endpoints_tests.rs"]
mod tests;
