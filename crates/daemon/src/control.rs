// SPDX-License-Identifier: Apache-2.0

//! C4: the control-channel session protocol (spec.md §4.4).
//!
//! Parsing of the raw JSON line lives in `veld_wire::control`; this module
//! owns the semantics — checksum validation, node creation/reconnect,
//! endpoint assignment, the reverse-DNS lookup that fills in
//! `NodeRecord.host`, and the `query`/`change_power` handlers.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use veld_core::{NodeId, NodeRecord, SlaveDescription};
use veld_transport::Endpoints;
use veld_wire::{ChangePowerRequest, ControlError, HandshakeAccepted, HandshakeRequest, QueryKind};

use crate::registry::MasterRegistry;

/// Bound on the reverse-DNS lookup so a slow or unreachable resolver never
/// stalls the control connection (spec.md §7 "DNS reverse lookup failure:
/// non-fatal").
const REVERSE_DNS_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a validated `handshake` request.
pub enum HandshakeReply {
    /// A new (or newly-supplied-but-unknown) node: the caller should send
    /// `body`, then fire the `identify` FSM event, then (asynchronously)
    /// submit `supplied_data` to the workflow if present and start the
    /// reverse-DNS lookup.
    Accepted { body: HandshakeAccepted, node_id: NodeId, supplied_data: Option<serde_json::Value> },
    /// A known id: no new `NodeRecord` and no master-generated initial
    /// data, but a reconnecting worker may still have supplied its own
    /// `data` to submit to the workflow (spec.md §4.4: the submit-on-
    /// response step isn't scoped to new nodes only — `server.py`'s
    /// `data = msg.get('data')` / `apply_initial_data_from_slave` runs for
    /// both branches of `_handshake`).
    Reconnected { node_id: NodeId, supplied_data: Option<serde_json::Value> },
    Rejected(ControlError),
}

/// Validate and apply a `handshake` request (spec.md §4.4).
pub async fn handle_handshake(
    registry: &mut MasterRegistry,
    endpoints: &Endpoints,
    req: HandshakeRequest,
    peer_ip: &str,
) -> HandshakeReply {
    match &req.checksum {
        None => return HandshakeReply::Rejected(ControlError::HandshakeChecksumMissing),
        Some(checksum) if checksum != registry.workflow.checksum() => {
            return HandshakeReply::Rejected(ControlError::HandshakeChecksumMismatch {
                expected: registry.workflow.checksum().to_string(),
                got: checksum.clone(),
            });
        }
        Some(_) => {}
    }
    let Some(power) = req.power else {
        return HandshakeReply::Rejected(ControlError::MissingPower);
    };
    let Some(mid) = req.mid.clone() else {
        return HandshakeReply::Rejected(ControlError::MissingMid);
    };
    let Some(pid) = req.pid else {
        return HandshakeReply::Rejected(ControlError::MissingPid);
    };

    let known = req.id.as_deref().is_some_and(|id| registry.node(&NodeId::from(id)).is_some());
    if known {
        // Safe: `known` only true when `req.id` is `Some`.
        let node_id = NodeId::from(req.id.as_deref().unwrap_or_default());
        return HandshakeReply::Reconnected { node_id, supplied_data: req.data.clone() };
    }

    let node_id = match &req.id {
        Some(existing) => NodeId::from(existing.as_str()),
        None => NodeId::generate(),
    };
    registry.ensure_node(node_id.clone(), mid.clone(), pid, power, peer_ip.to_string());
    if let Some(meta) = launch_meta_from(&req) {
        registry.set_launch_meta(&node_id, meta);
    }
    let endpoint = registry.select_endpoint(endpoints, &mid, pid, peer_ip);
    if let Some(node) = registry.node_mut(&node_id) {
        node.endpoint = Some(endpoint.clone());
        node.backend = req.backend.clone();
        node.device = req.device.clone();
    }

    let desc = slave_description(registry, &node_id).expect("just inserted above");
    let data = registry.workflow.generate_initial_data_for_slave(&desc).await;
    if let Some(node) = registry.node_mut(&node_id) {
        node.initial_data = Some(data.clone());
    }

    let body = HandshakeAccepted {
        id: Some(node_id.to_string()),
        endpoint,
        data,
        log_id: registry.launcher.log_id().to_string(),
    };
    HandshakeReply::Accepted { body, node_id, supplied_data: req.data.clone() }
}

fn launch_meta_from(req: &HandshakeRequest) -> Option<veld_core::LaunchMeta> {
    if req.executable.is_none() && req.argv.is_none() && req.cwd.is_none() && req.python_path.is_none() {
        return None;
    }
    Some(veld_core::LaunchMeta {
        executable: req.executable.clone(),
        argv: req.argv.clone(),
        cwd: req.cwd.clone(),
        python_path: req.python_path.clone(),
    })
}

/// Build the immutable `desc` tuple passed to workflow callbacks (spec.md
/// §6.1).
pub fn slave_description(registry: &MasterRegistry, node_id: &NodeId) -> Option<SlaveDescription> {
    registry.node(node_id).map(|n: &NodeRecord| SlaveDescription {
        id: n.id.clone(),
        mid: n.mid.clone(),
        pid: n.pid,
        power: n.power,
        host: n.host.clone(),
        state: n.state,
    })
}

/// Reject a `handshake`/`change_power` attempt from a connection that has
/// already sent a `query` (spec.md §4.4: "a session that has sent a query
/// is marked not_a_slave and may not subsequently send worker commands").
pub fn guard_worker_command(not_a_slave: bool) -> Result<(), ControlError> {
    if not_a_slave {
        Err(ControlError::NotASlave)
    } else {
        Ok(())
    }
}

/// `{cmd: "change_power"}` (spec.md §4.4). `node_id` is `None` when the
/// session hasn't completed a handshake yet.
pub fn handle_change_power(
    registry: &mut MasterRegistry,
    node_id: Option<&NodeId>,
    req: ChangePowerRequest,
) -> Result<(), ControlError> {
    let node_id = node_id.ok_or(ControlError::NotASlave)?;
    let power = req.power.ok_or(ControlError::MissingPowerForChangePower)?;
    match registry.node_mut(node_id) {
        Some(node) => {
            node.power = power;
            Ok(())
        }
        None => Err(ControlError::NotASlave),
    }
}

/// `{"query": "nodes"}` response body (spec.md §4.4, §6.2): the active
/// node table, excluding nodes with no live session (SPEC_FULL.md
/// "active_nodes excludes disconnected nodes").
pub fn nodes_query_response(registry: &MasterRegistry) -> serde_json::Value {
    let nodes: Vec<serde_json::Value> = registry
        .active_nodes()
        .map(|n| {
            serde_json::json!({
                "id": n.id.as_str(),
                "mid": n.mid,
                "pid": n.pid,
                "power": n.power,
                "host": n.host,
                "state": n.state,
                "jobs": n.jobs,
            })
        })
        .collect();
    serde_json::Value::Array(nodes)
}

/// `{"query": "endpoints"}` response body (spec.md §4.4, §4.1).
pub fn endpoints_query_response(endpoints: &Endpoints) -> serde_json::Value {
    serde_json::json!({
        "inproc": endpoints.inproc,
        "ipc": endpoints.ipc,
        "tcp": endpoints.tcp,
    })
}

pub fn query_response(kind: QueryKind, registry: &MasterRegistry, endpoints: &Endpoints) -> serde_json::Value {
    match kind {
        QueryKind::Nodes => nodes_query_response(registry),
        QueryKind::Endpoints => endpoints_query_response(endpoints),
    }
}

/// Reverse-resolve `peer_ip`, stripping `domain_suffix` from the result,
/// falling back to the raw address string on timeout or failure (spec.md
/// §4.4 "falling back to the raw address on failure", §7.6).
pub async fn resolve_peer_host(
    resolver: &TokioAsyncResolver,
    peer_ip: IpAddr,
    domain_suffix: Option<&str>,
) -> String {
    match tokio::time::timeout(REVERSE_DNS_TIMEOUT, resolver.reverse_lookup(peer_ip)).await {
        Ok(Ok(lookup)) => match lookup.iter().next() {
            Some(name) => strip_domain_suffix(&name.to_string(), domain_suffix),
            None => peer_ip.to_string(),
        },
        Ok(Err(_)) | Err(_) => peer_ip.to_string(),
    }
}

/// Strip a trailing `.` (DNS root label) and, if configured, the local
/// domain suffix from a resolved hostname (spec.md §4.4, mirroring
/// `server.py`'s `socket.getfqdn()`-derived suffix strip).
fn strip_domain_suffix(host: &str, suffix: Option<&str>) -> String {
    let trimmed = host.trim_end_matches('.');
    match suffix {
        Some(suffix) if !suffix.is_empty() => {
            trimmed.strip_suffix(suffix).map(|s| s.trim_end_matches('.').to_string()).unwrap_or_else(|| trimmed.to_string())
        }
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
