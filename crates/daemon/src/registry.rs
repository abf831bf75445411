// SPDX-License-Identifier: Apache-2.0

//! C6: the master's process-wide indices (spec.md §3, §4.6).
//!
//! `MasterRegistry` owns `nodes` and `sessions` keyed by `NodeId` so that a
//! `Session` never needs a back-pointer into the registry or its
//! `NodeRecord` (spec.md §9 "Cyclic references" — the registry is the only
//! owner, sessions hold the id and look the record up on demand).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use veld_core::{FsmEvent, LaunchMeta, Launcher, NodeId, NodeRecord, Workflow};
use veld_transport::Endpoints;

use crate::error::DaemonError;
use crate::session::Session;

/// Static configuration the registry needs but spec.md scopes to CLI
/// parsing (SPEC_FULL.md §6.4).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// `None` disables the job timeout timer (`--job-timeout <= 0`).
    pub job_timeout_floor: Option<Duration>,
    /// Enables retaining `LaunchMeta` and scheduling SSH respawn on drop.
    pub respawn: bool,
    /// Local domain suffix stripped from reverse-DNS results.
    pub domain_suffix: Option<String>,
    /// This master process's own `mid`/`pid`, used by endpoint selection
    /// (spec.md §4.6 "same mid and pid as the master").
    pub master_mid: String,
    pub master_pid: u32,
}

/// C6: the process-wide node/session/pending-request indices (spec.md §3).
pub struct MasterRegistry {
    pub config: RegistryConfig,
    pub workflow: Arc<dyn Workflow>,
    pub launcher: Arc<dyn Launcher>,
    nodes: HashMap<NodeId, NodeRecord>,
    sessions: HashMap<NodeId, Session>,
    job_requests: HashSet<NodeId>,
    blacklist: HashSet<NodeId>,
    paused: HashMap<NodeId, bool>,
}

impl MasterRegistry {
    pub fn new(config: RegistryConfig, workflow: Arc<dyn Workflow>, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config,
            workflow,
            launcher,
            nodes: HashMap::new(),
            sessions: HashMap::new(),
            job_requests: HashSet::new(),
            blacklist: HashSet::new(),
            paused: HashMap::new(),
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    /// Query result for `{"query": "nodes"}`: only nodes with a live
    /// session (supplemented feature, `server.py`'s `active_nodes`
    /// filters out disconnected `NodeRecord`s that linger only because the
    /// workflow is still running; see SPEC_FULL.md).
    pub fn active_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values().filter(move |n| self.sessions.contains_key(&n.id))
    }

    pub fn session(&self, id: &NodeId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn session_mut(&mut self, id: &NodeId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Apply an FSM event to `id`'s session and carry out its entry action
    /// on the matching `NodeRecord` (spec.md §4.3: "Entry actions set the
    /// NodeRecord `state` field"). The two maps are disjoint fields on this
    /// struct, so both are reachable without a session -> registry
    /// back-pointer (spec.md §9 "Cyclic references").
    pub fn apply_fsm_event(&mut self, id: &NodeId, event: FsmEvent) -> Result<(), DaemonError> {
        let Some(session) = self.sessions.get_mut(id) else {
            return Err(DaemonError::UnknownNode(id.to_string()));
        };
        let entry_state = session.apply_event(event)?;
        if let Some(state) = entry_state {
            if let Some(node) = self.nodes.get_mut(id) {
                node.state = state;
            }
        }
        Ok(())
    }

    /// Create (or reuse, on reconnect) a `NodeRecord` (spec.md §3
    /// "Lifecycle": created on first handshake, reused on reconnect).
    pub fn ensure_node(&mut self, id: NodeId, mid: String, pid: u32, power: f64, host: String) -> &NodeRecord {
        self.nodes.entry(id.clone()).or_insert_with(|| NodeRecord::new(id.clone(), mid, pid, power, host));
        self.nodes.get(&id).expect("just inserted or already present")
    }

    pub fn set_launch_meta(&mut self, id: &NodeId, meta: LaunchMeta) {
        if self.config.respawn {
            if let Some(node) = self.nodes.get_mut(id) {
                node.launch_meta = Some(meta);
            }
        }
    }

    /// Insert a new session for `id`, evicting any prior one first
    /// (invariant 2: at most one `Session` per `NodeId` at any time).
    /// Panics if `id` has no `NodeRecord` yet (invariant 1), which would be
    /// a caller bug — a session is only ever installed after `ensure_node`.
    pub fn insert_session(&mut self, id: NodeId, session: Session) {
        debug_assert!(self.nodes.contains_key(&id), "session installed without a NodeRecord (invariant 1)");
        self.job_requests.remove(&id);
        if let Some(mut prev) = self.sessions.remove(&id) {
            prev.cancel_timeout();
        }
        self.sessions.insert(id, session);
    }

    /// Remove and return a disconnected session's state, cancelling its
    /// timer and dropping it from `job_requests` (spec.md §5 "Cancellation").
    pub fn remove_session(&mut self, id: &NodeId) -> Option<Session> {
        self.job_requests.remove(id);
        let mut session = self.sessions.remove(id)?;
        session.cancel_timeout();
        Some(session)
    }

    pub fn has_session(&self, id: &NodeId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn is_blacklisted(&self, id: &NodeId) -> bool {
        self.blacklist.contains(id)
    }

    /// Blacklist `id` (spec.md §4.5 "hanged" eviction, §4.5 job timeout
    /// firing). Idempotent.
    pub fn blacklist(&mut self, id: NodeId) {
        self.blacklist.insert(id);
    }

    /// `job_requests` members must satisfy invariant 4 (FSM = Work,
    /// balance = 0); callers are expected to have checked that before
    /// parking a session.
    pub fn park(&mut self, id: NodeId) {
        self.job_requests.insert(id);
    }

    pub fn is_parked(&self, id: &NodeId) -> bool {
        self.job_requests.contains(id)
    }

    /// Drain every parked session id so the caller can re-drive each one
    /// (spec.md §8 "Parked fairness": every session in `job_requests` is
    /// re-driven at least once after any successful update).
    pub fn drain_parked(&mut self) -> Vec<NodeId> {
        self.job_requests.drain().collect()
    }

    /// `pause(id)`: spec.md §4.6. Records "no pending job seen yet".
    pub fn pause(&mut self, id: NodeId) {
        self.paused.insert(id, false);
    }

    pub fn is_paused(&self, id: &NodeId) -> bool {
        self.paused.contains_key(id)
    }

    /// A job request arrived while paused: flip the flag to "pending" and
    /// report that the request should be absorbed rather than dispatched.
    pub fn absorb_paused_request(&mut self, id: &NodeId) -> bool {
        match self.paused.get_mut(id) {
            Some(pending) => {
                *pending = true;
                true
            }
            None => false,
        }
    }

    /// `resume(id)`: spec.md §4.6. Returns whether an absorbed request
    /// should now be re-delivered as if freshly received.
    pub fn resume(&mut self, id: &NodeId) -> bool {
        match self.paused.remove(id) {
            Some(pending) => pending,
            None => false,
        }
    }

    /// Nodes with zero completed jobs while at least one other node has
    /// made progress are "hanged" (spec.md §4.5, §8 boundary: executed
    /// whenever a request is parked).
    pub fn hanged_candidates(&self) -> Vec<NodeId> {
        let any_progress = self.nodes.values().any(|n| n.jobs > 0);
        if !any_progress {
            return Vec::new();
        }
        self.sessions
            .keys()
            .filter(|id| self.nodes.get(*id).map(|n| n.jobs == 0).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// C6 endpoint selection (spec.md §4.6): same mid+pid as the master ->
    /// inproc; same mid only -> ipc; otherwise -> tcp with the wildcard
    /// host replaced by the worker's observed source IP.
    pub fn select_endpoint(&self, endpoints: &Endpoints, worker_mid: &str, worker_pid: u32, source_ip: &str) -> String {
        if worker_mid == self.config.master_mid && worker_pid == self.config.master_pid {
            endpoints.inproc.clone()
        } else if worker_mid == self.config.master_mid {
            endpoints.ipc.clone()
        } else {
            rewrite_tcp_host(&endpoints.tcp, source_ip)
        }
    }

    /// Erase `id`'s `NodeRecord` when its session disconnects while the
    /// workflow is no longer running (spec.md §3 "Lifecycle", §4.6
    /// "Shutdown"). A no-op while the workflow is still running, since the
    /// record must survive for a future reconnect.
    pub fn maybe_evict_node(&mut self, id: &NodeId) {
        if !self.workflow.is_running() {
            self.nodes.remove(id);
            self.blacklist.remove(id);
            self.paused.remove(id);
        }
    }

    /// Whether the master has no more live sessions — combined with
    /// `!workflow.is_running()` this is the "stop the master" condition
    /// (spec.md §4.6 "Shutdown").
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn rewrite_tcp_host(tcp_endpoint: &str, source_ip: &str) -> String {
    match tcp_endpoint.rsplit_once(':') {
        Some((_scheme_and_host, port)) => format!("tcp://{source_ip}:{port}"),
        None => tcp_endpoint.to_string(),
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
