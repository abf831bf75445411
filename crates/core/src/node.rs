// SPDX-License-Identifier: Apache-2.0

//! Node identity and the registry's per-node record (spec.md §3).

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, UUID-like identifier for a worker node.
///
/// Generated as a uniform random 128-bit value (spec.md §4.4) when a
/// handshake arrives without an `id`; persists across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generate a fresh, uniformly random node id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The coarse-grained activity state the registry reports for a node
/// (distinct from the session FSM's finer-grained protocol state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Waiting,
    Working,
    Offline,
}

/// Launch metadata needed to respawn a node via the launcher hook.
///
/// Retained on `NodeRecord` only when `--respawn` is enabled (spec.md §9);
/// otherwise dropped for privacy and memory, matching the original's
/// `executable`/`argv`/`cwd`/`PYTHONPATH` handshake fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchMeta {
    pub executable: Option<String>,
    pub argv: Option<Vec<String>>,
    pub cwd: Option<String>,
    pub python_path: Option<String>,
}

/// Per-node record owned by the Master Registry (spec.md §3).
///
/// Persists across reconnects of the same `id`; created on first successful
/// handshake and erased only when its Session disconnects while the
/// workflow is not running (spec.md §3 "Lifecycle").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub mid: String,
    pub pid: u32,
    pub power: f64,
    pub host: String,
    pub state: NodeState,
    pub endpoint: Option<String>,
    pub jobs: u64,
    pub initial_data: Option<serde_json::Value>,
    pub backend: Option<String>,
    pub device: Option<String>,
    pub launch_meta: Option<LaunchMeta>,
}

impl NodeRecord {
    pub fn new(id: NodeId, mid: String, pid: u32, power: f64, host: String) -> Self {
        Self {
            id,
            mid,
            pid,
            power,
            host,
            state: NodeState::Waiting,
            endpoint: None,
            jobs: 0,
            initial_data: None,
            backend: None,
            device: None,
            launch_meta: None,
        }
    }
}

#[cfg(test)]
#[path = "node_tests.rs"]
mod tests;
