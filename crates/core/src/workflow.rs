// SPDX-License-Identifier: Apache-2.0

//! The external collaborator interface the master drives (spec.md §6.1).
//!
//! The workflow engine, its thread pool, and the launcher are all owned by
//! the embedding application; the master only ever sees them through these
//! traits. Keeping them as `async_trait` objects (rather than a concrete
//! struct) lets `veld-daemon` be exercised against fakes in tests, mirroring
//! the teacher's `test-support` feature convention for swapping in fakes.

use async_trait::async_trait;
use thiserror::Error;

use crate::node::{NodeId, NodeState};

/// The immutable `(id, mid, pid, power, host, state)` tuple drawn from the
/// current `NodeRecord`, passed to every workflow callback (spec.md §6.1).
#[derive(Debug, Clone, PartialEq)]
pub struct SlaveDescription {
    pub id: NodeId,
    pub mid: String,
    pub pid: u32,
    pub power: f64,
    pub host: String,
    pub state: NodeState,
}

/// The result of asking the workflow for a job (spec.md §4.5, §9 Open
/// Questions).
///
/// The two "no job" sentinels are semantically distinct and must stay that
/// way: `Refuse` means the node will never get this job and the session
/// falls back to `Work`; `NotReady` means "ask again once any update
/// arrives" and triggers the balance-aware postpone/park logic. Collapsing
/// them into a single `Option` would lose that distinction, which is the one
/// invariant spec.md explicitly calls out as must-not-change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// `generate_data_for_slave` returned a job to ship.
    Ready(Vec<u8>),
    /// The workflow has no job yet; try again after the next update.
    NotReady,
    /// The workflow will never give this node a job (refusal).
    Refuse,
}

/// Errors a `Launcher` can report when attempting to respawn a node.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("missing launch metadata, cannot respawn")]
    MissingMetadata,
    #[error("launch failed: {0}")]
    Failed(String),
}

/// The workflow engine interface required from the external collaborator
/// (spec.md §6.1). All methods that may block are async so the master can
/// defer them to the workflow's own thread pool without blocking the event
/// loop (spec.md §5, suspension points a/b/c).
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Opaque identity string used to match worker and master.
    fn checksum(&self) -> &str;

    /// Whether the overall computation is still running.
    fn is_running(&self) -> bool;

    /// Produce the initial payload sent to a newly identified node.
    async fn generate_initial_data_for_slave(&self, desc: &SlaveDescription) -> serde_json::Value;

    /// Apply a node-supplied initial payload (fire-and-forget from the
    /// caller's perspective; errors go to the shared error sink).
    async fn apply_initial_data_from_slave(&self, payload: serde_json::Value, desc: &SlaveDescription);

    /// Ask for the next unit of work for `desc`. See `JobOutcome` for the
    /// three-way result.
    async fn generate_data_for_slave(&self, desc: &SlaveDescription) -> JobOutcome;

    /// Apply a node's result payload for the job in flight. Returns whether
    /// the update was accepted.
    async fn apply_data_from_slave(&self, payload: Vec<u8>, desc: &SlaveDescription) -> bool;

    /// Notify the workflow that a node was lost.
    async fn drop_slave(&self, desc: &SlaveDescription);
}

/// Periodic statistics extension point (SPEC_FULL.md "Supplemented
/// features": `server.py`'s `Server.print_stats` is a no-op hook the outer
/// launcher calls on a timer; kept here as its own trait rather than folded
/// into `Launcher` so a metrics exporter can be wired in later without
/// touching the dispatcher).
pub trait StatsSink: Send + Sync {
    fn print_stats(&self, active_nodes: usize, total_jobs: u64);
}

/// A `StatsSink` that does nothing, used when no exporter is configured.
pub struct NoopStatsSink;

impl StatsSink for NoopStatsSink {
    fn print_stats(&self, _active_nodes: usize, _total_jobs: u64) {}
}

/// The launcher hook used for SSH respawn (spec.md §4.5 "Respawn").
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Identifier the master reports back to nodes in the handshake
    /// response (`log_id`).
    fn log_id(&self) -> &str;

    /// Relaunch a dropped node's process on `host`.
    async fn launch_remote_progs(
        &self,
        host: &str,
        command: &str,
        cwd: &str,
        python_path: &str,
    ) -> Result<(), LaunchError>;

    /// Stop the launcher (called when the master has no more protocols and
    /// the workflow is no longer running).
    fn stop(&self);
}
