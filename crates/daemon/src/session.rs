// SPDX-License-Identifier: Apache-2.0

//! Per-connection session state (spec.md §3 "Session").

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use veld_core::{FsmEvent, NodeId, NodeState, SessionFsm};

use crate::error::DaemonError;

/// Bounded history of observed update-submit intervals, used by the job
/// timeout formula (spec.md §4.5, §9 boundary: fewer than 3 samples means
/// no timeout is scheduled).
const HISTORY_CAPACITY: usize = 20;

/// One live TCP connection's state (spec.md §3 "Session").
#[derive(Debug)]
pub struct Session {
    pub node_id: NodeId,
    fsm: SessionFsm,
    pub balance: u8,
    last_submit: Option<Instant>,
    history: VecDeque<Duration>,
    pub timeout_handle: Option<tokio::task::JoinHandle<()>>,
    pub drop_on_timeout: bool,
    /// Lets the dispatcher force-close this session's control connection
    /// (hanged-peer eviction, job timeout firing) without reaching back
    /// into the per-connection task directly.
    pub disconnect: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Session {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            fsm: SessionFsm::new(),
            balance: 0,
            last_submit: None,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            timeout_handle: None,
            drop_on_timeout: false,
            disconnect: None,
        }
    }

    pub fn state(&self) -> veld_core::FsmState {
        self.fsm.current()
    }

    /// Apply an FSM event. Balance is orthogonal to the FSM transition
    /// (spec.md invariant 3 vs. invariant 4) and is updated separately by
    /// the dispatcher.
    pub fn apply_event(&mut self, event: FsmEvent) -> Result<Option<NodeState>, DaemonError> {
        self.fsm.apply(event).map_err(DaemonError::from)
    }

    pub fn cancel_timeout(&mut self) {
        if let Some(handle) = self.timeout_handle.take() {
            handle.abort();
        }
    }

    /// Force-close this session's control connection, e.g. after a job
    /// timeout fires or a hanged-peer scan blacklists it. A no-op if the
    /// connection already went away.
    pub fn force_disconnect(&mut self) {
        if let Some(tx) = self.disconnect.take() {
            let _ = tx.send(());
        }
    }

    /// Seed the measurement window at the moment a job is actually handed
    /// to the worker (spec.md §4.5 "Job timeout"; `server.py` seeds
    /// `_last_job_submit_time` in `_requestJob`, not on update receipt, so
    /// the very first job/update round-trip is captured in history rather
    /// than only intervals between consecutive updates).
    pub fn record_job_dispatch(&mut self) {
        self.last_submit = Some(Instant::now());
    }

    /// Record the elapsed time since the job was dispatched (spec.md §4.5:
    /// "Record the elapsed time since the previous submit in the session's
    /// history"). The window is consumed: a new one only opens the next
    /// time `record_job_dispatch` runs, matching the original arming the
    /// timer once per dispatched job rather than once per update.
    pub fn record_update_elapsed(&mut self) -> Option<Duration> {
        let elapsed = self.last_submit.take().map(|prev| Instant::now().duration_since(prev));
        if let Some(elapsed) = elapsed {
            if self.history.len() == HISTORY_CAPACITY {
                self.history.pop_front();
            }
            self.history.push_back(elapsed);
        }
        elapsed
    }

    pub fn history(&self) -> &VecDeque<Duration> {
        &self.history
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
