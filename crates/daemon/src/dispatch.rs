// SPDX-License-Identifier: Apache-2.0

//! C5: the dispatcher (spec.md §4.5).
//!
//! Every function here locks `SharedDaemon`, does its synchronous FSM/registry
//! work, then drops the lock before awaiting a workflow callback so other
//! sessions keep moving while this one is parked on the workflow's own thread
//! pool (spec.md §5 "Suspension points"). After the `await`, the lock is
//! retaken and the session's current FSM state is re-checked before the
//! result is applied — a late result for a session that has since dropped,
//! reconnected, or moved to a different state is logged and discarded rather
//! than applied against stale state (spec.md §5 "late-arriving results",
//! §9 "Dynamic callbacks").

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, warn};

use veld_core::{FsmEvent, FsmState, JobOutcome, Launcher, NodeId, Workflow};
use veld_wire::{JobReply, UpdateReply};

use crate::control::slave_description;
use crate::error::DaemonError;
use crate::registry::MasterRegistry;
use crate::{Daemon, SharedDaemon};

/// `{"cmd": "job"}` on the data channel (spec.md §4.5 "Job request").
pub async fn handle_job_request(daemon: &SharedDaemon, node_id: &NodeId, is_ipc: bool) -> Result<(), DaemonError> {
    let workflow = {
        let mut d = daemon.lock().await;

        if d.registry.is_paused(node_id) {
            d.registry.absorb_paused_request(node_id);
            return Ok(());
        }

        if !d.registry.has_session(node_id) {
            return Err(DaemonError::UnknownNode(node_id.to_string()));
        }
        d.registry.apply_fsm_event(node_id, FsmEvent::RequestJob)?;

        if d.registry.is_blacklisted(node_id) {
            // The original never increments `balance` for a blacklisted
            // node's request before refusing it (it skips straight to
            // `_refuseJob`), so `balance` is left untouched here too —
            // decrementing it unconditionally, as the original does, would
            // drive it negative and violate invariant 3.
            d.registry.apply_fsm_event(node_id, FsmEvent::RefuseJob)?;
            d.router.reply_job(node_id.as_str(), JobReply::Refused, is_ipc).await?;
            return Ok(());
        }

        let session = d.registry.session_mut(node_id).ok_or_else(|| DaemonError::UnknownNode(node_id.to_string()))?;
        if session.balance > 1 {
            // Defensive guard carried over from the original's own
            // `if self._balance > 1: return`; never observed in practice but
            // preserved rather than second-guessed.
            return Ok(());
        }
        session.balance += 1;

        d.registry.workflow.clone()
    };

    let desc = {
        let d = daemon.lock().await;
        match slave_description(&d.registry, node_id) {
            Some(desc) => desc,
            None => return Err(DaemonError::UnknownNode(node_id.to_string())),
        }
    };
    let outcome = workflow.generate_data_for_slave(&desc).await;

    let mut d = daemon.lock().await;
    let Some(state) = d.registry.session(node_id).map(|s| s.state()) else {
        warn!(%node_id, "job outcome arrived for a session that is gone, discarding");
        return Ok(());
    };
    if state != FsmState::GettingJob {
        warn!(%node_id, ?state, "job outcome arrived after the session moved on, discarding");
        return Ok(());
    }

    match outcome {
        JobOutcome::Ready(data) => {
            d.registry.apply_fsm_event(node_id, FsmEvent::ObtainJob)?;
            d.router.reply_job(node_id.as_str(), JobReply::Data(data), is_ipc).await?;
            // Seed the measurement window and arm the job timeout at the
            // moment the job is actually handed to the worker (spec.md
            // §4.5 "Job timeout"; `server.py` arms its timer in
            // `_requestJob`, not on update receipt, so a worker that was
            // handed a job and then never replies at all is still caught —
            // arming on update receipt would never fire for it).
            let floor = d.registry.config.job_timeout_floor;
            let drop_on_timeout =
                d.registry.session(node_id).map(|s| s.drop_on_timeout).unwrap_or(false);
            if let Some(session) = d.registry.session_mut(node_id) {
                session.record_job_dispatch();
            }
            if let (Some(floor), true) = (floor, drop_on_timeout) {
                let history = d.registry.session(node_id).map(|s| s.history().clone()).unwrap_or_default();
                if let Some(timeout) = compute_timeout(&history, floor) {
                    schedule_job_timeout(daemon.clone(), node_id.clone(), timeout, &mut d);
                }
            }
        }
        JobOutcome::Refuse => {
            let session = d.registry.session_mut(node_id).ok_or_else(|| DaemonError::UnknownNode(node_id.to_string()))?;
            session.balance = session.balance.saturating_sub(1);
            d.registry.apply_fsm_event(node_id, FsmEvent::RefuseJob)?;
            d.router.reply_job(node_id.as_str(), JobReply::Refused, is_ipc).await?;
        }
        JobOutcome::NotReady => {
            let session = d.registry.session_mut(node_id).ok_or_else(|| DaemonError::UnknownNode(node_id.to_string()))?;
            session.balance = session.balance.saturating_sub(1);
            let balance = session.balance;
            // Either branch leaves GettingJob via `postpone_job` back to
            // Work, whether or not balance is still positive: a parked
            // session must satisfy invariant 4 (FSM = Work, balance = 0),
            // so that `retry_parked`'s re-drive re-enters through
            // `handle_job_request`'s own `request_job` transition rather
            // than finding the session still stuck in GettingJob, where no
            // second `request_job` transition is defined.
            d.registry.apply_fsm_event(node_id, FsmEvent::PostponeJob)?;
            if balance > 0 {
                d.router.reply_job(node_id.as_str(), JobReply::NeedUpdate, is_ipc).await?;
            } else {
                d.registry.park(node_id.clone());
                scan_and_blacklist_hanged(&mut d).await?;
            }
        }
    }
    Ok(())
}

/// `{"cmd": "update"}` on the data channel (spec.md §4.5 "Update submit").
pub async fn handle_update(daemon: &SharedDaemon, node_id: &NodeId, payload: Vec<u8>) -> Result<(), DaemonError> {
    let workflow = {
        let mut d = daemon.lock().await;
        let Some(session) = d.registry.session_mut(node_id) else {
            return Err(DaemonError::UnknownNode(node_id.to_string()));
        };
        let should_idle = session.balance == 1;
        session.record_update_elapsed();
        // The worker replied in time, so whatever timer was armed for the
        // job it just updated no longer applies (spec.md §4.5 "Job
        // timeout" is armed per dispatched job, in `handle_job_request`,
        // not here) — cancel it rather than let it fire against a job that
        // already completed.
        session.cancel_timeout();
        if should_idle {
            d.registry.apply_fsm_event(node_id, FsmEvent::Idle)?;
        }

        if let Some(node) = d.registry.node_mut(node_id) {
            node.jobs += 1;
        }

        d.registry.workflow.clone()
    };

    let desc = {
        let d = daemon.lock().await;
        match slave_description(&d.registry, node_id) {
            Some(desc) => desc,
            None => return Err(DaemonError::UnknownNode(node_id.to_string())),
        }
    };
    let accepted = workflow.apply_data_from_slave(payload, &desc).await;

    let (getting_job, is_ipc) = {
        let mut d = daemon.lock().await;
        let Some(session) = d.registry.session_mut(node_id) else {
            warn!(%node_id, "update result arrived for a session that is gone, discarding");
            return Ok(());
        };
        if !matches!(session.state(), FsmState::Work | FsmState::GettingJob | FsmState::Idle) {
            warn!(%node_id, state = ?session.state(), "update result arrived after the session moved on, discarding");
            return Ok(());
        }

        let is_ipc = node_is_ipc(&d.registry, node_id);
        d.router.reply_update(node_id.as_str(), UpdateReply::from_accepted(accepted), is_ipc).await?;

        let session = d.registry.session_mut(node_id).ok_or_else(|| DaemonError::UnknownNode(node_id.to_string()))?;
        session.balance = session.balance.saturating_sub(1);
        (session.state() == FsmState::GettingJob, is_ipc)
    };

    if getting_job {
        handle_job_request(daemon, node_id, is_ipc).await
    } else {
        retry_parked(daemon).await
    }
}

/// `resume(id)` (spec.md §4.6): un-pause the node and, if a request arrived
/// while it was paused, re-deliver that request now as though it had just
/// arrived.
pub async fn resume(daemon: &SharedDaemon, node_id: &NodeId, is_ipc: bool) -> Result<(), DaemonError> {
    let had_pending = daemon.lock().await.registry.resume(node_id);
    if had_pending {
        handle_job_request(daemon, node_id, is_ipc).await?;
    }
    Ok(())
}

/// Re-drive every session parked in `job_requests` at least once (spec.md §8
/// "Parked fairness").
pub async fn retry_parked(daemon: &SharedDaemon) -> Result<(), DaemonError> {
    let parked = daemon.lock().await.registry.drain_parked();
    for id in parked {
        let is_ipc = {
            let d = daemon.lock().await;
            node_is_ipc(&d.registry, &id)
        };
        handle_job_request(daemon, &id, is_ipc).await?;
    }
    Ok(())
}

/// Blacklist and force-disconnect every hanged node (spec.md §4.5, executed
/// whenever a request is parked).
async fn scan_and_blacklist_hanged(d: &mut Daemon) -> Result<(), DaemonError> {
    let hanged = d.registry.hanged_candidates();
    if hanged.is_empty() {
        return Ok(());
    }
    warn!(count = hanged.len(), "blacklisting hanged nodes");
    for id in hanged {
        d.registry.blacklist(id.clone());
        if let Some(session) = d.registry.session_mut(&id) {
            session.force_disconnect();
        }
    }
    Ok(())
}

fn node_is_ipc(registry: &MasterRegistry, id: &NodeId) -> bool {
    registry.node(id).and_then(|n| n.endpoint.as_deref()).map(|e| e.starts_with("ipc://")).unwrap_or(false)
}

/// Schedule the job timeout timer: if no update arrives within `timeout`,
/// blacklist the node and force-close its connection (spec.md §4.5 "Job
/// timeout"). Any previous timer for this session is cancelled first.
fn schedule_job_timeout(daemon: SharedDaemon, node_id: NodeId, timeout: Duration, d: &mut Daemon) {
    let Some(session) = d.registry.session_mut(&node_id) else { return };
    session.cancel_timeout();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let mut d = daemon.lock().await;
        d.registry.blacklist(node_id.clone());
        if let Some(session) = d.registry.session_mut(&node_id) {
            session.force_disconnect();
        }
    });
    if let Some(session) = d.registry.session_mut(&node_id) {
        session.timeout_handle = Some(handle);
    } else {
        handle.abort();
    }
}

/// Respawn a dropped node via its `Launcher`, with exponential backoff
/// between attempts (spec.md §4.5 "Respawn": `1 << effort` seconds, `effort`
/// starting at 1). Only called when `--respawn` is enabled and the workflow
/// is still running at the time the node's session disconnected; a node with
/// no retained `LaunchMeta` (never supplied one, or `--respawn` was off when
/// it connected) cannot be respawned and is reported once to `error_sink`.
pub fn respawn_with_backoff(daemon: SharedDaemon, node_id: NodeId, error_sink: UnboundedSender<DaemonError>, effort: u32) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1 << effort.min(20))).await;

        let (launcher, host, meta) = {
            let d = daemon.lock().await;
            let Some(node) = d.registry.node(&node_id) else { return };
            let Some(meta) = node.launch_meta.clone() else {
                let _ = error_sink.send(DaemonError::Launch(veld_core::workflow::LaunchError::MissingMetadata));
                return;
            };
            (d.registry.launcher.clone(), node.host.clone(), meta)
        };

        let Some(executable) = meta.executable.clone() else {
            let _ = error_sink.send(DaemonError::Launch(veld_core::workflow::LaunchError::MissingMetadata));
            return;
        };
        let mut argv = meta.argv.clone().unwrap_or_default();
        if !argv.iter().any(|a| a == "-b" || a == "--background") {
            argv.push("-b".to_string());
        }
        let command = std::iter::once(executable).chain(argv).collect::<Vec<_>>().join(" ");
        let cwd = meta.cwd.clone().unwrap_or_default();
        let python_path = meta.python_path.clone().unwrap_or_default();

        match launcher.launch_remote_progs(&host, &command, &cwd, &python_path).await {
            Ok(()) => {}
            Err(err) => {
                error!(%node_id, %err, effort, "respawn attempt failed, backing off");
                let _ = error_sink.send(DaemonError::from(err));
                respawn_with_backoff(daemon, node_id, error_sink, effort + 1);
            }
        }
    });
}

/// `max(mean + 3*stddev, floor)` over the session's update-interval history
/// (spec.md §4.5, §9 boundary: fewer than 3 samples disables the timer).
pub fn compute_timeout(history: &VecDeque<Duration>, floor: Duration) -> Option<Duration> {
    if history.len() < 3 {
        return None;
    }
    let samples: Vec<f64> = history.iter().map(Duration::as_secs_f64).collect();
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    let stddev = variance.sqrt();
    let computed = mean + 3.0 * stddev;
    Some(Duration::from_secs_f64(computed.max(floor.as_secs_f64())))
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
