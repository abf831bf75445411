// SPDX-License-Identifier: Apache-2.0

//! Fake `Workflow`/`Launcher` implementations for downstream crates' tests.
//!
//! Enabled via the `test-support` feature, following the same pattern as
//! the teacher's `oj-adapters` `FakeAdapter` exports: a deterministic,
//! scriptable stand-in for the real external collaborator so `veld-daemon`
//! can exercise the dispatcher and session protocol without a real
//! workflow engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::node::NodeState;
use crate::workflow::{JobOutcome, LaunchError, Launcher, SlaveDescription, Workflow};

/// A scriptable `Workflow` fake.
///
/// Job outcomes are consumed in FIFO order from a queue you pre-load with
/// `push_job`; once the queue is empty, `generate_data_for_slave` returns
/// `JobOutcome::NotReady`. Applied updates and initial data are recorded so
/// tests can assert on what the dispatcher actually submitted.
pub struct FakeWorkflow {
    checksum: String,
    running: AtomicBool,
    jobs: Mutex<VecDeque<JobOutcome>>,
    next_update_accept: Mutex<VecDeque<bool>>,
    pub applied_updates: Mutex<Vec<(Vec<u8>, NodeState)>>,
    pub applied_initial: Mutex<Vec<serde_json::Value>>,
    pub dropped: Mutex<Vec<SlaveDescription>>,
    pub initial_data: serde_json::Value,
}

impl FakeWorkflow {
    pub fn new(checksum: impl Into<String>) -> Self {
        Self {
            checksum: checksum.into(),
            running: AtomicBool::new(true),
            jobs: Mutex::new(VecDeque::new()),
            next_update_accept: Mutex::new(VecDeque::new()),
            applied_updates: Mutex::new(Vec::new()),
            applied_initial: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
            initial_data: serde_json::Value::Null,
        }
    }

    pub fn push_job(&self, outcome: JobOutcome) {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).push_back(outcome);
    }

    pub fn push_update_result(&self, accepted: bool) {
        self.next_update_accept
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(accepted);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

#[async_trait]
impl Workflow for FakeWorkflow {
    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn generate_initial_data_for_slave(&self, _desc: &SlaveDescription) -> serde_json::Value {
        self.initial_data.clone()
    }

    async fn apply_initial_data_from_slave(
        &self,
        payload: serde_json::Value,
        _desc: &SlaveDescription,
    ) {
        self.applied_initial.lock().unwrap_or_else(|e| e.into_inner()).push(payload);
    }

    async fn generate_data_for_slave(&self, _desc: &SlaveDescription) -> JobOutcome {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(JobOutcome::NotReady)
    }

    async fn apply_data_from_slave(&self, payload: Vec<u8>, desc: &SlaveDescription) -> bool {
        self.applied_updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((payload, desc.state));
        self.next_update_accept
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(true)
    }

    async fn drop_slave(&self, desc: &SlaveDescription) {
        self.dropped.lock().unwrap_or_else(|e| e.into_inner()).push(desc.clone());
    }
}

/// A `Launcher` fake that records respawn attempts instead of shelling out.
pub struct FakeLauncher {
    log_id: String,
    pub attempts: Mutex<Vec<(String, String, String, String)>>,
    pub fail_next: AtomicBool,
}

impl FakeLauncher {
    pub fn new(log_id: impl Into<String>) -> Self {
        Self { log_id: log_id.into(), attempts: Mutex::new(Vec::new()), fail_next: AtomicBool::new(false) }
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    fn log_id(&self) -> &str {
        &self.log_id
    }

    async fn launch_remote_progs(
        &self,
        host: &str,
        command: &str,
        cwd: &str,
        python_path: &str,
    ) -> Result<(), LaunchError> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((host.to_string(), command.to_string(), cwd.to_string(), python_path.to_string()));
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LaunchError::Failed("injected failure".into()));
        }
        Ok(())
    }

    fn stop(&self) {}
}
