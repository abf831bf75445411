// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use veld_core::test_support::{FakeLauncher, FakeWorkflow};
use veld_core::{FsmEvent, FsmState, JobOutcome, NodeId};
use veld_transport::Router;

use super::*;
use crate::registry::RegistryConfig;
use crate::session::Session;
use crate::Daemon;

fn history(seconds: &[u64]) -> VecDeque<Duration> {
    seconds.iter().map(|s| Duration::from_secs(*s)).collect()
}

#[test]
fn fewer_than_three_samples_disables_the_timeout() {
    assert_eq!(compute_timeout(&history(&[]), Duration::from_secs(1)), None);
    assert_eq!(compute_timeout(&history(&[5]), Duration::from_secs(1)), None);
    assert_eq!(compute_timeout(&history(&[5, 6]), Duration::from_secs(1)), None);
}

#[test]
fn three_identical_samples_have_zero_stddev_so_timeout_is_the_mean() {
    let got = compute_timeout(&history(&[4, 4, 4]), Duration::from_secs(1)).unwrap();
    assert_eq!(got, Duration::from_secs(4));
}

#[test]
fn timeout_never_drops_below_the_configured_floor() {
    let got = compute_timeout(&history(&[1, 1, 1]), Duration::from_secs(30)).unwrap();
    assert_eq!(got, Duration::from_secs(30));
}

#[test]
fn dispersed_samples_widen_the_timeout_past_the_mean() {
    let tight = compute_timeout(&history(&[4, 4, 4]), Duration::from_secs(1)).unwrap();
    let wide = compute_timeout(&history(&[1, 4, 7]), Duration::from_secs(1)).unwrap();
    assert!(wide > tight);
}

async fn daemon_with_session(node_id: &NodeId) -> (SharedDaemon, Arc<FakeWorkflow>) {
    let workflow = Arc::new(FakeWorkflow::new("X"));
    let config = RegistryConfig {
        job_timeout_floor: None,
        respawn: false,
        domain_suffix: None,
        master_mid: "master-mid".to_string(),
        master_pid: 100,
    };
    let mut registry = MasterRegistry::new(config, workflow.clone(), Arc::new(FakeLauncher::new("L")));
    registry.ensure_node(node_id.clone(), "m1".to_string(), 1, 1.0, "h".to_string());
    let mut session = Session::new(node_id.clone());
    session.apply_event(FsmEvent::Connect).unwrap();
    session.apply_event(FsmEvent::Identify).unwrap();
    registry.insert_session(node_id.clone(), session);

    let router = Router::bind("test-master", &std::env::temp_dir(), 20000..=20100, false).await.unwrap();
    (Arc::new(Mutex::new(Daemon { registry, router })), workflow)
}

#[tokio::test]
async fn job_request_with_a_ready_job_moves_the_session_to_work() {
    let node_id = NodeId::from("n1");
    let (daemon, workflow) = daemon_with_session(&node_id).await;
    workflow.push_job(JobOutcome::Ready(b"job-bytes".to_vec()));

    handle_job_request(&daemon, &node_id, false).await.unwrap();

    let d = daemon.lock().await;
    let session = d.registry.session(&node_id).unwrap();
    assert_eq!(session.state(), FsmState::Work);
    assert_eq!(session.balance, 1);
}

#[tokio::test]
async fn not_ready_with_balance_one_parks_the_session() {
    let node_id = NodeId::from("n1");
    let (daemon, workflow) = daemon_with_session(&node_id).await;
    workflow.push_job(JobOutcome::NotReady);

    handle_job_request(&daemon, &node_id, false).await.unwrap();

    let d = daemon.lock().await;
    assert!(d.registry.is_parked(&node_id));
    let session = d.registry.session(&node_id).unwrap();
    assert_eq!(session.balance, 0);
    // Invariant 4: a parked session's FSM state is Work, not stuck in
    // GettingJob, so a later re-drive's own `request_job` transition is
    // valid.
    assert_eq!(session.state(), FsmState::Work);
}

#[tokio::test]
async fn parked_sessions_are_re_driven_and_not_dropped() {
    let node_id = NodeId::from("n1");
    let (daemon, workflow) = daemon_with_session(&node_id).await;
    workflow.push_job(JobOutcome::NotReady);
    handle_job_request(&daemon, &node_id, false).await.unwrap();
    assert!(daemon.lock().await.registry.is_parked(&node_id));

    workflow.push_job(JobOutcome::Ready(b"job-bytes".to_vec()));
    retry_parked(&daemon).await.unwrap();

    let d = daemon.lock().await;
    assert!(!d.registry.is_parked(&node_id));
    assert_eq!(d.registry.session(&node_id).unwrap().state(), FsmState::Work);
}

#[tokio::test]
async fn blacklisted_node_is_refused_without_touching_balance() {
    let node_id = NodeId::from("n1");
    let (daemon, _workflow) = daemon_with_session(&node_id).await;
    daemon.lock().await.registry.blacklist(node_id.clone());

    handle_job_request(&daemon, &node_id, false).await.unwrap();

    let d = daemon.lock().await;
    let session = d.registry.session(&node_id).unwrap();
    assert_eq!(session.state(), FsmState::Work);
    assert_eq!(session.balance, 0);
}

#[tokio::test]
async fn paused_session_absorbs_the_request_without_an_fsm_transition() {
    let node_id = NodeId::from("n1");
    let (daemon, _workflow) = daemon_with_session(&node_id).await;
    {
        let mut d = daemon.lock().await;
        d.registry.pause(node_id.clone());
    }

    handle_job_request(&daemon, &node_id, false).await.unwrap();

    let d = daemon.lock().await;
    assert_eq!(d.registry.session(&node_id).unwrap().state(), FsmState::Work);
    assert!(d.registry.resume(&node_id));
}

#[tokio::test]
async fn resuming_a_node_with_an_absorbed_request_redelivers_it() {
    let node_id = NodeId::from("n1");
    let (daemon, workflow) = daemon_with_session(&node_id).await;
    workflow.push_job(JobOutcome::Ready(b"job-bytes".to_vec()));
    {
        let mut d = daemon.lock().await;
        d.registry.pause(node_id.clone());
    }
    handle_job_request(&daemon, &node_id, false).await.unwrap();

    resume(&daemon, &node_id, false).await.unwrap();

    let d = daemon.lock().await;
    assert!(!d.registry.is_paused(&node_id));
    let session = d.registry.session(&node_id).unwrap();
    assert_eq!(session.state(), FsmState::Work);
    assert_eq!(session.balance, 1);
}

#[tokio::test]
async fn resuming_a_node_with_no_absorbed_request_does_nothing() {
    let node_id = NodeId::from("n1");
    let (daemon, _workflow) = daemon_with_session(&node_id).await;
    {
        let mut d = daemon.lock().await;
        d.registry.pause(node_id.clone());
    }

    resume(&daemon, &node_id, false).await.unwrap();

    let d = daemon.lock().await;
    assert!(!d.registry.is_paused(&node_id));
    assert_eq!(d.registry.session(&node_id).unwrap().balance, 0);
}
