// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use veld_core::test_support::{FakeLauncher, FakeWorkflow};
use veld_core::{FsmEvent, NodeId, NodeState};
use veld_transport::Endpoints;

use super::*;

fn registry() -> MasterRegistry {
    registry_with_workflow().0
}

fn registry_with_workflow() -> (MasterRegistry, Arc<FakeWorkflow>) {
    let config = RegistryConfig {
        job_timeout_floor: None,
        respawn: false,
        domain_suffix: None,
        master_mid: "master-mid".to_string(),
        master_pid: 100,
    };
    let workflow = Arc::new(FakeWorkflow::new("X"));
    let reg = MasterRegistry::new(config, workflow.clone(), Arc::new(FakeLauncher::new("L")));
    (reg, workflow)
}

fn endpoints() -> Endpoints {
    Endpoints {
        inproc: "inproc://veld-m".to_string(),
        ipc: "ipc:///tmp/veld-m.ipc".to_string(),
        tcp: "tcp://0.0.0.0:5555".to_string(),
    }
}

#[test]
fn ensure_node_creates_once_and_reuses_on_reconnect() {
    let mut reg = registry();
    let id = NodeId::from("n1");
    reg.ensure_node(id.clone(), "m".to_string(), 1, 1.0, "h".to_string());
    reg.node_mut(&id).unwrap().jobs = 5;
    reg.ensure_node(id.clone(), "m".to_string(), 1, 1.0, "h".to_string());
    assert_eq!(reg.node(&id).unwrap().jobs, 5);
}

#[test]
fn apply_fsm_event_writes_the_entry_action_into_the_node_record() {
    let mut reg = registry();
    let id = NodeId::from("n1");
    reg.ensure_node(id.clone(), "m".to_string(), 1, 1.0, "h".to_string());
    reg.insert_session(id.clone(), Session::new(id.clone()));
    assert_eq!(reg.node(&id).unwrap().state, NodeState::Waiting);

    reg.apply_fsm_event(&id, FsmEvent::Connect).unwrap();
    reg.apply_fsm_event(&id, FsmEvent::Identify).unwrap();
    assert_eq!(reg.node(&id).unwrap().state, NodeState::Waiting);

    reg.apply_fsm_event(&id, FsmEvent::RequestJob).unwrap();
    reg.apply_fsm_event(&id, FsmEvent::ObtainJob).unwrap();
    assert_eq!(reg.node(&id).unwrap().state, NodeState::Working);

    reg.apply_fsm_event(&id, FsmEvent::Drop).unwrap();
    assert_eq!(reg.node(&id).unwrap().state, NodeState::Offline);
}

#[test]
fn inserting_a_second_session_evicts_the_first() {
    let mut reg = registry();
    let id = NodeId::from("n1");
    reg.ensure_node(id.clone(), "m".to_string(), 1, 1.0, "h".to_string());
    reg.insert_session(id.clone(), Session::new(id.clone()));
    reg.insert_session(id.clone(), Session::new(id.clone()));
    assert_eq!(reg.session_count(), 1);
}

#[test]
fn select_endpoint_same_mid_and_pid_is_inproc() {
    let reg = registry();
    assert_eq!(reg.select_endpoint(&endpoints(), "master-mid", 100, "9.9.9.9"), "inproc://veld-m");
}

#[test]
fn select_endpoint_same_mid_only_is_ipc() {
    let reg = registry();
    assert_eq!(reg.select_endpoint(&endpoints(), "master-mid", 200, "9.9.9.9"), "ipc:///tmp/veld-m.ipc");
}

#[test]
fn select_endpoint_cross_host_rewrites_wildcard_to_source_ip() {
    let reg = registry();
    assert_eq!(reg.select_endpoint(&endpoints(), "other-mid", 1, "9.9.9.9"), "tcp://9.9.9.9:5555");
}

#[test]
fn pause_then_resume_without_a_request_redelivers_nothing() {
    let mut reg = registry();
    let id = NodeId::from("n1");
    reg.pause(id.clone());
    assert!(reg.is_paused(&id));
    assert!(!reg.resume(&id));
    assert!(!reg.is_paused(&id));
}

#[test]
fn request_absorbed_while_paused_is_redelivered_on_resume() {
    let mut reg = registry();
    let id = NodeId::from("n1");
    reg.pause(id.clone());
    assert!(reg.absorb_paused_request(&id));
    assert!(reg.resume(&id));
}

#[test]
fn hanged_candidates_empty_when_nobody_has_progressed() {
    let mut reg = registry();
    let id = NodeId::from("n1");
    reg.ensure_node(id.clone(), "m".to_string(), 1, 1.0, "h".to_string());
    reg.insert_session(id.clone(), Session::new(id.clone()));
    assert!(reg.hanged_candidates().is_empty());
}

#[test]
fn hanged_candidates_flags_zero_job_sessions_once_another_progressed() {
    let mut reg = registry();
    let stuck = NodeId::from("stuck");
    let progressed = NodeId::from("progressed");
    reg.ensure_node(stuck.clone(), "m".to_string(), 1, 1.0, "h".to_string());
    reg.ensure_node(progressed.clone(), "m".to_string(), 2, 1.0, "h".to_string());
    reg.node_mut(&progressed).unwrap().jobs = 3;
    reg.insert_session(stuck.clone(), Session::new(stuck.clone()));
    reg.insert_session(progressed.clone(), Session::new(progressed.clone()));
    assert_eq!(reg.hanged_candidates(), vec![stuck]);
}

#[test]
fn evict_node_is_a_noop_while_workflow_still_running() {
    let mut reg = registry();
    let id = NodeId::from("n1");
    reg.ensure_node(id.clone(), "m".to_string(), 1, 1.0, "h".to_string());
    reg.maybe_evict_node(&id);
    assert!(reg.node(&id).is_some());
}

#[test]
fn evict_node_erases_record_once_workflow_stopped() {
    let (mut reg, workflow) = registry_with_workflow();
    let id = NodeId::from("n1");
    reg.ensure_node(id.clone(), "m".to_string(), 1, 1.0, "h".to_string());
    workflow.set_running(false);
    reg.maybe_evict_node(&id);
    assert!(reg.node(&id).is_none());
}
