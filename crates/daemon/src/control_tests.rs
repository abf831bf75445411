// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use veld_core::test_support::{FakeLauncher, FakeWorkflow};
use veld_core::NodeId;
use veld_transport::Endpoints;

use super::*;
use crate::registry::RegistryConfig;

fn registry() -> MasterRegistry {
    let config = RegistryConfig {
        job_timeout_floor: None,
        respawn: false,
        domain_suffix: None,
        master_mid: "master-mid".to_string(),
        master_pid: 100,
    };
    MasterRegistry::new(config, Arc::new(FakeWorkflow::new("X")), Arc::new(FakeLauncher::new("L")))
}

fn endpoints() -> Endpoints {
    Endpoints {
        inproc: "inproc://veld-m".to_string(),
        ipc: "ipc:///tmp/veld-m.ipc".to_string(),
        tcp: "tcp://0.0.0.0:5555".to_string(),
    }
}

fn handshake(checksum: &str) -> HandshakeRequest {
    HandshakeRequest {
        checksum: Some(checksum.to_string()),
        id: None,
        power: Some(1.0),
        mid: Some("m1".to_string()),
        pid: Some(42),
        data: None,
        backend: None,
        device: None,
        argv: None,
        executable: None,
        cwd: None,
        python_path: None,
    }
}

#[tokio::test]
async fn missing_checksum_is_rejected() {
    let mut reg = registry();
    let mut req = handshake("X");
    req.checksum = None;
    assert!(matches!(
        handle_handshake(&mut reg, &endpoints(), req, "1.2.3.4").await,
        HandshakeReply::Rejected(ControlError::HandshakeChecksumMissing)
    ));
}

#[tokio::test]
async fn mismatched_checksum_reports_both_values() {
    let mut reg = registry();
    let req = handshake("Y");
    match handle_handshake(&mut reg, &endpoints(), req, "1.2.3.4").await {
        HandshakeReply::Rejected(ControlError::HandshakeChecksumMismatch { expected, got }) => {
            assert_eq!(expected, "X");
            assert_eq!(got, "Y");
        }
        _ => panic!("expected a checksum mismatch rejection"),
    }
}

#[tokio::test]
async fn missing_power_is_rejected() {
    let mut reg = registry();
    let mut req = handshake("X");
    req.power = None;
    assert!(matches!(
        handle_handshake(&mut reg, &endpoints(), req, "1.2.3.4").await,
        HandshakeReply::Rejected(ControlError::MissingPower)
    ));
}

#[tokio::test]
async fn fresh_handshake_is_accepted_and_echoes_a_generated_id() {
    let mut reg = registry();
    let req = handshake("X");
    match handle_handshake(&mut reg, &endpoints(), req, "1.2.3.4").await {
        HandshakeReply::Accepted { body, node_id, .. } => {
            assert_eq!(body.id.as_deref(), Some(node_id.as_str()));
            assert_eq!(body.endpoint, "tcp://1.2.3.4:5555");
            assert!(reg.node(&node_id).is_some());
        }
        _ => panic!("expected acceptance"),
    }
}

#[tokio::test]
async fn known_id_reconnects_without_new_node_record() {
    let mut reg = registry();
    let node_id = NodeId::from("n1");
    reg.ensure_node(node_id.clone(), "m1".to_string(), 42, 1.0, "h".to_string());

    let mut req = handshake("X");
    req.id = Some(node_id.to_string());
    match handle_handshake(&mut reg, &endpoints(), req, "1.2.3.4").await {
        HandshakeReply::Reconnected { node_id: got, .. } => assert_eq!(got, node_id),
        _ => panic!("expected a reconnect reply"),
    }
}

#[tokio::test]
async fn reconnect_carries_supplied_data_through_for_the_caller_to_apply() {
    let mut reg = registry();
    let node_id = NodeId::from("n1");
    reg.ensure_node(node_id.clone(), "m1".to_string(), 42, 1.0, "h".to_string());

    let mut req = handshake("X");
    req.id = Some(node_id.to_string());
    req.data = Some(serde_json::json!({"checkpoint": 7}));
    match handle_handshake(&mut reg, &endpoints(), req, "1.2.3.4").await {
        HandshakeReply::Reconnected { node_id: got, supplied_data } => {
            assert_eq!(got, node_id);
            assert_eq!(supplied_data, Some(serde_json::json!({"checkpoint": 7})));
        }
        _ => panic!("expected a reconnect reply"),
    }
}

#[tokio::test]
async fn unknown_supplied_id_is_treated_as_new_and_echoed() {
    let mut reg = registry();
    let mut req = handshake("X");
    req.id = Some("custom-id".to_string());
    match handle_handshake(&mut reg, &endpoints(), req, "1.2.3.4").await {
        HandshakeReply::Accepted { body, node_id, .. } => {
            assert_eq!(node_id.as_str(), "custom-id");
            assert_eq!(body.id.as_deref(), Some("custom-id"));
        }
        _ => panic!("expected acceptance"),
    }
}

#[test]
fn change_power_without_identity_is_not_a_slave() {
    let mut reg = registry();
    let err = handle_change_power(&mut reg, None, ChangePowerRequest { power: Some(2.0) }).unwrap_err();
    assert_eq!(err, ControlError::NotASlave);
}

#[test]
fn change_power_updates_the_node_record() {
    let mut reg = registry();
    let node_id = NodeId::from("n1");
    reg.ensure_node(node_id.clone(), "m1".to_string(), 42, 1.0, "h".to_string());
    handle_change_power(&mut reg, Some(&node_id), ChangePowerRequest { power: Some(3.5) }).unwrap();
    assert_eq!(reg.node(&node_id).unwrap().power, 3.5);
}

#[test]
fn worker_commands_are_rejected_once_a_session_has_queried() {
    assert_eq!(guard_worker_command(true).unwrap_err(), ControlError::NotASlave);
    assert!(guard_worker_command(false).is_ok());
}

#[test]
fn endpoints_query_returns_the_three_transports() {
    let value = endpoints_query_response(&endpoints());
    assert_eq!(value["tcp"], "tcp://0.0.0.0:5555");
    assert_eq!(value["inproc"], "inproc://veld-m");
}

#[test]
fn strip_domain_suffix_removes_configured_suffix() {
    assert_eq!(strip_domain_suffix("worker1.corp.example.com.", Some(".corp.example.com")), "worker1");
}

#[test]
fn strip_domain_suffix_is_noop_without_a_configured_suffix() {
    assert_eq!(strip_domain_suffix("worker1.corp.example.com", None), "worker1.corp.example.com");
}
