// SPDX-License-Identifier: Apache-2.0

use super::*;

#[test]
fn connect_moves_init_to_wait_with_no_entry_action() {
    let mut fsm = SessionFsm::new();
    let effect = fsm.apply(Event::Connect).expect("connect is valid from Init");
    assert_eq!(fsm.current(), State::Wait);
    assert_eq!(effect, None);
}

#[test]
fn full_job_cycle_matches_spec_table() {
    let mut fsm = SessionFsm::new();
    assert_eq!(fsm.apply(Event::Connect).unwrap(), None);
    assert_eq!(fsm.apply(Event::Identify).unwrap(), Some(NodeState::Waiting));
    assert_eq!(fsm.current(), State::Work);

    assert_eq!(fsm.apply(Event::RequestJob).unwrap(), Some(NodeState::Waiting));
    assert_eq!(fsm.current(), State::GettingJob);

    assert_eq!(fsm.apply(Event::ObtainJob).unwrap(), Some(NodeState::Working));
    assert_eq!(fsm.current(), State::Work);

    assert_eq!(fsm.apply(Event::Idle).unwrap(), Some(NodeState::Waiting));
    assert_eq!(fsm.current(), State::Idle);

    // Idle can request another job.
    assert_eq!(fsm.apply(Event::RequestJob).unwrap(), Some(NodeState::Waiting));
    assert_eq!(fsm.current(), State::GettingJob);
}

#[test]
fn refuse_and_postpone_both_return_to_work() {
    for ev in [Event::RefuseJob, Event::PostponeJob] {
        let mut fsm = SessionFsm::new();
        fsm.apply(Event::Connect).unwrap();
        fsm.apply(Event::Identify).unwrap();
        fsm.apply(Event::RequestJob).unwrap();
        let effect = fsm.apply(ev).unwrap();
        assert_eq!(fsm.current(), State::Work);
        assert_eq!(effect, Some(NodeState::Waiting));
    }
}

#[test]
fn drop_is_total_and_idempotent() {
    for start in [State::Init, State::Wait, State::Work, State::GettingJob, State::Idle] {
        let mut fsm = SessionFsm { state: start };
        let effect = fsm.apply(Event::Drop).unwrap();
        assert_eq!(fsm.current(), State::Init);
        assert_eq!(effect, Some(NodeState::Offline));
    }

    // Dropping an already-Init session is a no-op transition, not an error.
    let mut fsm = SessionFsm::new();
    assert!(fsm.apply(Event::Drop).is_ok());
    assert_eq!(fsm.current(), State::Init);
}

#[test]
fn invalid_transitions_are_rejected_without_mutating_state() {
    let mut fsm = SessionFsm::new();
    let before = fsm.current();
    let err = fsm.apply(Event::ObtainJob).unwrap_err();
    assert_eq!(fsm.current(), before);
    assert_eq!(err, CoreError::InvalidTransition { state: State::Init, event: Event::ObtainJob });
}

#[test]
fn request_job_requires_work_or_idle() {
    let mut fsm = SessionFsm::new();
    assert!(fsm.apply(Event::RequestJob).is_err());
}
