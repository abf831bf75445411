// SPDX-License-Identifier: Apache-2.0

use super::*;

#[test]
fn fresh_session_starts_in_init_with_empty_history() {
    let session = Session::new(NodeId::from("n1"));
    assert_eq!(session.state(), veld_core::FsmState::Init);
    assert!(session.history().is_empty());
}

#[test]
fn update_with_no_prior_dispatch_has_no_elapsed_sample() {
    let mut session = Session::new(NodeId::from("n1"));
    assert_eq!(session.record_update_elapsed(), None);
    assert!(session.history().is_empty());
}

#[test]
fn update_following_a_dispatch_records_one_sample() {
    let mut session = Session::new(NodeId::from("n1"));
    session.record_job_dispatch();
    let elapsed = session.record_update_elapsed();
    assert!(elapsed.is_some());
    assert_eq!(session.history().len(), 1);
}

#[test]
fn a_second_update_without_an_intervening_dispatch_records_nothing_more() {
    let mut session = Session::new(NodeId::from("n1"));
    session.record_job_dispatch();
    session.record_update_elapsed();
    assert_eq!(session.record_update_elapsed(), None);
    assert_eq!(session.history().len(), 1);
}

#[test]
fn history_is_bounded() {
    let mut session = Session::new(NodeId::from("n1"));
    for _ in 0..(HISTORY_CAPACITY + 5) {
        session.record_job_dispatch();
        session.record_update_elapsed();
    }
    assert_eq!(session.history().len(), HISTORY_CAPACITY);
}
