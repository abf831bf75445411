// SPDX-License-Identifier: Apache-2.0

//! Per-session finite state machine (component C3).
//!
//! Ported from the reflective `fysom` state machine in the original
//! `VelesProtocol` (`examples/original_source/veles/server.py`) to a fixed
//! transition table: a pure function from `(State, Event)` to
//! `(State, Option<NodeState>)`, so that late async results can re-check the
//! current state without re-running any side effect (see DESIGN.md,
//! "Dynamic callbacks").

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::node::NodeState;

/// Session states (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Init,
    Wait,
    Work,
    GettingJob,
    Idle,
}

/// Events that drive the session FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    Connect,
    Identify,
    RequestJob,
    ObtainJob,
    RefuseJob,
    PostponeJob,
    Idle,
    Drop,
}

/// A session's state machine instance.
///
/// `drop` is defined from every state and is idempotent: calling it on an
/// already-`Init` session succeeds and re-reports `Offline`, matching
/// `connectionLost` being safe to invoke more than once in the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFsm {
    state: State,
}

impl Default for SessionFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFsm {
    pub fn new() -> Self {
        Self { state: State::Init }
    }

    pub fn current(&self) -> State {
        self.state
    }

    /// Apply `event`, returning the entry action (the `NodeRecord.state` to
    /// set) on success. Returns `Err` without mutating `self` if no
    /// transition exists for `(current, event)`.
    pub fn apply(&mut self, event: Event) -> Result<Option<NodeState>, CoreError> {
        let (next, effect) = transition(self.state, event)
            .ok_or(CoreError::InvalidTransition { state: self.state, event })?;
        self.state = next;
        Ok(effect)
    }
}

/// The fixed transition table from spec.md §4.3.
fn transition(state: State, event: Event) -> Option<(State, Option<NodeState>)> {
    // `drop` is total and always goes to Init, regardless of current state.
    if matches!(event, Event::Drop) {
        return Some((State::Init, Some(NodeState::Offline)));
    }

    match (state, event) {
        (State::Init, Event::Connect) => Some((State::Wait, None)),
        (State::Wait, Event::Identify) => Some((State::Work, Some(NodeState::Waiting))),
        (State::Work, Event::RequestJob) | (State::Idle, Event::RequestJob) => {
            Some((State::GettingJob, Some(NodeState::Waiting)))
        }
        (State::GettingJob, Event::ObtainJob) => Some((State::Work, Some(NodeState::Working))),
        (State::GettingJob, Event::RefuseJob) => Some((State::Work, Some(NodeState::Waiting))),
        (State::GettingJob, Event::PostponeJob) => Some((State::Work, Some(NodeState::Waiting))),
        (State::Work, Event::Idle) => Some((State::Idle, Some(NodeState::Waiting))),
        _ => None,
    }
}

#[cfg(test)]
#[path = "fsm_tests.rs"]
mod tests;
