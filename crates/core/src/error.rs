// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the core domain model.

use thiserror::Error;

use crate::fsm::{Event, State};

/// Errors raised by the core domain model.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CoreError {
    /// The session FSM has no transition for `event` from `state`.
    #[error("no transition for event {event:?} from state {state:?}")]
    InvalidTransition { state: State, event: Event },
}
