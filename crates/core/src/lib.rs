// SPDX-License-Identifier: Apache-2.0

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! veld-core: domain types shared by the master coordinator.
//!
//! This crate is intentionally free of any networking or async-runtime
//! dependency beyond the `async_trait`-expressed `Workflow`/`Launcher`
//! collaborator traits: it holds the node/session data model and the
//! per-session finite state machine, so that `veld-transport` and
//! `veld-daemon` can be tested against it without a socket in sight.

pub mod error;
pub mod fsm;
pub mod node;
pub mod workflow;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::CoreError;
pub use fsm::{Event as FsmEvent, SessionFsm, State as FsmState};
pub use node::{LaunchMeta, NodeId, NodeRecord, NodeState};
pub use workflow::{JobOutcome, LaunchError, Launcher, NoopStatsSink, SlaveDescription, StatsSink, Workflow};
