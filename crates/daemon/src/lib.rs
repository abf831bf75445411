// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! veld-daemon: the runnable master — C4 Session Protocol (`control`), C5
//! Dispatcher (`dispatch`), C6 Master Registry (`registry`) — atop
//! `veld-core`'s FSM/workflow trait and `veld-transport`'s router.

pub mod control;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod session;

pub use error::DaemonError;
pub use registry::{MasterRegistry, RegistryConfig};
pub use session::Session;

use std::sync::Arc;

use veld_transport::Router;

/// Everything the coordinating logic touches (spec.md §5: "all mutations...
/// occur exclusively on the event-loop thread"). Held behind one
/// `tokio::sync::Mutex` so every control/data-channel task serializes
/// through it the way Twisted's single reactor thread would; the lock is
/// released before any workflow-callback `await` so other sessions' work
/// keeps flowing while one session is blocked on the workflow's thread pool
/// (spec.md §5 "Suspension points", `dispatch`'s lock/await/relock shape).
pub struct Daemon {
    pub registry: MasterRegistry,
    pub router: Router,
}

pub type SharedDaemon = Arc<tokio::sync::Mutex<Daemon>>;
