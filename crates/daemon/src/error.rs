// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Crate-local error enum (SPEC_FULL.md §7): every fallible path in
/// `veld-daemon` returns one of these. Workflow-callback failures never
/// reach this type directly — they go to the shared error sink
/// (`main::spawn_error_sink`) instead, per spec.md §7 propagation policy
/// ("workflow-thread errors... logs and continues").
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Core(#[from] veld_core::CoreError),
    #[error(transparent)]
    Transport(#[from] veld_transport::TransportError),
    #[error(transparent)]
    Control(#[from] veld_wire::ControlError),
    #[error(transparent)]
    Framing(#[from] veld_wire::FramingError),
    #[error(transparent)]
    Launch(#[from] veld_core::workflow::LaunchError),
    #[error("unknown node id: {0}")]
    UnknownNode(String),
}
