// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! veld-transport: the data-channel socket layer (spec.md §4.1/§4.2, C1+C2).
//!
//! `endpoints` binds a `RouterSocket` to inproc/ipc/tcp and builds the
//! endpoint map a connecting node picks from; `router` wraps that socket
//! for multipart send/recv and routing-token bookkeeping; `shmem` is the
//! per-node reusable job-reply buffer.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod shmem;

pub use endpoints::{Endpoints, DEFAULT_TCP_PORT_RANGE};
pub use error::TransportError;
pub use router::{Compression, InboundMessage, Router};
pub use shmem::{SharedJobBuffer, ShmemOverflow, RESERVE_SHMEM_SIZE};
