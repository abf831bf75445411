// SPDX-License-Identifier: Apache-2.0

//! Per-node reusable job-reply buffer: the "shared-memory fast path" of
//! spec.md §4.2 / SPEC_FULL.md §4.2.
//!
//! The original master (`examples/original_source/veles/server.py`) backs
//! this with POSIX shared memory (`txzmq.SharedIO`) handed to libzmq by
//! reference, avoiding a payload copy across the ipc transport. The
//! pure-Rust `zeromq` crate has no equivalent zero-copy handoff, so this
//! keeps the *shape* of the optimization — a per-node buffer that's reused
//! rather than reallocated on every job reply, seeked back to the start
//! before each reuse, and rebuilt larger on overflow — without claiming an
//! OS shared-memory segment. Noted as an implementation-detail deviation in
//! DESIGN.md.

/// Extra headroom kept when a buffer is (re)allocated, so a job only
/// slightly larger than the last one doesn't force an immediate regrow
/// (spec.md/server.py `RESERVE_SHMEM_SIZE = 0.05`).
pub const RESERVE_SHMEM_SIZE: f64 = 0.05;

/// A reusable buffer for one node's `"job"` channel replies.
#[derive(Debug)]
pub struct SharedJobBuffer {
    name: String,
    data: Vec<u8>,
}

impl SharedJobBuffer {
    /// Allocate a buffer sized for `payload_len` plus the reserve margin.
    pub fn with_capacity_for(name: impl Into<String>, payload_len: usize) -> Self {
        let capacity = grown_capacity(payload_len);
        Self { name: name.into(), data: Vec::with_capacity(capacity) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Seek to the start and write `payload` if it fits within the current
    /// capacity; otherwise report overflow so the caller can fall back to a
    /// regular send and allocate a fresh, larger buffer for next time
    /// (server.py: `ZmqConnection.IOOverflow` -> `self.shmem[node_id] = None`
    /// then immediately resized on the same reply).
    pub fn try_reuse(&mut self, payload: &[u8]) -> Result<(), ShmemOverflow> {
        if payload.len() > self.data.capacity() {
            return Err(ShmemOverflow { needed: payload.len() });
        }
        self.data.clear();
        self.data.extend_from_slice(payload);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// Raised by [`SharedJobBuffer::try_reuse`] when the payload no longer fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmemOverflow {
    pub needed: usize,
}

fn grown_capacity(payload_len: usize) -> usize {
    ((payload_len as f64) * (1.0 + RESERVE_SHMEM_SIZE)).ceil() as usize
}

#[cfg(test)]
#[path = "shmem_tests.rs"]
mod tests;
