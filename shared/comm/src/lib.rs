//! The process-group abstraction (ranked communicator, point-to-point,
//! collectives, non-blocking variants, subgroup construction, custom
//! reduction operators) that the ring distance engine and cadence
//! controller are both built on top of.
//!
//! The `mpi` crate (rsmpi) is the genuine Rust binding for exactly this
//! contract, so [`MpiProcessGroup`] wraps it directly rather than inventing
//! a parallel transport. [`ProcessGroup`] is still expressed as a trait, in
//! the style the modeling crate uses for its own external seams (a
//! `CausalLM`-shaped contract rather than a concrete struct threaded
//! everywhere) — that seam is what lets the ring engine and cadence
//! controller be exercised in-process with [`testing::InProcessGroup`]
//! without an MPI runtime.

pub mod mpi_group;
pub mod reduction;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use psyche_core::{Error, Result};
pub use reduction::{CustomReductionOp, ReductionOp};

use std::sync::Arc;

/// A handle to a non-blocking collective. `Wait()` is consumed by value so
/// the type system enforces an "exactly once" contract: once waited, the
/// handle is gone.
pub trait WaitHandle: Send {
    /// Blocks until the reduction completes and returns the reduced buffer.
    fn wait(self: Box<Self>) -> Result<Vec<u8>>;
}

/// The ranked communicator contract shared by the ring distance engine and
/// the cadence controller.
///
/// All byte-buffer methods operate on raw bytes so the same trait covers
/// both natively-typed collectives (e.g. `f32` element sums) and the
/// reduced-precision custom operators, which MPI itself only knows how to
/// treat as bytes.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> i32;
    fn size(&self) -> i32;

    /// Builds a new communicator scoped to exactly `ranks`, preserving
    /// their relative order. `ranks` must be non-empty and a subset of
    /// `0..size()`.
    fn subgroup(&self, ranks: &[i32]) -> Result<Arc<dyn ProcessGroup>>;

    /// Blocking send of `buf` to `peer`, matched on `tag`.
    fn send(&self, buf: &[u8], peer: i32, tag: i32) -> Result<()>;

    /// Blocks until a message matching `(peer, tag)` is ready and returns
    /// its byte length, without consuming it. Needed whenever the receiver
    /// doesn't already know the incoming size.
    fn probe(&self, peer: i32, tag: i32) -> Result<usize>;

    /// Blocking receive of exactly `byte_len` bytes from `peer` on `tag`.
    /// Callers that don't already know the size call [`Self::probe`] first.
    fn recv(&self, peer: i32, tag: i32, byte_len: usize) -> Result<Vec<u8>>;

    /// Blocking in-place all-reduce of `buf` using `op`.
    fn allreduce_sum(&self, buf: &mut [u8], op: &ReductionOp) -> Result<()>;

    /// Non-blocking all-reduce. `buf` is consumed; the reduced bytes come
    /// back from [`WaitHandle::wait`].
    fn allreduce_sum_nonblocking(
        &self,
        buf: Vec<u8>,
        op: ReductionOp,
    ) -> Result<Box<dyn WaitHandle>>;
}
