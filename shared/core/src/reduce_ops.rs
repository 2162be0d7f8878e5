//! Byte-buffer sum kernels for custom reduction operators.
//!
//! `mpi` (and MPI generally) lets a caller register a user-defined reduction
//! callback that operates on raw byte buffers rather than a typed slice, so
//! that the same callback can be registered once and invoked by the
//! transport for every `Allreduce` it drives. Ported from `heat`'s
//! `__sum_f16_cb`/`__sum_bfloat_cb` (`optim/dp_optimizer.py`), which exist
//! because MPI has no native reduction op for half-precision floats: the
//! callback reinterprets the `invec`/`inoutvec` byte buffers as
//! `[half::f16]`/`[half::bf16]` and sums them element-wise in place.

use bytemuck::{cast_slice, cast_slice_mut};
use half::{bf16, f16};

/// Sums `invec` into `inoutvec` element-wise, both reinterpreted as
/// `[f16]`. Panics if the buffers aren't the same length or aren't sized to
/// an integral number of `f16`s, since that indicates a mismatched
/// registration rather than a recoverable runtime condition.
pub fn sum_f16(invec: &[u8], inoutvec: &mut [u8]) {
    let src: &[f16] = cast_slice(invec);
    let dst: &mut [f16] = cast_slice_mut(inoutvec);
    assert_eq!(src.len(), dst.len(), "reduction buffer length mismatch");
    for (d, s) in dst.iter_mut().zip(src) {
        *d = *d + *s;
    }
}

/// Sums `invec` into `inoutvec` element-wise, both reinterpreted as
/// `[bf16]`.
pub fn sum_bfloat16(invec: &[u8], inoutvec: &mut [u8]) {
    let src: &[bf16] = cast_slice(invec);
    let dst: &mut [bf16] = cast_slice_mut(inoutvec);
    assert_eq!(src.len(), dst.len(), "reduction buffer length mismatch");
    for (d, s) in dst.iter_mut().zip(src) {
        *d = *d + *s;
    }
}
