//! Reduction operator selection for [`crate::ProcessGroup::allreduce_sum`].

/// A user-defined reduction callback over raw byte buffers, matching the
/// signature `psyche_core::reduce_ops::{sum_f16, sum_bfloat16}` already
/// expose: reinterpret both buffers as the same element type, sum
/// element-wise, and write the result into the second buffer.
#[derive(Clone, Copy)]
pub struct CustomReductionOp {
    pub name: &'static str,
    pub commutative: bool,
    pub apply: fn(&[u8], &mut [u8]),
}

impl std::fmt::Debug for CustomReductionOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomReductionOp")
            .field("name", &self.name)
            .field("commutative", &self.commutative)
            .finish()
    }
}

/// Which sum operator an `allreduce_sum` call should use.
#[derive(Debug, Clone, Copy)]
pub enum ReductionOp {
    /// The buffer holds native `f32` elements; use the transport's built-in
    /// sum reduction.
    NativeF32Sum,
    /// The buffer holds native `f64` elements (e.g. the cadence
    /// controller's per-rank loss vector); use the transport's built-in sum
    /// reduction.
    NativeF64Sum,
    /// The buffer holds a reduced-precision element type the transport has
    /// no native reduction for; use the registered custom operator.
    Custom(CustomReductionOp),
}

/// Registers one of the two reduced-precision sum operators. Returns a
/// handle that callers pass to `allreduce_sum`; there is no global registry
/// to look the operator up by id later — the handle is passed explicitly
/// instead.
pub fn register_reduction_op(
    name: &'static str,
    apply: fn(&[u8], &mut [u8]),
    commutative: bool,
) -> CustomReductionOp {
    CustomReductionOp {
        name,
        commutative,
        apply,
    }
}

/// The two concrete reduced-precision operators, built on the byte-buffer
/// kernels in `psyche_core::reduce_ops`.
pub fn f16_sum_op() -> CustomReductionOp {
    register_reduction_op("f16_sum", psyche_core::reduce_ops::sum_f16, true)
}

pub fn bfloat16_sum_op() -> CustomReductionOp {
    register_reduction_op("bfloat16_sum", psyche_core::reduce_ops::sum_bfloat16, true)
}
