//! Converts between `tch::Tensor`s and the raw byte buffers the process
//! group's point-to-point and collective primitives move around.
//!
//! The ring engine moves two different kinds of buffer: the owner's
//! stationary feature block (moved at the input tensor's own precision,
//! `f32` here) and the computed distance/similarity tiles (§3 fixes the
//! output matrix at `f64`, so those must round-trip at `f64` too — encoding
//! them as `f32` on the wire would narrow roughly half of each rank's
//! off-diagonal tiles and break the 1e-8 cross-partition agreement bound).
//! Reduced-precision buffers for the parameter codec's downcast path are
//! produced directly as `half`/`bfloat16` bytes by `codec.rs`, not here.

use tch::{Kind, Tensor};

pub fn tensor_to_bytes(t: &Tensor) -> Vec<u8> {
    let t = t.to_kind(Kind::Float).contiguous();
    let numel = t.numel();
    let mut data = vec![0f32; numel];
    t.copy_data(&mut data, numel);
    bytemuck::cast_slice(&data).to_vec()
}

pub fn bytes_to_tensor(bytes: &[u8], shape: &[i64]) -> Tensor {
    let data: &[f32] = bytemuck::cast_slice(bytes);
    Tensor::from_slice(data).reshape(shape)
}

/// Byte length of a row-major `f32` tensor with `numel` elements.
pub fn byte_len(numel: usize) -> usize {
    numel * std::mem::size_of::<f32>()
}

/// `f64` counterpart of [`tensor_to_bytes`], used for the ring engine's
/// distance tiles rather than feature blocks.
pub fn tensor_to_bytes_f64(t: &Tensor) -> Vec<u8> {
    let t = t.to_kind(Kind::Double).contiguous();
    let numel = t.numel();
    let mut data = vec![0f64; numel];
    t.copy_data(&mut data, numel);
    bytemuck::cast_slice(&data).to_vec()
}

/// `f64` counterpart of [`bytes_to_tensor`], used for the ring engine's
/// distance tiles rather than feature blocks.
pub fn bytes_to_tensor_f64(bytes: &[u8], shape: &[i64]) -> Tensor {
    let data: &[f64] = bytemuck::cast_slice(bytes);
    Tensor::from_slice(data).reshape(shape)
}
