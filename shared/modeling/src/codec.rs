//! The parameter codec: flattens a named, ordered parameter collection
//! into one contiguous buffer (optionally downcast to a reduced precision),
//! records a per-name shape/slice/dtype layout, and restores parameters
//! from such a buffer with a weighted blend of the received average
//! against the current local value.

use std::ops::Range;

use psyche_core::{Error, Result, ScalarKind};
use tch::{Kind, Tensor};

use crate::params::{NamedParameter, NamedParameters};

/// Where one parameter lives inside a packed buffer.
#[derive(Debug, Clone)]
pub struct ParamSlice {
    pub shape: Vec<i64>,
    /// Element offsets (not bytes) within the buffer, in units of `dtype`.
    pub range: Range<usize>,
    pub dtype: ScalarKind,
}

/// The name → slice table captured at pack time, in the same stable order
/// the parameters were iterated.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    pub entries: Vec<(String, ParamSlice)>,
}

impl Layout {
    pub fn get(&self, name: &str) -> Option<&ParamSlice> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Total element count covered by this layout.
    pub fn numel(&self) -> usize {
        self.entries.last().map(|(_, s)| s.range.end).unwrap_or(0)
    }
}

fn scalar_kind_of(t: &Tensor) -> ScalarKind {
    match t.kind() {
        Kind::Float => ScalarKind::Float32,
        Kind::Double => ScalarKind::Float64,
        Kind::Half => ScalarKind::Float16,
        Kind::BFloat16 => ScalarKind::Bfloat16,
        Kind::Int64 => ScalarKind::Int64,
        Kind::Int => ScalarKind::Int32,
        Kind::Bool => ScalarKind::Bool,
        other => panic!("parameter codec does not support tensor kind {other:?}"),
    }
}

fn to_tch_kind(kind: ScalarKind) -> Kind {
    match kind {
        ScalarKind::Float32 => Kind::Float,
        ScalarKind::Float64 => Kind::Double,
        ScalarKind::Float16 => Kind::Half,
        ScalarKind::Bfloat16 => Kind::BFloat16,
        ScalarKind::Int64 => Kind::Int64,
        ScalarKind::Int32 => Kind::Int,
        ScalarKind::Bool => Kind::Bool,
        other => panic!("parameter codec does not support scalar kind {other:?}"),
    }
}

/// Byte width of one element of `kind`, reusing the lattice's bit width.
pub fn byte_width(kind: ScalarKind) -> usize {
    (kind.bits() as usize) / 8
}

fn tensor_to_kind_bytes(t: &Tensor, target: ScalarKind) -> Vec<u8> {
    macro_rules! copy_as {
        ($elem:ty, $tch_kind:expr) => {{
            let t = t.to_kind($tch_kind).contiguous();
            let n = t.numel();
            let mut data = vec![<$elem>::default(); n];
            t.copy_data(&mut data, n);
            bytemuck::cast_slice(&data).to_vec()
        }};
    }
    match target {
        ScalarKind::Float32 => copy_as!(f32, Kind::Float),
        ScalarKind::Float64 => copy_as!(f64, Kind::Double),
        ScalarKind::Float16 => copy_as!(half::f16, Kind::Half),
        ScalarKind::Bfloat16 => copy_as!(half::bf16, Kind::BFloat16),
        other => panic!("packing does not support scalar kind {other:?}"),
    }
}

fn bytes_to_tensor_kind(bytes: &[u8], kind: ScalarKind) -> Tensor {
    match kind {
        ScalarKind::Float32 => Tensor::from_slice(bytemuck::cast_slice::<u8, f32>(bytes)),
        ScalarKind::Float64 => Tensor::from_slice(bytemuck::cast_slice::<u8, f64>(bytes)),
        ScalarKind::Float16 => Tensor::from_slice(bytemuck::cast_slice::<u8, half::f16>(bytes)),
        ScalarKind::Bfloat16 => Tensor::from_slice(bytemuck::cast_slice::<u8, half::bf16>(bytes)),
        other => panic!("unpacking does not support scalar kind {other:?}"),
    }
}

/// Packs every `requires_grad` parameter, in iteration order, into one
/// contiguous buffer. `cast` forces every entry to a single reduced-
/// precision dtype (the cadence controller's downcast path); `None` keeps
/// each parameter's own dtype.
pub fn pack(params: &[NamedParameter], cast: Option<ScalarKind>) -> (Vec<u8>, Layout) {
    let mut entries = Vec::new();
    let mut buffer = Vec::new();
    let mut offset = 0usize;

    for p in params {
        if !p.requires_grad {
            continue;
        }
        let target = cast.unwrap_or_else(|| scalar_kind_of(&p.tensor));
        let numel = p.tensor.numel();
        buffer.extend(tensor_to_kind_bytes(&p.tensor, target));
        entries.push((
            p.name.clone(),
            ParamSlice {
                shape: p.tensor.size(),
                range: offset..offset + numel,
                dtype: target,
            },
        ));
        offset += numel;
    }

    (buffer, Layout { entries })
}

/// Restores parameters from a received, already-reduced buffer with a
/// weighted blend against the current value: `param <- alpha * param +
/// update`, where `update = (buffer_slice / denom).reshape(shape)`.
///
/// At warmup/cooldown or a terminal batch, the caller passes `alpha = 0.0`
/// so the received average fully replaces the parameter; otherwise it
/// passes the blend weight computed from `batches_since_send`.
pub fn unpack_with_blend(
    buffer: &[u8],
    layout: &Layout,
    params: &mut dyn NamedParameters,
    denom: f64,
    alpha: f64,
) -> Result<()> {
    for (name, slice) in &layout.entries {
        let width = byte_width(slice.dtype);
        let start = slice.range.start * width;
        let end = slice.range.end * width;
        let bytes = buffer.get(start..end).ok_or_else(|| {
            Error::Caller(format!("packed buffer too short for parameter {name}"))
        })?;

        let current = params
            .get_parameter(name)
            .ok_or_else(|| Error::Caller(format!("unknown parameter {name}")))?;
        let target_kind = current.kind();

        let raw = bytes_to_tensor_kind(bytes, slice.dtype)
            .reshape(&slice.shape)
            .to_kind(target_kind);
        let update = (raw / denom).to_kind(target_kind);

        let blended = if alpha == 0.0 {
            update
        } else {
            (&current * alpha) + &update
        };
        params.set_parameter(name, &blended);
    }
    Ok(())
}

/// The `⌈size/chunk_size⌉` element counts a buffer splits into: the first
/// piece holds the remainder (so it's typically smaller), subsequent pieces
/// are exactly `chunk_size` elements.
pub fn chunk_sizes(total_elements: usize, chunk_size: usize) -> Vec<usize> {
    if chunk_size == 0 || total_elements == 0 {
        return Vec::new();
    }
    let remainder = total_elements % chunk_size;
    if remainder == 0 {
        vec![chunk_size; total_elements / chunk_size]
    } else {
        let mut sizes = vec![remainder];
        sizes.extend(std::iter::repeat(chunk_size).take(total_elements / chunk_size));
        sizes
    }
}

/// Splits a packed buffer of uniform element width `elem_width` into chunks
/// per [`chunk_sizes`].
pub fn split_into_chunks(buffer: &[u8], elem_width: usize, chunk_size_elems: usize) -> Vec<Vec<u8>> {
    let total_elems = buffer.len() / elem_width;
    let mut out = Vec::new();
    let mut offset = 0;
    for size in chunk_sizes(total_elems, chunk_size_elems) {
        let byte_len = size * elem_width;
        out.push(buffer[offset..offset + byte_len].to_vec());
        offset += byte_len;
    }
    out
}

/// Reassembles chunks produced by [`split_into_chunks`] back into one
/// contiguous buffer. Pure concatenation: chunking never reorders or
/// transforms the underlying bytes.
pub fn concat_chunks(chunks: &[Vec<u8>]) -> Vec<u8> {
    chunks.concat()
}
