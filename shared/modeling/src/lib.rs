//! Tensor-level components of the distributed toolkit: the metric functor,
//! the ring distance engine built on it, the named-parameter iteration
//! contract, and the parameter codec.

pub mod codec;
pub mod metric;
pub mod params;
pub mod ring;
pub mod tensor_bytes;

pub use codec::{pack, unpack_with_blend, Layout, ParamSlice};
pub use metric::Metric;
pub use params::{NamedParameter, NamedParameters};
pub use ring::{similarity, Split};
