//! The named-parameter iteration contract: any module-like collection of
//! trainable tensors that can be walked in a stable order. Expressed as a
//! trait, in the style of a `CausalLM`-shaped seam, so the codec and
//! cadence controller can drive any `tch`-backed module without depending
//! on a concrete model type.

use tch::Tensor;

/// One trainable parameter: its stable name, the tensor itself, and whether
/// it participates in gradient-based training. Only `requires_grad`
/// parameters are packed/unpacked by the codec.
pub struct NamedParameter {
    pub name: String,
    pub tensor: Tensor,
    pub requires_grad: bool,
}

/// Iteration order must be stable across ranks and across steps: every
/// rank must iterate the same names in the same order for the codec's
/// layout to line up.
pub trait NamedParameters {
    fn named_parameters(&self) -> Vec<NamedParameter>;

    /// Reads one parameter's current tensor by name, used by the codec's
    /// unpack-with-blend path to read `param` before combining it with the
    /// received update.
    fn get_parameter(&self, name: &str) -> Option<Tensor>;

    /// In-place overwrite of one parameter's data by name. Implementations
    /// must not change the tensor's shape or dtype.
    fn set_parameter(&mut self, name: &str, value: &Tensor);
}
