//! The metric functor: a pairwise distance/similarity kernel between two
//! row blocks, exposed as a value with call semantics rather than operator
//! overloading.

use psyche_core::{Error, Result};
use tch::{Kind, Tensor};

/// A pairwise distance or similarity kernel. `Euclidean` and `Gaussian` are
/// the two variants the ring distance engine drives; new kernels are added
/// here rather than by asking callers to branch on a type tag.
#[derive(Debug, Clone, Copy)]
pub enum Metric {
    Euclidean,
    /// Radial basis function kernel with bandwidth `sigma`.
    Gaussian { sigma: f64 },
}

impl Metric {
    /// `X: k1×F`, `Y: k2×F` → `k1×k2`, always `f64` regardless of the
    /// input tensors' dtype.
    pub fn call(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let x_shape = x.size();
        let y_shape = y.size();
        if x_shape.len() != 2 || y_shape.len() != 2 {
            return Err(Error::Caller(format!(
                "metric functor expects 2D inputs, got shapes {x_shape:?} and {y_shape:?}"
            )));
        }
        if x_shape[1] != y_shape[1] {
            return Err(Error::Caller(format!(
                "feature dimension mismatch: X has {} features, Y has {}",
                x_shape[1], y_shape[1]
            )));
        }

        let x = x.to_kind(Kind::Double);
        let y = y.to_kind(Kind::Double);
        // squared_dists[i, j] = sum_d (X[i,d] - Y[j,d])^2, fusing the outer
        // loop via broadcasting rather than looping row-by-row.
        let diff = x.unsqueeze(1) - y.unsqueeze(0);
        let squared_dists = diff.pow_tensor_scalar(2).sum_dim_intlist(-1, false, Kind::Double);

        match self {
            Metric::Euclidean => Ok(squared_dists.sqrt()),
            Metric::Gaussian { sigma } => {
                let denom = 2.0 * sigma * sigma;
                Ok((-(squared_dists) / denom).exp())
            }
        }
    }
}
