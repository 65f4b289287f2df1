//! Rectified mean/energy normalization using basic tensor operations.
//!
//! This is the only stabilizing mechanism in the network: every feed-forward
//! stage and every linear-attention update passes through it. It has no
//! parameters and no state, so recomputation during the reversible backward
//! pass reproduces the forward values exactly.
//!
//! Activations in this crate are channel-first (`[batch, channels, time]`), so the
//! feature axis is dimension 1 and normalization happens independently at every
//! time position.

use candle_core::shape::Dim;
use candle_core::{Result, Tensor, D};

/// Numerical guard added to the L2 norm.
pub const NORM_EPS: f64 = 1e-5;

/// Added under the square root; sqrt has an infinite derivative at zero and
/// fully rectified positions would otherwise backpropagate NaN.
const SQRT_GUARD: f64 = 1e-12;

/// Subtract the mean over `dim` and rescale so the L2 norm over `dim` is
/// `sqrt(n)`, where `n` is the size of `dim`.
///
/// center_scale(x) = (x - mean(x)) / ((||x - mean(x)|| + eps) * n^-0.5)
pub fn center_scale<T: Dim + Copy>(x: &Tensor, dim: T) -> Result<Tensor> {
    let n = x.dim(dim)?;
    let centered = x.broadcast_sub(&x.mean_keepdim(dim)?)?;
    let norm = (centered.sqr()?.sum_keepdim(dim)? + SQRT_GUARD)?.sqrt()?;
    // (norm + eps) * n^-0.5
    let denom = norm.affine((n as f64).powf(-0.5), NORM_EPS * (n as f64).powf(-0.5))?;
    centered.broadcast_div(&denom)
}

/// ReLU followed by [`center_scale`] over `dim`.
pub fn activate_norm<T: Dim + Copy>(x: &Tensor, dim: T) -> Result<Tensor> {
    center_scale(&x.relu()?, dim)
}

/// [`activate_norm`] over the last axis, for `[..., features]` layouts.
pub fn activate_norm_last(x: &Tensor) -> Result<Tensor> {
    activate_norm(x, D::Minus1)
}

/// [`activate_norm`] over the channel axis of a `[batch, channels, time]` tensor.
pub fn activate_norm_channels(x: &Tensor) -> Result<Tensor> {
    activate_norm(x, 1)
}
