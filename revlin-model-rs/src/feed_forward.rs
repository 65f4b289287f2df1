//! Convolutional feed-forward block.
//!
//! expand (pointwise) -> norm -> causal mix (kernel k) -> norm -> project (pointwise)

use candle_core::{Result, Tensor, Var};

use crate::conv::causal_conv1d;
use crate::norm::activate_norm_channels;
use crate::params::{Initializer, ParamStore};

/// Shapes and initial gains of one feed-forward block.
#[derive(Debug, Clone, Copy)]
pub struct FeedForwardSpec {
    pub in_features: usize,
    pub intermediate: usize,
    pub out_features: usize,
    pub kernel_size: usize,
    /// Orthogonal gain of the expand and mix kernels is `1 / activation_std`
    pub activation_std: f64,
    /// Orthogonal gain of the projection kernel
    pub final_scale: f64,
}

/// Three chained causal convolutions with normalization between them.
pub struct FeedForward {
    name: String,
    w0: Var,
    w1: Var,
    w2: Var,
}

impl FeedForward {
    /// Create and register the block's kernels as `{name}.w0`, `{name}.w1`, `{name}.w2`.
    pub fn new(
        name: &str,
        spec: FeedForwardSpec,
        init: &mut Initializer,
        store: &ParamStore,
    ) -> Result<Self> {
        let gain = 1.0 / spec.activation_std;
        let w0 = init.orthogonal((spec.intermediate, spec.in_features, 1), gain)?;
        let w1 = init.orthogonal(
            (spec.intermediate, spec.intermediate, spec.kernel_size),
            gain,
        )?;
        let w2 = init.orthogonal((spec.out_features, spec.intermediate, 1), spec.final_scale)?;

        Ok(Self {
            name: name.to_string(),
            w0: store.register(&format!("{name}.w0"), &w0)?,
            w1: store.register(&format!("{name}.w1"), &w1)?,
            w2: store.register(&format!("{name}.w2"), &w2)?,
        })
    }

    /// Forward pass
    /// Input: (batch, in_features, time)
    /// Output: (batch, out_features, time)
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = activate_norm_channels(&causal_conv1d(x, self.w0.as_tensor())?)?;
        let h = activate_norm_channels(&causal_conv1d(&h, self.w1.as_tensor())?)?;
        causal_conv1d(&h, self.w2.as_tensor())
    }

    /// Registered names with their variables.
    pub fn named_parameters(&self) -> Vec<(String, &Var)> {
        vec![
            (format!("{}.w0", self.name), &self.w0),
            (format!("{}.w1", self.name), &self.w1),
            (format!("{}.w2", self.name), &self.w2),
        ]
    }

    /// Parameter name prefix
    pub fn name(&self) -> &str {
        &self.name
    }
}
