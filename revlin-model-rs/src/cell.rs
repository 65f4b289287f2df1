//! Linear-attention cell: the residual function of one reversible block.
//!
//! ```text
//! biased = inp + pos
//! acc    = cumsum_t(depth(biased)) / divisor * scale(biased) + shift(biased)
//! out    = inp + norm(acc)
//! ```
//!
//! The running sum over time replaces pairwise attention; the divisor gives
//! each channel its own position-dependent weighting.

use candle_core::{Result, Tensor, Var};

use crate::config::ModelConfig;
use crate::feed_forward::{FeedForward, FeedForwardSpec};
use crate::norm::activate_norm_channels;
use crate::params::{Initializer, ParamStore};
use crate::positional::PositionalScheme;

/// One cell. Holds only its three feed-forward parameter sets; the positional
/// buffers are borrowed on every call.
pub struct LinearAttentionCell {
    depth: FeedForward,
    scale: FeedForward,
    shift: FeedForward,
}

impl LinearAttentionCell {
    /// Create a cell whose parameters are registered under `prefix`.
    pub fn new(
        prefix: &str,
        config: &ModelConfig,
        init: &mut Initializer,
        store: &ParamStore,
    ) -> Result<Self> {
        let base = FeedForwardSpec {
            in_features: config.features,
            intermediate: config.intermediate_features(),
            out_features: config.features,
            kernel_size: config.conv_kernel_size,
            activation_std: config.activation_std,
            final_scale: 1.0,
        };
        let modulation = FeedForwardSpec {
            final_scale: config.modulation_scale(),
            ..base
        };

        Ok(Self {
            depth: FeedForward::new(&format!("{prefix}.depth"), base, init, store)?,
            scale: FeedForward::new(&format!("{prefix}.scale"), modulation, init, store)?,
            shift: FeedForward::new(&format!("{prefix}.shift"), modulation, init, store)?,
        })
    }

    /// Forward pass
    /// Input: (batch, features, time)
    /// Output: (batch, features, time)
    pub fn forward(&self, inp: &Tensor, positions: &PositionalScheme) -> Result<Tensor> {
        let (_, _, time) = inp.dims3()?;
        let (pos_embd, divisor) = positions.window(time)?;

        let biased = inp.broadcast_add(&pos_embd)?;
        let depth = self.depth.forward(&biased)?;
        let scale = self.scale.forward(&biased)?;
        let shift = self.shift.forward(&biased)?;

        let acc = depth.cumsum(2)?.broadcast_div(&divisor)?;
        let acc = ((acc * scale)? + shift)?;
        inp + activate_norm_channels(&acc)?
    }

    /// All nine kernels with their registered names.
    pub fn named_parameters(&self) -> Vec<(String, &Var)> {
        let mut params = self.depth.named_parameters();
        params.extend(self.scale.named_parameters());
        params.extend(self.shift.named_parameters());
        params
    }
}
