//! Fixed sinusoidal position buffers shared by every cell.

use std::f64::consts::PI;

use candle_core::{Device, Result, Tensor};

use crate::error::{RevlinError, RevlinResult};

/// Position index and divisor profile, built once per model.
///
/// `pos_embd` is `[1, 1, P]` with values `1..=P` and `divisor` is `[1, F, P]`,
/// where `P` is the vocabulary size (the positional capacity) and `F` the lane
/// width. Neither is trainable.
#[derive(Debug, Clone)]
pub struct PositionalScheme {
    pos_embd: Tensor,
    divisor: Tensor,
    capacity: usize,
    features: usize,
}

impl PositionalScheme {
    /// Build the buffers.
    ///
    /// Channel `k` (1-based) uses frequency
    /// `exp(((k - k % 2) / 2) * 8 / F - ln(P / 2π)) + π * (k % 2)`
    /// and `divisor[k, p] = sin(p * freq_k) * position_std / sqrt(depth)`.
    pub fn new(
        capacity: usize,
        features: usize,
        position_std: f64,
        depth: usize,
        device: &Device,
    ) -> Result<Self> {
        let amplitude = position_std / (depth as f64).sqrt();
        let offset = (capacity as f64 / (2.0 * PI)).ln();

        let mut divisor = Vec::with_capacity(features * capacity);
        for k in 1..=features {
            let phase = (k % 2) as f64;
            let exponent = (k as f64 - phase) / 2.0 * 8.0 / features as f64 - offset;
            let frequency = exponent.exp() + PI * phase;
            for p in 1..=capacity {
                divisor.push(((p as f64 * frequency).sin() * amplitude) as f32);
            }
        }

        let positions: Vec<f32> = (1..=capacity).map(|p| p as f32).collect();

        Ok(Self {
            pos_embd: Tensor::from_vec(positions, (1, 1, capacity), device)?,
            divisor: Tensor::from_vec(divisor, (1, features, capacity), device)?,
            capacity,
            features,
        })
    }

    /// Maximum sequence length the buffers cover.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Channel count of the divisor.
    pub fn features(&self) -> usize {
        self.features
    }

    /// Full `[1, 1, P]` position buffer.
    pub fn pos_embd(&self) -> &Tensor {
        &self.pos_embd
    }

    /// Full `[1, F, P]` divisor buffer.
    pub fn divisor(&self) -> &Tensor {
        &self.divisor
    }

    /// Fail when `time` positions do not fit.
    pub fn check_length(&self, time: usize) -> RevlinResult<()> {
        if time > self.capacity {
            return Err(RevlinError::shape_mismatch(
                format!("sequence length <= {}", self.capacity),
                format!("sequence length {time}"),
            ));
        }
        Ok(())
    }

    /// First `time` positions: `([1, 1, time], [1, F, time])`.
    pub fn window(&self, time: usize) -> Result<(Tensor, Tensor)> {
        if time > self.capacity {
            candle_core::bail!(
                "sequence length {time} exceeds positional capacity {}",
                self.capacity
            );
        }
        Ok((
            self.pos_embd.narrow(2, 0, time)?,
            self.divisor.narrow(2, 0, time)?,
        ))
    }
}
