//! Causal 1-D convolution.
//!
//! The only operator in the model that mixes information across time. The time
//! axis is left-padded with `kernel_size - 1` zeros, so output position `t`
//! sees inputs `t - kernel_size + 1 ..= t` and nothing later.

use candle_core::{bail, Result, Tensor};

/// Causal convolution without bias.
///
/// Input: (batch, in_channels, time)
/// Weight: (out_channels, in_channels, kernel_size)
/// Output: (batch, out_channels, time)
pub fn causal_conv1d(input: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let (_, in_channels, _) = input.dims3()?;
    let (_, w_in, kernel_size) = weight.dims3()?;
    if w_in != in_channels {
        bail!(
            "causal_conv1d: kernel expects {w_in} input channels, input has {in_channels} ({:?} vs {:?})",
            weight.dims(),
            input.dims()
        );
    }
    if kernel_size == 0 {
        bail!("causal_conv1d: kernel_size must be > 0");
    }

    let padded = if kernel_size > 1 {
        input.pad_with_zeros(2, kernel_size - 1, 0)?
    } else {
        input.clone()
    };
    padded.conv1d(weight, 0, 1, 1, 1)
}

/// Pointwise (kernel size 1) convolution with a per-channel bias.
///
/// Weight: (out_channels, in_channels, 1), bias: (out_channels,)
pub fn pointwise_conv1d_bias(input: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let out = causal_conv1d(input, weight)?;
    let out_channels = bias.dims1()?;
    out.broadcast_add(&bias.reshape((1, out_channels, 1))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_causal_conv_shape() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 1.0, (2, 4, 10), &device).unwrap();
        let w = Tensor::randn(0.0f32, 1.0, (6, 4, 3), &device).unwrap();
        let out = causal_conv1d(&x, &w).unwrap();
        assert_eq!(out.dims(), &[2, 6, 10]);
    }

    #[test]
    fn test_causal_conv_known_values() {
        let device = Device::Cpu;
        // Single channel, kernel [1, 2]: y[t] = x[t-1] + 2 x[t]
        let x = Tensor::new(&[[[1.0f32, 2.0, 3.0, 4.0]]], &device).unwrap();
        let w = Tensor::new(&[[[1.0f32, 2.0]]], &device).unwrap();
        let out: Vec<f32> = causal_conv1d(&x, &w)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(out, vec![2.0, 5.0, 8.0, 11.0]);
    }

    #[test]
    fn test_causal_conv_is_causal() {
        let device = Device::Cpu;
        let time = 12;
        let x = Tensor::randn(0.0f32, 1.0, (1, 3, time), &device).unwrap();
        let w = Tensor::randn(0.0f32, 1.0, (5, 3, 4), &device).unwrap();
        let base = causal_conv1d(&x, &w).unwrap();

        for t in 0..time {
            // Perturb every channel at position t only
            let mut data: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();
            for c in 0..3 {
                data[c * time + t] += 10.0;
            }
            let perturbed = Tensor::from_vec(data, (1, 3, time), &device).unwrap();
            let out = causal_conv1d(&perturbed, &w).unwrap();

            if t > 0 {
                let diff = (out.narrow(2, 0, t).unwrap() - base.narrow(2, 0, t).unwrap())
                    .unwrap()
                    .abs()
                    .unwrap()
                    .max_all()
                    .unwrap()
                    .to_scalar::<f32>()
                    .unwrap();
                assert_eq!(diff, 0.0, "output before t={t} changed");
            }
            let here = (out.narrow(2, t, 1).unwrap() - base.narrow(2, t, 1).unwrap())
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(here > 0.0, "output at t={t} should react");
        }
    }

    #[test]
    fn test_channel_mismatch_fails() {
        let device = Device::Cpu;
        let x = Tensor::zeros((1, 4, 8), candle_core::DType::F32, &device).unwrap();
        let w = Tensor::zeros((2, 5, 1), candle_core::DType::F32, &device).unwrap();
        assert!(causal_conv1d(&x, &w).is_err());
    }

    #[test]
    fn test_pointwise_bias() {
        let device = Device::Cpu;
        let x = Tensor::ones((1, 2, 3), candle_core::DType::F32, &device).unwrap();
        let w = Tensor::new(&[[[1.0f32], [1.0]], [[0.0], [2.0]]], &device).unwrap();
        let b = Tensor::new(&[0.5f32, -1.0], &device).unwrap();
        let out = pointwise_conv1d_bias(&x, &w, &b).unwrap();
        let vals = out.to_vec3::<f32>().unwrap();
        assert_eq!(vals[0][0], vec![2.5, 2.5, 2.5]);
        assert_eq!(vals[0][1], vec![1.0, 1.0, 1.0]);
    }
}
