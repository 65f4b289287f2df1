//! Complete language model.
//!
//! Architecture:
//! - Embedding: class id -> 2F features
//! - Reversible stack of linear-attention cells over two F-wide lanes
//! - Pointwise output convolution (with bias) -> class logits
//! - Cross-entropy against the next token
//!
//! Two training paths share the same parameters:
//! - [`LinearAttention::forward`] returns a loss that carries the full autograd
//!   graph, so `loss.backward()` works as usual.
//! - [`LinearAttention::loss_and_grads`] runs the reversible path and returns a
//!   name-keyed gradient map without keeping per-block activations.

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::loss::cross_entropy;

use crate::config::RevlinConfig;
use crate::conv::pointwise_conv1d_bias;
use crate::error::{RevlinError, RevlinResult};
use crate::params::{Gradients, Initializer, ParamStore};
use crate::positional::PositionalScheme;
use crate::reversible::{accumulate, ReversibleStack};

/// Reversible linear-attention language model.
pub struct LinearAttention {
    config: RevlinConfig,
    embedding: Var,
    stem: ReversibleStack,
    output_weight: Var,
    output_bias: Var,
    positions: PositionalScheme,
    params: ParamStore,
    device: Device,
}

impl LinearAttention {
    /// Create a freshly initialized model.
    ///
    /// Initialization is seeded by `config.seed`; equal configs give equal weights.
    pub fn new(config: &RevlinConfig, device: &Device) -> RevlinResult<Self> {
        config.validate()?;
        let m = &config.model;
        let classes = config.num_classes();
        let width = 2 * m.features;

        let params = ParamStore::new();
        let mut init = Initializer::new(config.seed, device);

        let embedding = init.normal((classes, width), m.input_embedding_std)?;
        let embedding = params.register("embedding", &embedding)?;

        let stem = ReversibleStack::new(m, &mut init, &params)?;

        // Conv1d default: U(-1/sqrt(fan_in), 1/sqrt(fan_in)) for weight and bias
        let bound = 1.0 / (width as f64).sqrt();
        let output_weight = init.uniform(&[classes, width, 1], bound)?;
        let output_weight = params.register("output.weight", &output_weight)?;
        let output_bias = init.uniform(&[classes], bound)?;
        let output_bias = params.register("output.bias", &output_bias)?;

        let positions = PositionalScheme::new(
            classes,
            m.features,
            m.position_embedding_std,
            m.depth,
            device,
        )?;

        tracing::info!(
            "Built linear-attention model: {} parameters, {} cells x {} repeats, {} classes",
            params.num_elements(),
            m.device_count,
            m.weight_shared_blocks,
            classes
        );

        Ok(Self {
            config: config.clone(),
            embedding,
            stem,
            output_weight,
            output_bias,
            positions,
            params,
            device: device.clone(),
        })
    }

    /// Standard forward pass returning the mean cross-entropy loss.
    ///
    /// Inputs: token ids and targets, `(batch, time)` or `(1, batch, time)`.
    /// The returned scalar keeps the full graph.
    pub fn forward(&self, input_ids: &Tensor, target_ids: &Tensor) -> RevlinResult<Tensor> {
        let (ids, targets) = self.prepare(input_ids, target_ids)?;
        let (a, b) = self.split_lanes(&self.embed(&ids)?)?;
        let (p, q) = self.stem.forward_tracked(&a, &b, &self.positions)?;
        let logits = self.head(&p, &q)?;
        self.loss(&logits, &targets)
    }

    /// Class logits `(batch, num_classes, time)` computed without an autograd graph.
    pub fn logits(&self, input_ids: &Tensor) -> RevlinResult<Tensor> {
        let ids = self.prepare_ids(input_ids)?;
        let (a, b) = self.split_lanes(&self.embed(&ids)?)?;
        let (p, q) = self.stem.forward(&a, &b, &self.positions)?;
        Ok(self.head(&p, &q)?.detach())
    }

    /// Memory-efficient loss and gradients.
    ///
    /// Activations are kept for the output head and one cell at a time; every
    /// other block input is rebuilt from its output during the backward walk.
    pub fn loss_and_grads(
        &self,
        input_ids: &Tensor,
        target_ids: &Tensor,
    ) -> RevlinResult<(f32, Gradients)> {
        let (ids, targets) = self.prepare(input_ids, target_ids)?;
        let embedded = self.embed(&ids)?;
        let (a, b) = self.split_lanes(&embedded.detach())?;
        let (p, q) = self.stem.forward(&a, &b, &self.positions)?;

        // Head and loss with the lane outputs as leaves
        let p = Var::from_tensor(&p)?;
        let q = Var::from_tensor(&q)?;
        let logits = self.head(p.as_tensor(), q.as_tensor())?;
        let loss = self.loss(&logits, &targets)?;
        let loss_value = loss.to_scalar::<f32>()?;
        let head_grads = loss.backward()?;

        let mut grads = Gradients::new();
        for (name, var) in [
            ("output.weight", &self.output_weight),
            ("output.bias", &self.output_bias),
        ] {
            let g = head_grads.get(var.as_tensor()).ok_or(RevlinError::NoGradients)?;
            accumulate(&mut grads, name, g)?;
        }
        let dp = head_grads.get(p.as_tensor()).ok_or(RevlinError::NoGradients)?;
        let dq = head_grads.get(q.as_tensor()).ok_or(RevlinError::NoGradients)?;

        let stack = self.stem.backward(
            (p.as_tensor(), q.as_tensor()),
            (dp, dq),
            &self.positions,
            &mut grads,
        )?;

        // Embedding gradient through the lookup
        let d_embedded = Tensor::cat(&[&stack.input_grads.0, &stack.input_grads.1], 1)?;
        let surrogate = (&embedded * d_embedded)?.sum_all()?;
        let embed_grads = surrogate.backward()?;
        let g = embed_grads
            .get(self.embedding.as_tensor())
            .ok_or(RevlinError::NoGradients)?;
        accumulate(&mut grads, "embedding", g)?;

        Ok((loss_value, grads))
    }

    /// Embedding lookup: `(batch, time)` ids -> `(batch, 2F, time)`.
    fn embed(&self, ids: &Tensor) -> RevlinResult<Tensor> {
        let (batch, time) = ids.dims2()?;
        let width = 2 * self.config.model.features;
        let rows = self.embedding.as_tensor().index_select(&ids.flatten_all()?, 0)?;
        Ok(rows
            .reshape((batch, time, width))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn split_lanes(&self, x: &Tensor) -> RevlinResult<(Tensor, Tensor)> {
        let f = self.config.model.features;
        Ok((
            x.narrow(1, 0, f)?.contiguous()?,
            x.narrow(1, f, f)?.contiguous()?,
        ))
    }

    fn head(&self, p: &Tensor, q: &Tensor) -> RevlinResult<Tensor> {
        let joined = Tensor::cat(&[p, q], 1)?;
        Ok(pointwise_conv1d_bias(
            &joined,
            self.output_weight.as_tensor(),
            self.output_bias.as_tensor(),
        )?)
    }

    fn loss(&self, logits: &Tensor, targets: &Tensor) -> RevlinResult<Tensor> {
        let (batch, classes, time) = logits.dims3()?;
        let flat = logits
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch * time, classes))?;
        Ok(cross_entropy(&flat, &targets.flatten_all()?)?)
    }

    fn prepare(&self, input_ids: &Tensor, target_ids: &Tensor) -> RevlinResult<(Tensor, Tensor)> {
        let ids = self.prepare_ids(input_ids)?;
        let targets = self.prepare_ids(target_ids)?;
        if ids.dims() != targets.dims() {
            return Err(RevlinError::shape_mismatch(
                format!("targets shaped like inputs {:?}", ids.dims()),
                format!("{:?}", targets.dims()),
            ));
        }
        Ok((ids, targets))
    }

    /// Squeeze a leading unit axis, check the length and the id range.
    fn prepare_ids(&self, ids: &Tensor) -> RevlinResult<Tensor> {
        let ids = match ids.rank() {
            2 => ids.clone(),
            3 if ids.dim(0)? == 1 => ids.squeeze(0)?,
            _ => {
                return Err(RevlinError::shape_mismatch(
                    "(batch, time) or (1, batch, time)",
                    format!("{:?}", ids.dims()),
                ))
            }
        };
        if ids.dim(0)? == 0 || ids.dim(1)? == 0 {
            return Err(RevlinError::shape_mismatch(
                "at least one token in every dimension",
                format!("{:?}", ids.dims()),
            ));
        }
        self.positions.check_length(ids.dim(1)?)?;

        let num_classes = self.num_classes();
        let values: Vec<i64> = ids.flatten_all()?.to_dtype(DType::I64)?.to_vec1()?;
        if let Some(&token) = values
            .iter()
            .find(|&&v| v < 0 || v as usize >= num_classes)
        {
            return Err(RevlinError::TokenOutOfRange { token, num_classes });
        }
        Ok(ids.to_dtype(DType::U32)?)
    }

    /// Save weights to a safetensors file.
    pub fn save(&self, path: &Path) -> RevlinResult<()> {
        self.params.var_map().save(path)?;
        Ok(())
    }

    /// Build a model for `config` and fill it from a safetensors file.
    ///
    /// Every parameter must be present in the file with a matching shape.
    pub fn load(config: &RevlinConfig, path: &Path, device: &Device) -> RevlinResult<Self> {
        let mut model = Self::new(config, device)?;
        model.load_weights(path)?;
        Ok(model)
    }

    /// Overwrite the current weights in place from a safetensors file.
    pub fn load_weights(&mut self, path: &Path) -> RevlinResult<()> {
        self.params.var_map_mut().load(path)?;
        tracing::info!("Loaded weights from {}", path.display());
        Ok(())
    }

    /// Every trainable variable with its name, sorted by name.
    pub fn named_parameters(&self) -> RevlinResult<Vec<(String, Var)>> {
        Ok(self.params.named_vars()?)
    }

    /// Total scalar parameter count.
    pub fn num_parameters(&self) -> usize {
        self.params.num_elements()
    }

    /// Vocabulary size.
    pub fn num_classes(&self) -> usize {
        self.config.num_classes()
    }

    /// The configuration the model was built from.
    pub fn config(&self) -> &RevlinConfig {
        &self.config
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Shared positional buffers.
    pub fn positions(&self) -> &PositionalScheme {
        &self.positions
    }

    /// The reversible stack.
    pub fn stem(&self) -> &ReversibleStack {
        &self.stem
    }

    /// Parameter store backing this model.
    pub fn params(&self) -> &ParamStore {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(batch: usize, time: usize, seed: u32) -> Tensor {
        let data: Vec<u32> = (0..(batch * time) as u32)
            .map(|i| (i * 37 + seed * 11) % 100)
            .collect();
        Tensor::from_vec(data, (batch, time), &Device::Cpu).unwrap()
    }

    fn max_abs(t: &Tensor) -> f32 {
        t.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_model_creation() {
        let config = RevlinConfig::test();
        let model = LinearAttention::new(&config, &Device::Cpu).unwrap();
        assert_eq!(model.num_parameters(), config.parameter_count());
        assert_eq!(model.stem().num_blocks(), 2);

        let names: Vec<String> = model
            .named_parameters()
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert!(names.contains(&"embedding".to_string()));
        assert!(names.contains(&"output.weight".to_string()));
        assert!(names.contains(&"output.bias".to_string()));
        assert!(names.contains(&"stem.cells.1.shift.w2".to_string()));
    }

    #[test]
    fn test_forward_loss_is_finite() {
        let config = RevlinConfig::test();
        let model = LinearAttention::new(&config, &Device::Cpu).unwrap();
        let loss = model.forward(&tokens(2, 16, 0), &tokens(2, 16, 1)).unwrap();
        assert_eq!(loss.dims(), &[] as &[usize]);
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite() && value >= 0.0, "loss = {value}");
    }

    #[test]
    fn test_logits_shape_and_leading_axis() {
        let config = RevlinConfig::test();
        let model = LinearAttention::new(&config, &Device::Cpu).unwrap();
        let ids = tokens(2, 16, 0);
        let logits = model.logits(&ids).unwrap();
        assert_eq!(logits.dims(), &[2, 100, 16]);

        let stacked = model.logits(&ids.unsqueeze(0).unwrap()).unwrap();
        assert!(max_abs(&(logits - stacked).unwrap()) == 0.0);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let config = RevlinConfig::test();
        let a = LinearAttention::new(&config, &Device::Cpu).unwrap();
        let b = LinearAttention::new(&config, &Device::Cpu).unwrap();
        let la = a.logits(&tokens(1, 8, 3)).unwrap();
        let lb = b.logits(&tokens(1, 8, 3)).unwrap();
        assert_eq!(max_abs(&(la - lb).unwrap()), 0.0);
    }

    #[test]
    fn test_token_out_of_range_fails() {
        let config = RevlinConfig::test();
        let model = LinearAttention::new(&config, &Device::Cpu).unwrap();
        let bad = Tensor::new(&[[1u32, 2, 100]], &Device::Cpu).unwrap();
        let ok = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        let err = model.forward(&bad, &ok).unwrap_err();
        assert!(matches!(
            err,
            RevlinError::TokenOutOfRange {
                token: 100,
                num_classes: 100
            }
        ));
        // Targets are checked too
        assert!(model.forward(&ok, &bad).is_err());
    }

    #[test]
    fn test_shape_mismatch_fails() {
        let config = RevlinConfig::test();
        let model = LinearAttention::new(&config, &Device::Cpu).unwrap();
        let err = model.forward(&tokens(2, 16, 0), &tokens(2, 15, 0)).unwrap_err();
        assert!(matches!(err, RevlinError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_sequence_beyond_capacity_fails() {
        let config = RevlinConfig::test();
        let model = LinearAttention::new(&config, &Device::Cpu).unwrap();
        let ids = tokens(1, 101, 0);
        assert!(matches!(
            model.forward(&ids, &ids).unwrap_err(),
            RevlinError::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn test_empty_sequence_fails() {
        let config = RevlinConfig::test();
        let model = LinearAttention::new(&config, &Device::Cpu).unwrap();
        for shape in [(2, 0), (0, 16)] {
            let ids = Tensor::zeros(shape, DType::U32, &Device::Cpu).unwrap();
            assert!(matches!(
                model.forward(&ids, &ids).unwrap_err(),
                RevlinError::ShapeMismatch { .. }
            ));
            assert!(model.loss_and_grads(&ids, &ids).is_err());
            assert!(model.logits(&ids).is_err());
        }
    }

    #[test]
    fn test_reversible_gradients_match_autograd() {
        let config = RevlinConfig::test().with_weight_shared_blocks(2);
        let model = LinearAttention::new(&config, &Device::Cpu).unwrap();
        let ids = tokens(2, 12, 0);
        let targets = tokens(2, 12, 5);

        let loss = model.forward(&ids, &targets).unwrap();
        let reference = loss.backward().unwrap();
        let (value, grads) = model.loss_and_grads(&ids, &targets).unwrap();

        assert!((loss.to_scalar::<f32>().unwrap() - value).abs() < 1e-4);

        let params = model.named_parameters().unwrap();
        assert_eq!(grads.len(), params.len());
        for (name, var) in params {
            let expected = reference.get(var.as_tensor()).unwrap();
            let got = &grads[&name];
            let diff = max_abs(&(expected - got).unwrap());
            assert!(
                diff < 1e-3 * (1.0 + max_abs(expected)),
                "gradient mismatch for {name}: {diff}"
            );
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let config = RevlinConfig::test();
        let model = LinearAttention::new(&config, &Device::Cpu).unwrap();
        model.save(&path).unwrap();

        let ids = tokens(1, 10, 2);
        let before = model.logits(&ids).unwrap();

        // A different seed starts elsewhere and converges after loading
        let other = config.clone().with_seed(config.seed + 1);
        let mut fresh = LinearAttention::new(&other, &Device::Cpu).unwrap();
        assert!(max_abs(&(fresh.logits(&ids).unwrap() - &before).unwrap()) > 0.0);
        fresh.load_weights(&path).unwrap();
        assert_eq!(max_abs(&(fresh.logits(&ids).unwrap() - &before).unwrap()), 0.0);

        let loaded = LinearAttention::load(&other, &path, &Device::Cpu).unwrap();
        assert_eq!(max_abs(&(loaded.logits(&ids).unwrap() - &before).unwrap()), 0.0);
    }
}
