//! Configuration for the reversible linear-attention model.
//!
//! The configuration is split the same way the training context is consumed:
//! [`ModelConfig`] for the architecture, [`DatasetConfig`] for the token file and
//! loader workers, and [`OptimizerConfig`] for the AdamW step and gradient
//! accumulation. [`RevlinConfig`] bundles the three and is what gets loaded from
//! JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RevlinError, RevlinResult};

/// Architecture hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Tokens per training window (input length)
    pub sequence_length: usize,
    /// Windows per micro-batch
    pub batch_size: usize,
    /// Width of one reversible lane (the embedding is twice as wide)
    pub features: usize,
    /// Intermediate width multiplier inside every feed-forward block
    pub feed_forward_intermediate_factor: f64,
    /// Kernel size of the temporal-mixing convolution
    pub conv_kernel_size: usize,
    /// Expected activation std; expand/mix convolutions are scaled by its inverse
    pub activation_std: f64,
    /// Std of the normal embedding initialization
    pub input_embedding_std: f64,
    /// Amplitude of the positional divisor profile
    pub position_embedding_std: f64,
    /// Depth used for initialization scaling (independent of `device_count`)
    pub depth: usize,
    /// Number of distinct cells in one weight group
    pub device_count: usize,
    /// How many times the weight group is repeated in the stack
    pub weight_shared_blocks: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            sequence_length: 2048,
            batch_size: 16,
            features: 256,
            feed_forward_intermediate_factor: 2.0,
            conv_kernel_size: 7,
            activation_std: 1.0,
            input_embedding_std: 1.0,
            position_embedding_std: 1.0,
            depth: 16,
            device_count: 4,
            weight_shared_blocks: 4,
        }
    }
}

impl ModelConfig {
    /// Channel width inside the feed-forward blocks.
    pub fn intermediate_features(&self) -> usize {
        (self.features as f64 * self.feed_forward_intermediate_factor) as usize
    }

    /// Total number of cell applications in the reversible stack.
    pub fn num_blocks(&self) -> usize {
        self.device_count * self.weight_shared_blocks
    }

    /// `sqrt(depth)`, the divisor applied to the positional profile amplitude.
    pub fn init_scale(&self) -> f64 {
        (self.depth as f64).sqrt()
    }

    /// Output-projection gain for the scale and shift paths.
    ///
    /// Shrinks with depth so that deep stacks start close to the identity.
    pub fn modulation_scale(&self) -> f64 {
        0.5 / self.init_scale()
    }
}

/// Token file and loader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Safetensors file holding the 1-D token tensor
    pub file_name: PathBuf,
    /// Tensor name inside the file (the only tensor is used when `None`)
    pub tensor_name: Option<String>,
    /// Vocabulary size
    pub num_classes: usize,
    /// Background worker threads (0 = load on the caller's thread)
    pub num_workers: usize,
    /// Bounded queue depth per worker; also caps the worker count
    pub prefetch_factor: usize,
    /// Shuffle item order each epoch
    pub shuffle: bool,
    /// Accepted for compatibility; candle has no pinned host memory
    pub pin_memory: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            file_name: PathBuf::from("data/tokens.safetensors"),
            tensor_name: None,
            num_classes: 256,
            num_workers: 4,
            prefetch_factor: 8,
            shuffle: false,
            pin_memory: false,
        }
    }
}

impl DatasetConfig {
    /// Number of workers that will actually run.
    ///
    /// Workers beyond the prefetch depth would sit idle, so the count is capped.
    pub fn effective_workers(&self) -> usize {
        self.num_workers.min(self.prefetch_factor)
    }
}

/// AdamW and accumulation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    /// Micro-batches per optimizer step
    pub gradient_accumulation_steps: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
            gradient_accumulation_steps: 1,
        }
    }
}

/// Complete training context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevlinConfig {
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    pub optimizer: OptimizerConfig,
    /// Seed for parameter initialization and shuffling
    #[serde(default)]
    pub seed: u64,
}

impl RevlinConfig {
    /// Test configuration (minimal for unit tests)
    pub fn test() -> Self {
        Self {
            model: ModelConfig {
                sequence_length: 16,
                batch_size: 2,
                features: 8,
                feed_forward_intermediate_factor: 2.0,
                conv_kernel_size: 3,
                activation_std: 1.0,
                input_embedding_std: 1.0,
                position_embedding_std: 1.0,
                depth: 2,
                device_count: 2,
                weight_shared_blocks: 1,
            },
            dataset: DatasetConfig {
                num_classes: 100,
                num_workers: 0,
                prefetch_factor: 2,
                ..DatasetConfig::default()
            },
            optimizer: OptimizerConfig::default(),
            seed: 42,
        }
    }

    /// Set the dataset file
    pub fn with_dataset_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.dataset.file_name = path.into();
        self
    }

    /// Set the weight-group repetition count
    pub fn with_weight_shared_blocks(mut self, blocks: usize) -> Self {
        self.model.weight_shared_blocks = blocks;
        self
    }

    /// Set the initialization seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Vocabulary size.
    pub fn num_classes(&self) -> usize {
        self.dataset.num_classes
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> RevlinResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> RevlinResult<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject configurations that cannot build a model.
    pub fn validate(&self) -> RevlinResult<()> {
        let m = &self.model;
        let positive = [
            ("model.sequence_length", m.sequence_length),
            ("model.batch_size", m.batch_size),
            ("model.features", m.features),
            ("model.conv_kernel_size", m.conv_kernel_size),
            ("model.depth", m.depth),
            ("model.device_count", m.device_count),
            ("model.weight_shared_blocks", m.weight_shared_blocks),
            ("dataset.num_classes", self.dataset.num_classes),
            ("dataset.prefetch_factor", self.dataset.prefetch_factor),
            (
                "optimizer.gradient_accumulation_steps",
                self.optimizer.gradient_accumulation_steps,
            ),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RevlinError::invalid_config(format!("{name} must be > 0")));
            }
        }

        let stds = [
            ("model.activation_std", m.activation_std),
            ("model.input_embedding_std", m.input_embedding_std),
            ("model.position_embedding_std", m.position_embedding_std),
        ];
        for (name, value) in stds {
            if !(value.is_finite() && value > 0.0) {
                return Err(RevlinError::invalid_config(format!(
                    "{name} must be a positive finite number, got {value}"
                )));
            }
        }

        if m.intermediate_features() == 0 {
            return Err(RevlinError::invalid_config(format!(
                "features ({}) * feed_forward_intermediate_factor ({}) rounds to zero",
                m.features, m.feed_forward_intermediate_factor
            )));
        }

        if m.sequence_length > self.dataset.num_classes {
            return Err(RevlinError::invalid_config(format!(
                "sequence_length ({}) exceeds the positional capacity ({} positions)",
                m.sequence_length, self.dataset.num_classes
            )));
        }

        Ok(())
    }

    /// Trainable parameter count (shared blocks are counted once).
    pub fn parameter_count(&self) -> usize {
        let m = &self.model;
        let f = m.features;
        let i = m.intermediate_features();
        let classes = self.dataset.num_classes;

        let feed_forward = f * i + i * i * m.conv_kernel_size + i * f;
        let cell = 3 * feed_forward;
        let embedding = classes * 2 * f;
        let output = 2 * f * classes + classes;

        embedding + m.device_count * cell + output
    }

    /// Activation bytes one cell keeps alive while its graph exists (FP32).
    pub fn activation_memory_per_block(&self, batch_size: usize, seq_len: usize) -> usize {
        let m = &self.model;
        let positions = batch_size * seq_len;
        // Per feed-forward: two conv outputs and two norms at intermediate width, one output.
        let feed_forward = 4 * m.intermediate_features() + m.features;
        // Biased input, cumsum, division, modulation, norm, residual.
        let linear_attention = 6 * m.features;
        (3 * feed_forward + linear_attention) * positions * 4
    }

    /// Compare reversible and stored-activation training memory.
    pub fn activation_memory_estimate(
        &self,
        batch_size: usize,
        seq_len: usize,
    ) -> ActivationMemoryEstimate {
        let per_block = self.activation_memory_per_block(batch_size, seq_len);
        let lanes = 2 * self.model.features * batch_size * seq_len * 4;
        let blocks = self.model.num_blocks();

        ActivationMemoryEstimate {
            per_block,
            stored: blocks * per_block + lanes,
            reversible: per_block + 2 * lanes,
            num_blocks: blocks,
        }
    }
}

/// Activation memory with and without reversible recomputation.
#[derive(Debug, Clone)]
pub struct ActivationMemoryEstimate {
    /// Bytes held by one block's recomputation graph
    pub per_block: usize,
    /// Bytes when every block's graph is retained
    pub stored: usize,
    /// Bytes for the reversible path (one live block plus lanes and their grads)
    pub reversible: usize,
    /// Cell applications in the stack
    pub num_blocks: usize,
}

impl ActivationMemoryEstimate {
    /// Fraction of stored-activation memory the reversible path needs.
    pub fn reduction_factor(&self) -> f64 {
        if self.stored == 0 {
            1.0
        } else {
            self.reversible as f64 / self.stored as f64
        }
    }

    /// Format the estimate as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Activation Memory Estimate:\n\
             - Per block:   {}\n\
             - Stored:      {} ({} blocks)\n\
             - Reversible:  {} ({:.1}% of stored)",
            format_bytes(self.per_block),
            format_bytes(self.stored),
            self.num_blocks,
            format_bytes(self.reversible),
            100.0 * self.reduction_factor(),
        )
    }
}

/// Render a byte count with a binary unit suffix.
pub fn format_bytes(b: usize) -> String {
    if b >= 1024 * 1024 * 1024 {
        format!("{:.2} GB", b as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if b >= 1024 * 1024 {
        format!("{:.2} MB", b as f64 / (1024.0 * 1024.0))
    } else if b >= 1024 {
        format!("{:.2} KB", b as f64 / 1024.0)
    } else {
        format!("{} bytes", b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_config_is_valid() {
        let config = RevlinConfig::test();
        config.validate().unwrap();
        assert_eq!(config.model.intermediate_features(), 16);
        assert_eq!(config.model.num_blocks(), 2);
    }

    #[test]
    fn test_default_config_is_valid() {
        let mut config = RevlinConfig::default();
        config.model.sequence_length = 256;
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_features() {
        let mut config = RevlinConfig::test();
        config.model.features = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, RevlinError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_rejects_bad_std() {
        let mut config = RevlinConfig::test();
        config.model.activation_std = 0.0;
        assert!(config.validate().is_err());

        let mut config = RevlinConfig::test();
        config.model.position_embedding_std = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_sequence_beyond_positions() {
        let mut config = RevlinConfig::test();
        config.model.sequence_length = config.dataset.num_classes + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_workers_capped() {
        let mut config = RevlinConfig::test();
        config.dataset.num_workers = 8;
        config.dataset.prefetch_factor = 3;
        assert_eq!(config.dataset.effective_workers(), 3);
        // The configured value is not rewritten
        assert_eq!(config.dataset.num_workers, 8);
    }

    #[test]
    fn test_modulation_scale_shrinks_with_depth() {
        let mut config = RevlinConfig::test();
        config.model.depth = 4;
        let shallow = config.model.modulation_scale();
        config.model.depth = 64;
        let deep = config.model.modulation_scale();
        assert!(deep < shallow);
        assert!((shallow - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_parameter_count_ignores_repeats() {
        let config = RevlinConfig::test();
        let shared = config.clone().with_weight_shared_blocks(4);
        assert_eq!(config.parameter_count(), shared.parameter_count());
    }

    #[test]
    fn test_reversible_memory_is_depth_independent() {
        let shallow = RevlinConfig::test();
        let deep = RevlinConfig::test().with_weight_shared_blocks(8);

        let a = shallow.activation_memory_estimate(2, 16);
        let b = deep.activation_memory_estimate(2, 16);

        assert_eq!(a.reversible, b.reversible);
        assert!(b.stored > a.stored);
        assert!(b.reduction_factor() < a.reduction_factor());
        assert!(b.format().contains("Reversible:"));
    }

    #[test]
    fn test_json_round_trip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = RevlinConfig::test().with_seed(7);
        config.to_json_file(&path).unwrap();

        let loaded = RevlinConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.seed, 7);
        assert_eq!(loaded.model.features, config.model.features);
        assert_eq!(loaded.dataset.num_classes, config.dataset.num_classes);
    }
}
