//! Reversible linear-attention language model in pure Rust
//!
//! This crate implements a next-token model whose mixing layer is a causal
//! cumulative-sum "linear attention" cell, stacked reversibly so training
//! memory does not grow with depth:
//! - Rectified mean/energy normalization as the only stabilizer
//! - Causal convolutional feed-forward blocks (depth, scale and shift paths)
//! - Fixed sinusoidal divisor profile shared by every cell
//! - Reversible coupling with optional weight-shared block repetition
//! - Threaded, order-preserving loader over a flat token tensor
//!
//! # Example
//!
//! ```no_run
//! use revlin_model_rs::{LinearAttention, RevlinConfig};
//! use candle_core::{Device, Tensor};
//!
//! let config = RevlinConfig::test();
//! let device = Device::Cpu;
//! let model = LinearAttention::new(&config, &device).unwrap();
//!
//! let ids = Tensor::zeros((2, 16), candle_core::DType::U32, &device).unwrap();
//! let loss = model.forward(&ids, &ids).unwrap();
//! ```
//!
//! # Reversible training
//!
//! [`LinearAttention::loss_and_grads`] rebuilds each block's input from its
//! output during the backward walk instead of storing it:
//!
//! ```no_run
//! use revlin_model_rs::{RevlinConfig, SequenceLoader, LinearAttention, Trainer};
//! use candle_core::Device;
//!
//! let config = RevlinConfig::test().with_dataset_file("data/tokens.safetensors");
//! let loader = SequenceLoader::new(&config, Device::Cpu).unwrap();
//! let mut trainer = Trainer::new(LinearAttention::new(&config, &Device::Cpu).unwrap());
//!
//! for batch in loader.take(100) {
//!     let outcome = trainer.step(&batch.unwrap()).unwrap();
//!     println!("step {} loss {:.3}", outcome.step, outcome.loss);
//! }
//! ```

pub mod cell;
pub mod config;
pub mod conv;
pub mod data;
pub mod error;
pub mod feed_forward;
pub mod model;
pub mod norm;
pub mod params;
pub mod positional;
pub mod reversible;
pub mod trainer;

pub use cell::LinearAttentionCell;
pub use config::{
    format_bytes, ActivationMemoryEstimate, DatasetConfig, ModelConfig, OptimizerConfig,
    RevlinConfig,
};
pub use data::{load_token_file, LmBatch, SequenceLoader, TokenWindows};
pub use error::{RevlinError, RevlinResult};
pub use feed_forward::{FeedForward, FeedForwardSpec};
pub use model::LinearAttention;
pub use params::{Gradients, Initializer, ParamStore};
pub use positional::PositionalScheme;
pub use reversible::{ReversibleStack, StackBackward};
pub use trainer::{AdamW, StepOutcome, Trainer};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::RevlinConfig;
    pub use crate::data::{LmBatch, SequenceLoader};
    pub use crate::error::{RevlinError, RevlinResult};
    pub use crate::model::LinearAttention;
    pub use crate::trainer::{AdamW, StepOutcome, Trainer};
}
