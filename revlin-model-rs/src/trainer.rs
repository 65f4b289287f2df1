//! AdamW and the accumulation-aware training step.

use std::collections::HashMap;

use candle_core::{DType, Tensor};

use crate::config::OptimizerConfig;
use crate::data::LmBatch;
use crate::error::{RevlinError, RevlinResult};
use crate::model::LinearAttention;
use crate::params::Gradients;
use crate::reversible::accumulate;

/// AdamW optimizer over name-keyed gradients.
pub struct AdamW {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    /// First moment estimates
    m: HashMap<String, Tensor>,
    /// Second moment estimates
    v: HashMap<String, Tensor>,
    /// Step counter for bias correction
    t: usize,
}

impl AdamW {
    /// Create an optimizer from its configuration.
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.epsilon,
            weight_decay: config.weight_decay,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        }
    }

    /// Apply one update to every parameter of `model` that has a gradient.
    pub fn step(&mut self, model: &LinearAttention, grads: &Gradients) -> RevlinResult<()> {
        if grads.is_empty() {
            return Err(RevlinError::NoGradients);
        }
        self.t += 1;

        // Bias correction factors
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for (name, var) in model.named_parameters()? {
            let Some(grad) = grads.get(&name) else {
                continue;
            };

            let (m, v) = match (self.m.get(&name), self.v.get(&name)) {
                (Some(m), Some(v)) => (m.clone(), v.clone()),
                _ => {
                    let zeros = Tensor::zeros(var.dims(), DType::F32, var.device())?;
                    (zeros.clone(), zeros)
                }
            };

            // m = β1 * m + (1 - β1) * g
            let m_new = ((m * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
            // v = β2 * v + (1 - β2) * g²
            let v_new = ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let m_hat = (&m_new / bc1)?;
            let v_hat = (&v_new / bc2)?;
            let update = ((m_hat / (v_hat.sqrt()? + self.eps)?)? * self.learning_rate)?;

            // Decoupled decay: w = w - lr * wd * w - update
            let w = var.as_tensor();
            let decay = (w * (self.learning_rate * self.weight_decay))?;
            var.set(&((w - update)? - decay)?)?;

            self.m.insert(name.clone(), m_new);
            self.v.insert(name, v_new);
        }
        Ok(())
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Override the learning rate.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    /// Updates applied so far.
    pub fn steps(&self) -> usize {
        self.t
    }
}

/// Result of one optimizer step.
#[derive(Debug, Clone, Copy)]
pub struct StepOutcome {
    /// Mean loss over the micro-batches
    pub loss: f32,
    /// Global L2 norm of the averaged gradient
    pub gradient_norm: f32,
    /// Optimizer step number (1-based)
    pub step: usize,
}

/// Drives [`LinearAttention::loss_and_grads`] and [`AdamW`] over loader items.
pub struct Trainer {
    model: LinearAttention,
    optimizer: AdamW,
    accumulation_steps: usize,
}

impl Trainer {
    /// Create a trainer with the model's own optimizer settings.
    pub fn new(model: LinearAttention) -> Self {
        let optimizer = AdamW::new(&model.config().optimizer);
        let accumulation_steps = model.config().optimizer.gradient_accumulation_steps;
        tracing::info!(
            "Initialized AdamW optimizer with lr={}, {} trainable params",
            optimizer.learning_rate(),
            model.num_parameters()
        );
        Self {
            model,
            optimizer,
            accumulation_steps,
        }
    }

    /// One optimizer step over a loader item of `batch_size * accumulation_steps` rows.
    ///
    /// The item is split into `accumulation_steps` micro-batches; their losses
    /// and gradients are averaged before the update.
    pub fn step(&mut self, batch: &LmBatch) -> RevlinResult<StepOutcome> {
        let rows = batch.rows();
        if rows % self.accumulation_steps != 0 {
            return Err(RevlinError::shape_mismatch(
                format!("rows divisible by {}", self.accumulation_steps),
                format!("{rows} rows"),
            ));
        }
        let micro = rows / self.accumulation_steps;

        let mut total_loss = 0.0f32;
        let mut grads = Gradients::new();
        for chunk in 0..self.accumulation_steps {
            let (ids, targets) = batch.micro_batch(chunk * micro, micro)?;
            let (loss, chunk_grads) = self.model.loss_and_grads(&ids, &targets)?;
            if !loss.is_finite() {
                return Err(RevlinError::training(format!(
                    "non-finite loss {loss} in micro-batch {chunk} of item {}",
                    batch.index
                )));
            }
            total_loss += loss;
            for (name, g) in &chunk_grads {
                accumulate(&mut grads, name, g)?;
            }
        }

        let scale = 1.0 / self.accumulation_steps as f64;
        for g in grads.values_mut() {
            *g = g.affine(scale, 0.0)?;
        }
        let gradient_norm = gradient_norm(&grads)?;

        self.optimizer.step(&self.model, &grads)?;
        let outcome = StepOutcome {
            loss: total_loss / self.accumulation_steps as f32,
            gradient_norm,
            step: self.optimizer.steps(),
        };
        tracing::debug!(
            "step {}: loss={:.4} grad_norm={:.4}",
            outcome.step,
            outcome.loss,
            outcome.gradient_norm
        );
        Ok(outcome)
    }

    /// The model being trained.
    pub fn model(&self) -> &LinearAttention {
        &self.model
    }

    /// The optimizer.
    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    /// Consume the trainer and return the model.
    pub fn into_model(self) -> LinearAttention {
        self.model
    }
}

/// Global L2 norm over every gradient tensor.
pub fn gradient_norm(grads: &Gradients) -> RevlinResult<f32> {
    let mut sum = 0.0f32;
    for g in grads.values() {
        sum += g.sqr()?.sum_all()?.to_scalar::<f32>()?;
    }
    Ok(sum.sqrt())
}
