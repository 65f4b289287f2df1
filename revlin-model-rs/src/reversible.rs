//! Reversible composition of linear-attention cells.
//!
//! Each step maps a lane pair `(a, b)` to `(b, a + f(b))`, where `f` is one
//! [`LinearAttentionCell`]. The inverse is `(p, q) -> (q - f(p), p)`, so the
//! backward pass rebuilds every block's input from its output instead of
//! keeping it, and activation memory stays flat in depth.
//!
//! Weight sharing is an index schedule: `device_count` cells own parameters and
//! the schedule repeats that group `weight_shared_blocks` times.

use candle_core::{Result, Tensor, Var};

use crate::cell::LinearAttentionCell;
use crate::config::ModelConfig;
use crate::params::{Gradients, Initializer, ParamStore};
use crate::positional::PositionalScheme;

/// Gradients flowing out of [`ReversibleStack::backward`].
pub struct StackBackward {
    /// Reconstructed stack inputs `(a, b)`
    pub inputs: (Tensor, Tensor),
    /// Loss gradient with respect to the stack inputs
    pub input_grads: (Tensor, Tensor),
}

/// Invertible stack of cells over two equal-shape lanes.
pub struct ReversibleStack {
    cells: Vec<LinearAttentionCell>,
    schedule: Vec<usize>,
}

impl ReversibleStack {
    /// Create `device_count` cells registered as `stem.cells.{i}` and repeat
    /// them `weight_shared_blocks` times.
    pub fn new(config: &ModelConfig, init: &mut Initializer, store: &ParamStore) -> Result<Self> {
        let cells = (0..config.device_count)
            .map(|i| LinearAttentionCell::new(&format!("stem.cells.{i}"), config, init, store))
            .collect::<Result<Vec<_>>>()?;
        let schedule = (0..config.weight_shared_blocks)
            .flat_map(|_| 0..config.device_count)
            .collect();
        Ok(Self { cells, schedule })
    }

    /// Parameter-owning cells.
    pub fn cells(&self) -> &[LinearAttentionCell] {
        &self.cells
    }

    /// Cell index applied at every step.
    pub fn schedule(&self) -> &[usize] {
        &self.schedule
    }

    /// Number of block applications.
    pub fn num_blocks(&self) -> usize {
        self.schedule.len()
    }

    /// Memory-efficient forward. Every intermediate pair is detached, so no
    /// autograd graph survives a step.
    pub fn forward(
        &self,
        a: &Tensor,
        b: &Tensor,
        positions: &PositionalScheme,
    ) -> Result<(Tensor, Tensor)> {
        let mut a = a.detach();
        let mut b = b.detach();
        for &idx in &self.schedule {
            let q = (&a + self.cells[idx].forward(&b, positions)?)?.detach();
            a = b;
            b = q;
        }
        Ok((a, b))
    }

    /// Forward that keeps the whole autograd graph (standard backprop path).
    pub fn forward_tracked(
        &self,
        a: &Tensor,
        b: &Tensor,
        positions: &PositionalScheme,
    ) -> Result<(Tensor, Tensor)> {
        let mut a = a.clone();
        let mut b = b.clone();
        for &idx in &self.schedule {
            let q = (&a + self.cells[idx].forward(&b, positions)?)?;
            a = b;
            b = q;
        }
        Ok((a, b))
    }

    /// Recover the stack inputs from its outputs.
    pub fn inverse(
        &self,
        p: &Tensor,
        q: &Tensor,
        positions: &PositionalScheme,
    ) -> Result<(Tensor, Tensor)> {
        let mut p = p.detach();
        let mut q = q.detach();
        for &idx in self.schedule.iter().rev() {
            let a = (&q - self.cells[idx].forward(&p, positions)?)?.detach();
            q = p;
            p = a;
        }
        Ok((p, q))
    }

    /// Backpropagate `output_grads` through the stack.
    ///
    /// Walks the schedule in reverse, reconstructing each block's input and
    /// recomputing its cell with gradient tracking. Parameter gradients are
    /// added into `param_grads` by name, so repeated cells accumulate into a
    /// single entry.
    pub fn backward(
        &self,
        outputs: (&Tensor, &Tensor),
        output_grads: (&Tensor, &Tensor),
        positions: &PositionalScheme,
        param_grads: &mut Gradients,
    ) -> Result<StackBackward> {
        let mut p = outputs.0.detach();
        let mut q = outputs.1.detach();
        let mut dp = output_grads.0.detach();
        let mut dq = output_grads.1.detach();

        for &idx in self.schedule.iter().rev() {
            let cell = &self.cells[idx];

            let p_var = Var::from_tensor(&p)?;
            let fp = cell.forward(p_var.as_tensor(), positions)?;
            let surrogate = (&fp * &dq)?.sum_all()?;
            let grads = surrogate.backward()?;

            for (name, var) in cell.named_parameters() {
                if let Some(g) = grads.get(var.as_tensor()) {
                    accumulate(param_grads, &name, g)?;
                }
            }

            let grad_p = match grads.get(p_var.as_tensor()) {
                Some(g) => g.detach(),
                None => p.zeros_like()?,
            };

            // (a, b) = (q - f(p), p); da = dq, db = dp + df/dp^T dq
            let a = (&q - fp.detach())?;
            let db = (&dp + grad_p)?;
            q = p;
            p = a;
            dp = dq;
            dq = db;
        }

        Ok(StackBackward {
            inputs: (p, q),
            input_grads: (dp, dq),
        })
    }

    /// Every parameter with its registered name, each shared cell listed once.
    pub fn named_parameters(&self) -> Vec<(String, &Var)> {
        self.cells
            .iter()
            .flat_map(|cell| cell.named_parameters())
            .collect()
    }
}

/// Add `grad` into the entry for `name`.
pub fn accumulate(grads: &mut Gradients, name: &str, grad: &Tensor) -> Result<()> {
    let grad = grad.detach();
    match grads.get_mut(name) {
        Some(existing) => *existing = (&*existing + grad)?,
        None => {
            grads.insert(name.to_string(), grad);
        }
    }
    Ok(())
}
