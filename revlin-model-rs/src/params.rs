//! Named parameter storage and seeded initialization.
//!
//! Parameters live in a [`candle_nn::VarMap`] under dotted names
//! (`stem.cells.0.depth.w1`, `embedding`, ...) so they can be saved as
//! safetensors, looked up by the optimizer, and matched against gradients.
//! Initial values come from a ChaCha stream seeded by the config, so two
//! models built from the same config start bit-identical.

use std::collections::HashMap;

use candle_core::{Device, Result, Tensor, Var};
use candle_nn::VarMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Gradients keyed by parameter name.
pub type Gradients = HashMap<String, Tensor>;

/// Trainable parameters registered by name.
#[derive(Clone)]
pub struct ParamStore {
    var_map: VarMap,
}

impl ParamStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            var_map: VarMap::new(),
        }
    }

    /// Register `value` as a trainable variable under `name`.
    ///
    /// Registering the same name twice is an error: weight sharing is done by
    /// holding the returned [`Var`], never by re-registering.
    pub fn register(&self, name: &str, value: &Tensor) -> Result<Var> {
        let var = Var::from_tensor(value)?;
        let mut data = self
            .var_map
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("parameter store poisoned: {e}")))?;
        if data.contains_key(name) {
            candle_core::bail!("parameter {name} registered twice");
        }
        data.insert(name.to_string(), var.clone());
        Ok(var)
    }

    /// Snapshot of every (name, variable) pair, sorted by name.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("parameter store poisoned: {e}")))?;
        let mut vars: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Look up one variable.
    pub fn get(&self, name: &str) -> Result<Option<Var>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("parameter store poisoned: {e}")))?;
        Ok(data.get(name).cloned())
    }

    /// Number of registered tensors.
    pub fn len(&self) -> usize {
        self.var_map.all_vars().len()
    }

    /// Whether nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total scalar parameter count.
    pub fn num_elements(&self) -> usize {
        self.var_map.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Underlying VarMap (for safetensors IO).
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Mutable VarMap (for loading in place).
    pub fn var_map_mut(&mut self) -> &mut VarMap {
        &mut self.var_map
    }
}

impl Default for ParamStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Seeded source of initial parameter values.
pub struct Initializer {
    rng: ChaCha8Rng,
    device: Device,
}

impl Initializer {
    /// Create an initializer for `device` seeded with `seed`.
    pub fn new(seed: u64, device: &Device) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            device: device.clone(),
        }
    }

    fn standard_normal(&mut self, n: usize) -> Vec<f64> {
        (0..n)
            .map(|_| StandardNormal.sample(&mut self.rng))
            .collect()
    }

    /// Normal(0, std) tensor.
    pub fn normal(&mut self, shape: (usize, usize), std: f64) -> Result<Tensor> {
        let data: Vec<f32> = self
            .standard_normal(shape.0 * shape.1)
            .into_iter()
            .map(|v| (v * std) as f32)
            .collect();
        Tensor::from_vec(data, shape, &self.device)
    }

    /// Uniform(-bound, bound) tensor of any shape.
    pub fn uniform(&mut self, dims: &[usize], bound: f64) -> Result<Tensor> {
        let n: usize = dims.iter().product();
        let data: Vec<f32> = (0..n)
            .map(|_| self.rng.gen_range(-bound..=bound) as f32)
            .collect();
        Tensor::from_vec(data, dims, &self.device)
    }

    /// Orthogonal initialization of a convolution kernel
    /// `(out_channels, in_channels, kernel_size)`, scaled by `gain`.
    ///
    /// The kernel is viewed as an `out × (in·k)` matrix whose rows (or columns,
    /// whichever set is smaller) are orthonormal before scaling.
    pub fn orthogonal(&mut self, shape: (usize, usize, usize), gain: f64) -> Result<Tensor> {
        let rows = shape.0;
        let cols = shape.1 * shape.2;
        let tall = rows.max(cols);
        let wide = rows.min(cols);

        // Column-major tall × wide matrix of standard normals.
        let mut q = self.standard_normal(tall * wide);
        gram_schmidt(&mut q, tall, wide);

        let mut data = vec![0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                // q[col * tall + row]; transpose when the kernel is wide.
                let v = if rows >= cols {
                    q[c * tall + r]
                } else {
                    q[r * tall + c]
                };
                data[r * cols + c] = (v * gain) as f32;
            }
        }
        Tensor::from_vec(data, shape, &self.device)
    }
}

/// Modified Gram-Schmidt over the `cols` columns of a column-major
/// `rows × cols` matrix (`rows >= cols`). Leaves orthonormal columns whose
/// QR `R` factor has a positive diagonal.
fn gram_schmidt(m: &mut [f64], rows: usize, cols: usize) {
    for j in 0..cols {
        for k in 0..j {
            let dot: f64 = (0..rows).map(|i| m[k * rows + i] * m[j * rows + i]).sum();
            for i in 0..rows {
                m[j * rows + i] -= dot * m[k * rows + i];
            }
        }
        let norm = (0..rows)
            .map(|i| m[j * rows + i] * m[j * rows + i])
            .sum::<f64>()
            .sqrt()
            .max(1e-12);
        for i in 0..rows {
            m[j * rows + i] /= norm;
        }
    }
}
