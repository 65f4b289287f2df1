//! Token windows and the threaded sequence loader.
//!
//! This module turns one flat token tensor into next-token training items:
//! - [`load_token_file`] - Read the 1-D token tensor from a safetensors file
//! - [`TokenWindows`] - Indexable dataset of overlapping `(input, target)` windows
//! - [`SequenceLoader`] - Ordered, prefetching iterator yielding [`LmBatch`]
//!
//! Item `i` holds `batch_size * accumulation_steps` rows. Row `r` is the window
//! of `sequence_length + 1` tokens starting at `(i * batch_size + r) * sequence_length`;
//! the input drops its last token and the target drops its first.
//!
//! # Example
//!
//! ```no_run
//! use revlin_model_rs::{RevlinConfig, SequenceLoader};
//! use candle_core::Device;
//!
//! let config = RevlinConfig::test().with_dataset_file("data/tokens.safetensors");
//! let loader = SequenceLoader::new(&config, Device::Cpu).unwrap();
//!
//! for batch in loader {
//!     let batch = batch.unwrap();
//!     println!("item {}: {:?}", batch.index, batch.input_ids.dims());
//! }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::RevlinConfig;
use crate::error::{RevlinError, RevlinResult};

/// One training item.
#[derive(Debug, Clone)]
pub struct LmBatch {
    /// Input token ids: (1, rows, sequence_length), U32
    pub input_ids: Tensor,
    /// Next-token targets: (1, rows, sequence_length), U32
    pub target_ids: Tensor,
    /// Dataset index this item was built from
    pub index: usize,
}

impl LmBatch {
    /// Number of windows in the item.
    pub fn rows(&self) -> usize {
        self.input_ids.dims()[1]
    }

    /// Rows `start..start + len` as `(len, sequence_length)` tensors.
    pub fn micro_batch(&self, start: usize, len: usize) -> RevlinResult<(Tensor, Tensor)> {
        Ok((
            self.input_ids.squeeze(0)?.narrow(0, start, len)?,
            self.target_ids.squeeze(0)?.narrow(0, start, len)?,
        ))
    }
}

/// Read a 1-D integer token tensor from a safetensors file.
///
/// `tensor_name` selects the tensor; when `None`, the file must hold exactly one.
pub fn load_token_file(path: impl AsRef<Path>, tensor_name: Option<&str>) -> RevlinResult<Vec<u32>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(RevlinError::data(format!(
            "Token file does not exist: {}",
            path.display()
        )));
    }

    let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let tensor = match tensor_name {
        Some(name) => tensors.remove(name).ok_or_else(|| {
            RevlinError::data(format!("No tensor named {name:?} in {}", path.display()))
        })?,
        None if tensors.len() == 1 => match tensors.into_values().next() {
            Some(t) => t,
            None => return Err(RevlinError::data("Empty token file")),
        },
        None => {
            let mut names: Vec<String> = tensors.into_keys().collect();
            names.sort();
            return Err(RevlinError::data(format!(
                "{} holds {} tensors ({}); set dataset.tensor_name",
                path.display(),
                names.len(),
                names.join(", ")
            )));
        }
    };

    if tensor.rank() != 1 {
        return Err(RevlinError::data(format!(
            "Token tensor must be 1-D, got shape {:?}",
            tensor.dims()
        )));
    }

    match tensor.dtype() {
        DType::U32 => Ok(tensor.to_vec1::<u32>()?),
        DType::U8 => Ok(tensor.to_dtype(DType::U32)?.to_vec1::<u32>()?),
        DType::I64 => tensor
            .to_vec1::<i64>()?
            .into_iter()
            .map(|v| {
                u32::try_from(v)
                    .map_err(|_| RevlinError::data(format!("Token id {v} is not a valid class id")))
            })
            .collect(),
        other => Err(RevlinError::data(format!(
            "Token tensor must be U8, U32 or I64, got {other:?}"
        ))),
    }
}

/// Indexable next-token windows over a shared token sequence.
#[derive(Debug, Clone)]
pub struct TokenWindows {
    tokens: Arc<[u32]>,
    sequence_length: usize,
    batch_size: usize,
    rows: usize,
    len: usize,
}

impl TokenWindows {
    /// Build the window geometry.
    ///
    /// There are `tokens / sequence_length / batch_size - accumulation_steps`
    /// items. Fails when the corpus cannot fill a single item or when the last
    /// item's final window would run past the end of the corpus.
    pub fn new(
        tokens: Arc<[u32]>,
        sequence_length: usize,
        batch_size: usize,
        accumulation_steps: usize,
    ) -> RevlinResult<Self> {
        if sequence_length == 0 || batch_size == 0 || accumulation_steps == 0 {
            return Err(RevlinError::invalid_config(
                "sequence_length, batch_size and accumulation steps must be > 0",
            ));
        }
        let total = tokens.len();
        // One spare item per accumulation step keeps the extra rows inside the corpus
        let len = (total / sequence_length / batch_size).saturating_sub(accumulation_steps);
        if len == 0 {
            return Err(RevlinError::data(format!(
                "{total} tokens are too few for windows of {sequence_length} x {batch_size}"
            )));
        }

        let windows = Self {
            tokens,
            sequence_length,
            batch_size,
            rows: batch_size * accumulation_steps,
            len,
        };
        let end = windows.window_start(len - 1, windows.rows - 1) + sequence_length + 1;
        if end > total {
            return Err(RevlinError::data(format!(
                "Last item needs tokens up to {end} but the corpus holds {total}; \
                 reduce gradient_accumulation_steps or add data"
            )));
        }
        Ok(windows)
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no items.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rows per item (`batch_size * accumulation_steps`).
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Tokens per input row.
    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    /// Total tokens in the corpus.
    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Token offset where row `row` of item `index` begins.
    pub fn window_start(&self, index: usize, row: usize) -> usize {
        (index * self.batch_size + row) * self.sequence_length
    }

    /// Item `index` as flat `(inputs, targets)`, each `rows * sequence_length` long.
    pub fn item_ids(&self, index: usize) -> RevlinResult<(Vec<u32>, Vec<u32>)> {
        if index >= self.len {
            return Err(RevlinError::data(format!(
                "Index {index} out of range for {} items",
                self.len
            )));
        }
        let s = self.sequence_length;
        let mut inputs = Vec::with_capacity(self.rows * s);
        let mut targets = Vec::with_capacity(self.rows * s);
        for row in 0..self.rows {
            let start = self.window_start(index, row);
            let window = &self.tokens[start..start + s + 1];
            inputs.extend_from_slice(&window[..s]);
            targets.extend_from_slice(&window[1..]);
        }
        Ok((inputs, targets))
    }

    /// Item `index` as tensors shaped `(1, rows, sequence_length)`.
    pub fn get(&self, index: usize, device: &Device) -> RevlinResult<LmBatch> {
        let (inputs, targets) = self.item_ids(index)?;
        let shape = (1, self.rows, self.sequence_length);
        Ok(LmBatch {
            input_ids: Tensor::from_vec(inputs, shape, device)?,
            target_ids: Tensor::from_vec(targets, shape, device)?,
            index,
        })
    }
}

/// Prefetching loader over [`TokenWindows`].
///
/// Worker `w` of `W` builds the items at epoch positions `w, w + W, ...` into
/// its own bounded channel, and the consumer drains the channels round-robin,
/// so items arrive in the same order as single-threaded iteration.
pub struct SequenceLoader {
    dataset: Arc<TokenWindows>,
    device: Device,
    shuffle: bool,
    seed: u64,
    epoch: u64,
    num_workers: usize,
    prefetch_factor: usize,
    order: Arc<[usize]>,
    position: usize,
    receivers: Vec<Receiver<RevlinResult<LmBatch>>>,
    workers: Vec<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl SequenceLoader {
    /// Load `config.dataset.file_name` and start the workers.
    pub fn new(config: &RevlinConfig, device: Device) -> RevlinResult<Self> {
        let tokens = load_token_file(
            &config.dataset.file_name,
            config.dataset.tensor_name.as_deref(),
        )?;
        tracing::info!(
            "Loaded {} tokens from {}",
            tokens.len(),
            config.dataset.file_name.display()
        );
        Self::from_tokens(tokens.into(), config, device)
    }

    /// Build a loader over tokens already in memory.
    pub fn from_tokens(
        tokens: Arc<[u32]>,
        config: &RevlinConfig,
        device: Device,
    ) -> RevlinResult<Self> {
        let dataset = TokenWindows::new(
            tokens,
            config.model.sequence_length,
            config.model.batch_size,
            config.optimizer.gradient_accumulation_steps,
        )?;

        let ds = &config.dataset;
        if ds.prefetch_factor == 0 {
            return Err(RevlinError::invalid_config("dataset.prefetch_factor must be > 0"));
        }
        let num_workers = ds.effective_workers();
        if num_workers < ds.num_workers {
            tracing::warn!(
                "prefetch_factor ({}) < num_workers ({}). Some workers would be idle at all times; \
                 running {} workers",
                ds.prefetch_factor,
                ds.num_workers,
                num_workers
            );
        }
        if ds.pin_memory {
            tracing::debug!("pin_memory has no effect on candle devices; ignoring");
        }

        tracing::info!(
            "Sequence loader: {} items of {} x {} tokens, {} workers",
            dataset.len(),
            dataset.rows(),
            dataset.sequence_length(),
            num_workers
        );

        let mut loader = Self {
            order: (0..dataset.len()).collect::<Vec<_>>().into(),
            dataset: Arc::new(dataset),
            device,
            shuffle: ds.shuffle,
            seed: config.seed,
            epoch: 0,
            num_workers,
            prefetch_factor: ds.prefetch_factor,
            position: 0,
            receivers: Vec::new(),
            workers: Vec::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
        };
        loader.start_epoch();
        Ok(loader)
    }

    /// Items per epoch.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    /// Whether an epoch is empty.
    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// The underlying windows.
    pub fn dataset(&self) -> &TokenWindows {
        &self.dataset
    }

    /// Worker threads actually running.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Current epoch (starts at 0).
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Stop the current epoch and start the next one.
    pub fn reset(&mut self) {
        self.stop_workers();
        self.epoch += 1;
        self.start_epoch();
    }

    fn start_epoch(&mut self) {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }
        self.order = order.into();
        self.position = 0;
        self.stop_flag.store(false, Ordering::SeqCst);

        for worker in 0..self.num_workers {
            let (sender, receiver) = sync_channel(self.prefetch_factor);
            let dataset = Arc::clone(&self.dataset);
            let order = Arc::clone(&self.order);
            let stop_flag = Arc::clone(&self.stop_flag);
            let device = self.device.clone();
            let stride = self.num_workers;

            let handle = thread::spawn(move || {
                for &index in order.iter().skip(worker).step_by(stride) {
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    // A closed channel means the loader was dropped
                    if sender.send(dataset.get(index, &device)).is_err() {
                        break;
                    }
                }
            });

            self.receivers.push(receiver);
            self.workers.push(handle);
        }
    }

    fn stop_workers(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        // Dropping the receivers unblocks workers waiting on a full channel
        self.receivers.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    /// Get the next item of the current epoch (blocking).
    fn next_batch(&mut self) -> Option<RevlinResult<LmBatch>> {
        if self.position >= self.order.len() {
            return None;
        }
        let slot = self.position;
        self.position += 1;

        if self.num_workers == 0 {
            return Some(self.dataset.get(self.order[slot], &self.device));
        }
        match self.receivers[slot % self.num_workers].recv() {
            Ok(batch) => Some(batch),
            Err(_) => Some(Err(RevlinError::data(format!(
                "Loader worker {} exited before producing item {}",
                slot % self.num_workers,
                slot
            )))),
        }
    }
}

impl Iterator for SequenceLoader {
    type Item = RevlinResult<LmBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

impl Drop for SequenceLoader {
    fn drop(&mut self) {
        self.stop_workers();
    }
}
