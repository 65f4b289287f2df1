//! Integration tests for revlin-model-rs.
//!
//! These tests run the complete pipeline: token file on disk, sequence
//! loader, reversible model forward/backward and optimizer steps.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use revlin_model_rs::{
    LinearAttention, RevlinConfig, RevlinError, SequenceLoader, Trainer,
};

/// Write `n` pseudo-random tokens below 100 to a safetensors file.
fn write_tokens(path: &Path, n: usize) {
    let mut state = 12345u64;
    let tokens: Vec<u32> = (0..n)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) % 100) as u32
        })
        .collect();
    let mut map = HashMap::new();
    map.insert(
        "tokens".to_string(),
        Tensor::from_vec(tokens, n, &Device::Cpu).unwrap(),
    );
    candle_core::safetensors::save(&map, path).unwrap();
}

fn end_to_end_config(path: &Path) -> RevlinConfig {
    // vocab 100, features 8, sequence 16, batch 2, two blocks
    let config = RevlinConfig::test().with_dataset_file(path);
    assert_eq!(config.num_classes(), 100);
    assert_eq!(config.model.features, 8);
    assert_eq!(config.model.sequence_length, 16);
    assert_eq!(config.model.batch_size, 2);
    assert_eq!(config.model.num_blocks(), 2);
    config
}

#[test]
fn test_end_to_end_forward() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.safetensors");
    write_tokens(&path, 10_000);
    let config = end_to_end_config(&path);
    let device = Device::Cpu;

    let mut loader = SequenceLoader::new(&config, device.clone()).unwrap();
    assert_eq!(loader.len(), 311);

    let batch = loader.next().unwrap().unwrap();
    assert_eq!(batch.input_ids.dims(), &[1, 2, 16]);
    assert_eq!(batch.target_ids.dims(), &[1, 2, 16]);

    let model = LinearAttention::new(&config, &device).unwrap();
    let loss = model
        .forward(&batch.input_ids, &batch.target_ids)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(loss.is_finite(), "loss = {loss}");
    assert!(loss >= 0.0, "loss = {loss}");
}

#[test]
fn test_threaded_loader_feeds_training() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.safetensors");
    write_tokens(&path, 10_000);
    let mut config = end_to_end_config(&path);
    config.dataset.num_workers = 3;
    config.dataset.prefetch_factor = 2;
    config.dataset.shuffle = true;

    let device = Device::Cpu;
    let loader = SequenceLoader::new(&config, device.clone()).unwrap();
    assert_eq!(loader.num_workers(), 2);

    let mut trainer = Trainer::new(LinearAttention::new(&config, &device).unwrap());
    for batch in loader.take(5) {
        let outcome = trainer.step(&batch.unwrap()).unwrap();
        assert!(outcome.loss.is_finite());
        assert!(outcome.gradient_norm.is_finite());
    }
    assert_eq!(trainer.optimizer().steps(), 5);
}

#[test]
fn test_weight_shared_training_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let tokens = dir.path().join("tokens.safetensors");
    let weights = dir.path().join("model.safetensors");
    write_tokens(&tokens, 10_000);
    let config = end_to_end_config(&tokens).with_weight_shared_blocks(3);

    let device = Device::Cpu;
    let mut loader = SequenceLoader::new(&config, device.clone()).unwrap();
    let mut trainer = Trainer::new(LinearAttention::new(&config, &device).unwrap());
    let batch = loader.next().unwrap().unwrap();
    trainer.step(&batch).unwrap();

    let model = trainer.into_model();
    assert_eq!(model.stem().num_blocks(), 6);
    model.save(&weights).unwrap();

    let restored = LinearAttention::load(&config, &weights, &device).unwrap();
    let a = model.logits(&batch.input_ids).unwrap();
    let b = restored.logits(&batch.input_ids).unwrap();
    let diff = (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert_eq!(diff, 0.0);
}

#[test]
fn test_config_file_drives_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let tokens = dir.path().join("tokens.safetensors");
    let config_path = dir.path().join("config.json");
    write_tokens(&tokens, 10_000);

    let mut config = end_to_end_config(&tokens);
    config.dataset.tensor_name = Some("tokens".to_string());
    config.to_json_file(&config_path).unwrap();

    let loaded = RevlinConfig::from_json_file(&config_path).unwrap();
    let loader = SequenceLoader::new(&loaded, Device::Cpu).unwrap();
    assert_eq!(loader.len(), 311);
}

#[test]
fn test_missing_token_file_is_a_data_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = RevlinConfig::test().with_dataset_file(dir.path().join("absent.safetensors"));
    assert!(matches!(
        SequenceLoader::new(&config, Device::Cpu),
        Err(RevlinError::Data(_))
    ));
}
