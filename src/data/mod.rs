// Data module - batches, replayable loaders and the data provider interface

mod text;

pub use text::TextClassificationDataModule;

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::ModuleError;

/// One tokenized, labelled example
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub input_ids: Vec<u32>,
    pub token_type_ids: Vec<u32>,
    pub label: u32,
}

impl Example {
    pub fn new(input_ids: Vec<u32>, label: u32) -> Self {
        let token_type_ids = vec![0; input_ids.len()];
        Self {
            input_ids,
            token_type_ids,
            label,
        }
    }
}

/// Named tensors of one batch (`input_ids`, `attention_mask`, `token_type_ids`, `labels`)
#[derive(Debug, Clone, Default)]
pub struct Batch {
    fields: BTreeMap<String, Tensor>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn insert(&mut self, name: &str, tensor: Tensor) {
        self.fields.insert(name.to_string(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Tensor, ModuleError> {
        self.get(name)
            .ok_or_else(|| ModuleError::MissingBatchField(name.to_string()))
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.fields.remove(name)
    }

    /// Copy every field of `other` into this batch, replacing existing keys
    pub fn merge(&mut self, other: &Batch) {
        for (name, tensor) in &other.fields {
            self.fields.insert(name.clone(), tensor.clone());
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Pad examples to the longest sequence and stack them
    pub fn collate(examples: &[&Example], device: &Device) -> Result<Self> {
        let batch_size = examples.len();
        let max_len = examples
            .iter()
            .map(|e| e.input_ids.len())
            .max()
            .unwrap_or(0)
            .max(1);

        let mut input_ids = Vec::with_capacity(batch_size * max_len);
        let mut attention_mask = Vec::with_capacity(batch_size * max_len);
        let mut token_type_ids = Vec::with_capacity(batch_size * max_len);
        let mut labels = Vec::with_capacity(batch_size);

        for example in examples {
            let pad = max_len - example.input_ids.len();
            input_ids.extend_from_slice(&example.input_ids);
            input_ids.extend(std::iter::repeat(0).take(pad));
            attention_mask.extend(std::iter::repeat(1u32).take(example.input_ids.len()));
            attention_mask.extend(std::iter::repeat(0).take(pad));
            token_type_ids.extend_from_slice(&example.token_type_ids);
            token_type_ids.extend(
                std::iter::repeat(0).take(max_len - example.token_type_ids.len()),
            );
            labels.push(example.label);
        }

        Ok(Batch::new()
            .with(
                "input_ids",
                Tensor::from_vec(input_ids, (batch_size, max_len), device)?,
            )
            .with(
                "attention_mask",
                Tensor::from_vec(attention_mask, (batch_size, max_len), device)?,
            )
            .with(
                "token_type_ids",
                Tensor::from_vec(token_type_ids, (batch_size, max_len), device)?,
            )
            .with("labels", Tensor::from_vec(labels, batch_size, device)?))
    }
}

/// Replayable batch iterator over a shared dataset.
///
/// Without `shuffle` every pass yields batches in dataset order. With
/// `shuffle` the order is fixed per (seed, epoch).
#[derive(Debug, Clone)]
pub struct DataLoader {
    examples: Arc<Vec<Example>>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
    device: Device,
}

impl DataLoader {
    pub fn new(examples: Arc<Vec<Example>>, batch_size: usize, device: Device) -> Self {
        Self {
            examples,
            batch_size: batch_size.max(1),
            shuffle: false,
            seed: 0,
            epoch: 0,
            device,
        }
    }

    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Number of examples in the underlying dataset
    pub fn dataset_len(&self) -> usize {
        self.examples.len()
    }

    /// Number of batches per pass
    pub fn len(&self) -> usize {
        self.examples.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Batch>> + '_ {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }

        let chunks: Vec<Vec<usize>> = order
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        chunks.into_iter().map(move |chunk| {
            let examples: Vec<&Example> = chunk.iter().map(|&i| &self.examples[i]).collect();
            Batch::collate(&examples, &self.device)
        })
    }
}

/// Data provider consumed by lightning modules and the trainer
pub trait DataModule {
    /// Ordered class label names
    fn target_names(&self) -> &[String];

    fn train_dataloader(&self) -> Result<DataLoader>;

    fn val_dataloader(&self) -> Result<Option<DataLoader>>;

    fn test_dataloader(&self) -> Result<Option<DataLoader>>;
}
