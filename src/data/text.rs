// Text classification data module
// Reads JSONL splits, tokenizes them once and serves replayable loaders

use anyhow::{anyhow, bail, Context, Result};
use candle_core::Device;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokenizers::{Tokenizer, TruncationParams};

use super::{DataLoader, DataModule, Example};
use crate::config::DataSettings;

/// Tokenized train/validation/test splits with ordered label names
#[derive(Debug, Clone)]
pub struct TextClassificationDataModule {
    target_names: Vec<String>,
    train: Arc<Vec<Example>>,
    validation: Option<Arc<Vec<Example>>>,
    test: Option<Arc<Vec<Example>>>,
    train_batch_size: usize,
    eval_batch_size: usize,
    shuffle: bool,
    seed: u64,
    device: Device,
}

impl TextClassificationDataModule {
    /// Build from already tokenized examples
    pub fn from_examples(
        target_names: Vec<String>,
        train: Vec<Example>,
        validation: Option<Vec<Example>>,
        test: Option<Vec<Example>>,
    ) -> Self {
        Self {
            target_names,
            train: Arc::new(train),
            validation: validation.map(Arc::new),
            test: test.map(Arc::new),
            train_batch_size: 32,
            eval_batch_size: 32,
            shuffle: false,
            seed: 0,
            device: Device::Cpu,
        }
    }

    /// Read and tokenize the JSONL files named in `settings`
    pub fn from_jsonl(settings: &DataSettings, tokenizer: &Tokenizer) -> Result<Self> {
        let mut tokenizer = tokenizer.clone();
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: settings.max_seq_len,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Failed to configure truncation: {}", e))?;

        let train_rows = read_jsonl(&settings.train_path, settings)?;
        let target_names = match &settings.target_names {
            Some(names) => names.clone(),
            None => train_rows
                .iter()
                .map(|(_, label)| label.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };
        let label_index: HashMap<&str, u32> = target_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i as u32))
            .collect();

        let train = encode_rows(&train_rows, &tokenizer, &label_index)?;
        let validation = match &settings.validation_path {
            Some(path) => Some(encode_rows(
                &read_jsonl(path, settings)?,
                &tokenizer,
                &label_index,
            )?),
            None => None,
        };
        let test = match &settings.test_path {
            Some(path) => Some(encode_rows(
                &read_jsonl(path, settings)?,
                &tokenizer,
                &label_index,
            )?),
            None => None,
        };

        tracing::info!(
            train = train.len(),
            validation = validation.as_ref().map_or(0, Vec::len),
            test = test.as_ref().map_or(0, Vec::len),
            num_labels = target_names.len(),
            "Loaded text classification dataset"
        );

        let module = Self::from_examples(target_names, train, validation, test);
        Ok(module.with_shuffle(settings.shuffle, 0))
    }

    pub fn with_batch_sizes(mut self, train_batch_size: usize, eval_batch_size: usize) -> Self {
        self.train_batch_size = train_batch_size;
        self.eval_batch_size = eval_batch_size;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool, seed: u64) -> Self {
        self.shuffle = shuffle;
        self.seed = seed;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    fn eval_loader(&self, split: &Option<Arc<Vec<Example>>>) -> Option<DataLoader> {
        split.as_ref().map(|examples| {
            DataLoader::new(Arc::clone(examples), self.eval_batch_size, self.device.clone())
        })
    }
}

impl DataModule for TextClassificationDataModule {
    fn target_names(&self) -> &[String] {
        &self.target_names
    }

    fn train_dataloader(&self) -> Result<DataLoader> {
        let loader = DataLoader::new(
            Arc::clone(&self.train),
            self.train_batch_size,
            self.device.clone(),
        );
        Ok(if self.shuffle {
            loader.shuffled(self.seed)
        } else {
            loader
        })
    }

    fn val_dataloader(&self) -> Result<Option<DataLoader>> {
        Ok(self.eval_loader(&self.validation))
    }

    fn test_dataloader(&self) -> Result<Option<DataLoader>> {
        Ok(self.eval_loader(&self.test))
    }
}

/// (text, label) pairs from a JSONL file
fn read_jsonl(path: &Path, settings: &DataSettings) -> Result<Vec<(String, String)>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset {}", path.display()))?;

    let mut rows = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid JSON", path.display(), line_no + 1))?;

        let text = record
            .get(&settings.text_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                anyhow!(
                    "{}:{}: missing text field '{}'",
                    path.display(),
                    line_no + 1,
                    settings.text_field
                )
            })?;
        let label = match record.get(&settings.label_field) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::Bool(b)) => b.to_string(),
            _ => bail!(
                "{}:{}: missing label field '{}'",
                path.display(),
                line_no + 1,
                settings.label_field
            ),
        };
        rows.push((text.to_string(), label));
    }
    Ok(rows)
}

fn encode_rows(
    rows: &[(String, String)],
    tokenizer: &Tokenizer,
    label_index: &HashMap<&str, u32>,
) -> Result<Vec<Example>> {
    rows.iter()
        .map(|(text, label)| {
            let label = *label_index
                .get(label.as_str())
                .ok_or_else(|| anyhow!("Label '{}' is not among the target names", label))?;
            let encoding = tokenizer
                .encode(text.as_str(), true)
                .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
            Ok(Example {
                input_ids: encoding.get_ids().to_vec(),
                token_type_ids: encoding.get_type_ids().to_vec(),
                label,
            })
        })
        .collect()
}
