// Shared fixtures: a tiny randomly initialized BERT and synthetic datasets

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use embeddings::config::{TaskModelSettings, TrainerSettings};
use embeddings::data::{Example, TextClassificationDataModule};
use embeddings::lightning::HuggingFaceLightningModule;
use embeddings::models::{AutoModelForSequenceClassification, DevicePreference};
use tempfile::TempDir;

pub const NUM_LAYERS: usize = 2;

/// Model directory holding only config.json (weights are freshly initialized)
pub fn tiny_bert_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    let config = serde_json::json!({
        "model_type": "bert",
        "vocab_size": 32,
        "hidden_size": 8,
        "num_hidden_layers": NUM_LAYERS,
        "num_attention_heads": 2,
        "intermediate_size": 16,
        "hidden_act": "gelu",
        "hidden_dropout_prob": 0.1,
        "max_position_embeddings": 16,
        "type_vocab_size": 2,
        "initializer_range": 0.02,
        "layer_norm_eps": 1e-12,
        "pad_token_id": 0,
        "position_embedding_type": "absolute",
        "use_cache": false,
        "classifier_dropout": null
    });
    fs::write(
        dir.path().join("config.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();
    dir
}

pub fn module(
    model_dir: &TempDir,
    num_classes: usize,
    finetune_last_n_layers: i64,
    task: TaskModelSettings,
) -> HuggingFaceLightningModule {
    HuggingFaceLightningModule::new(
        model_dir.path().to_str().unwrap(),
        Arc::new(AutoModelForSequenceClassification),
        num_classes,
        finetune_last_n_layers,
        None,
        BTreeMap::new(),
        task,
        DevicePreference::Cpu,
    )
    .unwrap()
}

pub fn small_task() -> TaskModelSettings {
    TaskModelSettings {
        train_batch_size: 4,
        eval_batch_size: 4,
        warmup_steps: 1,
        learning_rate: 1e-3,
        ..Default::default()
    }
}

/// `n` short sequences labelled `i % num_classes`
pub fn examples(n: usize, num_classes: u32) -> Vec<Example> {
    (0..n)
        .map(|i| {
            let len = 2 + i % 5;
            let ids = (0..len).map(|j| ((i + j) % 30 + 1) as u32).collect();
            Example::new(ids, i as u32 % num_classes)
        })
        .collect()
}

pub fn datamodule(train: usize, eval: usize, num_classes: u32) -> TextClassificationDataModule {
    let target_names = (0..num_classes).map(|c| format!("label_{}", c)).collect();
    TextClassificationDataModule::from_examples(
        target_names,
        examples(train, num_classes),
        Some(examples(eval, num_classes)),
        Some(examples(eval, num_classes)),
    )
    .with_batch_sizes(4, 4)
}

pub fn trainer_settings(root: PathBuf, max_epochs: Option<usize>) -> TrainerSettings {
    TrainerSettings {
        max_epochs,
        default_root_dir: root,
        enable_progress_bar: false,
        ..Default::default()
    }
}
