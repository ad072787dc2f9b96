// Configuration structs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::models::DevicePreference;

/// Full run configuration (one TOML file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelSettings,

    #[serde(default)]
    pub task: TaskModelSettings,

    #[serde(default)]
    pub trainer: TrainerSettings,

    pub data: DataSettings,

    /// Metrics used to score final predictions
    #[serde(default = "default_metric_specs")]
    pub metric: Vec<MetricSpec>,
}

/// Pretrained encoder selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Local directory or Hugging Face Hub model id
    pub model_name_or_path: String,

    /// Downstream head built on top of the encoder
    #[serde(default = "default_downstream_model_type")]
    pub downstream_model_type: String,

    pub num_classes: usize,

    /// Number of top encoder layers left trainable (-1 disables freezing)
    #[serde(default = "default_finetune_last_n_layers")]
    pub finetune_last_n_layers: i64,

    /// Overrides applied on top of config.json
    #[serde(default)]
    pub config_kwargs: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub device: DevicePreference,
}

/// Optimization knobs shared by every lightning module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskModelSettings {
    pub optimizer: String,
    pub learning_rate: f64,
    pub adam_epsilon: f64,
    pub warmup_steps: usize,
    pub weight_decay: f64,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub use_scheduler: bool,
}

impl Default for TaskModelSettings {
    fn default() -> Self {
        Self {
            optimizer: "AdamW".to_string(),
            learning_rate: 1e-4,
            adam_epsilon: 1e-8,
            warmup_steps: 100,
            weight_decay: 0.0,
            train_batch_size: 32,
            eval_batch_size: 32,
            use_scheduler: true,
        }
    }
}

/// Hyperparameters captured when a module is constructed.
///
/// Persisted with every checkpoint. The downstream model type is stored by
/// name; the type itself is held by the module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParameters {
    pub model_name_or_path: String,
    pub downstream_model_type: String,
    pub num_classes: usize,
    pub finetune_last_n_layers: i64,
    #[serde(default)]
    pub config_kwargs: BTreeMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub task: TaskModelSettings,
}

/// Training engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    pub max_epochs: Option<usize>,
    pub num_devices: usize,
    pub accumulate_grad_batches: usize,
    /// Directory holding checkpoints
    pub default_root_dir: PathBuf,
    /// Epoch snapshots kept next to `last`
    pub max_checkpoints: usize,
    pub enable_progress_bar: bool,
    pub log_every_n_steps: usize,
    pub seed: u64,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            max_epochs: Some(20),
            num_devices: 1,
            accumulate_grad_batches: 1,
            default_root_dir: PathBuf::from("checkpoints"),
            max_checkpoints: 3,
            enable_progress_bar: true,
            log_every_n_steps: 50,
            seed: 441,
        }
    }
}

/// Text classification dataset files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    pub train_path: PathBuf,
    #[serde(default)]
    pub validation_path: Option<PathBuf>,
    #[serde(default)]
    pub test_path: Option<PathBuf>,
    #[serde(default = "default_text_field")]
    pub text_field: String,
    #[serde(default = "default_label_field")]
    pub label_field: String,
    /// Explicit label order; sorted training labels when absent
    #[serde(default)]
    pub target_names: Option<Vec<String>>,
    /// Defaults to tokenizer.json next to the model weights
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

/// Metric used to score predictions through the adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    #[serde(default)]
    pub compute_options: BTreeMap<String, serde_json::Value>,
}

fn default_metric_specs() -> Vec<MetricSpec> {
    let mut compute_options = BTreeMap::new();
    compute_options.insert("average".to_string(), serde_json::json!("macro"));
    vec![MetricSpec {
        name: "f1".to_string(),
        compute_options,
    }]
}

fn default_downstream_model_type() -> String {
    "AutoModelForSequenceClassification".to_string()
}

fn default_finetune_last_n_layers() -> i64 {
    -1
}

fn default_text_field() -> String {
    "text".to_string()
}

fn default_label_field() -> String {
    "label".to_string()
}

fn default_max_seq_len() -> usize {
    128
}

fn default_shuffle() -> bool {
    true
}
