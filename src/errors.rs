// Error types for metrics, lightning modules and the trainer
//
// Fatal conditions are typed so callers can tell them apart from the
// recoverable ones (sentinel metric scores, predicting without a checkpoint).

use thiserror::Error;

/// Errors raised by evaluation metrics and the metric adapter
#[derive(Debug, Error)]
pub enum MetricError {
    /// Adapter instantiated on a worker other than the primary process
    #[error(
        "Metric computation should be run on the main process (got process_id={0}). \
         Otherwise it would not return results in dict."
    )]
    InvalidProcessId(u64),

    /// Metric name not known to the registry
    #[error("Unknown metric '{0}'")]
    UnknownMetric(String),

    /// Option value has the wrong type or is out of range at construction time
    #[error("Invalid option '{key}': {reason}")]
    InvalidOption { key: String, reason: String },

    /// Inputs are malformed (shape mismatch, non-binary labels for binary average, ...)
    #[error("Invalid metric input: {0}")]
    Value(String),

    /// Inputs do not expose what the metric needs (e.g. float tensor for labels)
    #[error("Unsupported metric input: {0}")]
    Attribute(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl MetricError {
    /// Errors the adapter converts into a sentinel score
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MetricError::Value(_) | MetricError::Attribute(_))
    }
}

/// Errors raised by lightning modules
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Parameter name does not belong to a known encoder architecture
    #[error("Parameter name not recognized when freezing transformer: '{0}'")]
    UnrecognizedParameter(String),

    #[error("Unable to retrieve max_epochs from trainer.")]
    MissingMaxEpochs,

    #[error("train_batch_size must be positive, got {0}")]
    InvalidBatchSize(usize),

    /// Optimizer unknown or missing a required constructor parameter
    #[error("Optimizer '{name}' is not supported: {reason}")]
    UnsupportedOptimizer { name: String, reason: String },

    #[error("forward expects either positional batches or a keyword batch, not {0}")]
    InvalidForwardArguments(&'static str),

    #[error("Checkpoint is missing key '{0}'")]
    MissingCheckpointKey(String),

    #[error("Batch is missing field '{0}'")]
    MissingBatchField(String),

    #[error("Metrics are not initialized; call setup() first")]
    MetricsNotInitialized,

    #[error("Unknown downstream model type '{0}'")]
    UnknownModelType(String),
}

/// Errors raised by the trainer
#[derive(Debug, Error)]
pub enum TrainerError {
    /// `ckpt_path = last` requested before `fit` produced a checkpoint
    #[error(
        "The last model checkpoint cannot be loaded because Trainer.fit has not been called"
    )]
    NotFitted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<candle_core::Error> for TrainerError {
    fn from(err: candle_core::Error) -> Self {
        TrainerError::Other(err.into())
    }
}

/// Format a model not found error with helpful suggestions
pub fn model_not_found_error(model_name: &str) -> String {
    format!(
        "Model '{}' not found\n\n\
        \x1b[1;33mPossible causes:\x1b[0m\n\
        • Local directory has no config.json\n\
        • Model id misspelled\n\
        • No network access to the Hugging Face Hub\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Check the model directory:\n\
           \x1b[36mls {}\x1b[0m\n\n\
        2. Check the model cache:\n\
           \x1b[36mls ~/.cache/huggingface/hub/\x1b[0m",
        model_name, model_name
    )
}

/// Format a config parse error with helpful suggestions
pub fn config_parse_error(error: &str) -> String {
    format!(
        "Failed to parse config file\n\n\
        \x1b[1;33mError:\x1b[0m {}\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Check config file syntax:\n\
           \x1b[36mcat ~/.embeddings/config.toml\x1b[0m\n\n\
        2. Common mistakes:\n\
           • Missing quotes around strings\n\
           • Missing [model] or [data] section\n\
           • num_classes given as a string",
        error
    )
}
