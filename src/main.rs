// Embeddings - fine-tune pretrained encoders for text classification
// Main entry point

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing_subscriber::prelude::*;

use embeddings::config::{load_config, DataSettings, MetricSpec, RunConfig};
use embeddings::data::{DataLoader, DataModule, TextClassificationDataModule};
use embeddings::lightning::{HuggingFaceLightningModule, LightningModule, Predictions, Trainer};
use embeddings::metrics::{HuggingFaceMetric, MetricInput, MetricOptions, MetricSource};
use embeddings::models::resolve_model_files;

#[derive(Parser, Debug)]
#[command(name = "embeddings")]
#[command(about = "Fine-tune pretrained encoders for text classification", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Fine-tune, test and score on the configured dataset
    Train {
        /// Run configuration (default: ~/.embeddings/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Predict the test split with a saved checkpoint
    Predict {
        /// Checkpoint directory (contains checkpoint.json)
        #[arg(long)]
        checkpoint: PathBuf,

        /// Run configuration (default: ~/.embeddings/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write predictions here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    match args.command {
        Command::Train { config } => run_train(config.as_deref()),
        Command::Predict {
            checkpoint,
            config,
            output,
        } => run_predict(&checkpoint, config.as_deref(), output.as_deref()),
    }
}

fn init_tracing() {
    // Default: INFO level, can be overridden with RUST_LOG env var
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Bridge log crate → tracing (tokenizers and hf-hub log through it)
    tracing_log::LogTracer::init().ok();
}

fn run_train(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;

    let mut module =
        HuggingFaceLightningModule::from_settings(&config.model, &config.task, None)?;
    let device = module.device();
    if !device.is_cpu() {
        device.set_seed(config.trainer.seed)?;
    }

    let tokenizer = load_tokenizer(&config)?;
    let datamodule = build_datamodule(&config, &config.data, &tokenizer, &module)?;

    let mut trainer = Trainer::new(config.trainer.clone())?;
    trainer.fit(&mut module, &datamodule)?;

    let Some(test_loader) = datamodule.test_dataloader()? else {
        tracing::info!("No test split configured, skipping evaluation");
        return Ok(());
    };

    let test_metrics = trainer.test(&mut module, &datamodule)?;
    let predictions = module.predict(&mut trainer, &test_loader)?;
    let scores = score_predictions(&config.metric, &predictions)?;

    let report = json!({
        "test_metrics": test_metrics,
        "scores": scores,
        "checkpoint": trainer.last_checkpoint(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_predict(checkpoint: &Path, config_path: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;

    let mut module =
        HuggingFaceLightningModule::load_from_checkpoint(checkpoint, None, config.model.device)?;

    // Label indices must match the ones the checkpoint was trained with
    let mut data = config.data.clone();
    if data.target_names.is_none() {
        data.target_names = module.target_names.clone();
    }

    let tokenizer = load_tokenizer(&config)?;
    let datamodule = build_datamodule(&config, &data, &tokenizer, &module)?;
    let loader = prediction_loader(&datamodule)?;

    let mut trainer = Trainer::new(config.trainer.clone())?;
    let predictions = module.predict(&mut trainer, &loader)?;

    let report = json!({
        "y_pred": predictions.y_pred.to_vec(),
        "y_true": predictions.y_true.to_vec(),
        "y_probabilities": predictions
            .y_probabilities
            .outer_iter()
            .map(|row| row.to_vec())
            .collect::<Vec<_>>(),
        "target_names": &module.target_names,
    });
    let rendered = serde_json::to_string_pretty(&report)?;

    match output {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("Failed to write predictions to {}", path.display()))?;
            tracing::info!(path = %path.display(), rows = predictions.y_pred.len(), "Wrote predictions");
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn load_tokenizer(config: &RunConfig) -> Result<Tokenizer> {
    let path = match &config.data.tokenizer_path {
        Some(path) => path.clone(),
        None => resolve_model_files(&config.model.model_name_or_path)?
            .tokenizer
            .ok_or_else(|| {
                anyhow!(
                    "No tokenizer.json found for '{}'; set data.tokenizer_path",
                    config.model.model_name_or_path
                )
            })?,
    };
    Tokenizer::from_file(&path)
        .map_err(|e| anyhow!("Failed to load tokenizer {}: {}", path.display(), e))
}

fn build_datamodule(
    config: &RunConfig,
    data: &DataSettings,
    tokenizer: &Tokenizer,
    module: &HuggingFaceLightningModule,
) -> Result<TextClassificationDataModule> {
    Ok(TextClassificationDataModule::from_jsonl(data, tokenizer)?
        .with_batch_sizes(config.task.train_batch_size, config.task.eval_batch_size)
        .with_shuffle(data.shuffle, config.trainer.seed)
        .with_device(module.device().clone()))
}

fn prediction_loader(datamodule: &TextClassificationDataModule) -> Result<DataLoader> {
    if let Some(loader) = datamodule.test_dataloader()? {
        return Ok(loader);
    }
    datamodule
        .val_dataloader()?
        .context("Prediction needs a test or validation split in [data]")
}

fn score_predictions(
    specs: &[MetricSpec],
    predictions: &Predictions,
) -> Result<BTreeMap<String, f64>> {
    let y_true = MetricInput::Array(predictions.y_true.clone());
    let y_pred = MetricInput::Array(predictions.y_pred.clone());

    let mut scores = BTreeMap::new();
    for spec in specs {
        let metric = HuggingFaceMetric::new(
            MetricSource::Name(spec.name.clone()),
            Some(spec.compute_options.clone()),
            MetricOptions::new(),
        )?;
        for (name, value) in metric.compute(&y_true, &y_pred, &MetricOptions::new())? {
            let key = if name == metric.name() {
                metric.to_string()
            } else {
                format!("{}/{}", metric, name)
            };
            scores.insert(key, value);
        }
    }
    Ok(scores)
}
