// Trainer - runs fit/validate/test/predict loops over a lightning module
// Synchronous, single process; gradient accumulation over micro-batches

use anyhow::{Context, Result};
use candle_core::Tensor;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::checkpoint::{restore_into, CheckpointManager, LAST};
use super::module::{LightningModule, Stage, TrainerContext};
use crate::config::TrainerSettings;
use crate::data::{DataLoader, DataModule};
use crate::errors::TrainerError;

/// Epoch count used when the settings leave `max_epochs` unset
const DEFAULT_MAX_EPOCHS: usize = 1000;

/// Weights to use for prediction
#[derive(Debug, Clone, PartialEq)]
pub enum CkptPath {
    /// The `last` checkpoint written by this trainer's `fit`
    Last,
    /// Whatever the module currently holds
    Current,
    /// An explicit checkpoint directory
    Path(PathBuf),
}

pub struct Trainer {
    settings: TrainerSettings,
    checkpoints: CheckpointManager,
    last_checkpoint: Option<PathBuf>,
    global_step: usize,
    current_epoch: usize,
}

impl Trainer {
    pub fn new(settings: TrainerSettings) -> Result<Self> {
        let checkpoints =
            CheckpointManager::new(settings.default_root_dir.clone(), settings.max_checkpoints)?;
        Ok(Self {
            settings,
            checkpoints,
            last_checkpoint: None,
            global_step: 0,
            current_epoch: 0,
        })
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    pub fn max_epochs(&self) -> Option<usize> {
        self.settings.max_epochs
    }

    pub fn num_devices(&self) -> usize {
        self.settings.num_devices
    }

    pub fn accumulate_grad_batches(&self) -> usize {
        self.settings.accumulate_grad_batches.max(1)
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Directory of the `last` checkpoint, once `fit` has written one
    pub fn last_checkpoint(&self) -> Option<&PathBuf> {
        self.last_checkpoint.as_ref()
    }

    fn context<'a>(&self, datamodule: &'a dyn DataModule) -> TrainerContext<'a> {
        TrainerContext {
            max_epochs: self.settings.max_epochs,
            num_devices: self.settings.num_devices,
            accumulate_grad_batches: self.accumulate_grad_batches(),
            datamodule,
        }
    }

    fn progress_bar(&self, len: usize, label: &str) -> ProgressBar {
        if !self.settings.enable_progress_bar {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_prefix(label.to_string());
        bar
    }

    /// Train for `max_epochs`, validating and saving the `last` checkpoint after
    /// every epoch
    pub fn fit<M: LightningModule + ?Sized>(
        &mut self,
        module: &mut M,
        datamodule: &dyn DataModule,
    ) -> Result<()> {
        module.setup(Some(Stage::Fit), &self.context(datamodule))?;
        let mut optimizer = module.configure_optimizers()?;

        let mut train_loader = datamodule.train_dataloader()?;
        let val_loader = datamodule.val_dataloader()?;
        let max_epochs = self.settings.max_epochs.unwrap_or(DEFAULT_MAX_EPOCHS);
        let accumulate = self.accumulate_grad_batches();
        let num_batches = train_loader.len();

        tracing::info!(
            max_epochs,
            batches_per_epoch = num_batches,
            accumulate_grad_batches = accumulate,
            "Starting training"
        );

        for epoch in 0..max_epochs {
            self.current_epoch = epoch;
            train_loader.set_epoch(epoch as u64);
            module.train(true);

            let bar = self.progress_bar(num_batches, &format!("Epoch {}", epoch));
            let mut accumulated: Option<Tensor> = None;
            let mut micro_batches = 0;

            for (batch_idx, batch) in train_loader.iter().enumerate() {
                let batch = batch?;
                let loss = module.training_step(&batch, batch_idx)?;
                let scaled = loss.affine(1.0 / accumulate as f64, 0.0)?;
                accumulated = Some(match accumulated.take() {
                    None => scaled,
                    Some(prev) => (prev + scaled)?,
                });
                micro_batches += 1;

                if micro_batches == accumulate || batch_idx + 1 == num_batches {
                    if let Some(total) = accumulated.take() {
                        let mut grads = total.backward()?;
                        optimizer.step(&mut grads)?;
                    }
                    micro_batches = 0;
                    self.global_step += 1;

                    let log_every = self.settings.log_every_n_steps.max(1);
                    if self.global_step % log_every == 0 {
                        tracing::debug!(
                            step = self.global_step,
                            lr = optimizer.learning_rate(),
                            loss = module.state().logged_metrics.get("train/loss").copied(),
                            "Optimization step"
                        );
                    }
                }

                if let Some(loss) = module.state().logged_metrics.get("train/loss") {
                    bar.set_message(format!("loss={:.4}", loss));
                }
                bar.inc(1);
            }
            bar.finish_and_clear();

            if let Some(val_loader) = &val_loader {
                self.evaluation_loop(module, val_loader, Stage::Validate)?;
            }
            let train_metrics = module.on_train_epoch_end()?;
            tracing::info!(epoch, metrics = ?train_metrics, "Finished epoch");

            self.checkpoints
                .save(&*module, &format!("epoch={:03}", epoch), epoch, self.global_step)?;
            self.checkpoints.save(&*module, LAST, epoch, self.global_step)?;
            self.last_checkpoint = Some(self.checkpoints.path_of(LAST));
        }

        tracing::info!(global_step = self.global_step, "Training finished");
        Ok(())
    }

    /// Run the validation loop once
    pub fn validate<M: LightningModule + ?Sized>(
        &mut self,
        module: &mut M,
        datamodule: &dyn DataModule,
    ) -> Result<BTreeMap<String, f64>> {
        module.setup(Some(Stage::Validate), &self.context(datamodule))?;
        let loader = datamodule
            .val_dataloader()?
            .context("Data module has no validation split")?;
        self.evaluation_loop(module, &loader, Stage::Validate)
    }

    /// Run the test loop once
    pub fn test<M: LightningModule + ?Sized>(
        &mut self,
        module: &mut M,
        datamodule: &dyn DataModule,
    ) -> Result<BTreeMap<String, f64>> {
        module.setup(Some(Stage::Test), &self.context(datamodule))?;
        let loader = datamodule
            .test_dataloader()?
            .context("Data module has no test split")?;
        self.evaluation_loop(module, &loader, Stage::Test)
    }

    fn evaluation_loop<M: LightningModule + ?Sized>(
        &self,
        module: &mut M,
        loader: &DataLoader,
        stage: Stage,
    ) -> Result<BTreeMap<String, f64>> {
        module.train(false);
        let label = if stage == Stage::Test { "Test" } else { "Validation" };
        let bar = self.progress_bar(loader.len(), label);

        for (batch_idx, batch) in loader.iter().enumerate() {
            let batch = batch?;
            if stage == Stage::Test {
                module.test_step(&batch, batch_idx)?;
            } else {
                module.validation_step(&batch, batch_idx)?;
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        let values = if stage == Stage::Test {
            module.on_test_epoch_end()?
        } else {
            module.on_validation_epoch_end()?
        };
        if self.settings.enable_progress_bar {
            let shown = &module.state().progress_bar_metrics;
            if !shown.is_empty() {
                tracing::info!(metrics = ?shown, "{} results", label);
            }
        }
        Ok(values)
    }

    /// Logits and predicted classes for every batch of `loader`
    pub fn predict<M: LightningModule + ?Sized>(
        &mut self,
        module: &mut M,
        loader: &DataLoader,
        ckpt_path: CkptPath,
    ) -> Result<Vec<(Tensor, Tensor)>, TrainerError> {
        match &ckpt_path {
            CkptPath::Last => {
                let dir = self.last_checkpoint.clone().ok_or(TrainerError::NotFitted)?;
                restore_into(module, &dir)?;
            }
            CkptPath::Path(dir) => {
                restore_into(module, dir)?;
            }
            CkptPath::Current => {}
        }

        module.train(false);
        let bar = self.progress_bar(loader.len(), "Predict");
        let mut outputs = Vec::with_capacity(loader.len());
        for (batch_idx, batch) in loader.iter().enumerate() {
            outputs.push(module.predict_step(&batch?, batch_idx)?);
            bar.inc(1);
        }
        bar.finish_and_clear();

        Ok(outputs)
    }
}
