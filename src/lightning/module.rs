// Lightning module interface
// Lifecycle hooks, metric bookkeeping, optimizer setup and prediction shared by
// every trainable module.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor};
use candle_nn::VarMap;
use ndarray::{Array1, Array2};
use serde_json::Value;
use std::collections::BTreeMap;

use super::optim::{
    GroupedOptimizer, LinearWarmupSchedule, OptimizerConfig, OptimizerKind, ParamGroup, NO_DECAY,
};
use super::trainer::{CkptPath, Trainer};
use crate::config::HyperParameters;
use crate::data::{Batch, DataLoader, DataModule};
use crate::errors::{ModuleError, TrainerError};
use crate::metrics::{Average, ClassificationMetric, MetricCollection, MetricKind};
use crate::models::{ModelOutput, NamedParameter, PretrainedModel};

/// Trainer stage a hook runs for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fit,
    Validate,
    Test,
    Predict,
}

/// Which metric collection a step or epoch end refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn prefix(&self) -> &'static str {
        match self {
            Split::Train => "train/",
            Split::Val => "val/",
            Split::Test => "test/",
        }
    }
}

/// What the trainer exposes to `setup`
pub struct TrainerContext<'a> {
    pub max_epochs: Option<usize>,
    pub num_devices: usize,
    pub accumulate_grad_batches: usize,
    pub datamodule: &'a dyn DataModule,
}

/// Loss (when labels were given), raw logits and argmax class indices
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: Option<Tensor>,
    pub logits: Tensor,
    pub predictions: Tensor,
}

/// Predictions over a whole loader
#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
    pub y_pred: Array1<i64>,
    pub y_true: Array1<i64>,
    pub y_probabilities: Array2<f32>,
}

/// State every lightning module carries
#[derive(Debug, Clone)]
pub struct ModuleState {
    pub hparams: HyperParameters,
    /// Template collection; defaults are built in `init_metrics` when absent
    pub metrics: Option<MetricCollection>,
    pub train_metrics: Option<MetricCollection>,
    pub val_metrics: Option<MetricCollection>,
    pub test_metrics: Option<MetricCollection>,
    /// Optimization steps the schedule spans, computed in `setup`
    pub total_steps: Option<usize>,
    /// Last value logged under each key
    pub logged_metrics: BTreeMap<String, f64>,
    /// Subset of `logged_metrics` shown in the progress bar
    pub progress_bar_metrics: BTreeMap<String, f64>,
    pub training: bool,
}

impl ModuleState {
    pub fn new(hparams: HyperParameters, metrics: Option<MetricCollection>) -> Self {
        Self {
            hparams,
            metrics,
            train_metrics: None,
            val_metrics: None,
            test_metrics: None,
            total_steps: None,
            logged_metrics: BTreeMap::new(),
            progress_bar_metrics: BTreeMap::new(),
            training: false,
        }
    }

    pub fn log(&mut self, name: &str, value: f64, prog_bar: bool) {
        tracing::debug!(metric = %name, value, "log");
        self.logged_metrics.insert(name.to_string(), value);
        if prog_bar {
            self.progress_bar_metrics.insert(name.to_string(), value);
        }
    }

    pub fn log_dict(&mut self, values: &BTreeMap<String, f64>, prog_bar: bool) {
        for (name, value) in values {
            tracing::info!(metric = %name, value, "Epoch metric");
            self.log(name, *value, prog_bar);
        }
    }

    pub fn split_metrics(&self, split: Split) -> Option<&MetricCollection> {
        match split {
            Split::Train => self.train_metrics.as_ref(),
            Split::Val => self.val_metrics.as_ref(),
            Split::Test => self.test_metrics.as_ref(),
        }
    }

    pub fn split_metrics_mut(&mut self, split: Split) -> Result<&mut MetricCollection, ModuleError> {
        match split {
            Split::Train => self.train_metrics.as_mut(),
            Split::Val => self.val_metrics.as_mut(),
            Split::Test => self.test_metrics.as_mut(),
        }
        .ok_or(ModuleError::MetricsNotInitialized)
    }

    /// Compute, reset and log one split's metrics
    pub fn aggregate_and_log_metrics(
        &mut self,
        split: Split,
        prog_bar: bool,
    ) -> Result<BTreeMap<String, f64>, ModuleError> {
        let metrics = self.split_metrics_mut(split)?;
        let values = metrics.compute();
        metrics.reset();
        self.log_dict(&values, prog_bar);
        Ok(values)
    }
}

/// F1, precision and recall (binary when at most two classes, micro and
/// macro always) plus accuracy
pub fn default_metrics(num_classes: usize) -> MetricCollection {
    let mut metrics = BTreeMap::new();
    for (kind, name) in [
        (MetricKind::F1, "f1"),
        (MetricKind::Precision, "precision"),
        (MetricKind::Recall, "recall"),
    ] {
        if num_classes <= 2 {
            metrics.insert(format!("{}_binary", name), ClassificationMetric::binary(kind));
        }
        for (average, suffix) in [(Average::Micro, "micro"), (Average::Macro, "macro")] {
            metrics.insert(
                format!("{}_{}", name, suffix),
                ClassificationMetric::multiclass(kind, num_classes, average),
            );
        }
    }
    metrics.insert(
        "acc".to_string(),
        ClassificationMetric::multiclass(MetricKind::Accuracy, num_classes, Average::Micro),
    );
    if num_classes <= 2 {
        metrics.insert(
            "acc_binary".to_string(),
            ClassificationMetric::binary(MetricKind::Accuracy),
        );
    }
    MetricCollection::new(metrics)
}

/// A trainable module driven by [`Trainer`]
pub trait LightningModule {
    fn state(&self) -> &ModuleState;

    fn state_mut(&mut self) -> &mut ModuleState;

    fn model(&self) -> &dyn PretrainedModel;

    /// (Re)build the wrapped model from the hyperparameters
    fn init_model(&mut self) -> Result<()>;

    /// Run the model on either positional batches or one keyword batch
    fn forward(&self, args: &[Batch], kwargs: Option<&Batch>) -> Result<ModelOutput>;

    fn shared_step(&self, batch: &Batch) -> Result<StepOutput>;

    /// Loss to optimize for one training batch
    fn training_step(&mut self, batch: &Batch, batch_idx: usize) -> Result<Tensor>;

    fn validation_step(&mut self, batch: &Batch, batch_idx: usize) -> Result<Option<Tensor>>;

    fn test_step(&mut self, batch: &Batch, batch_idx: usize) -> Result<Option<Tensor>>;

    fn setup(&mut self, _stage: Option<Stage>, _ctx: &TrainerContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Add module-specific entries to the checkpoint state map
    fn on_save_checkpoint(&self, _state: &mut BTreeMap<String, Value>) -> Result<()> {
        Ok(())
    }

    fn on_load_checkpoint(&mut self, _state: &BTreeMap<String, Value>) -> Result<()> {
        Ok(())
    }

    fn hparams(&self) -> &HyperParameters {
        &self.state().hparams
    }

    fn named_parameters(&self) -> Result<Vec<NamedParameter>> {
        self.model().named_parameters()
    }

    fn var_map(&self) -> &VarMap {
        self.model().var_map()
    }

    /// Switch between training (dropout on) and evaluation mode
    fn train(&mut self, mode: bool) {
        self.state_mut().training = mode;
    }

    fn predict_step(&self, batch: &Batch, _batch_idx: usize) -> Result<(Tensor, Tensor)> {
        let output = self.shared_step(batch)?;
        Ok((output.logits, output.predictions))
    }

    /// Predict every batch of `loader` with the last checkpoint, falling back
    /// to the current weights when the trainer never fitted.
    fn predict(&mut self, trainer: &mut Trainer, loader: &DataLoader) -> Result<Predictions> {
        let outputs = match trainer.predict(self, loader, CkptPath::Last) {
            Ok(outputs) => outputs,
            Err(TrainerError::NotFitted) => {
                tracing::warn!(
                    "The best model checkpoint cannot be loaded because trainer.fit has not been called. \
                     Using current weights for prediction."
                );
                trainer.predict(self, loader, CkptPath::Current)?
            }
            Err(e) => return Err(e.into()),
        };
        if outputs.is_empty() {
            bail!("Prediction produced no batches");
        }

        let (logits, predictions): (Vec<Tensor>, Vec<Tensor>) = outputs.into_iter().unzip();
        let logits = Tensor::cat(&logits, 0)?.to_dtype(DType::F32)?;
        let probabilities = candle_nn::ops::softmax(&logits, 1)?;
        let (rows, cols) = probabilities.dims2()?;
        let y_probabilities =
            Array2::from_shape_vec((rows, cols), probabilities.flatten_all()?.to_vec1::<f32>()?)?;

        let y_pred = Tensor::cat(&predictions, 0)?
            .to_dtype(DType::I64)?
            .to_vec1::<i64>()?;

        let mut labels = Vec::new();
        for batch in loader.iter() {
            labels.push(batch?.require("labels")?.clone());
        }
        let y_true = Tensor::cat(&labels, 0)?.to_dtype(DType::I64)?.to_vec1::<i64>()?;

        Ok(Predictions {
            y_pred: Array1::from(y_pred),
            y_true: Array1::from(y_true),
            y_probabilities,
        })
    }

    fn on_train_epoch_end(&mut self) -> Result<BTreeMap<String, f64>> {
        Ok(self.state_mut().aggregate_and_log_metrics(Split::Train, false)?)
    }

    fn on_validation_epoch_end(&mut self) -> Result<BTreeMap<String, f64>> {
        Ok(self.state_mut().aggregate_and_log_metrics(Split::Val, true)?)
    }

    fn on_test_epoch_end(&mut self) -> Result<BTreeMap<String, f64>> {
        Ok(self.state_mut().aggregate_and_log_metrics(Split::Test, false)?)
    }

    fn get_default_metrics(&self) -> MetricCollection {
        default_metrics(self.hparams().num_classes)
    }

    /// Fill in default metrics if none were given and derive the per-split copies
    fn init_metrics(&mut self) {
        if self.state().metrics.is_none() {
            let defaults = self.get_default_metrics();
            self.state_mut().metrics = Some(defaults);
        }
        let state = self.state_mut();
        if let Some(metrics) = &state.metrics {
            let train = metrics.clone_with_prefix(Split::Train.prefix());
            let val = metrics.clone_with_prefix(Split::Val.prefix());
            let test = metrics.clone_with_prefix(Split::Test.prefix());
            state.train_metrics = Some(train);
            state.val_metrics = Some(val);
            state.test_metrics = Some(test);
        }
    }

    /// Optimizer over trainable parameters (decay and no-decay groups) and,
    /// with `use_scheduler`, the linear warmup schedule
    fn configure_optimizers(&self) -> Result<OptimizerConfig> {
        let hparams = self.hparams();
        let kind = OptimizerKind::from_name(&hparams.task.optimizer)?;

        let (no_decay, decay): (Vec<NamedParameter>, Vec<NamedParameter>) = self
            .named_parameters()?
            .into_iter()
            .filter(|p| p.requires_grad)
            .partition(|p| NO_DECAY.iter().any(|nd| p.name.contains(nd)));

        let groups = vec![
            ParamGroup {
                vars: decay.into_iter().map(|p| p.var).collect(),
                weight_decay: hparams.task.weight_decay,
            },
            ParamGroup {
                vars: no_decay.into_iter().map(|p| p.var).collect(),
                weight_decay: 0.0,
            },
        ];
        tracing::debug!(
            optimizer = ?kind,
            decay = groups[0].len(),
            no_decay = groups[1].len(),
            "Configured optimizer groups"
        );

        let optimizer = GroupedOptimizer::new(
            kind,
            groups,
            hparams.task.learning_rate,
            hparams.task.adam_epsilon,
        )?;

        let scheduler = if hparams.task.use_scheduler {
            let total_steps = self
                .state()
                .total_steps
                .ok_or(ModuleError::MissingMaxEpochs)?;
            Some(LinearWarmupSchedule::new(
                hparams.task.learning_rate,
                hparams.task.warmup_steps,
                total_steps,
            ))
        } else {
            None
        };

        Ok(OptimizerConfig::new(optimizer, scheduler))
    }
}
