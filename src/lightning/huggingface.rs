// Hugging Face encoder lightning module
// Pretrained encoder + downstream head, layer freezing and sequence
// classification steps

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::checkpoint::{load_checkpoint_metadata, restore_into};
use super::module::{LightningModule, ModuleState, Split, Stage, StepOutput, TrainerContext};
use crate::config::{HyperParameters, ModelSettings, TaskModelSettings};
use crate::data::Batch;
use crate::errors::ModuleError;
use crate::metrics::MetricCollection;
use crate::models::{
    downstream_model_type, freeze_plan, get_device_with_preference, DevicePreference,
    DownstreamModelType, ModelOutput, PretrainedModel,
};

/// Optimization steps covered by the learning rate schedule
pub fn compute_total_steps(
    dataset_len: usize,
    train_batch_size: usize,
    num_devices: usize,
    accumulate_grad_batches: usize,
    max_epochs: usize,
) -> usize {
    let tb_size = train_batch_size * num_devices.max(1);
    let ab_size = tb_size * accumulate_grad_batches.max(1);
    ((dataset_len as f64 / ab_size as f64) * max_epochs as f64) as usize
}

pub struct HuggingFaceLightningModule {
    state: ModuleState,
    downstream_model_type: Arc<dyn DownstreamModelType>,
    config_kwargs: BTreeMap<String, Value>,
    device: Device,
    model: Box<dyn PretrainedModel>,
    /// Ordered class names, from the data module or a checkpoint
    pub target_names: Option<Vec<String>>,
}

impl HuggingFaceLightningModule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model_name_or_path: &str,
        downstream_model_type: Arc<dyn DownstreamModelType>,
        num_classes: usize,
        finetune_last_n_layers: i64,
        metrics: Option<MetricCollection>,
        config_kwargs: BTreeMap<String, Value>,
        task_model_kwargs: TaskModelSettings,
        device: DevicePreference,
    ) -> Result<Self> {
        let hparams = HyperParameters {
            model_name_or_path: model_name_or_path.to_string(),
            downstream_model_type: downstream_model_type.name().to_string(),
            num_classes,
            finetune_last_n_layers,
            config_kwargs: config_kwargs.clone(),
            task: task_model_kwargs,
        };
        let device = get_device_with_preference(device)?;
        let model = load_model(&hparams, downstream_model_type.as_ref(), &config_kwargs, &device)?;

        let mut module = Self {
            state: ModuleState::new(hparams, metrics),
            downstream_model_type,
            config_kwargs,
            device,
            model,
            target_names: None,
        };
        module.apply_configured_freezing()?;
        Ok(module)
    }

    /// Build from the `[model]` and `[task]` config sections
    pub fn from_settings(
        model: &ModelSettings,
        task: &TaskModelSettings,
        metrics: Option<MetricCollection>,
    ) -> Result<Self> {
        Self::new(
            &model.model_name_or_path,
            downstream_model_type(&model.downstream_model_type)?,
            model.num_classes,
            model.finetune_last_n_layers,
            metrics,
            model.config_kwargs.clone(),
            task.clone(),
            model.device,
        )
    }

    /// Rebuild a module from a checkpoint directory: hyperparameters first,
    /// then weights and saved state
    pub fn load_from_checkpoint(
        dir: &Path,
        model_type: Option<Arc<dyn DownstreamModelType>>,
        device: DevicePreference,
    ) -> Result<Self> {
        let checkpoint = load_checkpoint_metadata(dir)?;
        let hparams = checkpoint.hyper_parameters;
        let model_type = match model_type {
            Some(model_type) => model_type,
            None => downstream_model_type(&hparams.downstream_model_type)?,
        };

        let mut module = Self::new(
            &hparams.model_name_or_path,
            model_type,
            hparams.num_classes,
            hparams.finetune_last_n_layers,
            None,
            hparams.config_kwargs,
            hparams.task,
            device,
        )?;
        restore_into(&mut module, dir)
            .with_context(|| format!("Failed to restore checkpoint {:?}", dir))?;
        Ok(module)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config_kwargs(&self) -> &BTreeMap<String, Value> {
        &self.config_kwargs
    }

    fn apply_configured_freezing(&mut self) -> Result<()> {
        let n = self.state.hparams.finetune_last_n_layers;
        if n > -1 {
            self.freeze_transformer(n as usize)?;
        }
        Ok(())
    }

    /// Freeze encoder parameters so that only the last
    /// `finetune_last_n_layers` layers (and the head) train; 0 freezes the
    /// whole encoder
    pub fn freeze_transformer(&mut self, finetune_last_n_layers: usize) -> Result<()> {
        let names = self.model.base_model_parameter_names()?;
        let total_layers = self.model.config().num_hidden_layers;
        let frozen = freeze_plan(&names, total_layers, finetune_last_n_layers)?;

        let prefix = self.model.base_model_prefix().to_string();
        for name in &frozen {
            self.model
                .set_requires_grad(&format!("{}.{}", prefix, name), false);
        }

        tracing::info!(
            finetune_last_n_layers,
            total_layers,
            frozen = frozen.len(),
            encoder_parameters = names.len(),
            "Froze encoder parameters"
        );
        Ok(())
    }

    fn eval_step(&mut self, batch: &Batch, split: Split) -> Result<Option<Tensor>> {
        let output = self.shared_step(batch)?;
        if let Some(labels) = batch.get("labels") {
            self.state
                .split_metrics_mut(split)?
                .update(&output.predictions, labels)?;
        }
        if let Some(loss) = &output.loss {
            let name = format!("{}loss", split.prefix());
            self.state
                .log(&name, scalar(loss)?, split == Split::Val);
        }
        Ok(output.loss)
    }
}

fn load_model(
    hparams: &HyperParameters,
    downstream_model_type: &dyn DownstreamModelType,
    config_kwargs: &BTreeMap<String, Value>,
    device: &Device,
) -> Result<Box<dyn PretrainedModel>> {
    tracing::info!(
        model = %hparams.model_name_or_path,
        downstream_model_type = %downstream_model_type.name(),
        num_classes = hparams.num_classes,
        "Loading pretrained model"
    );
    downstream_model_type.from_pretrained(
        &hparams.model_name_or_path,
        hparams.num_classes,
        config_kwargs,
        device,
    )
}

fn scalar(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64)
}

impl LightningModule for HuggingFaceLightningModule {
    fn state(&self) -> &ModuleState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModuleState {
        &mut self.state
    }

    fn model(&self) -> &dyn PretrainedModel {
        self.model.as_ref()
    }

    fn init_model(&mut self) -> Result<()> {
        self.model = load_model(
            &self.state.hparams,
            self.downstream_model_type.as_ref(),
            &self.config_kwargs,
            &self.device,
        )?;
        self.apply_configured_freezing()
    }

    fn forward(&self, args: &[Batch], kwargs: Option<&Batch>) -> Result<ModelOutput> {
        let inputs = match (args, kwargs) {
            ([], None) => return Err(ModuleError::InvalidForwardArguments("neither").into()),
            ([_, ..], Some(_)) => return Err(ModuleError::InvalidForwardArguments("both").into()),
            ([], Some(batch)) => batch.clone(),
            (batches, None) => {
                let mut merged = Batch::new();
                for batch in batches {
                    merged.merge(batch);
                }
                merged
            }
        };
        self.model.forward(&inputs, self.state.training)
    }

    fn shared_step(&self, batch: &Batch) -> Result<StepOutput> {
        let output = self.forward(&[], Some(batch))?;
        let predictions = output.logits.argmax(1)?;
        Ok(StepOutput {
            loss: output.loss,
            logits: output.logits,
            predictions,
        })
    }

    fn training_step(&mut self, batch: &Batch, _batch_idx: usize) -> Result<Tensor> {
        let output = self.shared_step(batch)?;
        let labels = batch.require("labels")?;
        let loss = output
            .loss
            .ok_or_else(|| ModuleError::MissingBatchField("labels".to_string()))?;

        self.state
            .split_metrics_mut(Split::Train)?
            .update(&output.predictions, labels)?;
        self.state.log("train/loss", scalar(&loss)?, false);
        Ok(loss)
    }

    fn validation_step(&mut self, batch: &Batch, _batch_idx: usize) -> Result<Option<Tensor>> {
        self.eval_step(batch, Split::Val)
    }

    fn test_step(&mut self, batch: &Batch, _batch_idx: usize) -> Result<Option<Tensor>> {
        self.eval_step(batch, Split::Test)
    }

    fn setup(&mut self, stage: Option<Stage>, ctx: &TrainerContext<'_>) -> Result<()> {
        if matches!(stage, None | Some(Stage::Fit)) {
            self.target_names = Some(ctx.datamodule.target_names().to_vec());

            if self.state.hparams.task.use_scheduler {
                let max_epochs = ctx
                    .max_epochs
                    .filter(|&epochs| epochs > 0)
                    .ok_or(ModuleError::MissingMaxEpochs)?;
                let train_batch_size = self.state.hparams.task.train_batch_size;
                if train_batch_size == 0 {
                    return Err(ModuleError::InvalidBatchSize(train_batch_size).into());
                }
                let train_loader = ctx.datamodule.train_dataloader()?;
                let total_steps = compute_total_steps(
                    train_loader.dataset_len(),
                    train_batch_size,
                    ctx.num_devices,
                    ctx.accumulate_grad_batches,
                    max_epochs,
                );
                tracing::info!(total_steps, max_epochs, "Computed scheduler length");
                self.state.total_steps = Some(total_steps);
            }
            self.init_metrics();
        }
        Ok(())
    }

    fn on_save_checkpoint(&self, state: &mut BTreeMap<String, Value>) -> Result<()> {
        state.insert(
            "target_names".to_string(),
            serde_json::to_value(&self.target_names)?,
        );
        Ok(())
    }

    fn on_load_checkpoint(&mut self, state: &BTreeMap<String, Value>) -> Result<()> {
        let target_names = state
            .get("target_names")
            .ok_or_else(|| ModuleError::MissingCheckpointKey("target_names".to_string()))?;
        self.target_names = serde_json::from_value(target_names.clone())
            .context("Checkpoint 'target_names' is not a list of strings")?;
        Ok(())
    }
}
