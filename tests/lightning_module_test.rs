// Integration test: module lifecycle (setup, forward, optimizers, checkpoint hooks)

mod common;

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::collections::BTreeMap;

use embeddings::config::TaskModelSettings;
use embeddings::data::{Batch, DataModule, TextClassificationDataModule};
use embeddings::errors::ModuleError;
use embeddings::lightning::{LightningModule, OptimizerKind, Stage, TrainerContext};

fn context(datamodule: &dyn DataModule, max_epochs: Option<usize>, accumulate: usize) -> TrainerContext<'_> {
    TrainerContext {
        max_epochs,
        num_devices: 1,
        accumulate_grad_batches: accumulate,
        datamodule,
    }
}

fn batch(device: &Device) -> Result<Batch> {
    Ok(Batch::new()
        .with("input_ids", Tensor::new(&[[1u32, 4, 9], [2, 3, 0]], device)?)
        .with("attention_mask", Tensor::new(&[[1u32, 1, 1], [1, 1, 0]], device)?)
        .with("labels", Tensor::new(&[1u32, 0], device)?))
}

#[test]
fn test_setup_computes_total_steps() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let task = TaskModelSettings {
        train_batch_size: 8,
        ..Default::default()
    };
    let mut module = common::module(&dir, 2, -1, task);
    let datamodule = TextClassificationDataModule::from_examples(
        vec!["neg".to_string(), "pos".to_string()],
        common::examples(1000, 2),
        None,
        None,
    );

    module.setup(Some(Stage::Fit), &context(&datamodule, Some(3), 2))?;

    assert_eq!(module.state().total_steps, Some(187));
    assert_eq!(
        module.target_names,
        Some(vec!["neg".to_string(), "pos".to_string()])
    );
    assert!(module.state().train_metrics.is_some());
    assert_eq!(module.state().val_metrics.as_ref().unwrap().prefix(), "val/");
    Ok(())
}

#[test]
fn test_setup_without_max_epochs_fails() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let mut module = common::module(&dir, 2, -1, common::small_task());
    let datamodule = common::datamodule(8, 4, 2);

    let err = module
        .setup(None, &context(&datamodule, None, 1))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ModuleError>(),
        Some(ModuleError::MissingMaxEpochs)
    ));
    Ok(())
}

#[test]
fn test_setup_rejects_zero_batch_size() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let task = TaskModelSettings {
        train_batch_size: 0,
        ..common::small_task()
    };
    let mut module = common::module(&dir, 2, -1, task);
    let datamodule = common::datamodule(8, 4, 2);

    let err = module
        .setup(Some(Stage::Fit), &context(&datamodule, Some(2), 1))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ModuleError>(),
        Some(ModuleError::InvalidBatchSize(0))
    ));
    assert_eq!(module.state().total_steps, None);
    Ok(())
}

#[test]
fn test_setup_without_scheduler_skips_total_steps() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let task = TaskModelSettings {
        use_scheduler: false,
        ..common::small_task()
    };
    let mut module = common::module(&dir, 3, -1, task);
    let datamodule = common::datamodule(8, 4, 3);

    module.setup(Some(Stage::Fit), &context(&datamodule, None, 1))?;
    assert_eq!(module.state().total_steps, None);

    // Three classes: no binary variants
    let metrics = module.state().metrics.as_ref().unwrap();
    assert!(metrics.names().all(|n| !n.ends_with("_binary")));
    Ok(())
}

#[test]
fn test_setup_for_test_stage_is_noop() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let mut module = common::module(&dir, 2, -1, common::small_task());
    let datamodule = common::datamodule(8, 4, 2);

    module.setup(Some(Stage::Test), &context(&datamodule, None, 1))?;
    assert!(module.target_names.is_none());
    assert!(module.state().train_metrics.is_none());
    Ok(())
}

#[test]
fn test_forward_argument_shapes() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let module = common::module(&dir, 2, -1, common::small_task());
    let device = Device::Cpu;
    let full = batch(&device)?;

    let output = module.forward(&[], Some(&full))?;
    assert_eq!(output.logits.dims(), &[2, 2]);
    assert!(output.loss.is_some());

    let both = module.forward(&[full.clone()], Some(&full)).unwrap_err();
    assert!(matches!(
        both.downcast_ref::<ModuleError>(),
        Some(ModuleError::InvalidForwardArguments(_))
    ));
    let neither = module.forward(&[], None).unwrap_err();
    assert!(matches!(
        neither.downcast_ref::<ModuleError>(),
        Some(ModuleError::InvalidForwardArguments(_))
    ));
    Ok(())
}

#[test]
fn test_positional_batches_are_merged() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let module = common::module(&dir, 2, -1, common::small_task());
    let device = Device::Cpu;

    let mut inputs = batch(&device)?;
    let labels = inputs.remove("labels").unwrap();
    let label_part = Batch::new().with("labels", labels);

    let merged = module.forward(&[inputs.clone(), label_part], None)?;
    assert!(merged.loss.is_some());

    let unlabelled = module.forward(&[inputs], None)?;
    assert!(unlabelled.loss.is_none());
    Ok(())
}

#[test]
fn test_shared_step_predictions_are_argmax() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let module = common::module(&dir, 3, -1, common::small_task());

    let output = module.shared_step(&batch(&Device::Cpu)?)?;
    let logits = output.logits.to_vec2::<f32>()?;
    let predictions = output.predictions.to_vec1::<u32>()?;
    for (row, predicted) in logits.iter().zip(predictions) {
        let best = row
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc })
            .0;
        assert_eq!(best as u32, predicted);
    }
    Ok(())
}

#[test]
fn test_configure_optimizers() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let task = TaskModelSettings {
        weight_decay: 0.01,
        use_scheduler: false,
        ..common::small_task()
    };
    let module = common::module(&dir, 2, -1, task);

    let config = module.configure_optimizers()?;
    assert_eq!(config.optimizer.kind(), OptimizerKind::AdamW);
    assert_eq!(config.optimizer.weight_decays(), vec![0.01, 0.0]);
    assert!(config.scheduler.is_none());
    assert!((config.learning_rate() - 1e-3).abs() < 1e-12);
    Ok(())
}

#[test]
fn test_scheduler_requires_total_steps() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let module = common::module(&dir, 2, -1, common::small_task());

    let err = module.configure_optimizers().err().unwrap();
    assert!(matches!(
        err.downcast_ref::<ModuleError>(),
        Some(ModuleError::MissingMaxEpochs)
    ));
    Ok(())
}

#[test]
fn test_optimizer_without_eps_is_rejected() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let task = TaskModelSettings {
        optimizer: "SGD".to_string(),
        use_scheduler: false,
        ..common::small_task()
    };
    let module = common::module(&dir, 2, -1, task);

    let err = module.configure_optimizers().err().unwrap();
    assert!(matches!(
        err.downcast_ref::<ModuleError>(),
        Some(ModuleError::UnsupportedOptimizer { .. })
    ));
    Ok(())
}

#[test]
fn test_checkpoint_hooks() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let mut source = common::module(&dir, 2, -1, common::small_task());
    source.target_names = Some(vec!["b".to_string(), "a".to_string()]);

    let mut state = BTreeMap::new();
    source.on_save_checkpoint(&mut state)?;

    let mut fresh = common::module(&dir, 2, -1, common::small_task());
    fresh.on_load_checkpoint(&state)?;
    assert_eq!(fresh.target_names, Some(vec!["b".to_string(), "a".to_string()]));

    let err = fresh.on_load_checkpoint(&BTreeMap::new()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ModuleError>(),
        Some(ModuleError::MissingCheckpointKey(key)) if key == "target_names"
    ));
    Ok(())
}

#[test]
fn test_hyperparameters_are_recorded() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let module = common::module(&dir, 4, 1, common::small_task());

    let hparams = module.hparams();
    assert_eq!(hparams.num_classes, 4);
    assert_eq!(hparams.finetune_last_n_layers, 1);
    assert_eq!(hparams.downstream_model_type, "AutoModelForSequenceClassification");
    assert_eq!(hparams.task, common::small_task());
    Ok(())
}
