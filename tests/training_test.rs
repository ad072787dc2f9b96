// Integration test: fit, checkpointing and prediction on a tiny encoder

mod common;

use anyhow::Result;
use std::sync::Arc;
use tempfile::TempDir;

use embeddings::data::DataModule;
use embeddings::errors::{ModuleError, TrainerError};
use embeddings::lightning::{
    load_checkpoint_metadata, CkptPath, HuggingFaceLightningModule, LightningModule, Trainer,
};
use embeddings::models::{AutoModelForSequenceClassification, DevicePreference};

#[test]
fn test_fit_steps_and_checkpoints() -> Result<()> {
    let model_dir = common::tiny_bert_dir();
    let runs = TempDir::new()?;
    let mut module = common::module(&model_dir, 2, -1, common::small_task());
    // 10 examples in batches of 4: three micro-batches, two optimizer steps
    let datamodule = common::datamodule(10, 4, 2);

    let mut settings = common::trainer_settings(runs.path().to_path_buf(), Some(1));
    settings.accumulate_grad_batches = 2;
    let mut trainer = Trainer::new(settings)?;
    trainer.fit(&mut module, &datamodule)?;

    assert_eq!(trainer.global_step(), 2);
    assert_eq!(module.state().total_steps, Some(1));

    let last = trainer.last_checkpoint().unwrap().clone();
    assert!(last.join("model.safetensors").is_file());
    assert!(runs.path().join("epoch=000").join("checkpoint.json").is_file());

    let metadata = load_checkpoint_metadata(&last)?;
    assert_eq!(metadata.global_step, 2);
    assert_eq!(metadata.hyper_parameters.num_classes, 2);
    assert_eq!(
        metadata.state["target_names"],
        serde_json::json!(["label_0", "label_1"])
    );

    // Validation ran and fed the progress bar
    assert!(module.state().progress_bar_metrics.contains_key("val/acc"));
    assert!(module.state().logged_metrics.contains_key("train/f1_binary"));
    Ok(())
}

#[test]
fn test_epoch_snapshots_are_pruned() -> Result<()> {
    let model_dir = common::tiny_bert_dir();
    let runs = TempDir::new()?;
    let task = embeddings::config::TaskModelSettings {
        use_scheduler: false,
        ..common::small_task()
    };
    let mut module = common::module(&model_dir, 2, 0, task);
    let datamodule = common::datamodule(4, 4, 2);

    let mut settings = common::trainer_settings(runs.path().to_path_buf(), Some(3));
    settings.max_checkpoints = 1;
    let mut trainer = Trainer::new(settings)?;
    trainer.fit(&mut module, &datamodule)?;

    assert_eq!(trainer.global_step(), 3);
    assert!(runs.path().join("last").is_dir());
    assert!(runs.path().join("epoch=002").is_dir());
    assert!(!runs.path().join("epoch=000").exists());
    Ok(())
}

#[test]
fn test_test_loop_reports_prefixed_metrics() -> Result<()> {
    let model_dir = common::tiny_bert_dir();
    let runs = TempDir::new()?;
    let mut module = common::module(&model_dir, 3, -1, common::small_task());
    let datamodule = common::datamodule(8, 6, 3);

    let mut trainer = Trainer::new(common::trainer_settings(runs.path().to_path_buf(), Some(1)))?;
    trainer.fit(&mut module, &datamodule)?;
    let results = trainer.test(&mut module, &datamodule)?;

    assert!(results.contains_key("test/acc"));
    assert!(results.contains_key("test/f1_macro"));
    assert!(!results.contains_key("test/f1_binary"));
    let acc = results["test/acc"];
    assert!((0.0..=1.0).contains(&acc));
    Ok(())
}

#[test]
fn test_test_without_setup_needs_metrics() -> Result<()> {
    let model_dir = common::tiny_bert_dir();
    let runs = TempDir::new()?;
    let mut module = common::module(&model_dir, 2, -1, common::small_task());
    let datamodule = common::datamodule(4, 4, 2);

    let mut trainer = Trainer::new(common::trainer_settings(runs.path().to_path_buf(), Some(1)))?;
    let err = trainer.test(&mut module, &datamodule).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ModuleError>(),
        Some(ModuleError::MetricsNotInitialized)
    ));
    Ok(())
}

#[test]
fn test_predict_last_requires_fit() -> Result<()> {
    let model_dir = common::tiny_bert_dir();
    let runs = TempDir::new()?;
    let mut module = common::module(&model_dir, 2, -1, common::small_task());
    let loader = common::datamodule(4, 4, 2).test_dataloader()?.unwrap();

    let mut trainer = Trainer::new(common::trainer_settings(runs.path().to_path_buf(), Some(1)))?;
    let result = trainer.predict(&mut module, &loader, CkptPath::Last);
    assert!(matches!(result, Err(TrainerError::NotFitted)));
    Ok(())
}

#[test]
fn test_predict_before_fit_uses_current_weights() -> Result<()> {
    let model_dir = common::tiny_bert_dir();
    let runs = TempDir::new()?;
    let mut module = common::module(&model_dir, 3, -1, common::small_task());
    let datamodule = common::datamodule(4, 7, 3);
    let loader = datamodule.test_dataloader()?.unwrap();

    let mut trainer = Trainer::new(common::trainer_settings(runs.path().to_path_buf(), Some(1)))?;
    let predictions = module.predict(&mut trainer, &loader)?;

    assert_eq!(predictions.y_probabilities.dim(), (7, 3));
    for row in predictions.y_probabilities.outer_iter() {
        assert!((row.sum() - 1.0).abs() < 1e-5);
    }
    let expected: Vec<i64> = common::examples(7, 3).iter().map(|e| e.label as i64).collect();
    assert_eq!(predictions.y_true.to_vec(), expected);
    assert_eq!(predictions.y_pred.len(), 7);
    assert!(predictions.y_pred.iter().all(|&p| (0..3).contains(&p)));
    Ok(())
}

#[test]
fn test_checkpoint_round_trip() -> Result<()> {
    let model_dir = common::tiny_bert_dir();
    let runs = TempDir::new()?;
    let mut module = common::module(&model_dir, 2, 1, common::small_task());
    let datamodule = common::datamodule(8, 5, 2);
    let loader = datamodule.test_dataloader()?.unwrap();

    let mut trainer = Trainer::new(common::trainer_settings(runs.path().to_path_buf(), Some(1)))?;
    trainer.fit(&mut module, &datamodule)?;
    let original = module.predict(&mut trainer, &loader)?;

    let last = trainer.last_checkpoint().unwrap().clone();
    let mut restored = HuggingFaceLightningModule::load_from_checkpoint(
        &last,
        Some(Arc::new(AutoModelForSequenceClassification)),
        DevicePreference::Cpu,
    )?;
    assert_eq!(
        restored.target_names,
        Some(vec!["label_0".to_string(), "label_1".to_string()])
    );
    assert_eq!(restored.hparams(), module.hparams());

    let mut fresh_trainer =
        Trainer::new(common::trainer_settings(runs.path().join("other"), Some(1)))?;
    let reloaded = restored.predict(&mut fresh_trainer, &loader)?;

    assert_eq!(reloaded.y_pred, original.y_pred);
    for (a, b) in reloaded
        .y_probabilities
        .iter()
        .zip(original.y_probabilities.iter())
    {
        assert!((a - b).abs() < 1e-6);
    }
    Ok(())
}
