// Checkpoint management
// Each checkpoint is a directory holding model.safetensors and checkpoint.json

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::module::LightningModule;
use crate::config::HyperParameters;
use crate::models::{restore_weights, save_weights};

/// Id of the checkpoint rewritten after every epoch
pub const LAST: &str = "last";

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const METADATA_FILE: &str = "checkpoint.json";

/// Checkpoint metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub epoch: usize,
    pub global_step: usize,
    pub hyper_parameters: HyperParameters,
    /// Entries added by `on_save_checkpoint`
    #[serde(default)]
    pub state: BTreeMap<String, Value>,
}

/// Manages checkpoints under one root directory
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    /// Epoch snapshots kept next to `last`
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(checkpoint_dir: PathBuf, max_checkpoints: usize) -> Result<Self> {
        fs::create_dir_all(&checkpoint_dir).with_context(|| {
            format!("Failed to create checkpoint directory: {:?}", checkpoint_dir)
        })?;

        Ok(Self {
            checkpoint_dir,
            max_checkpoints,
        })
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn path_of(&self, checkpoint_id: &str) -> PathBuf {
        self.checkpoint_dir.join(checkpoint_id)
    }

    /// Write weights and metadata of `module` under `checkpoint_id`
    pub fn save<M: LightningModule + ?Sized>(
        &self,
        module: &M,
        checkpoint_id: &str,
        epoch: usize,
        global_step: usize,
    ) -> Result<Checkpoint> {
        let subdir = self.path_of(checkpoint_id);
        fs::create_dir_all(&subdir)
            .with_context(|| format!("Failed to create checkpoint subdirectory: {:?}", subdir))?;

        save_weights(module.var_map(), &subdir.join(WEIGHTS_FILE))
            .context("Failed to save model weights")?;

        let mut state = BTreeMap::new();
        module.on_save_checkpoint(&mut state)?;

        let checkpoint = Checkpoint {
            id: checkpoint_id.to_string(),
            timestamp: Utc::now(),
            epoch,
            global_step,
            hyper_parameters: module.hparams().clone(),
            state,
        };

        let metadata_path = subdir.join(METADATA_FILE);
        let metadata_json = serde_json::to_string_pretty(&checkpoint)
            .context("Failed to serialize checkpoint metadata")?;
        fs::write(&metadata_path, metadata_json)
            .with_context(|| format!("Failed to write checkpoint metadata: {:?}", metadata_path))?;

        tracing::info!(
            checkpoint_id = %checkpoint_id,
            epoch,
            global_step,
            "Saved checkpoint"
        );

        if checkpoint_id != LAST {
            self.cleanup_old_checkpoints()?;
        }

        Ok(checkpoint)
    }

    /// All readable checkpoints, newest first
    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();

        if !self.checkpoint_dir.exists() {
            return Ok(checkpoints);
        }

        for entry in fs::read_dir(&self.checkpoint_dir).with_context(|| {
            format!("Failed to read checkpoint directory: {:?}", self.checkpoint_dir)
        })? {
            let path = entry?.path();
            if path.join(METADATA_FILE).exists() {
                match load_checkpoint_metadata(&path) {
                    Ok(checkpoint) => checkpoints.push(checkpoint),
                    Err(e) => {
                        tracing::warn!(path = ?path, error = %e, "Failed to load checkpoint metadata");
                    }
                }
            }
        }

        checkpoints.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(b.global_step.cmp(&a.global_step))
        });

        Ok(checkpoints)
    }

    pub fn get_latest_checkpoint(&self) -> Result<Option<Checkpoint>> {
        Ok(self.list_checkpoints()?.into_iter().next())
    }

    /// Restore weights and module state from a stored checkpoint
    pub fn restore<M: LightningModule + ?Sized>(
        &self,
        module: &mut M,
        checkpoint_id: &str,
    ) -> Result<Checkpoint> {
        restore_into(module, &self.path_of(checkpoint_id))
    }

    pub fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        let checkpoint_dir = self.path_of(checkpoint_id);

        if checkpoint_dir.exists() {
            fs::remove_dir_all(&checkpoint_dir).with_context(|| {
                format!("Failed to delete checkpoint directory: {:?}", checkpoint_dir)
            })?;

            tracing::info!(checkpoint_id = %checkpoint_id, "Deleted checkpoint");
        }

        Ok(())
    }

    /// Keep only the newest `max_checkpoints` epoch snapshots; `last` is never removed
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let snapshots: Vec<Checkpoint> = self
            .list_checkpoints()?
            .into_iter()
            .filter(|c| c.id != LAST)
            .collect();

        if snapshots.len() > self.max_checkpoints {
            let to_delete = &snapshots[self.max_checkpoints..];

            for checkpoint in to_delete {
                self.delete_checkpoint(&checkpoint.id)?;
            }

            tracing::info!(
                deleted = to_delete.len(),
                kept = self.max_checkpoints,
                "Cleaned up old checkpoints"
            );
        }

        Ok(())
    }
}

/// Read `checkpoint.json` from a checkpoint directory
pub fn load_checkpoint_metadata(dir: &Path) -> Result<Checkpoint> {
    let path = dir.join(METADATA_FILE);
    let metadata_json = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read checkpoint metadata: {:?}", path))?;

    serde_json::from_str(&metadata_json).context("Failed to parse checkpoint metadata JSON")
}

/// Load weights strictly into `module`, then hand it the saved state map
pub fn restore_into<M: LightningModule + ?Sized>(module: &mut M, dir: &Path) -> Result<Checkpoint> {
    let checkpoint = load_checkpoint_metadata(dir)?;

    let device = module.model().device().clone();
    restore_weights(module.var_map(), &dir.join(WEIGHTS_FILE), &device)
        .context("Failed to load model weights from checkpoint")?;
    module.on_load_checkpoint(&checkpoint.state)?;

    tracing::info!(
        checkpoint_id = %checkpoint.id,
        timestamp = %checkpoint.timestamp,
        epoch = checkpoint.epoch,
        "Restored from checkpoint"
    );

    Ok(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskModelSettings;
    use tempfile::TempDir;

    fn checkpoint(id: &str, global_step: usize) -> Checkpoint {
        Checkpoint {
            id: id.to_string(),
            timestamp: Utc::now(),
            epoch: 0,
            global_step,
            hyper_parameters: HyperParameters {
                model_name_or_path: "bert-tiny".to_string(),
                downstream_model_type: "AutoModelForSequenceClassification".to_string(),
                num_classes: 2,
                finetune_last_n_layers: -1,
                config_kwargs: BTreeMap::new(),
                task: TaskModelSettings::default(),
            },
            state: BTreeMap::from([("target_names".to_string(), serde_json::json!(["a", "b"]))]),
        }
    }

    fn write(dir: &Path, checkpoint: &Checkpoint) {
        let subdir = dir.join(&checkpoint.id);
        fs::create_dir_all(&subdir).unwrap();
        fs::write(
            subdir.join(METADATA_FILE),
            serde_json::to_string(checkpoint).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_checkpoint_manager_creation() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path().join("ckpt"), 5);
        assert!(manager.is_ok());
        assert!(temp_dir.path().join("ckpt").is_dir());
    }

    #[test]
    fn test_metadata_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let original = checkpoint(LAST, 12);
        write(temp_dir.path(), &original);

        let loaded = load_checkpoint_metadata(&temp_dir.path().join(LAST)).unwrap();
        assert_eq!(loaded, original);
        // Task settings are flattened next to the model fields
        let json = serde_json::to_value(&original).unwrap();
        assert_eq!(json["hyper_parameters"]["optimizer"], "AdamW");
    }

    #[test]
    fn test_list_newest_first_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path().to_path_buf(), 5).unwrap();
        write(temp_dir.path(), &checkpoint("epoch=000", 1));
        write(temp_dir.path(), &checkpoint("epoch=001", 2));

        let listed = manager.list_checkpoints().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "epoch=001");

        manager.delete_checkpoint("epoch=001").unwrap();
        assert_eq!(manager.get_latest_checkpoint().unwrap().unwrap().id, "epoch=000");
    }
}
