// Model file resolution - local directories or the Hugging Face Hub
// Hub downloads go through hf-hub's cache (~/.cache/huggingface/)

use anyhow::{anyhow, Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::model_not_found_error;

/// Files making up a pretrained encoder
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    /// Architecture description (required)
    pub config: PathBuf,
    /// Pretrained weights; fresh initialization when absent
    pub weights: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
}

/// Locate model files for a local directory or a Hub model id
pub fn resolve_model_files(model_name_or_path: &str) -> Result<ModelFiles> {
    let local = Path::new(model_name_or_path);
    if local.is_dir() {
        return resolve_local(local);
    }
    download_from_hub(model_name_or_path)
}

fn resolve_local(dir: &Path) -> Result<ModelFiles> {
    let config = dir.join("config.json");
    if !config.exists() {
        return Err(anyhow!(model_not_found_error(&dir.display().to_string())));
    }

    let existing = |name: &str| {
        let path = dir.join(name);
        path.exists().then_some(path)
    };

    let files = ModelFiles {
        config,
        weights: existing("model.safetensors"),
        tokenizer: existing("tokenizer.json"),
    };
    tracing::debug!(dir = %dir.display(), has_weights = files.weights.is_some(), "Resolved local model");
    Ok(files)
}

fn download_from_hub(repo_id: &str) -> Result<ModelFiles> {
    let api = Api::new().context("Failed to initialize Hugging Face Hub client")?;
    let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(format!("Fetching {} config.json", repo_id));

    let config = repo.get("config.json").map_err(|e| {
        spinner.finish_and_clear();
        tracing::error!(repo = %repo_id, error = %e, "Failed to download required file config.json");
        anyhow!(model_not_found_error(repo_id))
    })?;

    let optional = |file: &str| -> Option<PathBuf> {
        spinner.set_message(format!("Fetching {} {}", repo_id, file));
        match repo.get(file) {
            Ok(path) => {
                tracing::info!(repo = %repo_id, file = %file, path = ?path, "Downloaded");
                Some(path)
            }
            Err(e) => {
                tracing::warn!(repo = %repo_id, file = %file, error = %e, "Failed to download optional file");
                None
            }
        }
    };

    let weights = optional("model.safetensors");
    let tokenizer = optional("tokenizer.json");
    spinner.finish_and_clear();

    Ok(ModelFiles {
        config,
        weights,
        tokenizer,
    })
}
