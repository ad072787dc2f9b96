// Model persistence utilities
// Tolerant loading of pretrained weights and strict save/restore of VarMaps

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// What happened to each variable while loading a weights file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Variables overwritten with stored values
    pub loaded: usize,
    /// Variables with no stored tensor (fresh initialization kept)
    pub missing: Vec<String>,
    /// Variables whose stored tensor has another shape (fresh initialization kept)
    pub mismatched: Vec<String>,
    /// Stored tensors no variable asked for
    pub unexpected: usize,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

/// Copy stored tensors into `varmap`, keeping fresh values for anything
/// missing or shaped differently.
///
/// Variable names are looked up as is, then without `base_prefix` (weights
/// saved from a bare encoder), then with legacy `gamma`/`beta` layer norm
/// names.
pub fn load_pretrained_weights(
    varmap: &VarMap,
    weights_path: &Path,
    base_prefix: &str,
    device: &Device,
) -> Result<LoadReport> {
    let tensors = candle_core::safetensors::load(weights_path, device)
        .with_context(|| format!("Failed to read weights from {:?}", weights_path))?;

    let report = copy_into(varmap, &tensors, base_prefix)?;

    if !report.mismatched.is_empty() {
        tracing::warn!(
            count = report.mismatched.len(),
            names = ?report.mismatched,
            "Some weights have mismatched shapes and were newly initialized"
        );
    }
    if !report.missing.is_empty() {
        tracing::warn!(
            count = report.missing.len(),
            names = ?report.missing,
            "Some weights were not found in the checkpoint and were newly initialized"
        );
    }
    tracing::info!(
        path = ?weights_path,
        loaded = report.loaded,
        unexpected = report.unexpected,
        "Loaded pretrained weights"
    );

    Ok(report)
}

/// Save every variable of `varmap` as safetensors
pub fn save_weights(varmap: &VarMap, weights_path: &Path) -> Result<()> {
    varmap
        .save(weights_path)
        .with_context(|| format!("Failed to save model weights to {:?}", weights_path))
}

/// Restore weights saved with [`save_weights`]; every variable must be present
/// with its exact shape.
pub fn restore_weights(varmap: &VarMap, weights_path: &Path, device: &Device) -> Result<()> {
    let tensors = candle_core::safetensors::load(weights_path, device)
        .with_context(|| format!("Failed to read weights from {:?}", weights_path))?;

    let report = copy_into(varmap, &tensors, "")?;
    if !report.is_complete() {
        bail!(
            "Checkpoint {:?} does not match the model: missing {:?}, mismatched {:?}",
            weights_path,
            report.missing,
            report.mismatched
        );
    }
    Ok(())
}

fn copy_into(
    varmap: &VarMap,
    tensors: &HashMap<String, Tensor>,
    base_prefix: &str,
) -> Result<LoadReport> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("VarMap lock poisoned"))?;

    let mut report = LoadReport::default();
    let mut used = HashSet::new();

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    for name in names {
        let var = &data[name];
        let Some((key, stored)) = candidate_names(name, base_prefix)
            .into_iter()
            .find_map(|key| tensors.get(&key).map(|t| (key, t)))
        else {
            report.missing.push(name.clone());
            continue;
        };
        used.insert(key);

        if stored.dims() != var.dims() {
            report.mismatched.push(name.clone());
            continue;
        }
        var.set(&stored.to_dtype(var.dtype())?)?;
        report.loaded += 1;
    }

    report.unexpected = tensors.keys().filter(|k| !used.contains(*k)).count();
    Ok(report)
}

fn candidate_names(name: &str, base_prefix: &str) -> Vec<String> {
    let mut candidates = vec![name.to_string()];
    if !base_prefix.is_empty() {
        if let Some(stripped) = name.strip_prefix(&format!("{}.", base_prefix)) {
            candidates.push(stripped.to_string());
        }
    }

    let legacy: Vec<String> = candidates
        .iter()
        .filter_map(|n| {
            if let Some(stem) = n.strip_suffix("LayerNorm.weight") {
                Some(format!("{}LayerNorm.gamma", stem))
            } else {
                n.strip_suffix("LayerNorm.bias")
                    .map(|stem| format!("{}LayerNorm.beta", stem))
            }
        })
        .collect();
    candidates.extend(legacy);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};
    use tempfile::TempDir;

    fn varmap_with(shapes: &[(&str, usize)]) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for (name, len) in shapes {
            vb.get_with_hints(*len, name, Init::Const(0.0)).unwrap();
        }
        varmap
    }

    fn values(varmap: &VarMap, name: &str) -> Vec<f32> {
        varmap.data().lock().unwrap()[name]
            .as_tensor()
            .to_vec1::<f32>()
            .unwrap()
    }

    #[test]
    fn test_candidate_names() {
        let names = candidate_names("bert.embeddings.LayerNorm.weight", "bert");
        assert_eq!(
            names,
            vec![
                "bert.embeddings.LayerNorm.weight",
                "embeddings.LayerNorm.weight",
                "bert.embeddings.LayerNorm.gamma",
                "embeddings.LayerNorm.gamma",
            ]
        );
    }

    #[test]
    fn test_tolerant_load_reports_missing_and_mismatched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let stored: HashMap<String, Tensor> = [
            ("embeddings.a".to_string(), Tensor::ones(3, DType::F32, &Device::Cpu).unwrap()),
            ("classifier.b".to_string(), Tensor::ones(5, DType::F32, &Device::Cpu).unwrap()),
            ("unused".to_string(), Tensor::ones(1, DType::F32, &Device::Cpu).unwrap()),
        ]
        .into_iter()
        .collect();
        candle_core::safetensors::save(&stored, &path).unwrap();

        let varmap = varmap_with(&[
            ("bert.embeddings.a", 3),
            ("classifier.b", 2),
            ("classifier.c", 2),
        ]);
        let report = load_pretrained_weights(&varmap, &path, "bert", &Device::Cpu).unwrap();

        assert_eq!(report.loaded, 1);
        assert_eq!(report.mismatched, vec!["classifier.b"]);
        assert_eq!(report.missing, vec!["classifier.c"]);
        assert_eq!(report.unexpected, 1);
        assert_eq!(values(&varmap, "bert.embeddings.a"), vec![1.0; 3]);
        assert_eq!(values(&varmap, "classifier.b"), vec![0.0; 2]);
    }

    #[test]
    fn test_save_then_strict_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");

        let source = varmap_with(&[("w", 4)]);
        source.data().lock().unwrap()["w"]
            .set(&Tensor::new(&[1f32, 2., 3., 4.], &Device::Cpu).unwrap())
            .unwrap();
        save_weights(&source, &path).unwrap();

        let target = varmap_with(&[("w", 4)]);
        restore_weights(&target, &path, &Device::Cpu).unwrap();
        assert_eq!(values(&target, "w"), vec![1.0, 2.0, 3.0, 4.0]);

        let wrong = varmap_with(&[("w", 4), ("extra", 1)]);
        assert!(restore_weights(&wrong, &path, &Device::Cpu).is_err());
    }
}
