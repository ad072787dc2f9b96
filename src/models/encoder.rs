// Pretrained encoders with downstream heads
// BERT backbone from candle-transformers, classification head built here

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::download::resolve_model_files;
use super::freeze::{natural_cmp, NamedParameter};
use super::persistence::load_pretrained_weights;
use crate::data::Batch;
use crate::errors::ModuleError;

/// Encoder architecture read from `config.json`, with `num_labels` and user
/// overrides applied
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    raw: Value,
    pub model_type: Option<String>,
    pub num_hidden_layers: usize,
    pub hidden_size: usize,
    pub num_labels: usize,
}

impl EncoderConfig {
    pub fn from_file(
        path: &Path,
        num_labels: usize,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config {:?}", path))?;
        let raw: Value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse model config {:?}", path))?;
        Self::from_value(raw, num_labels, overrides)
    }

    pub fn from_value(
        mut raw: Value,
        num_labels: usize,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<Self> {
        let object = raw
            .as_object_mut()
            .ok_or_else(|| anyhow!("Model config must be a JSON object"))?;
        object.insert("num_labels".to_string(), Value::from(num_labels));
        for (key, value) in overrides {
            object.insert(key.clone(), value.clone());
        }

        let usize_field = |key: &str| -> Result<usize> {
            object
                .get(key)
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .ok_or_else(|| anyhow!("Model config has no integer field '{}'", key))
        };

        let num_hidden_layers = usize_field("num_hidden_layers")?;
        let hidden_size = usize_field("hidden_size")?;
        let num_labels = usize_field("num_labels")?;
        let model_type = object
            .get("model_type")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            raw,
            model_type,
            num_hidden_layers,
            hidden_size,
            num_labels,
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn bert_config(&self) -> Result<BertConfig> {
        serde_json::from_value(self.raw.clone()).context("Model config is not a valid BERT config")
    }

    /// Dropout before the classification head
    pub fn classifier_dropout(&self) -> f32 {
        ["classifier_dropout", "hidden_dropout_prob"]
            .iter()
            .find_map(|key| self.raw.get(*key).and_then(Value::as_f64))
            .unwrap_or(0.1) as f32
    }
}

/// Logits plus the loss when the inputs carried `labels`
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub loss: Option<Tensor>,
    pub logits: Tensor,
}

/// An encoder with a task head, owning its variables
pub trait PretrainedModel {
    fn config(&self) -> &EncoderConfig;

    fn var_map(&self) -> &VarMap;

    fn device(&self) -> &Device;

    /// Prefix of the encoder's parameters inside the var map (`bert`)
    fn base_model_prefix(&self) -> &str;

    fn forward(&self, inputs: &Batch, train: bool) -> Result<ModelOutput>;

    /// Names of parameters excluded from optimization
    fn frozen_parameters(&self) -> &BTreeSet<String>;

    fn set_requires_grad(&mut self, name: &str, requires_grad: bool);

    /// Every variable, sorted in natural name order (numeric segments compare
    /// as numbers, so `layer.2` precedes `layer.10`)
    fn named_parameters(&self) -> Result<Vec<NamedParameter>> {
        let data = self
            .var_map()
            .data()
            .lock()
            .map_err(|_| anyhow!("VarMap lock poisoned"))?;
        let frozen = self.frozen_parameters();

        let mut parameters: Vec<NamedParameter> = data
            .iter()
            .map(|(name, var)| NamedParameter {
                name: name.clone(),
                var: var.clone(),
                requires_grad: !frozen.contains(name),
            })
            .collect();
        parameters.sort_by(|a, b| natural_cmp(&a.name, &b.name));
        Ok(parameters)
    }

    /// Encoder parameter names without the base model prefix, in natural name order
    fn base_model_parameter_names(&self) -> Result<Vec<String>> {
        let prefix = format!("{}.", self.base_model_prefix());
        Ok(self
            .named_parameters()?
            .into_iter()
            .filter_map(|p| p.name.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}

/// Factory for a model with a given head (the `AutoModelFor...` role)
pub trait DownstreamModelType: Send + Sync {
    fn name(&self) -> &str;

    /// Freshly initialized model for `config`
    fn build(&self, config: EncoderConfig, device: &Device) -> Result<Box<dyn PretrainedModel>>;

    /// Build from a local directory or Hub id and load the pretrained
    /// weights, tolerating head size mismatches
    fn from_pretrained(
        &self,
        model_name_or_path: &str,
        num_labels: usize,
        config_kwargs: &BTreeMap<String, Value>,
        device: &Device,
    ) -> Result<Box<dyn PretrainedModel>> {
        let files = resolve_model_files(model_name_or_path)?;
        let config = EncoderConfig::from_file(&files.config, num_labels, config_kwargs)?;
        let model = self.build(config, device)?;

        match &files.weights {
            Some(path) => {
                load_pretrained_weights(model.var_map(), path, model.base_model_prefix(), device)?;
            }
            None => tracing::warn!(
                model = %model_name_or_path,
                "No model.safetensors found, using randomly initialized weights"
            ),
        }
        Ok(model)
    }
}

/// Sequence classification head picked from the config's `model_type`
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoModelForSequenceClassification;

impl DownstreamModelType for AutoModelForSequenceClassification {
    fn name(&self) -> &str {
        "AutoModelForSequenceClassification"
    }

    fn build(&self, config: EncoderConfig, device: &Device) -> Result<Box<dyn PretrainedModel>> {
        match config.model_type.as_deref() {
            None | Some("bert") => Ok(Box::new(BertForSequenceClassification::new(config, device)?)),
            Some(other) => bail!("Unsupported encoder architecture '{}'", other),
        }
    }
}

/// Look up a downstream model type by name
pub fn downstream_model_type(name: &str) -> Result<Arc<dyn DownstreamModelType>, ModuleError> {
    match name {
        "AutoModelForSequenceClassification" | "BertForSequenceClassification" => {
            Ok(Arc::new(AutoModelForSequenceClassification))
        }
        other => Err(ModuleError::UnknownModelType(other.to_string())),
    }
}

const BERT_PREFIX: &str = "bert";

/// BERT encoder, tanh pooler over the first token and a linear classifier
pub struct BertForSequenceClassification {
    bert: BertModel,
    pooler: Linear,
    classifier: Linear,
    dropout: f32,
    config: EncoderConfig,
    varmap: VarMap,
    device: Device,
    frozen: BTreeSet<String>,
}

impl BertForSequenceClassification {
    pub fn new(config: EncoderConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let bert = BertModel::load(vb.pp(BERT_PREFIX), &config.bert_config()?)?;
        let pooler = linear(
            config.hidden_size,
            config.hidden_size,
            vb.pp(BERT_PREFIX).pp("pooler").pp("dense"),
        )?;
        let classifier = linear(config.hidden_size, config.num_labels, vb.pp("classifier"))?;

        tracing::debug!(
            layers = config.num_hidden_layers,
            hidden_size = config.hidden_size,
            num_labels = config.num_labels,
            "Built BERT sequence classifier"
        );

        Ok(Self {
            bert,
            pooler,
            classifier,
            dropout: config.classifier_dropout(),
            config,
            varmap,
            device: device.clone(),
            frozen: BTreeSet::new(),
        })
    }
}

impl PretrainedModel for BertForSequenceClassification {
    fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn var_map(&self) -> &VarMap {
        &self.varmap
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn base_model_prefix(&self) -> &str {
        BERT_PREFIX
    }

    fn forward(&self, inputs: &Batch, train: bool) -> Result<ModelOutput> {
        let input_ids = inputs.require("input_ids")?;
        let token_type_ids = match inputs.get("token_type_ids") {
            Some(ids) => ids.clone(),
            None => input_ids.zeros_like()?,
        };

        let hidden = self
            .bert
            .forward(input_ids, &token_type_ids, inputs.get("attention_mask"))?;
        let pooled = self.pooler.forward(&hidden.i((.., 0))?)?.tanh()?;
        let pooled = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&pooled, self.dropout)?
        } else {
            pooled
        };
        let logits = self.classifier.forward(&pooled)?;

        let loss = match inputs.get("labels") {
            None => None,
            // Single output regresses on the label value
            Some(labels) if self.config.num_labels == 1 => Some(candle_nn::loss::mse(
                &logits.squeeze(1)?,
                &labels.to_dtype(DType::F32)?,
            )?),
            Some(labels) => Some(candle_nn::loss::cross_entropy(
                &logits,
                &labels.to_dtype(DType::U32)?,
            )?),
        };

        Ok(ModelOutput { loss, logits })
    }

    fn frozen_parameters(&self) -> &BTreeSet<String> {
        &self.frozen
    }

    fn set_requires_grad(&mut self, name: &str, requires_grad: bool) {
        if requires_grad {
            self.frozen.remove(name);
        } else {
            self.frozen.insert(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tiny_config() -> Value {
        json!({
            "model_type": "bert",
            "vocab_size": 32,
            "hidden_size": 8,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "intermediate_size": 16,
            "hidden_act": "gelu",
            "hidden_dropout_prob": 0.1,
            "max_position_embeddings": 16,
            "type_vocab_size": 2,
            "initializer_range": 0.02,
            "layer_norm_eps": 1e-12,
            "pad_token_id": 0,
            "position_embedding_type": "absolute",
            "use_cache": false,
            "classifier_dropout": null
        })
    }

    #[test]
    fn test_config_overrides() {
        let overrides = BTreeMap::from([("hidden_dropout_prob".to_string(), json!(0.3))]);
        let config = EncoderConfig::from_value(tiny_config(), 3, &overrides).unwrap();
        assert_eq!(config.num_labels, 3);
        assert_eq!(config.num_hidden_layers, 2);
        assert_eq!(config.raw()["num_labels"], json!(3));
        assert!((config.classifier_dropout() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_config_missing_layers() {
        let err = EncoderConfig::from_value(json!({"hidden_size": 8}), 2, &BTreeMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("num_hidden_layers"));
    }

    #[test]
    fn test_forward_with_labels() {
        let config = EncoderConfig::from_value(tiny_config(), 3, &BTreeMap::new()).unwrap();
        let model = BertForSequenceClassification::new(config, &Device::Cpu).unwrap();
        let device = Device::Cpu;
        let inputs = Batch::new()
            .with("input_ids", Tensor::new(&[[1u32, 5, 7], [2, 3, 0]], &device).unwrap())
            .with("attention_mask", Tensor::new(&[[1u32, 1, 1], [1, 1, 0]], &device).unwrap())
            .with("labels", Tensor::new(&[0u32, 2], &device).unwrap());

        let output = model.forward(&inputs, false).unwrap();
        assert_eq!(output.logits.dims(), &[2, 3]);
        assert!(output.loss.is_some());

        let no_labels = Batch::new().with("input_ids", inputs.get("input_ids").unwrap().clone());
        assert!(model.forward(&no_labels, false).unwrap().loss.is_none());
    }

    #[test]
    fn test_parameter_layout() {
        let config = EncoderConfig::from_value(tiny_config(), 2, &BTreeMap::new()).unwrap();
        let model = BertForSequenceClassification::new(config, &Device::Cpu).unwrap();

        let base = model.base_model_parameter_names().unwrap();
        assert!(base[0].starts_with("embeddings."));
        assert!(base.last().unwrap().starts_with("pooler."));

        let all = model.named_parameters().unwrap();
        assert!(all.iter().any(|p| p.name == "classifier.weight"));
        assert!(all.iter().all(|p| p.requires_grad));
    }

    #[test]
    fn test_unknown_downstream_type() {
        assert!(downstream_model_type("AutoModelForSequenceClassification").is_ok());
        assert!(matches!(
            downstream_model_type("AutoModelForTokenClassification"),
            Err(ModuleError::UnknownModelType(_))
        ));
    }
}
