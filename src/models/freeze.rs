// Layer-wise freezing of encoder parameters
//
// Encoder parameter names follow the BERT layout: `embeddings.*`,
// `encoder.layer.<i>.*` and `pooler.*`. Freezing walks them in that order.

use candle_core::Var;
use std::cmp::Ordering;

use crate::errors::ModuleError;

/// Depth of an encoder parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerTag {
    Embedding,
    EncoderLayer(usize),
    Pooler,
    Unrecognized,
}

impl LayerTag {
    /// Layer number used for the freezing threshold (embeddings are 0, the
    /// pooler sorts after every encoder layer)
    pub fn layer_index(&self) -> Option<usize> {
        match self {
            LayerTag::Embedding => Some(0),
            LayerTag::EncoderLayer(index) => Some(*index),
            LayerTag::Pooler => Some(usize::MAX),
            LayerTag::Unrecognized => None,
        }
    }
}

/// Classify an encoder parameter name (without the base model prefix)
pub fn classify_parameter(name: &str) -> LayerTag {
    if name.starts_with("embeddings") {
        LayerTag::Embedding
    } else if name.starts_with("encoder") {
        name.split('.')
            .nth(2)
            .and_then(|segment| segment.parse().ok())
            .map_or(LayerTag::Unrecognized, LayerTag::EncoderLayer)
    } else if name.starts_with("pooler") {
        LayerTag::Pooler
    } else {
        LayerTag::Unrecognized
    }
}

/// Order dotted parameter names the way modules register them: numeric
/// segments compare as numbers, so `layer.2` comes before `layer.10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(i), Ok(j)) => i.cmp(&j),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// A model variable with its trainability switch
#[derive(Debug, Clone)]
pub struct NamedParameter {
    pub name: String,
    pub var: Var,
    pub requires_grad: bool,
}

/// Names of the encoder parameters to freeze, given in traversal order.
///
/// `finetune_last_n_layers == 0` freezes everything. Otherwise parameters are
/// frozen until the first one whose layer reaches
/// `total_layers - finetune_last_n_layers`; traversal stops there, so a later
/// parameter from a lower layer stays trainable.
pub fn freeze_plan(
    names: &[String],
    total_layers: usize,
    finetune_last_n_layers: usize,
) -> Result<Vec<String>, ModuleError> {
    if finetune_last_n_layers == 0 {
        return Ok(names.to_vec());
    }

    let threshold = total_layers.saturating_sub(finetune_last_n_layers);
    let mut frozen = Vec::new();
    for name in names {
        let layer = classify_parameter(name)
            .layer_index()
            .ok_or_else(|| ModuleError::UnrecognizedParameter(name.clone()))?;
        if layer >= threshold {
            break;
        }
        frozen.push(name.clone());
    }
    Ok(frozen)
}
