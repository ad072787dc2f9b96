// Integration test: layer freezing on a real encoder parameter layout

mod common;

use anyhow::Result;
use embeddings::errors::ModuleError;
use embeddings::lightning::LightningModule;
use embeddings::models::{classify_parameter, LayerTag};

fn frozen_base_fraction(module: &impl LightningModule) -> Result<(usize, usize)> {
    let params = module.named_parameters()?;
    let base: Vec<_> = params.iter().filter(|p| p.name.starts_with("bert.")).collect();
    let frozen = base.iter().filter(|p| !p.requires_grad).count();
    Ok((frozen, base.len()))
}

#[test]
fn test_zero_layers_freezes_whole_encoder() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let module = common::module(&dir, 2, 0, common::small_task());

    let (frozen, total) = frozen_base_fraction(&module)?;
    assert!(total > 0);
    assert_eq!(frozen, total);

    // Head stays trainable
    let params = module.named_parameters()?;
    assert!(params
        .iter()
        .filter(|p| p.name.starts_with("classifier."))
        .all(|p| p.requires_grad));
    Ok(())
}

#[test]
fn test_all_layers_trainable_freezes_nothing() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let module = common::module(&dir, 2, common::NUM_LAYERS as i64, common::small_task());

    let (frozen, _) = frozen_base_fraction(&module)?;
    assert_eq!(frozen, 0);
    Ok(())
}

#[test]
fn test_negative_disables_freezing() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let module = common::module(&dir, 2, -1, common::small_task());

    let (frozen, _) = frozen_base_fraction(&module)?;
    assert_eq!(frozen, 0);
    Ok(())
}

#[test]
fn test_last_layer_trainable() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let module = common::module(&dir, 2, 1, common::small_task());

    for param in module.named_parameters()? {
        let Some(name) = param.name.strip_prefix("bert.") else {
            continue;
        };
        let expect_frozen = matches!(
            classify_parameter(name),
            LayerTag::Embedding | LayerTag::EncoderLayer(0)
        );
        assert_eq!(!param.requires_grad, expect_frozen, "{}", param.name);
    }
    Ok(())
}

#[test]
fn test_head_only_when_encoder_frozen() -> Result<()> {
    let dir = common::tiny_bert_dir();
    let all_trainable = common::module(&dir, 2, -1, common::small_task());
    let head_only = common::module(&dir, 2, 0, common::small_task());

    let trainable = |module: &dyn LightningModule| -> Result<Vec<String>> {
        Ok(module
            .named_parameters()?
            .into_iter()
            .filter(|p| p.requires_grad)
            .map(|p| p.name)
            .collect())
    };

    assert!(trainable(&all_trainable)?.len() > 2);
    assert_eq!(
        trainable(&head_only)?,
        vec!["classifier.bias".to_string(), "classifier.weight".to_string()]
    );
    Ok(())
}

#[test]
fn test_unrecognized_parameter_message() {
    let err = ModuleError::UnrecognizedParameter("adapter.weight".to_string());
    assert!(err.to_string().contains("not recognized"));
}
