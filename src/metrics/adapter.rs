// Metric adapter
// Wraps a registry metric (or a ready instance) behind a uniform compute() that
// never fails on malformed inputs.

use std::fmt;

use super::registry::{self, EvaluationMetric, MetricInput, MetricOptions, MetricValues};
use crate::errors::MetricError;

/// Score reported when the wrapped metric rejects its inputs
pub const SENTINEL_SCORE: f64 = -1.0;

/// Where the wrapped metric comes from
pub enum MetricSource {
    /// Resolved through [`registry::load`]
    Name(String),
    /// Already configured instance
    Instance(Box<dyn EvaluationMetric>),
}

impl From<&str> for MetricSource {
    fn from(name: &str) -> Self {
        MetricSource::Name(name.to_string())
    }
}

/// Uniform wrapper over an evaluation metric.
///
/// Only usable on the primary process: results from other ranks would not
/// contain the aggregated values.
pub struct HuggingFaceMetric {
    name: String,
    metric: Box<dyn EvaluationMetric>,
    compute_options: MetricOptions,
}

impl HuggingFaceMetric {
    pub fn new(
        metric: MetricSource,
        compute_options: Option<MetricOptions>,
        init_options: MetricOptions,
    ) -> Result<Self, MetricError> {
        let process_id = match init_options.get("process_id") {
            None => 0,
            Some(value) => value.as_u64().ok_or_else(|| MetricError::InvalidOption {
                key: "process_id".to_string(),
                reason: format!("expected a non-negative integer, got {}", value),
            })?,
        };
        if process_id != 0 {
            return Err(MetricError::InvalidProcessId(process_id));
        }

        let (name, metric) = match metric {
            MetricSource::Name(name) => {
                let metric = registry::load(&name, &init_options)?;
                (name, metric)
            }
            MetricSource::Instance(metric) => (metric.name().to_string(), metric),
        };

        Ok(Self {
            name,
            metric,
            compute_options: compute_options.unwrap_or_default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute_options(&self) -> &MetricOptions {
        &self.compute_options
    }

    /// Compute the wrapped metric.
    ///
    /// Fixed compute options are applied first and `overrides` on top of them.
    /// Malformed inputs yield `{metric_name: -1.0}`.
    pub fn compute(
        &self,
        y_true: &MetricInput,
        y_pred: &MetricInput,
        overrides: &MetricOptions,
    ) -> Result<MetricValues, MetricError> {
        let mut options = self.compute_options.clone();
        options.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        match self.metric.compute(y_true, y_pred, &options) {
            Ok(values) => Ok(values),
            Err(err) if err.is_recoverable() => {
                tracing::warn!(metric = %self, error = %err, "Metric computation failed");
                Ok(MetricValues::from([(
                    self.metric.name().to_string(),
                    SENTINEL_SCORE,
                )]))
            }
            Err(err) => Err(err),
        }
    }
}

/// `name__key_value__...` with the fixed compute options in ascending key
/// order, so the same options always render the same string
impl fmt::Display for HuggingFaceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (key, value) in &self.compute_options {
            match value {
                serde_json::Value::String(s) => write!(f, "__{}_{}", key, s)?,
                other => write!(f, "__{}_{}", key, other)?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for HuggingFaceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HuggingFaceMetric")
            .field("name", &self.name)
            .field("compute_options", &self.compute_options)
            .finish()
    }
}
