// Stateful classification metrics, accumulated batch by batch during an epoch

use candle_core::{DType, Tensor};
use std::collections::BTreeMap;

use super::stats::{Average, ScoreKind, StatScores};
use crate::errors::MetricError;

/// Metric family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    F1,
    Precision,
    Recall,
    Accuracy,
}

/// Classification task the metric is computed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Positive class is 1
    Binary,
    Multiclass { average: Average },
}

/// One running statistic (F1, precision, recall or accuracy)
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationMetric {
    kind: MetricKind,
    task: Task,
    stats: StatScores,
}

impl ClassificationMetric {
    pub fn binary(kind: MetricKind) -> Self {
        Self {
            kind,
            task: Task::Binary,
            stats: StatScores::new(2),
        }
    }

    pub fn multiclass(kind: MetricKind, num_classes: usize, average: Average) -> Self {
        Self {
            kind,
            task: Task::Multiclass { average },
            stats: StatScores::new(num_classes),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn task(&self) -> Task {
        self.task
    }

    /// Accumulate predicted and target class indices
    pub fn update(&mut self, preds: &[u32], targets: &[u32]) -> Result<(), MetricError> {
        if self.task == Task::Binary {
            if let Some(label) = preds.iter().chain(targets).find(|&&label| label > 1) {
                return Err(MetricError::Value(format!(
                    "binary task expects labels in {{0, 1}}, got {}",
                    label
                )));
            }
        }
        self.stats.update(preds, targets)
    }

    pub fn compute(&self) -> f64 {
        let average = match self.task {
            Task::Binary => Average::Binary { pos_label: 1 },
            Task::Multiclass { average } => average,
        };
        match self.kind {
            MetricKind::Accuracy => match self.task {
                Task::Binary => self.stats.accuracy(),
                Task::Multiclass { average: Average::Micro } => self.stats.accuracy(),
                Task::Multiclass { average } => self.stats.score(ScoreKind::Recall, average),
            },
            MetricKind::F1 => self.stats.score(ScoreKind::F1, average),
            MetricKind::Precision => self.stats.score(ScoreKind::Precision, average),
            MetricKind::Recall => self.stats.score(ScoreKind::Recall, average),
        }
    }

    pub fn reset(&mut self) {
        self.stats.reset();
    }
}

/// Named group of metrics sharing a key prefix (`train/`, `val/`, `test/`)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricCollection {
    prefix: String,
    metrics: BTreeMap<String, ClassificationMetric>,
}

impl MetricCollection {
    pub fn new(metrics: BTreeMap<String, ClassificationMetric>) -> Self {
        Self {
            prefix: String::new(),
            metrics,
        }
    }

    /// Independent copy with fresh state and the given key prefix
    pub fn clone_with_prefix(&self, prefix: &str) -> Self {
        let mut cloned = self.clone();
        cloned.prefix = prefix.to_string();
        cloned.reset();
        cloned
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&ClassificationMetric> {
        self.metrics.get(name)
    }

    /// Update every metric with a batch of predictions and targets
    pub fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<(), MetricError> {
        let preds = tensor_to_labels(preds)?;
        let targets = tensor_to_labels(targets)?;
        self.update_labels(&preds, &targets)
    }

    pub fn update_labels(&mut self, preds: &[u32], targets: &[u32]) -> Result<(), MetricError> {
        for metric in self.metrics.values_mut() {
            metric.update(preds, targets)?;
        }
        Ok(())
    }

    /// Current values keyed by prefixed metric name
    pub fn compute(&self) -> BTreeMap<String, f64> {
        self.metrics
            .iter()
            .map(|(name, metric)| (format!("{}{}", self.prefix, name), metric.compute()))
            .collect()
    }

    pub fn reset(&mut self) {
        for metric in self.metrics.values_mut() {
            metric.reset();
        }
    }
}

fn tensor_to_labels(tensor: &Tensor) -> Result<Vec<u32>, MetricError> {
    match tensor.dtype() {
        DType::U8 | DType::U32 | DType::I64 => {
            Ok(tensor.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?)
        }
        dtype => Err(MetricError::Attribute(format!(
            "expected integer class indices, got {:?} tensor",
            dtype
        ))),
    }
}
