// Evaluation metric registry
// Stateless metrics loaded by name and computed over whole reference/prediction sets

use candle_core::{DType, Tensor};
use ndarray::Array1;
use std::collections::{BTreeMap, BTreeSet};

use super::stats::{Average, ScoreKind, StatScores};
use crate::errors::MetricError;

/// Options passed at load or compute time (`average = "macro"`, `process_id = 0`, ...)
pub type MetricOptions = BTreeMap<String, serde_json::Value>;

/// Metric results keyed by sub-name
pub type MetricValues = BTreeMap<String, f64>;

/// Init options understood by [`load`]
const INIT_OPTIONS: &[&str] = &[
    "process_id",
    "num_process",
    "config_name",
    "experiment_id",
    "cache_dir",
];

/// Reference or prediction values handed to a metric
#[derive(Debug, Clone)]
pub enum MetricInput {
    List(Vec<i64>),
    Array(Array1<i64>),
    Tensor(Tensor),
}

impl MetricInput {
    /// Integer class labels, or an error describing why they cannot be read
    pub fn to_labels(&self) -> Result<Vec<i64>, MetricError> {
        match self {
            MetricInput::List(values) => Ok(values.clone()),
            MetricInput::Array(values) => Ok(values.to_vec()),
            MetricInput::Tensor(tensor) => match tensor.dtype() {
                DType::U8 | DType::U32 | DType::I64 => {
                    if tensor.rank() > 1 {
                        return Err(MetricError::Value(format!(
                            "expected a 1-d tensor of labels, got shape {:?}",
                            tensor.dims()
                        )));
                    }
                    Ok(tensor.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?)
                }
                dtype => Err(MetricError::Attribute(format!(
                    "{:?} tensor has no integer labels",
                    dtype
                ))),
            },
        }
    }
}

impl From<Vec<i64>> for MetricInput {
    fn from(values: Vec<i64>) -> Self {
        MetricInput::List(values)
    }
}

impl From<Array1<i64>> for MetricInput {
    fn from(values: Array1<i64>) -> Self {
        MetricInput::Array(values)
    }
}

impl From<Tensor> for MetricInput {
    fn from(tensor: Tensor) -> Self {
        MetricInput::Tensor(tensor)
    }
}

/// A metric computed from full reference and prediction sets
pub trait EvaluationMetric: Send + Sync {
    fn name(&self) -> &str;

    fn compute(
        &self,
        references: &MetricInput,
        predictions: &MetricInput,
        options: &MetricOptions,
    ) -> Result<MetricValues, MetricError>;
}

/// Resolve a metric by name
pub fn load(
    name: &str,
    init_options: &MetricOptions,
) -> Result<Box<dyn EvaluationMetric>, MetricError> {
    if let Some(key) = init_options
        .keys()
        .find(|key| !INIT_OPTIONS.contains(&key.as_str()))
    {
        return Err(MetricError::InvalidOption {
            key: key.clone(),
            reason: format!("not accepted when loading '{}'", name),
        });
    }

    let metric: Box<dyn EvaluationMetric> = match name {
        "accuracy" => Box::new(Accuracy),
        "f1" => Box::new(ClassificationScore::new("f1", ScoreKind::F1)),
        "precision" => Box::new(ClassificationScore::new("precision", ScoreKind::Precision)),
        "recall" => Box::new(ClassificationScore::new("recall", ScoreKind::Recall)),
        other => return Err(MetricError::UnknownMetric(other.to_string())),
    };

    tracing::debug!(metric = %name, "Loaded evaluation metric");
    Ok(metric)
}

/// Fraction (or count, with `normalize = false`) of exact matches
pub struct Accuracy;

impl EvaluationMetric for Accuracy {
    fn name(&self) -> &str {
        "accuracy"
    }

    fn compute(
        &self,
        references: &MetricInput,
        predictions: &MetricInput,
        options: &MetricOptions,
    ) -> Result<MetricValues, MetricError> {
        reject_unknown_options(options, &["normalize"])?;
        let normalize = bool_option(options, "normalize", true)?;

        let stats = stat_scores(references, predictions, None)?.stats;
        let value = if normalize {
            stats.accuracy()
        } else {
            stats.correct() as f64
        };

        Ok(MetricValues::from([(self.name().to_string(), value)]))
    }
}

/// Precision, recall or F1 with sklearn-style averaging
pub struct ClassificationScore {
    name: &'static str,
    kind: ScoreKind,
}

impl ClassificationScore {
    fn new(name: &'static str, kind: ScoreKind) -> Self {
        Self { name, kind }
    }
}

impl EvaluationMetric for ClassificationScore {
    fn name(&self) -> &str {
        self.name
    }

    fn compute(
        &self,
        references: &MetricInput,
        predictions: &MetricInput,
        options: &MetricOptions,
    ) -> Result<MetricValues, MetricError> {
        reject_unknown_options(options, &["average", "pos_label"])?;
        let pos_label = i64_option(options, "pos_label", 1)?;
        let average = match options.get("average") {
            None => Average::Binary { pos_label: 0 },
            Some(serde_json::Value::String(name)) => Average::from_name(name, 0)?,
            Some(other) => {
                return Err(MetricError::Value(format!(
                    "average must be a string, got {}",
                    other
                )))
            }
        };
        let binary = matches!(average, Average::Binary { .. });

        let scores = stat_scores(references, predictions, binary.then_some(pos_label))?;
        let average = if binary {
            if scores.labels.len() > 2 {
                return Err(MetricError::Value(
                    "Target is multiclass but average='binary'. Please choose another average setting"
                        .to_string(),
                ));
            }
            if scores.labels.len() == 2 && !scores.labels.contains(&pos_label) {
                return Err(MetricError::Value(format!(
                    "pos_label={} is not a valid label: {:?}",
                    pos_label, scores.labels
                )));
            }
            Average::Binary {
                pos_label: scores.class_of(pos_label)?,
            }
        } else {
            average
        };

        let value = scores.stats.score(self.kind, average);
        Ok(MetricValues::from([(self.name.to_string(), value)]))
    }
}

/// Counts over both inputs, with every label mapped to a dense class index
struct LabelledScores {
    stats: StatScores,
    /// Labels seen in references or predictions, ascending
    labels: BTreeSet<i64>,
    classes: BTreeMap<i64, usize>,
}

impl LabelledScores {
    fn class_of(&self, label: i64) -> Result<usize, MetricError> {
        self.classes
            .get(&label)
            .copied()
            .ok_or_else(|| MetricError::Value(format!("label {} has no class index", label)))
    }
}

/// Count matches per class. Labels may be any integers (negative or sparse);
/// `extra_label` gets a class even when neither input contains it.
fn stat_scores(
    references: &MetricInput,
    predictions: &MetricInput,
    extra_label: Option<i64>,
) -> Result<LabelledScores, MetricError> {
    let references = references.to_labels()?;
    let predictions = predictions.to_labels()?;

    if references.len() != predictions.len() {
        return Err(MetricError::Value(format!(
            "Found input variables with inconsistent numbers of samples: [{}, {}]",
            references.len(),
            predictions.len()
        )));
    }

    let labels: BTreeSet<i64> = references.iter().chain(&predictions).copied().collect();
    let classes: BTreeMap<i64, usize> = labels
        .iter()
        .copied()
        .chain(extra_label)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .enumerate()
        .map(|(class, label)| (label, class))
        .collect();

    let to_classes = |values: &[i64]| -> Vec<u32> {
        values
            .iter()
            .filter_map(|label| classes.get(label).map(|&class| class as u32))
            .collect()
    };
    let mut stats = StatScores::new(classes.len());
    stats.update(&to_classes(&predictions), &to_classes(&references))?;
    Ok(LabelledScores {
        stats,
        labels,
        classes,
    })
}

fn reject_unknown_options(options: &MetricOptions, known: &[&str]) -> Result<(), MetricError> {
    match options.keys().find(|key| !known.contains(&key.as_str())) {
        Some(key) => Err(MetricError::InvalidOption {
            key: key.clone(),
            reason: format!("unexpected keyword argument (expected one of {:?})", known),
        }),
        None => Ok(()),
    }
}

fn bool_option(options: &MetricOptions, key: &str, default: bool) -> Result<bool, MetricError> {
    match options.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| MetricError::Value(format!("{} must be a bool, got {}", key, value))),
    }
}

fn i64_option(options: &MetricOptions, key: &str, default: i64) -> Result<i64, MetricError> {
    match options.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_i64()
            .ok_or_else(|| MetricError::Value(format!("{} must be an integer, got {}", key, value))),
    }
}
