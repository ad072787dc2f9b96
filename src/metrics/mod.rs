// Metrics module
// Epoch-level classification metrics and the evaluation metric adapter

pub mod adapter;
pub mod classification;
pub mod registry;
mod stats;

pub use adapter::{HuggingFaceMetric, MetricSource, SENTINEL_SCORE};
pub use classification::{ClassificationMetric, MetricCollection, MetricKind, Task};
pub use registry::{load, EvaluationMetric, MetricInput, MetricOptions, MetricValues};
pub use stats::{Average, ScoreKind, StatScores};
