// Per-class true/false positive counts shared by every classification score

use crate::errors::MetricError;

/// How per-class scores are reduced to one number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Average {
    /// Score of a single positive class
    Binary { pos_label: usize },
    /// Global counts summed over classes
    Micro,
    /// Unweighted mean over classes seen in predictions or targets
    Macro,
    /// Mean over classes weighted by target support
    Weighted,
}

impl Average {
    pub fn from_name(name: &str, pos_label: usize) -> Result<Self, MetricError> {
        match name {
            "binary" => Ok(Average::Binary { pos_label }),
            "micro" => Ok(Average::Micro),
            "macro" => Ok(Average::Macro),
            "weighted" => Ok(Average::Weighted),
            other => Err(MetricError::Value(format!(
                "average has to be one of (binary, micro, macro, weighted), got '{}'",
                other
            ))),
        }
    }
}

/// Which ratio to derive from the counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreKind {
    Precision,
    Recall,
    F1,
}

/// Confusion counts for single-label classification
#[derive(Debug, Clone, PartialEq)]
pub struct StatScores {
    tp: Vec<u64>,
    fp: Vec<u64>,
    fn_: Vec<u64>,
    correct: u64,
    total: u64,
}

impl StatScores {
    pub fn new(num_classes: usize) -> Self {
        Self {
            tp: vec![0; num_classes],
            fp: vec![0; num_classes],
            fn_: vec![0; num_classes],
            correct: 0,
            total: 0,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.tp.len()
    }

    /// Accumulate a batch of predicted and target class indices
    pub fn update(&mut self, preds: &[u32], targets: &[u32]) -> Result<(), MetricError> {
        if preds.len() != targets.len() {
            return Err(MetricError::Value(format!(
                "predictions and targets have different lengths: {} vs {}",
                preds.len(),
                targets.len()
            )));
        }

        let num_classes = self.num_classes();
        if let Some(label) = preds
            .iter()
            .chain(targets.iter())
            .find(|&&label| label as usize >= num_classes)
        {
            return Err(MetricError::Value(format!(
                "label {} out of range for {} classes",
                label, num_classes
            )));
        }

        for (&pred, &target) in preds.iter().zip(targets) {
            let (pred, target) = (pred as usize, target as usize);
            if pred == target {
                self.tp[pred] += 1;
                self.correct += 1;
            } else {
                self.fp[pred] += 1;
                self.fn_[target] += 1;
            }
        }
        self.total += preds.len() as u64;
        Ok(())
    }

    pub fn reset(&mut self) {
        let num_classes = self.num_classes();
        *self = Self::new(num_classes);
    }

    /// Fraction of correct predictions (0 when nothing was seen)
    pub fn accuracy(&self) -> f64 {
        safe_div(self.correct, self.total)
    }

    pub fn correct(&self) -> u64 {
        self.correct
    }

    pub fn score(&self, kind: ScoreKind, average: Average) -> f64 {
        match average {
            Average::Binary { pos_label } => {
                if pos_label >= self.num_classes() {
                    return 0.0;
                }
                self.class_score(kind, pos_label)
            }
            Average::Micro => {
                let tp: u64 = self.tp.iter().sum();
                let fp: u64 = self.fp.iter().sum();
                let fn_: u64 = self.fn_.iter().sum();
                ratio(kind, tp, fp, fn_)
            }
            Average::Macro => {
                let present: Vec<usize> = (0..self.num_classes())
                    .filter(|&c| self.tp[c] + self.fp[c] + self.fn_[c] > 0)
                    .collect();
                if present.is_empty() {
                    return 0.0;
                }
                present
                    .iter()
                    .map(|&c| self.class_score(kind, c))
                    .sum::<f64>()
                    / present.len() as f64
            }
            Average::Weighted => {
                let support: u64 = (0..self.num_classes()).map(|c| self.support(c)).sum();
                if support == 0 {
                    return 0.0;
                }
                (0..self.num_classes())
                    .map(|c| self.class_score(kind, c) * self.support(c) as f64)
                    .sum::<f64>()
                    / support as f64
            }
        }
    }

    fn support(&self, class: usize) -> u64 {
        self.tp[class] + self.fn_[class]
    }

    fn class_score(&self, kind: ScoreKind, class: usize) -> f64 {
        ratio(kind, self.tp[class], self.fp[class], self.fn_[class])
    }
}

fn ratio(kind: ScoreKind, tp: u64, fp: u64, fn_: u64) -> f64 {
    match kind {
        ScoreKind::Precision => safe_div(tp, tp + fp),
        ScoreKind::Recall => safe_div(tp, tp + fn_),
        ScoreKind::F1 => safe_div(2 * tp, 2 * tp + fp + fn_),
    }
}

// Zero division scores 0
fn safe_div(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}
