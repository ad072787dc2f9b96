// Optimizer groups and learning rate schedule
// Linear warmup then linear decay to zero, stepped once per optimization step

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::errors::ModuleError;

/// Parameter names excluded from weight decay
pub const NO_DECAY: &[&str] = &["bias", "LayerNorm.weight"];

/// Optimizer family selected by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    AdamW,
    Adam,
    Sgd,
}

impl OptimizerKind {
    /// Resolve a name, failing when the optimizer is unknown or cannot take
    /// both a learning rate and an epsilon
    pub fn from_name(name: &str) -> Result<Self, ModuleError> {
        let kind = match name {
            "AdamW" => OptimizerKind::AdamW,
            "Adam" => OptimizerKind::Adam,
            "SGD" => OptimizerKind::Sgd,
            _ => {
                return Err(ModuleError::UnsupportedOptimizer {
                    name: name.to_string(),
                    reason: "unknown optimizer".to_string(),
                })
            }
        };

        if !kind.accepts_lr() || !kind.accepts_eps() {
            return Err(ModuleError::UnsupportedOptimizer {
                name: name.to_string(),
                reason: "optimizer must accept both 'lr' and 'eps'".to_string(),
            });
        }
        Ok(kind)
    }

    pub fn accepts_lr(&self) -> bool {
        true
    }

    pub fn accepts_eps(&self) -> bool {
        !matches!(self, OptimizerKind::Sgd)
    }
}

/// Variables sharing a weight decay value
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub vars: Vec<Var>,
    pub weight_decay: f64,
}

impl ParamGroup {
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

struct OptimizerGroup {
    weight_decay: f64,
    /// Decay added to the gradients (`Adam`) instead of applied to the weights
    coupled_decay: bool,
    vars: Vec<Var>,
    optimizer: AdamW,
}

/// One optimizer per parameter group, driven with a shared learning rate.
///
/// `AdamW` decays the weights directly. `Adam` adds `weight_decay * param`
/// to each gradient before the update, the L2 form of weight decay.
pub struct GroupedOptimizer {
    kind: OptimizerKind,
    groups: Vec<OptimizerGroup>,
    learning_rate: f64,
}

impl GroupedOptimizer {
    pub fn new(kind: OptimizerKind, groups: Vec<ParamGroup>, lr: f64, eps: f64) -> Result<Self> {
        let coupled_decay = kind == OptimizerKind::Adam;
        let groups = groups
            .into_iter()
            .map(|group| {
                let optimizer = AdamW::new(
                    group.vars.clone(),
                    ParamsAdamW {
                        lr,
                        eps,
                        weight_decay: if coupled_decay { 0.0 } else { group.weight_decay },
                        ..Default::default()
                    },
                )?;
                Ok(OptimizerGroup {
                    weight_decay: group.weight_decay,
                    coupled_decay,
                    vars: group.vars,
                    optimizer,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            kind,
            groups,
            learning_rate: lr,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    /// Weight decay of each group, in construction order
    pub fn weight_decays(&self) -> Vec<f64> {
        self.groups.iter().map(|group| group.weight_decay).collect()
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
        for group in &mut self.groups {
            group.optimizer.set_learning_rate(lr);
        }
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<()> {
        for group in &mut self.groups {
            if group.coupled_decay && group.weight_decay != 0.0 {
                for var in &group.vars {
                    let param = var.as_tensor();
                    let Some(grad) = grads.get(param) else {
                        continue;
                    };
                    let decayed = (grad + param.affine(group.weight_decay, 0.0)?)?;
                    grads.insert(param, decayed);
                }
            }
            group.optimizer.step(grads)?;
        }
        Ok(())
    }
}

/// Linear warmup from 0 to the base rate, then linear decay to 0 at
/// `total_steps`
#[derive(Debug, Clone)]
pub struct LinearWarmupSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
}

impl LinearWarmupSchedule {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            step: 0,
        }
    }

    /// Multiplier applied to the base rate at `step`
    pub fn lr_lambda(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        (remaining / decay_steps).max(0.0)
    }

    pub fn current_lr(&self) -> f64 {
        self.base_lr * self.lr_lambda(self.step)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

/// Optimizer plus optional per-step schedule, as returned by
/// `configure_optimizers`
pub struct OptimizerConfig {
    pub optimizer: GroupedOptimizer,
    pub scheduler: Option<LinearWarmupSchedule>,
}

impl OptimizerConfig {
    pub fn new(mut optimizer: GroupedOptimizer, scheduler: Option<LinearWarmupSchedule>) -> Self {
        if let Some(scheduler) = &scheduler {
            optimizer.set_learning_rate(scheduler.current_lr());
        }
        Self {
            optimizer,
            scheduler,
        }
    }

    /// Apply gradients, then advance the schedule
    pub fn step(&mut self, grads: &mut GradStore) -> Result<()> {
        self.optimizer.step(grads)?;
        if let Some(scheduler) = &mut self.scheduler {
            scheduler.advance();
            self.optimizer.set_learning_rate(scheduler.current_lr());
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }
}
