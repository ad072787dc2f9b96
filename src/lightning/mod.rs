// Lightning layer - trainable modules, optimizers, trainer and checkpoints

pub mod checkpoint;
pub mod huggingface;
pub mod module;
pub mod optim;
pub mod trainer;

pub use checkpoint::{load_checkpoint_metadata, Checkpoint, CheckpointManager};
pub use huggingface::{compute_total_steps, HuggingFaceLightningModule};
pub use module::{
    default_metrics, LightningModule, ModuleState, Predictions, Split, Stage, StepOutput,
    TrainerContext,
};
pub use optim::{
    GroupedOptimizer, LinearWarmupSchedule, OptimizerConfig, OptimizerKind, ParamGroup,
};
pub use trainer::{CkptPath, Trainer};
