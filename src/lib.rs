// Embeddings - fine-tuning pretrained encoders for text classification
// Library exports

pub mod config;
pub mod data;
pub mod errors;
pub mod lightning;
pub mod metrics;
pub mod models;
