// Pretrained encoders
// Device selection, model file resolution, weight loading and layer freezing

pub mod common;
pub mod download;
pub mod encoder;
pub mod freeze;
pub mod persistence;

pub use common::{device_info, get_device_with_preference, DevicePreference};
pub use download::{resolve_model_files, ModelFiles};
pub use encoder::{
    downstream_model_type, AutoModelForSequenceClassification, BertForSequenceClassification,
    DownstreamModelType, EncoderConfig, ModelOutput, PretrainedModel,
};
pub use freeze::{classify_parameter, freeze_plan, natural_cmp, LayerTag, NamedParameter};
pub use persistence::{load_pretrained_weights, restore_weights, save_weights, LoadReport};
