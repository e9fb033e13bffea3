//! 機械学習（学習・推論）
//!
//! Burn を使った猫判定モデルの学習パイプラインと推論エンジンです。

pub mod batcher;
pub mod dataset;
pub mod inference;
pub mod metrics;
pub mod ml_model;
pub mod training;
pub mod transform;

/// クラス数（猫 / 猫以外）
pub const NUM_CLASSES: usize = 2;

pub use batcher::{BatchLoader, ImageBatch, ImageBatcher, LoaderMode, PreparedImage};
pub use dataset::{DatasetSplit, ImageSubset, LabeledImageSource, Sample};
pub use inference::{InferenceEngine, Prediction};
pub use metrics::{EpochMetrics, MetricsLog};
pub use ml_model::{CatClassifier, CatClassifierConfig, ResNet18Backbone};
pub use training::{evaluate, train_epoch, train_model, CheckpointSelector, PhaseMetrics, TrainingReport};
pub use transform::{decode_image_bytes, decode_image_path, normalize_chw, AugmentationPipeline, EvalTransform};
