pub mod class_map;
pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use class_map::ClassIndexMapping;
pub use config::{AppConfig, AugmentationSettings, DeviceType, ModelSettings, SelectionPolicy, TrainingSettings};
pub use model_metadata::{print_metadata_info, CheckpointMetadata, ARCHITECTURE};
pub use model_storage::{load_artifact, load_checkpoint, load_metadata, save_checkpoint, write_atomic};
