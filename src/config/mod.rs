//! Configuration loading and management.

mod file;
mod paths;
mod settings;
mod types;
mod validate;

pub use file::{load_config_file, load_default_config, save_config, save_default_config};
pub use paths::{config_dir, config_file_path, data_dir, database_path};
pub use settings::{EmbedderSettings, PipelineSettings, ResolutionSettings, Settings};
pub use types::{
    Config, EmbedderConfig, EmbeddingUpdate, PipelineConfig, ResolutionConfig, StorageConfig,
};
pub use validate::build_settings;
