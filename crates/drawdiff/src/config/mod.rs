pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str};
pub use schema::{
    AlignmentConfig, Config, LogFormat, LoggingConfig, OverlayConfig, Resampling, RetryConfig,
    TransformModel, WorkerConfig,
};
