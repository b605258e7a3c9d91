//! KDL configuration parsing for Keel.
//!
//! Turns a pipeline definition file into the `PipelineConfig` document that
//! the config store versions and persists.

pub mod error;
pub mod pipeline;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{parse_pipeline_config, read_pipeline_config};
