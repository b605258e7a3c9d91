//! Core domain types for the Keel build engine.
//!
//! This crate contains:
//! - Numeric identifiers for teams, pipelines, jobs and builds
//! - Build records and the build status state machine
//! - Build event payloads
//! - Versioned resources and build inputs/outputs
//! - Pipeline configuration documents and their version counter

pub mod build;
pub mod error;
pub mod event;
pub mod id;
pub mod pipeline;
pub mod resource;

pub use build::{Build, BuildStatus, JobRef};
pub use error::{Error, Result};
pub use event::{Event, Origin};
pub use id::{BuildId, JobId, PipelineId, TeamId};
pub use pipeline::{
    ConfigVersion, JobConfig, PausedState, PipelineConfig, PlanStep, ResourceConfig, SavedPipeline,
};
pub use resource::{
    BuildInput, BuildOutput, MetadataField, SavedVersionedResource, Version, VersionedResource,
};
