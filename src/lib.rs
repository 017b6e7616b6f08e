//! Core library for the statepull state collection tool.
//!
//! The crate maps remote state object keys to per-environment resource-class
//! directories, writes a backend configuration file into each, and drives an
//! external state CLI (`init`, then `state pull`) across those directories
//! with bounded parallelism.

pub mod command;
pub mod config;
pub mod generator;
pub mod logging;
pub mod matcher;
pub mod naming;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod render;
pub mod report;
pub mod storage;
pub mod test_support;

pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, StatepullConfig};
pub use generator::{BACKEND_FILE_NAME, BackendFileGenerator, GenerationError, GenerationResult};
pub use logging::{LoggingError, init_logging};
pub use matcher::match_prefix;
pub use naming::NamingError;
pub use orchestrator::{
    BatchResult, Job, JobKind, JobOutcome, JobResult, OrchestratorError, OutputTarget,
    ProcessOrchestrator, STATE_FILE_NAME, ShutdownSignal,
};
pub use pipeline::{Pipeline, PipelineError, PipelineMode, PipelineSettings};
pub use registry::{
    Environment, Registration, ResourceClass, ResourceClassRegistry, SkipReason, SkippedKey,
};
pub use render::{BackendContext, HandlebarsRenderer, RenderError, TemplateRenderer};
pub use report::{ClassSummary, EnvironmentReport, EnvironmentSummary, RunReport};
pub use storage::{AwsCliLister, BucketLocation, ListingError, ObjectLister};
