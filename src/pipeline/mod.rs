//! Per-environment sequencing of discovery, generation, init, and pull.
//!
//! Each environment runs scan → register → generate → init → pull. Pull only
//! targets directories whose init succeeded, and init only targets
//! directories whose backend file was written. A fatal error stops the
//! current environment, keeping whatever it had already summarised; the next
//! environment still runs.

use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{info, warn};

use crate::generator::{BackendFileGenerator, GenerationResult};
use crate::matcher::match_prefix;
use crate::orchestrator::{BatchResult, Job, JobKind, OrchestratorError, ProcessOrchestrator};
use crate::registry::{Registration, ResourceClassRegistry};
use crate::render::TemplateRenderer;
use crate::report::{ClassSummary, EnvironmentReport, EnvironmentSummary, RunReport};
use crate::storage::{ListingError, ObjectLister};

/// How far each environment is taken.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PipelineMode {
    /// Stop once backend files are written.
    Generate,
    /// Generate, then run init and pull.
    #[default]
    Full,
}

/// Explicit inputs of a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PipelineSettings {
    /// Bucket holding the state objects.
    pub bucket: String,
    /// Region of the bucket.
    pub region: String,
    /// Environment names, processed in order.
    pub environments: Vec<String>,
    /// Per-job timeout for init and pull.
    pub job_timeout: Option<Duration>,
    /// How far to take each environment.
    pub mode: PipelineMode,
}

/// Errors that stop one environment.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PipelineError {
    /// Raised when the bucket cannot be listed.
    #[error("failed to list state for {environment}: {source}")]
    Listing {
        /// Environment being listed.
        environment: String,
        /// Listing failure.
        source: ListingError,
    },
    /// Raised when every job of a batch failed because the tool is missing.
    #[error("{program} could not be launched for {environment} {phase}; is it installed?")]
    ToolUnavailable {
        /// Environment being processed.
        environment: String,
        /// Tool program name.
        program: String,
        /// Phase label (`init` or `pull`).
        phase: &'static str,
    },
    /// Raised when the orchestrator rejects a batch.
    #[error("invalid job batch: {0}")]
    Orchestrator(#[from] OrchestratorError),
    /// Raised when shutdown was requested before the environment started.
    #[error("run cancelled before {environment} was processed")]
    Cancelled {
        /// Environment that was not processed.
        environment: String,
    },
}

/// Runs every configured environment through the pipeline.
#[derive(Debug)]
pub struct Pipeline<L: ObjectLister, T: TemplateRenderer> {
    settings: PipelineSettings,
    lister: L,
    registry: ResourceClassRegistry,
    generator: BackendFileGenerator<T>,
    orchestrator: ProcessOrchestrator,
}

impl<L: ObjectLister, T: TemplateRenderer> Pipeline<L, T> {
    /// Creates a pipeline from explicit collaborators.
    #[must_use]
    pub const fn new(
        settings: PipelineSettings,
        lister: L,
        registry: ResourceClassRegistry,
        generator: BackendFileGenerator<T>,
        orchestrator: ProcessOrchestrator,
    ) -> Self {
        Self {
            settings,
            lister,
            registry,
            generator,
            orchestrator,
        }
    }

    /// Settings the pipeline was built with.
    #[must_use]
    pub const fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Processes every environment in order and collects their reports.
    pub async fn run(&self) -> RunReport {
        let mut environments = Vec::with_capacity(self.settings.environments.len());
        for name in &self.settings.environments {
            let report = self.run_environment(name).await;
            if let Some(err) = &report.fatal {
                warn!(environment = %name, error = %err, "environment failed");
            }
            environments.push(report);
        }
        RunReport { environments }
    }

    /// Runs one environment through every phase allowed by the mode.
    ///
    /// The report carries a [`PipelineError`] when listing fails, the tool is
    /// missing, a batch is rejected, or shutdown was requested before the
    /// environment started. Once keys are registered, the summary of the
    /// phases that ran is kept alongside that error.
    pub async fn run_environment(&self, name: &str) -> EnvironmentReport {
        if self.orchestrator.is_shutting_down() {
            return EnvironmentReport::failed(
                name,
                PipelineError::Cancelled {
                    environment: name.to_owned(),
                },
            );
        }

        info!(environment = name, "listing state objects");
        let keys = match self.lister.list(name) {
            Ok(keys) => keys,
            Err(source) => {
                return EnvironmentReport::failed(
                    name,
                    PipelineError::Listing {
                        environment: name.to_owned(),
                        source,
                    },
                );
            }
        };
        let matched = match_prefix(&keys, name);

        let Registration {
            environment,
            skipped,
        } = self.registry.register(name, &matched);
        info!(
            environment = name,
            keys = matched.len(),
            classes = environment.resource_classes().len(),
            skipped = skipped.len(),
            "registered resource classes"
        );

        let generation =
            self.generator
                .generate(&environment, &self.settings.bucket, &self.settings.region);

        let jobs_requested = self.settings.mode == PipelineMode::Full;
        let JobPhases { init, pull, fatal } = if jobs_requested {
            self.run_jobs(name, &generation).await
        } else {
            JobPhases::default()
        };

        let summary = EnvironmentSummary {
            name: name.to_owned(),
            root: environment.root().to_path_buf(),
            discovered: matched.len(),
            skipped,
            classes: summarise(generation, &init, &pull),
            jobs_requested,
            peak_concurrency: init.peak_concurrency().max(pull.peak_concurrency()),
        };
        EnvironmentReport {
            name: name.to_owned(),
            summary: Some(summary),
            fatal,
        }
    }

    async fn run_jobs(&self, name: &str, generation: &[GenerationResult]) -> JobPhases {
        let generated = generation
            .iter()
            .filter(|result| result.is_success())
            .map(|result| result.working_dir.clone())
            .collect::<Vec<_>>();
        let init = match self.run_phase(name, JobKind::Init, generated).await {
            Ok(batch) => batch,
            Err(err) => return JobPhases::stopped(BatchResult::default(), err),
        };
        if let Some(err) = self.missing_tool(name, JobKind::Init, &init) {
            return JobPhases::stopped(init, err);
        }

        if self.orchestrator.is_shutting_down() {
            warn!(environment = name, "shutdown requested; skipping pull");
            return JobPhases {
                init,
                ..JobPhases::default()
            };
        }

        let pull = match self
            .run_phase(name, JobKind::Pull, init.succeeded_dirs())
            .await
        {
            Ok(batch) => batch,
            Err(err) => return JobPhases::stopped(init, err),
        };
        let fatal = self.missing_tool(name, JobKind::Pull, &pull);
        JobPhases { init, pull, fatal }
    }

    async fn run_phase(
        &self,
        name: &str,
        kind: JobKind,
        dirs: Vec<Utf8PathBuf>,
    ) -> Result<BatchResult, PipelineError> {
        let jobs = dirs
            .into_iter()
            .map(|dir| Job::for_kind(kind, dir).with_timeout(self.settings.job_timeout))
            .collect::<Vec<_>>();
        info!(environment = name, phase = kind.label(), jobs = jobs.len(), "starting batch");

        let batch = self.orchestrator.run_batch(jobs).await?;
        let succeeded = batch.succeeded_dirs().len();
        info!(
            environment = name,
            phase = kind.label(),
            succeeded,
            failed = batch.len() - succeeded,
            peak = batch.peak_concurrency(),
            "batch finished"
        );
        Ok(batch)
    }

    fn missing_tool(
        &self,
        name: &str,
        kind: JobKind,
        batch: &BatchResult,
    ) -> Option<PipelineError> {
        batch.executable_missing().then(|| PipelineError::ToolUnavailable {
            environment: name.to_owned(),
            program: self.orchestrator.program().to_owned(),
            phase: kind.label(),
        })
    }
}

/// Init and pull batches of one environment, and the error that cut them
/// short.
#[derive(Default)]
struct JobPhases {
    init: BatchResult,
    pull: BatchResult,
    fatal: Option<PipelineError>,
}

impl JobPhases {
    fn stopped(init: BatchResult, fatal: PipelineError) -> Self {
        Self {
            init,
            pull: BatchResult::default(),
            fatal: Some(fatal),
        }
    }
}

fn summarise(
    generation: Vec<GenerationResult>,
    init: &BatchResult,
    pull: &BatchResult,
) -> Vec<ClassSummary> {
    generation
        .into_iter()
        .map(|result| ClassSummary {
            init: init.get(&result.working_dir).cloned(),
            pull: pull.get(&result.working_dir).cloned(),
            name: result.class_name,
            working_dir: result.working_dir,
            backend: result.outcome,
        })
        .collect()
}

#[cfg(all(test, unix))]
mod tests;
