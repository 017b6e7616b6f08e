//! Run summaries printed by the binary.

use std::fmt;

use camino::Utf8PathBuf;

use crate::generator::GenerationError;
use crate::orchestrator::{JobOutcome, JobResult};
use crate::pipeline::PipelineError;
use crate::registry::SkippedKey;

const OUTPUT_TAIL_LINES: usize = 5;

/// Everything that happened to one resource class.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClassSummary {
    /// Resource-class name.
    pub name: String,
    /// Working directory of the resource class.
    pub working_dir: Utf8PathBuf,
    /// Backend file path, or why it was not written.
    pub backend: Result<Utf8PathBuf, GenerationError>,
    /// Init job result; `None` when init was not attempted.
    pub init: Option<JobResult>,
    /// Pull job result; `None` when pull was not attempted.
    pub pull: Option<JobResult>,
}

impl ClassSummary {
    /// Returns `true` when every attempted step succeeded and, when
    /// `expect_jobs` is set, both jobs ran.
    #[must_use]
    pub fn is_success(&self, expect_jobs: bool) -> bool {
        let job_ok = |job: Option<&JobResult>| match job {
            Some(result) => result.outcome.is_success(),
            None => !expect_jobs,
        };
        self.backend.is_ok() && job_ok(self.init.as_ref()) && job_ok(self.pull.as_ref())
    }
}

/// What registration, generation and the jobs produced for one environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnvironmentSummary {
    /// Environment name.
    pub name: String,
    /// Directory holding the environment's resource classes.
    pub root: Utf8PathBuf,
    /// Number of keys the listing returned under the environment prefix.
    pub discovered: usize,
    /// Keys excluded during registration.
    pub skipped: Vec<SkippedKey>,
    /// Per-class results in registration order.
    pub classes: Vec<ClassSummary>,
    /// Whether init and pull were part of this run.
    pub jobs_requested: bool,
    /// Most tool subprocesses seen running at once across both batches.
    pub peak_concurrency: usize,
}

impl EnvironmentSummary {
    /// Returns `true` when every class succeeded. Skipped keys do not count
    /// as failures.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.classes
            .iter()
            .all(|class| class.is_success(self.jobs_requested))
    }
}

/// Result of one environment: whatever was summarised before it stopped,
/// plus the fatal error that stopped it, if any.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnvironmentReport {
    /// Environment name.
    pub name: String,
    /// Phases that ran; `None` when the environment failed before its keys
    /// were registered.
    pub summary: Option<EnvironmentSummary>,
    /// Error that stopped the environment early.
    pub fatal: Option<PipelineError>,
}

impl EnvironmentReport {
    /// Report for an environment that stopped before registration.
    #[must_use]
    pub fn failed(name: impl Into<String>, fatal: PipelineError) -> Self {
        Self {
            name: name.into(),
            summary: None,
            fatal: Some(fatal),
        }
    }

    /// Returns `true` when nothing was fatal and the summary succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
            && self
                .summary
                .as_ref()
                .is_some_and(EnvironmentSummary::is_success)
    }
}

/// Result of a whole run, one entry per environment in configured order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunReport {
    /// Per-environment reports.
    pub environments: Vec<EnvironmentReport>,
}

impl RunReport {
    /// Returns `true` when no environment failed fatally and every job
    /// succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.environments.iter().all(EnvironmentReport::is_success)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.environments {
            write!(f, "{report}")?;
        }
        let status = if self.is_success() { "ok" } else { "FAILED" };
        writeln!(f, "run {status}")
    }
}

impl fmt::Display for EnvironmentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(summary) = &self.summary {
            write!(f, "{summary}")?;
        }
        if let Some(err) = &self.fatal {
            writeln!(f, "environment {}: FAILED: {err}", self.name)?;
        }
        Ok(())
    }
}

impl fmt::Display for EnvironmentSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let generated = self
            .classes
            .iter()
            .filter(|class| class.backend.is_ok())
            .count();
        writeln!(
            f,
            "environment {} ({}): {} keys, {} backend files generated, {} skipped",
            self.name,
            self.root,
            self.discovered,
            generated,
            self.skipped.len()
        )?;
        for skipped in &self.skipped {
            writeln!(f, "  skipped {}: {}", skipped.key, skipped.reason)?;
        }
        for class in &self.classes {
            write_class(f, class)?;
        }
        Ok(())
    }
}

fn write_class(f: &mut fmt::Formatter<'_>, class: &ClassSummary) -> fmt::Result {
    if let Err(err) = &class.backend {
        return writeln!(f, "  {}: backend FAILED: {err}", class.name);
    }

    write!(f, "  {}: init {}", class.name, step(class.init.as_ref()))?;
    writeln!(f, ", pull {}", step(class.pull.as_ref()))?;
    for result in [&class.init, &class.pull].into_iter().flatten() {
        if !result.outcome.is_success() {
            write_tail(f, &result.output)?;
        }
    }
    Ok(())
}

fn step(result: Option<&JobResult>) -> String {
    result.map_or_else(
        || String::from("not run"),
        |result| match result.outcome {
            JobOutcome::Succeeded => format!("ok ({:.1}s)", result.elapsed.as_secs_f64()),
            ref other => other.to_string(),
        },
    )
}

fn write_tail(f: &mut fmt::Formatter<'_>, output: &str) -> fmt::Result {
    let lines = output.lines().collect::<Vec<_>>();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    for line in lines.iter().skip(start) {
        writeln!(f, "    | {line}")?;
    }
    Ok(())
}
