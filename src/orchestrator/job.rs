//! Job definitions and their terminal results.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;

/// File written by the pull job inside its working directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// Built-in state tool subcommands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobKind {
    /// Prepares the working directory (`init -input=false`).
    Init,
    /// Writes the remote state snapshot to [`STATE_FILE_NAME`] (`state pull`).
    Pull,
}

impl JobKind {
    /// Arguments passed to the state tool.
    #[must_use]
    pub fn args(self) -> Vec<String> {
        let args: &[&str] = match self {
            Self::Init => &["init", "-input=false"],
            Self::Pull => &["state", "pull"],
        };
        args.iter().map(|arg| (*arg).to_owned()).collect()
    }

    /// Where the job's combined output goes.
    #[must_use]
    pub fn output(self) -> OutputTarget {
        match self {
            Self::Init => OutputTarget::Capture,
            Self::Pull => OutputTarget::File(String::from(STATE_FILE_NAME)),
        }
    }

    /// Short label used in logs and reports.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Pull => "pull",
        }
    }
}

/// Destination of a job's combined stdout and stderr.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutputTarget {
    /// Collect output in memory, interleaved as the OS delivers it.
    Capture,
    /// Redirect both streams into this file inside the working directory.
    File(String),
}

/// One subprocess to run in a working directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Job {
    working_dir: Utf8PathBuf,
    args: Vec<String>,
    output: OutputTarget,
    timeout: Option<Duration>,
}

impl Job {
    /// Creates a job capturing its output, with no timeout.
    #[must_use]
    pub fn new(working_dir: impl Into<Utf8PathBuf>, args: Vec<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            args,
            output: OutputTarget::Capture,
            timeout: None,
        }
    }

    /// Creates a job running one of the built-in subcommands.
    #[must_use]
    pub fn for_kind(kind: JobKind, working_dir: impl Into<Utf8PathBuf>) -> Self {
        Self::new(working_dir, kind.args()).with_output(kind.output())
    }

    /// Replaces the output target.
    #[must_use]
    pub fn with_output(mut self, output: OutputTarget) -> Self {
        self.output = output;
        self
    }

    /// Sets the wall-clock budget after which the job is killed.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Directory the subprocess runs in.
    #[must_use]
    pub fn working_dir(&self) -> &Utf8Path {
        &self.working_dir
    }

    /// Arguments passed to the program.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Output destination.
    #[must_use]
    pub const fn output(&self) -> &OutputTarget {
        &self.output
    }

    /// Optional wall-clock budget.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Renders the invocation as a shell command line for logs.
    #[must_use]
    pub fn command_line(&self, program: &str) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(escape(program.into()).into_owned());
        parts.extend(
            self.args
                .iter()
                .map(|arg| escape(arg.as_str().into()).into_owned()),
        );
        if let OutputTarget::File(name) = &self.output {
            parts.push(format!("> {} 2>&1", escape(name.as_str().into())));
        }
        parts.join(" ")
    }
}

/// Terminal status of a job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    /// The process exited with status zero.
    Succeeded,
    /// The process exited non-zero, or without a code when killed by a
    /// signal.
    Failed {
        /// Exit code, when the OS reported one.
        exit_code: Option<i32>,
    },
    /// The process could not be started.
    LaunchFailed {
        /// Operating system error string.
        message: String,
        /// Whether the program itself was not found.
        executable_missing: bool,
    },
    /// The process exceeded its timeout and was killed.
    TimedOut {
        /// Budget that was exceeded.
        after: Duration,
    },
    /// The batch was asked to stop before the job finished.
    Cancelled,
}

impl JobOutcome {
    /// Returns `true` for [`JobOutcome::Succeeded`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed {
                exit_code: Some(code),
            } => write!(f, "failed (exit {code})"),
            Self::Failed { exit_code: None } => f.write_str("failed (no exit status)"),
            Self::LaunchFailed { message, .. } => write!(f, "failed to launch: {message}"),
            Self::TimedOut { after } => write!(f, "timed out after {:.1}s", after.as_secs_f64()),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal state of one job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobResult {
    /// The job as submitted.
    pub job: Job,
    /// How it ended.
    pub outcome: JobOutcome,
    /// Combined output; for file targets, filled only when the job failed.
    pub output: String,
    /// Wall-clock run time from launch to completion; zero when the job never started.
    pub elapsed: Duration,
}

/// Per-directory results of a batch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BatchResult {
    results: BTreeMap<Utf8PathBuf, JobResult>,
    peak_concurrency: usize,
}

impl BatchResult {
    pub(crate) const fn new(
        results: BTreeMap<Utf8PathBuf, JobResult>,
        peak_concurrency: usize,
    ) -> Self {
        Self {
            results,
            peak_concurrency,
        }
    }

    /// Number of jobs in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns `true` when the batch had no jobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Result for the job that ran in `working_dir`.
    #[must_use]
    pub fn get(&self, working_dir: &Utf8Path) -> Option<&JobResult> {
        self.results.get(working_dir)
    }

    /// Results ordered by working directory.
    pub fn iter(&self) -> impl Iterator<Item = (&Utf8PathBuf, &JobResult)> {
        self.results.iter()
    }

    /// Most subprocesses observed running at the same time.
    #[must_use]
    pub const fn peak_concurrency(&self) -> usize {
        self.peak_concurrency
    }

    /// Returns `true` when every job succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.results.values().all(|result| result.outcome.is_success())
    }

    /// Working directories whose job succeeded.
    #[must_use]
    pub fn succeeded_dirs(&self) -> Vec<Utf8PathBuf> {
        self.results
            .iter()
            .filter(|(_, result)| result.outcome.is_success())
            .map(|(dir, _)| dir.clone())
            .collect()
    }

    /// Returns `true` when the batch was non-empty and every job failed to
    /// launch because the program was missing.
    #[must_use]
    pub fn executable_missing(&self) -> bool {
        !self.results.is_empty()
            && self.results.values().all(|result| {
                matches!(
                    result.outcome,
                    JobOutcome::LaunchFailed {
                        executable_missing: true,
                        ..
                    }
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn built_in_kinds_map_to_tool_arguments() {
        let init = Job::for_kind(JobKind::Init, "generated/env/vpc");
        let pull = Job::for_kind(JobKind::Pull, "generated/env/vpc");

        assert_eq!(init.args(), ["init", "-input=false"]);
        assert_eq!(init.output(), &OutputTarget::Capture);
        assert_eq!(pull.args(), ["state", "pull"]);
        assert_eq!(pull.output(), &OutputTarget::File(String::from("state.json")));
    }

    #[rstest]
    fn command_line_escapes_arguments_and_shows_redirect() {
        let job = Job::new("dir", vec![String::from("a b"), String::from("plain")])
            .with_output(OutputTarget::File(String::from("out file.json")));

        assert_eq!(
            job.command_line("terraform"),
            "terraform 'a b' plain > 'out file.json' 2>&1"
        );
    }

    #[rstest]
    #[case(JobOutcome::Succeeded, "succeeded")]
    #[case(JobOutcome::Failed { exit_code: Some(1) }, "failed (exit 1)")]
    #[case(JobOutcome::Failed { exit_code: None }, "failed (no exit status)")]
    #[case(JobOutcome::TimedOut { after: Duration::from_secs(30) }, "timed out after 30.0s")]
    #[case(JobOutcome::TimedOut { after: Duration::from_millis(300) }, "timed out after 0.3s")]
    #[case(JobOutcome::Cancelled, "cancelled")]
    fn outcome_display(#[case] outcome: JobOutcome, #[case] expected: &str) {
        assert_eq!(outcome.to_string(), expected);
    }

    #[rstest]
    fn empty_batch_does_not_count_as_missing_executable() {
        assert!(!BatchResult::default().executable_missing());
        assert!(BatchResult::default().all_succeeded());
    }
}
