//! Bounded-parallel execution of the external state tool.
//!
//! Each job runs as one OS subprocess on its own task. A semaphore caps how
//! many run at once and a `JoinSet` is the batch barrier. Failures of any kind
//! are recorded per job; the batch itself only fails when the job list is
//! invalid.
//!
//! On Unix every job leads its own process group, so a timeout or cancel
//! reaches the tool's helper processes as well as the tool itself.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{Signal, killpg};
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(unix)]
use tokio::time::timeout;

mod capture;
mod job;

use capture::OutputCapture;
pub use job::{BatchResult, Job, JobKind, JobOutcome, JobResult, OutputTarget, STATE_FILE_NAME};

/// Default time allowed for a child's pipes to drain after it exits.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Default time a job's processes get to exit after `SIGTERM` before they
/// are sent `SIGKILL`.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Errors that reject a batch before any job is launched.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OrchestratorError {
    /// Raised when the concurrency limit is zero.
    #[error("concurrency limit must be at least 1")]
    InvalidConcurrency,
    /// Raised when two jobs in one batch share a working directory.
    #[error("more than one job targets {path}")]
    DuplicateDirectory {
        /// Working directory listed twice.
        path: Utf8PathBuf,
    },
}

/// Receiver side of the shutdown signal. Sending `true` cancels the batch.
pub type ShutdownSignal = watch::Receiver<bool>;

/// Runs [`Job`]s for one program with bounded parallelism.
#[derive(Clone, Debug)]
pub struct ProcessOrchestrator {
    program: Arc<str>,
    concurrency_limit: usize,
    shutdown: ShutdownSignal,
    drain_grace: Duration,
    terminate_grace: Duration,
}

impl ProcessOrchestrator {
    /// Creates an orchestrator launching `program` for every job.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidConcurrency`] when
    /// `concurrency_limit` is zero.
    pub fn new(
        program: impl Into<String>,
        concurrency_limit: usize,
    ) -> Result<Self, OrchestratorError> {
        if concurrency_limit == 0 {
            return Err(OrchestratorError::InvalidConcurrency);
        }
        let (_, shutdown) = watch::channel(false);
        Ok(Self {
            program: Arc::from(program.into()),
            concurrency_limit,
            shutdown,
            drain_grace: DEFAULT_DRAIN_GRACE,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        })
    }

    /// Wires a shutdown signal; once it reads `true`, queued jobs are not
    /// launched and running ones are killed.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Overrides how long output pipes may drain after a child exits.
    #[must_use]
    pub const fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Overrides how long a timed-out or cancelled job may take to exit
    /// after `SIGTERM` before it is killed outright.
    #[must_use]
    pub const fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Program launched for every job.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Maximum number of concurrent subprocesses.
    #[must_use]
    pub const fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Runs every job and returns one result per working directory.
    ///
    /// Jobs start in list order as slots free up; completion order is
    /// unspecified. Non-zero exits, launch failures, timeouts and
    /// cancellations are recorded per job and never stop sibling jobs.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::DuplicateDirectory`] when two jobs share
    /// a working directory; nothing is launched in that case.
    pub async fn run_batch(&self, jobs: Vec<Job>) -> Result<BatchResult, OrchestratorError> {
        reject_duplicates(&jobs)?;

        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let tracker = Arc::new(ConcurrencyTracker::default());
        let mut pending = jobs
            .iter()
            .map(|job| (job.working_dir().to_path_buf(), job.clone()))
            .collect::<BTreeMap<_, _>>();
        let mut tasks = JoinSet::new();

        for job in jobs {
            let slot = Slot {
                program: Arc::clone(&self.program),
                semaphore: Arc::clone(&semaphore),
                tracker: Arc::clone(&tracker),
                shutdown: self.shutdown.clone(),
                drain_grace: self.drain_grace,
                terminate_grace: self.terminate_grace,
            };
            tasks.spawn(run_job(job, slot));
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    pending.remove(result.job.working_dir());
                    results.insert(result.job.working_dir().to_path_buf(), result);
                }
                Err(err) => warn!(error = %err, "job task ended abnormally"),
            }
        }

        for (dir, job) in pending {
            results.insert(
                dir,
                JobResult {
                    job,
                    outcome: JobOutcome::Failed { exit_code: None },
                    output: String::from("job task ended before reporting a result"),
                    elapsed: Duration::ZERO,
                },
            );
        }

        Ok(BatchResult::new(results, tracker.peak()))
    }
}

fn reject_duplicates(jobs: &[Job]) -> Result<(), OrchestratorError> {
    let mut seen = BTreeSet::new();
    for job in jobs {
        if !seen.insert(job.working_dir()) {
            return Err(OrchestratorError::DuplicateDirectory {
                path: job.working_dir().to_path_buf(),
            });
        }
    }
    Ok(())
}

struct Slot {
    program: Arc<str>,
    semaphore: Arc<Semaphore>,
    tracker: Arc<ConcurrencyTracker>,
    shutdown: ShutdownSignal,
    drain_grace: Duration,
    terminate_grace: Duration,
}

#[derive(Default)]
struct ConcurrencyTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyTracker {
    fn enter(self: &Arc<Self>) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(Arc::clone(self))
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct ActiveGuard(Arc<ConcurrencyTracker>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Exit {
    Status(io::Result<ExitStatus>),
    TimedOut(Duration),
    Cancelled,
}

async fn run_job(job: Job, slot: Slot) -> JobResult {
    let permit = tokio::select! {
        biased;
        () = shutdown_requested(slot.shutdown.clone()) => None,
        permit = Arc::clone(&slot.semaphore).acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        info!(dir = %job.working_dir(), "job cancelled before launch");
        return JobResult {
            job,
            outcome: JobOutcome::Cancelled,
            output: String::new(),
            elapsed: Duration::ZERO,
        };
    };
    // Time spent queued for a slot is not run time.
    let started = Instant::now();

    let command_line = job.command_line(&slot.program);
    let (mut command, output_file) = match build_command(&slot.program, &job) {
        Ok(built) => built,
        Err(err) => {
            warn!(dir = %job.working_dir(), error = %err, "could not prepare job output");
            let outcome = launch_failure(&err, false);
            return finished(job, outcome, String::new(), started);
        }
    };

    debug!(dir = %job.working_dir(), command = %command_line, "launching job");
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(dir = %job.working_dir(), command = %command_line, error = %err, "job failed to launch");
            let outcome = launch_failure(&err, err.kind() == io::ErrorKind::NotFound);
            return finished(job, outcome, String::new(), started);
        }
    };
    let active = slot.tracker.enter();

    let capture = output_file
        .is_none()
        .then(|| OutputCapture::start(child.stdout.take(), child.stderr.take()));

    let exit = wait_for_exit(&mut child, job.timeout(), slot.shutdown.clone()).await;
    if !matches!(exit, Exit::Status(_)) {
        terminate(&mut child, job.working_dir(), slot.terminate_grace).await;
    }
    drop(active);

    let mut output = match capture {
        Some(capture) => capture.finish(slot.drain_grace).await,
        None => String::new(),
    };
    let outcome = match exit {
        Exit::Status(Ok(status)) if status.success() => JobOutcome::Succeeded,
        Exit::Status(Ok(status)) => JobOutcome::Failed {
            exit_code: status.code(),
        },
        Exit::Status(Err(err)) => {
            output.push_str(&format!("\nfailed to wait for process: {err}"));
            JobOutcome::Failed { exit_code: None }
        }
        Exit::TimedOut(after) => JobOutcome::TimedOut { after },
        Exit::Cancelled => JobOutcome::Cancelled,
    };

    if let (Some(path), false) = (output_file.as_ref(), outcome.is_success()) {
        output = std::fs::read_to_string(path).unwrap_or_default();
    }

    if outcome.is_success() {
        info!(dir = %job.working_dir(), command = %command_line, "job succeeded");
    } else {
        warn!(dir = %job.working_dir(), command = %command_line, %outcome, "job did not succeed");
    }
    finished(job, outcome, output, started)
}

fn build_command(program: &str, job: &Job) -> io::Result<(Command, Option<Utf8PathBuf>)> {
    // A missing cwd also surfaces as NotFound from spawn; keep it apart from a
    // missing executable.
    if !job.working_dir().is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("working directory {} does not exist", job.working_dir()),
        ));
    }

    let mut command = Command::new(program);
    command
        .args(job.args())
        .current_dir(job.working_dir())
        .stdin(Stdio::null())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    match job.output() {
        OutputTarget::Capture => {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
            Ok((command, None))
        }
        OutputTarget::File(name) => {
            let path = job.working_dir().join(name);
            let stdout = std::fs::File::create(&path)?;
            let stderr = stdout.try_clone()?;
            command.stdout(stdout).stderr(stderr);
            Ok((command, Some(path)))
        }
    }
}

async fn wait_for_exit(
    child: &mut Child,
    budget: Option<Duration>,
    shutdown: ShutdownSignal,
) -> Exit {
    tokio::select! {
        status = child.wait() => Exit::Status(status),
        () = expire(budget) => Exit::TimedOut(budget.unwrap_or_default()),
        () = shutdown_requested(shutdown) => Exit::Cancelled,
    }
}

/// Stops a job that overran or was cancelled, along with anything it spawned.
///
/// The process group gets `SIGTERM` and up to `grace` to exit, then `SIGKILL`
/// for whatever remains. The direct child is killed as a fallback when its
/// group cannot be signalled.
#[cfg(unix)]
async fn terminate(child: &mut Child, dir: &Utf8Path, grace: Duration) {
    let group = child
        .id()
        .and_then(|id| i32::try_from(id).ok())
        .map(Pid::from_raw);
    if let Some(group) = group {
        signal_group(group, Signal::SIGTERM, dir);
        let exited = timeout(grace, child.wait()).await.is_ok();
        // Helpers may ignore SIGTERM or outlive the group leader.
        signal_group(group, Signal::SIGKILL, dir);
        if exited {
            return;
        }
    }
    kill_child(child, dir).await;
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, dir: &Utf8Path, _grace: Duration) {
    kill_child(child, dir).await;
}

#[cfg(unix)]
fn signal_group(group: Pid, signal: Signal, dir: &Utf8Path) {
    match killpg(group, signal) {
        Ok(()) => debug!(%dir, %group, signal = signal.as_str(), "signalled job process group"),
        Err(Errno::ESRCH) => {}
        Err(err) => {
            warn!(%dir, %group, signal = signal.as_str(), error = %err, "failed to signal job process group");
        }
    }
}

async fn kill_child(child: &mut Child, dir: &Utf8Path) {
    if let Err(err) = child.kill().await {
        warn!(%dir, error = %err, "failed to kill job process");
    }
}

async fn expire(budget: Option<Duration>) {
    match budget {
        Some(after) => sleep(after).await,
        None => std::future::pending().await,
    }
}

/// Resolves once shutdown is requested; never resolves if the sender is gone
/// without having requested it.
async fn shutdown_requested(mut shutdown: ShutdownSignal) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn launch_failure(err: &io::Error, executable_missing: bool) -> JobOutcome {
    JobOutcome::LaunchFailed {
        message: err.to_string(),
        executable_missing,
    }
}

fn finished(job: Job, outcome: JobOutcome, output: String, started: Instant) -> JobResult {
    JobResult {
        job,
        outcome,
        output,
        elapsed: started.elapsed(),
    }
}
