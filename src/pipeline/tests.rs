//! Pipeline behaviour against a scripted stand-in for the state tool.

use super::*;
use crate::generator::BACKEND_FILE_NAME;
use crate::orchestrator::{JobOutcome, STATE_FILE_NAME};
use crate::registry::SkipReason;
use crate::render::HandlebarsRenderer;
use crate::test_support::StaticLister;
use std::os::unix::fs::PermissionsExt;
use tempfile::TempDir;
use tokio::sync::watch;

const FAKE_TOOL: &str = r#"#!/bin/sh
case "$1" in
  init)
    [ -f backend.tf ] || { echo "backend.tf missing" >&2; exit 3; }
    case "$(pwd -P)" in *broken-init) echo "init exploded" >&2; exit 1 ;; esac
    echo "initialised"
    ;;
  state)
    case "$(pwd -P)" in *broken-pull) echo "no state for class" >&2; exit 2 ;; esac
    printf '{"version": 4}\n'
    ;;
  *)
    exit 64
    ;;
esac
"#;

struct Sandbox {
    root: Utf8PathBuf,
    tool: Utf8PathBuf,
    _tmp: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        let tool = root.join("fake-tool");
        std::fs::write(&tool, FAKE_TOOL).unwrap_or_else(|err| panic!("write tool: {err}"));
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755))
            .unwrap_or_else(|err| panic!("chmod tool: {err}"));
        Self {
            root,
            tool,
            _tmp: tmp,
        }
    }

    fn output_root(&self) -> Utf8PathBuf {
        self.root.join("generated")
    }

    fn pipeline(
        &self,
        lister: StaticLister,
        mode: PipelineMode,
        environments: &[&str],
        orchestrator: ProcessOrchestrator,
    ) -> Pipeline<StaticLister, HandlebarsRenderer> {
        let renderer = HandlebarsRenderer::embedded().expect("embedded template compiles");
        Pipeline::new(
            PipelineSettings {
                bucket: String::from("acme-state"),
                region: String::from("eu-west-1"),
                environments: environments.iter().map(|name| (*name).to_owned()).collect(),
                job_timeout: Some(Duration::from_secs(30)),
                mode,
            },
            lister,
            ResourceClassRegistry::new(self.output_root()),
            BackendFileGenerator::new(renderer),
            orchestrator,
        )
    }

    fn tool_orchestrator(&self) -> ProcessOrchestrator {
        ProcessOrchestrator::new(self.tool.as_str(), 2).expect("valid limit")
    }
}

fn bucket() -> StaticLister {
    StaticLister::new(&[
        "acme-prod-vpc.tfstate",
        "acme-prod-app-server.tfstate",
        "acme-prod-broken-init.tfstate",
        "acme-prod-broken-pull.tfstate",
        "acme-prod.tfstate",
        "acme-stage-vpc.tfstate",
    ])
}

fn class<'a>(summary: &'a EnvironmentSummary, name: &str) -> &'a ClassSummary {
    summary
        .classes
        .iter()
        .find(|class| class.name == name)
        .unwrap_or_else(|| panic!("missing class {name}"))
}

fn completed(report: &EnvironmentReport) -> &EnvironmentSummary {
    assert_eq!(report.fatal, None, "{report}");
    report.summary.as_ref().expect("environment completes")
}

fn outcome(result: Option<&crate::orchestrator::JobResult>) -> Option<&JobOutcome> {
    result.map(|result| &result.outcome)
}

#[tokio::test(flavor = "multi_thread")]
async fn full_run_gates_pull_on_init_success() {
    let sandbox = Sandbox::new();
    let pipeline = sandbox.pipeline(
        bucket(),
        PipelineMode::Full,
        &["acme-prod"],
        sandbox.tool_orchestrator(),
    );

    let report = pipeline.run().await;

    assert!(!report.is_success());
    let summary = completed(&report.environments[0]);
    assert_eq!(summary.discovered, 5);
    assert_eq!(summary.classes.len(), 4);
    assert_eq!(summary.skipped.len(), 1);
    assert!(matches!(
        summary.skipped[0].reason,
        SkipReason::MalformedKey(_)
    ));
    assert!(summary.peak_concurrency <= 2);

    let vpc = class(summary, "vpc");
    assert_eq!(outcome(vpc.init.as_ref()), Some(&JobOutcome::Succeeded));
    assert_eq!(outcome(vpc.pull.as_ref()), Some(&JobOutcome::Succeeded));
    let state = std::fs::read_to_string(vpc.working_dir.join(STATE_FILE_NAME))
        .unwrap_or_else(|err| panic!("read state: {err}"));
    assert_eq!(state, "{\"version\": 4}\n");

    let broken_init = class(summary, "broken-init");
    assert_eq!(
        outcome(broken_init.init.as_ref()),
        Some(&JobOutcome::Failed { exit_code: Some(1) })
    );
    assert!(broken_init.pull.is_none());

    let broken_pull = class(summary, "broken-pull");
    assert_eq!(outcome(broken_pull.init.as_ref()), Some(&JobOutcome::Succeeded));
    let pull = broken_pull.pull.as_ref().expect("pull attempted");
    assert_eq!(pull.outcome, JobOutcome::Failed { exit_code: Some(2) });
    assert_eq!(pull.output, "no state for class\n");

    assert!(class(summary, "app-server").is_success(true));
}

#[tokio::test]
async fn generate_mode_stops_after_backend_files() {
    let sandbox = Sandbox::new();
    let pipeline = sandbox.pipeline(
        bucket(),
        PipelineMode::Generate,
        &["acme-stage"],
        sandbox.tool_orchestrator(),
    );

    let report = pipeline.run().await;

    assert!(report.is_success());
    let dir = sandbox.output_root().join("acme-stage").join("vpc");
    let backend = std::fs::read_to_string(dir.join(BACKEND_FILE_NAME))
        .unwrap_or_else(|err| panic!("read backend: {err}"));
    assert!(backend.contains("acme-stage-vpc.tfstate"), "{backend}");
    assert!(!dir.join(STATE_FILE_NAME).exists());
}

#[tokio::test]
async fn listing_failure_does_not_stop_later_environments() {
    let sandbox = Sandbox::new();
    let lister = bucket().fail_prefix(
        "acme-prod",
        ListingError::CommandFailure {
            program: String::from("aws"),
            status: Some(254),
            status_text: String::from("254"),
            stderr: String::from("AccessDenied"),
        },
    );
    let pipeline = sandbox.pipeline(
        lister,
        PipelineMode::Full,
        &["acme-prod", "acme-stage"],
        sandbox.tool_orchestrator(),
    );

    let report = pipeline.run().await;

    assert!(!report.is_success());
    assert!(matches!(
        report.environments[0].fatal,
        Some(PipelineError::Listing { ref environment, .. }) if environment == "acme-prod"
    ));
    assert!(report.environments[0].summary.is_none());
    let stage = completed(&report.environments[1]);
    assert!(stage.is_success());
}

#[tokio::test]
async fn missing_tool_is_environment_fatal() {
    let sandbox = Sandbox::new();
    let orchestrator =
        ProcessOrchestrator::new("definitely-not-a-real-binary-xyz", 2).expect("valid limit");
    let pipeline = sandbox.pipeline(bucket(), PipelineMode::Full, &["acme-prod"], orchestrator);

    let report = pipeline.run().await;

    let prod = &report.environments[0];
    assert_eq!(
        prod.fatal,
        Some(PipelineError::ToolUnavailable {
            environment: String::from("acme-prod"),
            program: String::from("definitely-not-a-real-binary-xyz"),
            phase: "init",
        })
    );
    assert!(!report.is_success());

    let summary = prod.summary.as_ref().expect("generation summary kept");
    assert_eq!(summary.discovered, 5);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.classes.len(), 4);
    for class in &summary.classes {
        assert!(class.working_dir.join(BACKEND_FILE_NAME).exists(), "{}", class.name);
        assert!(matches!(
            outcome(class.init.as_ref()),
            Some(JobOutcome::LaunchFailed {
                executable_missing: true,
                ..
            })
        ));
        assert!(class.pull.is_none());
    }

    let text = report.to_string();
    assert!(text.contains("4 backend files generated, 1 skipped"), "{text}");
    assert!(text.contains("skipped acme-prod.tfstate"), "{text}");
    assert!(
        text.contains("environment acme-prod: FAILED: definitely-not-a-real-binary-xyz"),
        "{text}"
    );
}

#[tokio::test]
async fn environment_without_keys_succeeds_with_nothing_to_do() {
    let sandbox = Sandbox::new();
    let pipeline = sandbox.pipeline(
        bucket(),
        PipelineMode::Full,
        &["acme-dev"],
        sandbox.tool_orchestrator(),
    );

    let report = pipeline.run().await;

    let summary = completed(&report.environments[0]);
    assert!(summary.classes.is_empty());
    assert!(report.is_success());
}

#[tokio::test]
async fn shutdown_before_start_cancels_every_environment() {
    let sandbox = Sandbox::new();
    let (stop, shutdown) = watch::channel(true);
    let orchestrator = sandbox.tool_orchestrator().with_shutdown(shutdown);
    let pipeline = sandbox.pipeline(
        bucket(),
        PipelineMode::Full,
        &["acme-prod", "acme-stage"],
        orchestrator,
    );

    let report = pipeline.run().await;
    drop(stop);

    assert_eq!(report.environments.len(), 2);
    for env in &report.environments {
        assert!(matches!(env.fatal, Some(PipelineError::Cancelled { .. })));
        assert!(env.summary.is_none());
    }
    assert!(!sandbox.output_root().exists());
}
