//! Binary entry point for the statepull CLI.

use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

use statepull::{
    AwsCliLister, BackendFileGenerator, BucketLocation, HandlebarsRenderer, Pipeline,
    PipelineMode, PipelineSettings, ProcessOrchestrator, ResourceClassRegistry, StatepullConfig,
    init_logging,
};

mod cli;

use cli::{Cli, GenerateCommand, RunCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unknown environment {name}; configured environments: {configured}")]
    UnknownEnvironment { name: String, configured: String },
    #[error("logging setup failed: {0}")]
    Logging(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("orchestrator error: {0}")]
    Orchestrator(String),
}

/// Settings taken from the command line that override loaded configuration.
#[derive(Debug, Default)]
struct Overrides {
    environments: Vec<String>,
    concurrency: Option<usize>,
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<bool, CliError> {
    match cli {
        Cli::Run(RunCommand {
            environments,
            concurrency,
            timeout,
        }) => {
            let overrides = Overrides {
                environments,
                concurrency,
                timeout,
            };
            execute(PipelineMode::Full, overrides).await
        }
        Cli::Generate(GenerateCommand { environments }) => {
            let overrides = Overrides {
                environments,
                ..Overrides::default()
            };
            execute(PipelineMode::Generate, overrides).await
        }
    }
}

async fn execute(mode: PipelineMode, overrides: Overrides) -> Result<bool, CliError> {
    let mut config =
        StatepullConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    apply_overrides(&mut config, &overrides);
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let environments = select_environments(&config.environment_names(), &overrides.environments)?;

    init_logging(&config.log_level, config.log_file.as_deref().map(Utf8Path::new))
        .map_err(|err| CliError::Logging(err.to_string()))?;

    let renderer = match config.template_dir.as_deref() {
        Some(dir) => HandlebarsRenderer::from_dir(Utf8Path::new(dir)),
        None => HandlebarsRenderer::embedded(),
    }
    .map_err(|err| CliError::Template(err.to_string()))?;

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(forward_interrupt(stop));
    let orchestrator = ProcessOrchestrator::new(&config.tool_bin, config.concurrency_limit)
        .map_err(|err| CliError::Orchestrator(err.to_string()))?
        .with_shutdown(shutdown);

    let lister = AwsCliLister::with_process_runner(
        &config.aws_bin,
        BucketLocation {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
        },
    );
    let settings = PipelineSettings {
        bucket: config.bucket.clone(),
        region: config.region.clone(),
        environments,
        job_timeout: config.job_timeout(),
        mode,
    };
    let pipeline = Pipeline::new(
        settings,
        lister,
        ResourceClassRegistry::new(&config.output_root),
        BackendFileGenerator::new(renderer),
        orchestrator,
    );

    let report = pipeline.run().await;
    write!(io::stdout(), "{report}").ok();
    Ok(report.is_success())
}

fn apply_overrides(config: &mut StatepullConfig, overrides: &Overrides) {
    if let Some(limit) = overrides.concurrency {
        config.concurrency_limit = limit;
    }
    if let Some(secs) = overrides.timeout {
        config.job_timeout_secs = secs;
    }
}

/// Keeps configured order; an empty selection means every environment.
fn select_environments(configured: &[String], selected: &[String]) -> Result<Vec<String>, CliError> {
    if let Some(unknown) = selected.iter().find(|name| !configured.contains(name)) {
        return Err(CliError::UnknownEnvironment {
            name: unknown.clone(),
            configured: configured.join(", "),
        });
    }
    Ok(configured
        .iter()
        .filter(|name| selected.is_empty() || selected.contains(name))
        .cloned()
        .collect())
}

async fn forward_interrupt(stop: watch::Sender<bool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received; cancelling running jobs");
        stop.send(true).ok();
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
