//! Configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default root of the generated directory tree.
pub const DEFAULT_OUTPUT_ROOT: &str = "generated";

/// Default external state CLI.
pub const DEFAULT_TOOL_BIN: &str = "terraform";

/// Settings merged from defaults, `statepull.toml`, and `STATEPULL_*`
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "STATEPULL",
    discovery(
        app_name = "statepull",
        env_var = "STATEPULL_CONFIG_PATH",
        config_file_name = "statepull.toml",
        dotfile_name = ".statepull.toml",
        project_file_name = "statepull.toml"
    )
)]
pub struct StatepullConfig {
    /// Region hosting the state bucket.
    pub region: String,
    /// Bucket holding one `.tfstate` object per resource class.
    pub bucket: String,
    /// Comma-separated environment names, each used as a key prefix.
    pub environments: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    #[ortho_config(default = "info".to_owned())]
    pub log_level: String,
    /// Optional file receiving a copy of every log event; truncated on
    /// each run.
    pub log_file: Option<String>,
    /// Root directory of the generated `<environment>/<class>` tree.
    #[ortho_config(default = DEFAULT_OUTPUT_ROOT.to_owned())]
    pub output_root: String,
    /// Directory holding a `backend.hbs` override for the embedded template.
    pub template_dir: Option<String>,
    /// External state CLI launched for `init` and `state pull`.
    #[ortho_config(default = DEFAULT_TOOL_BIN.to_owned())]
    pub tool_bin: String,
    /// `aws` executable used to list the bucket.
    #[ortho_config(default = crate::storage::DEFAULT_AWS_BIN.to_owned())]
    pub aws_bin: String,
    /// Maximum number of tool subprocesses running at once.
    #[ortho_config(default = 4)]
    pub concurrency_limit: usize,
    /// Wall-clock budget per job in seconds; `0` disables the timeout.
    #[ortho_config(default = 600)]
    pub job_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn hint(&self) -> String {
        format!(
            "set {} or add {} to [statepull] in statepull.toml",
            self.env_var, self.toml_key
        )
    }
}

const REQUIRED_TEXT: [FieldMetadata; 5] = [
    FieldMetadata::new("state bucket region", "STATEPULL_REGION", "region"),
    FieldMetadata::new("state bucket name", "STATEPULL_BUCKET", "bucket"),
    FieldMetadata::new("output root", "STATEPULL_OUTPUT_ROOT", "output_root"),
    FieldMetadata::new("state tool binary", "STATEPULL_TOOL_BIN", "tool_bin"),
    FieldMetadata::new("aws binary", "STATEPULL_AWS_BIN", "aws_bin"),
];

impl StatepullConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("statepull")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide values via environment variables or configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is blank
    /// and [`ConfigError::InvalidValue`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let values = [
            &self.region,
            &self.bucket,
            &self.output_root,
            &self.tool_bin,
            &self.aws_bin,
        ];
        for (value, metadata) in values.into_iter().zip(&REQUIRED_TEXT) {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "missing {}: {}",
                    metadata.description,
                    metadata.hint()
                )));
            }
        }

        if self.environment_names().is_empty() {
            let metadata =
                FieldMetadata::new("environment names", "STATEPULL_ENVIRONMENTS", "environments");
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.hint()
            )));
        }

        // Names become directories directly under the output root.
        if let Some(name) = self
            .environment_names()
            .into_iter()
            .find(|name| name == "." || name == ".." || name.contains(['/', '\\']))
        {
            return Err(ConfigError::InvalidValue(format!(
                "environment name {name:?} is not a plain directory name: fix \
                 STATEPULL_ENVIRONMENTS or environments in [statepull] in statepull.toml"
            )));
        }

        if self.concurrency_limit == 0 {
            let metadata = FieldMetadata::new(
                "concurrency limit",
                "STATEPULL_CONCURRENCY_LIMIT",
                "concurrency_limit",
            );
            return Err(ConfigError::InvalidValue(format!(
                "{} must be at least 1: {}",
                metadata.description,
                metadata.hint()
            )));
        }

        for (value, field) in [
            (self.log_file.as_deref(), "log_file"),
            (self.template_dir.as_deref(), "template_dir"),
        ] {
            if value.is_some_and(|v| v.trim().is_empty()) {
                return Err(ConfigError::InvalidValue(format!(
                    "{field} must not be blank when set"
                )));
            }
        }
        Ok(())
    }

    /// Splits `environments` on commas, trimming blanks and dropping repeats
    /// while keeping first-seen order.
    #[must_use]
    pub fn environment_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.environments.split(',').map(str::trim) {
            if !name.is_empty() && !names.iter().any(|seen| seen == name) {
                names.push(name.to_owned());
            }
        }
        names
    }

    /// Per-job timeout, or `None` when disabled.
    #[must_use]
    pub const fn job_timeout(&self) -> Option<Duration> {
        match self.job_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configured value is outside its accepted range.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
