//! Remote state discovery through the `aws` CLI.
//!
//! Listing shells out to `aws s3api list-objects-v2`, which pages through the
//! bucket itself and prints one JSON document. The prefix is handed to S3 as
//! a literal prefix filter.

use std::ffi::OsString;

use serde::Deserialize;
use thiserror::Error;

use crate::command::{CommandError, CommandRunner, ProcessCommandRunner};

/// Default `aws` CLI binary name.
pub const DEFAULT_AWS_BIN: &str = "aws";

/// Lists object keys stored under a literal prefix.
pub trait ObjectLister {
    /// Returns every key starting with `prefix`, in listing order.
    ///
    /// # Errors
    ///
    /// Returns [`ListingError`] when storage cannot be reached or its
    /// response cannot be understood.
    fn list(&self, prefix: &str) -> Result<Vec<String>, ListingError>;
}

/// Errors raised while listing objects.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ListingError {
    /// Raised when the listing command cannot be started.
    #[error(transparent)]
    Runner(#[from] CommandError),
    /// Raised when the listing command exits non-zero (for example on
    /// access denied or an unknown bucket).
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when the JSON response cannot be parsed.
    #[error("failed to parse object listing for bucket {bucket}: {message}")]
    Parse {
        /// Bucket being listed.
        bucket: String,
        /// Parser error message.
        message: String,
    },
}

/// Bucket coordinates used by [`AwsCliLister`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BucketLocation {
    /// Bucket name.
    pub bucket: String,
    /// Bucket region.
    pub region: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsResponse {
    #[serde(default)]
    contents: Vec<ObjectSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectSummary {
    key: String,
}

/// [`ObjectLister`] that shells out to `aws s3api list-objects-v2`.
#[derive(Clone, Debug)]
pub struct AwsCliLister<R: CommandRunner> {
    aws_bin: String,
    location: BucketLocation,
    runner: R,
}

impl AwsCliLister<ProcessCommandRunner> {
    /// Creates a lister wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(aws_bin: impl Into<String>, location: BucketLocation) -> Self {
        Self::new(aws_bin, location, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> AwsCliLister<R> {
    /// Creates a lister using the provided runner.
    #[must_use]
    pub fn new(aws_bin: impl Into<String>, location: BucketLocation, runner: R) -> Self {
        Self {
            aws_bin: aws_bin.into(),
            location,
            runner,
        }
    }

    fn build_list_args(&self, prefix: &str) -> Vec<OsString> {
        vec![
            OsString::from("s3api"),
            OsString::from("list-objects-v2"),
            OsString::from("--bucket"),
            OsString::from(&self.location.bucket),
            OsString::from("--prefix"),
            OsString::from(prefix),
            OsString::from("--region"),
            OsString::from(&self.location.region),
            OsString::from("--output"),
            OsString::from("json"),
        ]
    }

    fn parse_keys(&self, stdout: &str) -> Result<Vec<String>, ListingError> {
        // An empty bucket listing prints nothing at all.
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str::<ListObjectsResponse>(stdout)
            .map(|response| {
                response
                    .contents
                    .into_iter()
                    .map(|object| object.key)
                    .collect()
            })
            .map_err(|err| ListingError::Parse {
                bucket: self.location.bucket.clone(),
                message: err.to_string(),
            })
    }
}

impl<R: CommandRunner> ObjectLister for AwsCliLister<R> {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ListingError> {
        let args = self.build_list_args(prefix);
        let output = self.runner.run(&self.aws_bin, &args)?;
        if !output.is_success() {
            return Err(ListingError::CommandFailure {
                program: self.aws_bin.clone(),
                status: output.code,
                status_text: output.status_text(),
                stderr: output.stderr,
            });
        }
        self.parse_keys(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedRunner, json_listing};
    use rstest::{fixture, rstest};

    #[fixture]
    fn location() -> BucketLocation {
        BucketLocation {
            bucket: String::from("acme-state"),
            region: String::from("eu-west-1"),
        }
    }

    #[rstest]
    fn list_passes_bucket_prefix_and_region(location: BucketLocation) {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            json_listing(&["acme-prod-vpc.tfstate", "acme-prod-app.tfstate"]),
            "",
        );
        let lister = AwsCliLister::new(DEFAULT_AWS_BIN, location, runner.clone());

        let keys = lister.list("acme-prod").expect("listing succeeds");

        assert_eq!(keys, vec!["acme-prod-vpc.tfstate", "acme-prod-app.tfstate"]);
        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(
            invocations[0].command_string(),
            "aws s3api list-objects-v2 --bucket acme-state --prefix acme-prod \
             --region eu-west-1 --output json"
        );
    }

    #[rstest]
    #[case("")]
    #[case("  \n")]
    #[case("{\"RequestCharged\": null}")]
    fn empty_listings_yield_no_keys(location: BucketLocation, #[case] stdout: &str) {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), stdout, "");
        let lister = AwsCliLister::new(DEFAULT_AWS_BIN, location, runner);

        assert!(lister.list("acme").expect("listing succeeds").is_empty());
    }

    #[rstest]
    fn access_denied_surfaces_command_failure(location: BucketLocation) {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(254), "", "An error occurred (AccessDenied)");
        let lister = AwsCliLister::new(DEFAULT_AWS_BIN, location, runner);

        let err = lister.list("acme").expect_err("listing fails");

        assert_eq!(
            err,
            ListingError::CommandFailure {
                program: String::from("aws"),
                status: Some(254),
                status_text: String::from("254"),
                stderr: String::from("An error occurred (AccessDenied)"),
            }
        );
    }

    #[rstest]
    fn malformed_json_is_a_parse_error(location: BucketLocation) {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "{not json", "");
        let lister = AwsCliLister::new(DEFAULT_AWS_BIN, location, runner);

        assert!(matches!(
            lister.list("acme"),
            Err(ListingError::Parse { ref bucket, .. }) if bucket == "acme-state"
        ));
    }

    #[rstest]
    fn spawn_failure_is_a_runner_error(location: BucketLocation) {
        let lister = AwsCliLister::new("definitely-not-a-real-binary-xyz", location, ProcessCommandRunner);

        assert!(matches!(
            lister.list("acme"),
            Err(ListingError::Runner(CommandError::Spawn { .. }))
        ));
    }
}
