//! Shell-script stand-ins for `aws` and the state tool.

use std::os::unix::fs::PermissionsExt;

use camino::Utf8PathBuf;
use tempfile::TempDir;

/// Lists two classes for `acme-prod`, denies access for `acme-stage`, and
/// prints nothing for any other prefix.
const FAKE_AWS: &str = r#"#!/bin/sh
prefix=""
while [ $# -gt 0 ]; do
  [ "$1" = "--prefix" ] && prefix="$2"
  shift
done
case "$prefix" in
  acme-prod)
    printf '%s\n' '{"Contents":[{"Key":"acme-prod-vpc.tfstate"},{"Key":"acme-prod-app.tfstate"},{"Key":"acme-prod.tfstate"}],"KeyCount":3}'
    ;;
  acme-stage)
    echo "An error occurred (AccessDenied) when calling the ListObjectsV2 operation" >&2
    exit 254
    ;;
esac
"#;

const FAKE_TOOL: &str = r#"#!/bin/sh
case "$1" in
  init) [ -f backend.tf ] && echo "initialised" ;;
  state) printf '{"version": 4, "serial": 1}\n' ;;
  *) exit 64 ;;
esac
"#;

/// Temporary working directory holding the fake executables.
pub struct FakeBins {
    pub root: Utf8PathBuf,
    pub aws: Utf8PathBuf,
    pub tool: Utf8PathBuf,
    _tmp: TempDir,
}

impl FakeBins {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        let aws = write_script(&root, "fake-aws", FAKE_AWS);
        let tool = write_script(&root, "fake-tool", FAKE_TOOL);
        Self {
            root,
            aws,
            tool,
            _tmp: tmp,
        }
    }

    /// Environment variables configuring the binary against the fakes.
    pub fn env(&self, environments: &str) -> Vec<(&'static str, String)> {
        vec![
            ("STATEPULL_REGION", String::from("eu-west-1")),
            ("STATEPULL_BUCKET", String::from("acme-state")),
            ("STATEPULL_ENVIRONMENTS", environments.to_owned()),
            ("STATEPULL_AWS_BIN", self.aws.to_string()),
            ("STATEPULL_TOOL_BIN", self.tool.to_string()),
            ("STATEPULL_OUTPUT_ROOT", self.root.join("generated").to_string()),
            ("STATEPULL_CONCURRENCY_LIMIT", String::from("2")),
        ]
    }

    pub fn class_dir(&self, environment: &str, class: &str) -> Utf8PathBuf {
        self.root.join("generated").join(environment).join(class)
    }
}

fn write_script(root: &Utf8PathBuf, name: &str, body: &str) -> Utf8PathBuf {
    let path = root.join(name);
    std::fs::write(&path, body).unwrap_or_else(|err| panic!("write {path}: {err}"));
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .unwrap_or_else(|err| panic!("chmod {path}: {err}"));
    path
}
