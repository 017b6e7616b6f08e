//! Materialises `backend.tf` for every resource class of an environment.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{info, warn};

use crate::registry::{Environment, ResourceClass};
use crate::render::{BACKEND_TEMPLATE, BackendContext, RenderError, TemplateRenderer};

/// File name of the generated backend configuration.
pub const BACKEND_FILE_NAME: &str = "backend.tf";

/// Errors raised while generating a single backend file.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GenerationError {
    /// Raised when the working directory cannot be created.
    #[error("failed to create directory {path}: {message}")]
    Directory {
        /// Directory that could not be created.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the template collaborator fails.
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Outcome of generating one resource class's backend file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GenerationResult {
    /// Resource-class name.
    pub class_name: String,
    /// Working directory of the resource class.
    pub working_dir: Utf8PathBuf,
    /// Path of the written file, or why generation failed.
    pub outcome: Result<Utf8PathBuf, GenerationError>,
}

impl GenerationResult {
    /// Returns `true` when the backend file was written.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Creates working directories and renders backend files into them.
#[derive(Debug)]
pub struct BackendFileGenerator<T: TemplateRenderer> {
    renderer: T,
}

impl<T: TemplateRenderer> BackendFileGenerator<T> {
    /// Creates a generator using `renderer` for the `backend` template.
    #[must_use]
    pub const fn new(renderer: T) -> Self {
        Self { renderer }
    }

    /// Generates a backend file for every resource class in `environment`.
    ///
    /// Existing directories are reused and existing files overwritten. A
    /// failure for one resource class is recorded in its result and does not
    /// stop the others.
    #[must_use]
    pub fn generate(
        &self,
        environment: &Environment,
        bucket: &str,
        region: &str,
    ) -> Vec<GenerationResult> {
        environment
            .resource_classes()
            .iter()
            .map(|class| {
                let outcome = self.generate_one(class, bucket, region);
                match &outcome {
                    Ok(path) => info!(environment = environment.name(), %path, "generated backend file"),
                    Err(err) => warn!(
                        environment = environment.name(),
                        class = class.name(),
                        error = %err,
                        "backend generation failed"
                    ),
                }
                GenerationResult {
                    class_name: class.name().to_owned(),
                    working_dir: class.working_dir().to_path_buf(),
                    outcome,
                }
            })
            .collect()
    }

    fn generate_one(
        &self,
        class: &ResourceClass,
        bucket: &str,
        region: &str,
    ) -> Result<Utf8PathBuf, GenerationError> {
        ensure_directory(class.working_dir())?;
        let output = class.working_dir().join(BACKEND_FILE_NAME);
        let context = BackendContext {
            bucket: bucket.to_owned(),
            key: class.source_key().to_owned(),
            region: region.to_owned(),
        };
        self.renderer
            .render_to(BACKEND_TEMPLATE, &context, &output)?;
        Ok(output)
    }
}

fn ensure_directory(path: &Utf8Path) -> Result<(), GenerationError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| {
        GenerationError::Directory {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceClassRegistry;
    use crate::render::HandlebarsRenderer;
    use rstest::rstest;
    use tempfile::TempDir;

    struct FailingRenderer {
        failing_key: &'static str,
        inner: HandlebarsRenderer,
    }

    impl TemplateRenderer for FailingRenderer {
        fn render_to(
            &self,
            template: &str,
            context: &BackendContext,
            output: &Utf8Path,
        ) -> Result<(), RenderError> {
            if context.key == self.failing_key {
                return Err(RenderError::Render {
                    name: template.to_owned(),
                    message: String::from("simulated failure"),
                });
            }
            self.inner.render_to(template, context, output)
        }
    }

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("generated"))
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        (tmp, root)
    }

    fn read(path: &Utf8Path) -> String {
        std::fs::read_to_string(path).unwrap_or_else(|err| panic!("read {path}: {err}"))
    }

    #[rstest]
    fn writes_backend_file_into_each_working_directory() {
        let (_tmp, root) = temp_root();
        let registration = ResourceClassRegistry::new(&root).register(
            "acme-prod",
            &["acme-prod-network.tfstate", "acme-prod-app-db.tfstate"],
        );
        let generator =
            BackendFileGenerator::new(HandlebarsRenderer::embedded().expect("embedded template"));

        let results = generator.generate(&registration.environment, "acme-state", "eu-west-1");

        assert_eq!(results.len(), 2);
        let path = results[1].outcome.clone().expect("app-db generated");
        assert_eq!(path, root.join("acme-prod/app-db/backend.tf"));
        let contents = read(&path);
        assert!(contents.contains("acme-prod-app-db.tfstate"), "{contents}");
        assert!(contents.contains("acme-state"), "{contents}");
        assert!(contents.contains("eu-west-1"), "{contents}");
    }

    #[rstest]
    fn regeneration_over_existing_directories_is_idempotent() {
        let (_tmp, root) = temp_root();
        let registration =
            ResourceClassRegistry::new(&root).register("acme-prod", &["acme-prod-vpc.tfstate"]);
        let generator =
            BackendFileGenerator::new(HandlebarsRenderer::embedded().expect("embedded template"));

        let first = generator.generate(&registration.environment, "bucket", "us-east-1");
        let first_contents = read(first[0].outcome.as_ref().expect("first run"));
        let second = generator.generate(&registration.environment, "bucket", "us-east-1");
        let second_contents = read(second[0].outcome.as_ref().expect("second run"));

        assert_eq!(first, second);
        assert_eq!(first_contents, second_contents);
    }

    #[rstest]
    fn render_failure_is_isolated_to_its_resource_class() {
        let (_tmp, root) = temp_root();
        let registration = ResourceClassRegistry::new(&root).register(
            "acme-prod",
            &["acme-prod-a.tfstate", "acme-prod-b.tfstate", "acme-prod-c.tfstate"],
        );
        let generator = BackendFileGenerator::new(FailingRenderer {
            failing_key: "acme-prod-b.tfstate",
            inner: HandlebarsRenderer::embedded().expect("embedded template"),
        });

        let results = generator.generate(&registration.environment, "bucket", "us-east-1");

        let succeeded = results
            .iter()
            .map(GenerationResult::is_success)
            .collect::<Vec<_>>();
        assert_eq!(succeeded, vec![true, false, true]);
        assert!(matches!(
            results[1].outcome,
            Err(GenerationError::Render(RenderError::Render { .. }))
        ));
        assert!(root.join("acme-prod/c/backend.tf").is_file());
    }

    #[rstest]
    fn directory_failure_is_reported_per_class() {
        let (_tmp, root) = temp_root();
        std::fs::create_dir_all(root.join("acme-prod"))
            .unwrap_or_else(|err| panic!("create env root: {err}"));
        // A regular file where the working directory should go.
        std::fs::write(root.join("acme-prod/blocked"), "")
            .unwrap_or_else(|err| panic!("seed blocker: {err}"));
        let registration = ResourceClassRegistry::new(&root).register(
            "acme-prod",
            &["acme-prod-blocked.tfstate", "acme-prod-open.tfstate"],
        );
        let generator =
            BackendFileGenerator::new(HandlebarsRenderer::embedded().expect("embedded template"));

        let results = generator.generate(&registration.environment, "bucket", "us-east-1");

        assert!(matches!(
            results[0].outcome,
            Err(GenerationError::Directory { ref path, .. }) if *path == root.join("acme-prod/blocked")
        ));
        assert!(results[1].is_success());
    }
}
