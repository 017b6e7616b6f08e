//! Backend file rendering via `handlebars`.
//!
//! Templates are looked up by name. The renderer ships with an embedded
//! `backend` template and can instead load `<name>.hbs` files from a
//! directory supplied through configuration.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use handlebars::Handlebars;
use serde::Serialize;
use thiserror::Error;

/// Name of the template producing `backend.tf`.
pub const BACKEND_TEMPLATE: &str = "backend";

const TEMPLATE_EXTENSION: &str = "hbs";
const EMBEDDED_BACKEND_TEMPLATE: &str = include_str!("../templates/backend.hbs");

/// Values substituted into the backend template.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BackendContext {
    /// Storage bucket holding the remote state.
    pub bucket: String,
    /// Object key of the remote state artifact.
    pub key: String,
    /// Region of the storage bucket.
    pub region: String,
}

/// Errors raised while loading or rendering templates.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RenderError {
    /// Raised when a template file cannot be read.
    #[error("failed to load template {name} from {path}: {message}")]
    Load {
        /// Template name.
        name: String,
        /// File that could not be read.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when template source fails to compile.
    #[error("template {name} is invalid: {message}")]
    Template {
        /// Template name.
        name: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when rendering fails, for example on a missing variable.
    #[error("failed to render template {name}: {message}")]
    Render {
        /// Template name.
        name: String,
        /// Renderer error message.
        message: String,
    },
    /// Raised when the rendered output cannot be written.
    #[error("failed to write {path}: {message}")]
    Write {
        /// Destination path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// Renders a named template with a [`BackendContext`] into a file.
pub trait TemplateRenderer {
    /// Renders `template` with `context` and writes the result to `output`,
    /// replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError`] when the template is unknown, rendering fails,
    /// or the output cannot be written.
    fn render_to(
        &self,
        template: &str,
        context: &BackendContext,
        output: &Utf8Path,
    ) -> Result<(), RenderError>;
}

/// [`TemplateRenderer`] backed by a strict-mode handlebars registry.
#[derive(Debug)]
pub struct HandlebarsRenderer {
    registry: Handlebars<'static>,
}

impl HandlebarsRenderer {
    /// Builds a renderer holding the embedded `backend` template.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Template`] if the embedded template fails to
    /// compile.
    pub fn embedded() -> Result<Self, RenderError> {
        let mut renderer = Self::empty();
        renderer.register(BACKEND_TEMPLATE, EMBEDDED_BACKEND_TEMPLATE)?;
        Ok(renderer)
    }

    /// Builds a renderer loading `backend.hbs` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Load`] when the file cannot be read, or
    /// [`RenderError::Template`] when it fails to compile.
    pub fn from_dir(dir: &Utf8Path) -> Result<Self, RenderError> {
        let mut renderer = Self::empty();
        let file_name = format!("{BACKEND_TEMPLATE}.{TEMPLATE_EXTENSION}");
        let load_error = |message: String| RenderError::Load {
            name: String::from(BACKEND_TEMPLATE),
            path: dir.join(&file_name),
            message,
        };

        let source = Dir::open_ambient_dir(dir, ambient_authority())
            .and_then(|templates| templates.read_to_string(&file_name))
            .map_err(|err| load_error(err.to_string()))?;
        renderer.register(BACKEND_TEMPLATE, &source)?;
        Ok(renderer)
    }

    /// Renders `template` to a string.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Render`] when the template is unknown or a
    /// referenced variable is missing.
    pub fn render(&self, template: &str, context: &BackendContext) -> Result<String, RenderError> {
        self.registry
            .render(template, context)
            .map_err(|err| RenderError::Render {
                name: template.to_owned(),
                message: err.to_string(),
            })
    }

    fn empty() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    fn register(&mut self, name: &str, source: &str) -> Result<(), RenderError> {
        self.registry
            .register_template_string(name, source)
            .map_err(|err| RenderError::Template {
                name: name.to_owned(),
                message: err.to_string(),
            })
    }
}

impl TemplateRenderer for HandlebarsRenderer {
    fn render_to(
        &self,
        template: &str,
        context: &BackendContext,
        output: &Utf8Path,
    ) -> Result<(), RenderError> {
        let rendered = self.render(template, context)?;
        write_file(output, &rendered)
    }
}

fn write_file(path: &Utf8Path, contents: &str) -> Result<(), RenderError> {
    let write_error = |message: String| RenderError::Write {
        path: path.to_path_buf(),
        message,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| write_error(String::from("output path is missing a filename")))?;

    Dir::open_ambient_dir(parent, ambient_authority())
        .and_then(|dir| dir.write(file_name, contents))
        .map_err(|err| write_error(err.to_string()))
}
