//! Environment and resource-class model built from remote state keys.
//!
//! Registration never fails as a whole: keys that cannot be mapped onto a
//! working directory are reported as skips and the rest are kept.

use std::collections::BTreeSet;
use std::fmt;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::naming::{self, NamingError};

/// A deployment environment and the resource classes discovered for it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Environment {
    name: String,
    root: Utf8PathBuf,
    resource_classes: Vec<ResourceClass>,
}

impl Environment {
    /// Environment name as configured.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding every resource class of this environment.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Resource classes in registration order.
    #[must_use]
    pub fn resource_classes(&self) -> &[ResourceClass] {
        &self.resource_classes
    }
}

/// One unit of infrastructure state within an environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceClass {
    name: String,
    source_key: String,
    working_dir: Utf8PathBuf,
}

impl ResourceClass {
    /// Name derived from the source key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remote object key the class was derived from.
    #[must_use]
    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    /// Working directory for the state tool.
    #[must_use]
    pub fn working_dir(&self) -> &Utf8Path {
        &self.working_dir
    }
}

/// Why a key was left out of an environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// The key could not be split into a resource-class name.
    MalformedKey(NamingError),
    /// The derived name would resolve outside the environment root.
    UnsafeName {
        /// Offending resource-class name.
        name: String,
    },
    /// Another key already registered the same resource class.
    DuplicateClass {
        /// Resource-class name shared by both keys.
        name: String,
        /// Key that registered the class first.
        existing_key: String,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedKey(err) => write!(f, "{err}"),
            Self::UnsafeName { name } => {
                write!(f, "resource class {name} escapes the environment root")
            }
            Self::DuplicateClass { name, existing_key } => {
                write!(f, "resource class {name} already registered by {existing_key}")
            }
        }
    }
}

/// A key excluded during registration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SkippedKey {
    /// The object key that was skipped.
    pub key: String,
    /// Why it was skipped.
    pub reason: SkipReason,
}

/// Outcome of registering one environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Registration {
    /// Populated environment.
    pub environment: Environment,
    /// Keys excluded from the environment, in input order.
    pub skipped: Vec<SkippedKey>,
}

/// Builds [`Environment`] trees rooted under a shared output directory.
#[derive(Clone, Debug)]
pub struct ResourceClassRegistry {
    output_root: Utf8PathBuf,
}

impl ResourceClassRegistry {
    /// Creates a registry placing environments under `output_root`.
    #[must_use]
    pub fn new(output_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
        }
    }

    /// Root under which every environment directory is placed.
    #[must_use]
    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    /// Directory assigned to `environment`.
    #[must_use]
    pub fn environment_root(&self, environment: &str) -> Utf8PathBuf {
        self.output_root.join(environment)
    }

    /// Registers the resource classes named by `keys` under `environment`.
    ///
    /// Keys that fail derivation, resolve outside the environment root, or
    /// repeat an already registered class are recorded in
    /// [`Registration::skipped`].
    #[must_use]
    pub fn register<S: AsRef<str>>(&self, environment: &str, keys: &[S]) -> Registration {
        let root = self.environment_root(environment);
        let mut resource_classes: Vec<ResourceClass> = Vec::with_capacity(keys.len());
        let mut seen = BTreeSet::new();
        let mut skipped = Vec::new();

        for key in keys.iter().map(AsRef::as_ref) {
            match classify(key, &root, &resource_classes, &seen) {
                Ok(class) => {
                    debug!(environment, key, class = class.name(), "registered resource class");
                    seen.insert(class.name.clone());
                    resource_classes.push(class);
                }
                Err(reason) => {
                    warn!(environment, key, %reason, "skipping state key");
                    skipped.push(SkippedKey {
                        key: key.to_owned(),
                        reason,
                    });
                }
            }
        }

        Registration {
            environment: Environment {
                name: environment.to_owned(),
                root,
                resource_classes,
            },
            skipped,
        }
    }
}

fn classify(
    key: &str,
    root: &Utf8Path,
    registered: &[ResourceClass],
    seen: &BTreeSet<String>,
) -> Result<ResourceClass, SkipReason> {
    let name = naming::derive(key).map_err(SkipReason::MalformedKey)?;
    if !is_contained(&name) {
        return Err(SkipReason::UnsafeName { name });
    }
    if seen.contains(&name) {
        let existing_key = registered
            .iter()
            .find(|class| class.name == name)
            .map(|class| class.source_key.clone())
            .unwrap_or_default();
        return Err(SkipReason::DuplicateClass { name, existing_key });
    }

    Ok(ResourceClass {
        working_dir: root.join(&name),
        source_key: key.to_owned(),
        name,
    })
}

/// Accepts only relative names built from normal components.
fn is_contained(name: &str) -> bool {
    !name.split('/').any(str::is_empty)
        && Utf8Path::new(name)
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)))
}
