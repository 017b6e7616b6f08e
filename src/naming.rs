//! Resource-class name derivation from remote state object keys.
//!
//! Keys follow the `<project>-<environment>-<resource class>.tfstate`
//! convention. The first two segments are fixed; everything after the second
//! dash is the resource-class identifier, dashes included.

use thiserror::Error;

/// Suffix carried by remote state artifacts.
pub const STATE_SUFFIX: &str = ".tfstate";

const SEGMENT_DELIMITER: char = '-';
const SEGMENT_COUNT: usize = 3;

/// Errors raised while deriving a resource-class name.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NamingError {
    /// Raised when the key does not carry a resource-class segment.
    #[error("malformed state key {key}: expected <project>-<environment>-<class>.tfstate")]
    MalformedKey {
        /// Key that failed derivation.
        key: String,
    },
}

/// Derives the resource-class name from an object key.
///
/// # Errors
///
/// Returns [`NamingError::MalformedKey`] when the key, after removing
/// [`STATE_SUFFIX`], has fewer than three dash-delimited segments or an empty
/// third segment.
///
/// # Examples
///
/// ```
/// # use statepull::naming::derive;
/// assert_eq!(derive("proj-env-res-class.tfstate").as_deref(), Ok("res-class"));
/// assert!(derive("onlytwo-segments.tfstate").is_err());
/// ```
pub fn derive(key: &str) -> Result<String, NamingError> {
    let stem = key.strip_suffix(STATE_SUFFIX).unwrap_or(key);
    match stem.splitn(SEGMENT_COUNT, SEGMENT_DELIMITER).nth(SEGMENT_COUNT - 1) {
        Some(name) if !name.is_empty() => Ok(name.to_owned()),
        _ => Err(NamingError::MalformedKey {
            key: key.to_owned(),
        }),
    }
}
