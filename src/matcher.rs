//! Literal prefix filtering of storage object keys.

/// Returns every key that starts with `prefix`, preserving input order.
///
/// The prefix is compared as a literal string; characters such as `.` or `*`
/// carry no pattern meaning.
#[must_use]
pub fn match_prefix<S: AsRef<str>>(keys: &[S], prefix: &str) -> Vec<String> {
    keys.iter()
        .map(AsRef::as_ref)
        .filter(|key| key.starts_with(prefix))
        .map(str::to_owned)
        .collect()
}
