//! Scratch-directory filename rules
//!
//! A filename in a message is a single path component inside the
//! invocation's scratch directory. Anything that could escape it, or hide
//! in it, is rejected before the name is ever joined to a path.

use std::path::{Path, PathBuf};

use crate::error::WireError;

/// Longest filename accepted, in bytes
pub const MAX_FILENAME_BYTES: usize = 255;

/// Check that `name` is a plain, visible file name
///
/// # Errors
///
/// Returns [`WireError::InvalidFilename`] for empty names, names with `/`
/// or NUL, names starting with `.`, and names over [`MAX_FILENAME_BYTES`].
pub fn validate_filename(name: &str) -> Result<(), WireError> {
    let reason = if name.is_empty() {
        Some("empty")
    } else if name.len() > MAX_FILENAME_BYTES {
        Some("too long")
    } else if name.contains('/') {
        Some("contains '/'")
    } else if name.contains('\0') {
        Some("contains NUL")
    } else if name.starts_with('.') {
        Some("starts with '.'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(WireError::InvalidFilename {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Join a validated filename onto `basedir`
///
/// # Errors
///
/// Returns the [`validate_filename`] error for unsafe names.
pub fn resolve_in(basedir: &Path, name: &str) -> Result<PathBuf, WireError> {
    validate_filename(name)?;
    Ok(basedir.join(name))
}
