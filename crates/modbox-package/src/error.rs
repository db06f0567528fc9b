//! Package loading errors

use std::fmt;

/// Where and why module code failed to compile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// 1-based line, when known
    pub line: Option<usize>,
    /// 1-based column, when known
    pub column: Option<usize>,
    /// Parser message
    pub message: String,
}

impl CompileError {
    /// Error with no position
    #[must_use]
    pub fn unpositioned(message: impl Into<String>) -> Self {
        Self {
            line: None,
            column: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "line {line}, column {column}: {}", self.message),
            (Some(line), None) => write!(f, "line {line}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for CompileError {}

/// Errors from locating, unpacking, validating or compiling a package
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// No archive for this id and version
    #[error("module {id} version {version} not found")]
    NotFound { id: String, version: String },

    /// Reading the archive failed
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive is not a usable zip or has the wrong files
    #[error("invalid archive: {0}")]
    Archive(String),

    /// Spec is missing, malformed or inconsistent
    #[error("invalid module spec: {0}")]
    Spec(String),

    /// Code does not compile
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    /// Id or version is not a valid name
    #[error("invalid module name: {0}")]
    InvalidName(String),
}

impl LoadError {
    /// Check if the published package itself is broken
    ///
    /// Such a package fails the same way on every load until it is
    /// republished.
    #[inline]
    #[must_use]
    pub fn is_package_broken(&self) -> bool {
        matches!(self, Self::Archive(_) | Self::Spec(_) | Self::Compile(_))
    }
}

impl From<zip::result::ZipError> for LoadError {
    fn from(error: zip::result::ZipError) -> Self {
        match error {
            zip::result::ZipError::Io(e) => Self::Archive(format!("unreadable zip: {e}")),
            other => Self::Archive(other.to_string()),
        }
    }
}
