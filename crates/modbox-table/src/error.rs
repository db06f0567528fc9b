//! Error types for modbox Tables

use std::path::PathBuf;

use arrow::error::ArrowError;

use crate::column::DateUnit;

/// Errors building or writing a trusted table
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// Arrow rejected the data
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    /// Array type cannot carry the column's logical type
    #[error("column {column:?}: {data_type} cannot hold {expected}")]
    TypeMismatch {
        /// Column name
        column: String,
        /// Declared logical type
        expected: String,
        /// Arrow type supplied
        data_type: String,
    },

    /// Array length differs from the table's row count
    #[error("column {column:?} has {actual} rows, expected {expected}")]
    LengthMismatch {
        /// Column name
        column: String,
        /// Rows in the first column
        expected: usize,
        /// Rows in this column
        actual: usize,
    },

    /// Number of arrays differs from number of columns
    #[error("{columns} columns but {arrays} arrays")]
    ColumnCount {
        /// Declared columns
        columns: usize,
        /// Supplied arrays
        arrays: usize,
    },

    /// Filesystem failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a table file fails certification
///
/// Every variant is fatal: a rejected file never yields a partial table.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Output path is a symlink, directory or device
    #[error("{0} is not a regular file")]
    NotRegularFile(PathBuf),

    /// File could not be opened or read
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// File is larger than the configured ceiling
    #[error("table file is {actual} bytes, limit is {max}")]
    FileTooLarge {
        /// File size
        actual: u64,
        /// Configured ceiling
        max: u64,
    },

    /// Not a readable Arrow IPC file
    #[error("invalid arrow file: {0}")]
    InvalidArrowFile(String),

    /// Decoder panicked on the file's contents
    #[error("arrow decoder panicked: {0}")]
    DecoderPanicked(String),

    /// More than one record batch
    #[error("table has {0} record batches, expected at most 1")]
    TooManyRecordBatches(usize),

    /// Row ceiling exceeded
    #[error("table has {actual} rows, limit is {max}")]
    TooManyRows {
        /// Rows in the file
        actual: usize,
        /// Configured ceiling
        max: usize,
    },

    /// Column ceiling exceeded
    #[error("table has {actual} columns, limit is {max}")]
    TooManyColumns {
        /// Columns in the file
        actual: usize,
        /// Configured ceiling
        max: usize,
    },

    /// Column name is unusable
    #[error("column {position} has invalid name {name:?}: {reason}")]
    InvalidColumnName {
        /// Zero-based column index
        position: usize,
        /// Offending name
        name: String,
        /// What is wrong with it
        reason: &'static str,
    },

    /// Two columns share a name
    #[error("column name {name:?} appears at positions {first} and {second}")]
    DuplicateColumnName {
        /// Shared name
        name: String,
        /// First occurrence
        first: usize,
        /// Second occurrence
        second: usize,
    },

    /// On-disk type maps to no logical column type
    #[error("column {column:?} has unsupported type {data_type}")]
    UnsupportedType {
        /// Column name
        column: String,
        /// On-disk Arrow type
        data_type: String,
    },

    /// Array contents violate Arrow's own invariants
    #[error("column {column:?} is malformed: {reason}")]
    MalformedColumn {
        /// Column name
        column: String,
        /// Arrow's description of the fault
        reason: String,
    },

    /// Dictionary values are null, repeated or unused
    #[error("column {column:?} dictionary is invalid: {reason}")]
    InvalidDictionary {
        /// Column name
        column: String,
        /// What is wrong with it
        reason: &'static str,
    },

    /// Dictionary cardinality ceiling exceeded
    #[error("column {column:?} dictionary has {actual} values, limit is {max}")]
    DictionaryTooLarge {
        /// Column name
        column: String,
        /// Values in the dictionary
        actual: usize,
        /// Configured ceiling
        max: usize,
    },

    /// A key points outside the dictionary
    #[error("column {column:?} has a dictionary key out of range")]
    DictionaryKeyOutOfRange {
        /// Column name
        column: String,
    },

    /// NaN or infinity in a Number column
    #[error("column {column:?} row {row} is not a finite number")]
    NonFiniteNumber {
        /// Column name
        column: String,
        /// Zero-based row
        row: usize,
    },

    /// Date not on its column's unit boundary
    #[error("column {column:?} row {row} is not a valid {unit} date")]
    MisalignedDate {
        /// Column name
        column: String,
        /// Zero-based row
        row: usize,
        /// Column unit
        unit: DateUnit,
    },

    /// Metadata is invalid and the policy rejects rather than drops it
    #[error("column {column:?} has invalid metadata: {reason}")]
    InvalidMetadata {
        /// Column name
        column: String,
        /// What is wrong with it
        reason: String,
    },

    /// Metadata would be unsafe to interpret
    #[error("column {column:?} has unsafe metadata: {reason}")]
    UnsafeMetadata {
        /// Column name
        column: String,
        /// What is wrong with it
        reason: String,
    },
}

impl ValidationError {
    /// Check if the file itself could not be read, as opposed to read and refused
    #[inline]
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
