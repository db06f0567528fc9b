//! modbox Tables
//!
//! The host's restricted type system and the file format that carries it:
//! - [`Column`] / [`ColumnType`]: Number(format), Text, Timestamp, Date(unit)
//! - [`Table`]: columns plus at most one in-memory record batch
//! - [`write_table`]: canonical Arrow IPC file, zero bytes for no columns
//! - [`TableValidator`]: certifies files of unknown provenance

#![warn(unreachable_pub)]
// Output tables are memory-mapped for certification.
#![allow(unsafe_code)]

pub mod column;
pub mod error;
pub mod format;
pub mod io;
pub mod table;
pub mod validator;

pub use column::{
    Column, ColumnType, DateUnit, DEFAULT_NUMBER_FORMAT, FORMAT_METADATA_KEY, UNIT_METADATA_KEY,
};
pub use error::{TableError, ValidationError};
pub use format::{check_number_format, FormatIssue};
pub use io::{read_table, write_table};
pub use table::{column_type_for, Table};
pub use validator::{CertifiedTable, MetadataPolicy, MetadataWarning, TableValidator, ValidatorConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
