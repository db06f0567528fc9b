//! Table files
//!
//! The host writes tables only through [`write_table`], so every file it
//! produces is canonical. Files from anywhere else go through the
//! validator; [`read_table`] is a shorthand for that with default limits.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use arrow::ipc::writer::FileWriter;

use crate::error::{TableError, ValidationError};
use crate::table::Table;
use crate::validator::{TableValidator, ValidatorConfig};

/// Write `table` as an Arrow IPC file, replacing `path`
///
/// A table with no columns is written as zero bytes.
///
/// # Errors
///
/// Propagates filesystem and Arrow failures.
pub fn write_table(path: &Path, table: &Table) -> Result<(), TableError> {
    let file = File::create(path)?;
    let Some(batch) = table.record_batch() else {
        return Ok(());
    };

    let mut writer = FileWriter::try_new(BufWriter::new(file), &batch.schema())?;
    writer.write(batch)?;
    let mut inner = writer.into_inner()?;
    inner.flush()?;
    Ok(())
}

/// Certify `path` with default limits and return its table
///
/// # Errors
///
/// Returns the validator's error; metadata warnings are discarded.
pub fn read_table(path: &Path) -> Result<Table, ValidationError> {
    TableValidator::new(ValidatorConfig::default())
        .certify(path)
        .map(|certified| certified.table)
}
