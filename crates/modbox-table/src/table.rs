//! In-memory table
//!
//! A [`Table`] pairs the logical [`Column`] list with at most one Arrow
//! record batch. The batch's schema is always canonical: field metadata is
//! derived from the columns, never carried over from a file.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;

use crate::column::{Column, ColumnType, DateUnit};
use crate::error::TableError;

/// Logical type an Arrow type maps to, with default metadata
///
/// Returns `None` for every type outside the host's type system.
#[must_use]
pub fn column_type_for(data_type: &DataType) -> Option<ColumnType> {
    match data_type {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Float32
        | DataType::Float64 => Some(ColumnType::number()),
        DataType::Utf8 => Some(ColumnType::Text),
        DataType::Dictionary(key, value)
            if key.is_dictionary_key_type() && value.as_ref() == &DataType::Utf8 =>
        {
            Some(ColumnType::Text)
        }
        DataType::Timestamp(TimeUnit::Nanosecond, None) => Some(ColumnType::Timestamp),
        DataType::Date32 => Some(ColumnType::date(DateUnit::Day)),
        _ => None,
    }
}

fn same_family(a: &ColumnType, b: &ColumnType) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

/// Arrow field for `column`, carrying exactly its canonical metadata
pub(crate) fn canonical_field(position: usize, column: &Column, data_type: &DataType) -> Field {
    let field = match data_type {
        // Each dictionary needs its own id or the IPC writer treats them as one.
        #[allow(clippy::cast_possible_wrap)]
        DataType::Dictionary(..) => {
            Field::new_dict(&column.name, data_type.clone(), true, position as i64, false)
        }
        _ => Field::new(&column.name, data_type.clone(), true),
    };
    match column.column_type.metadata_entry() {
        Some((key, value)) => field.with_metadata(HashMap::from([(key.to_string(), value)])),
        None => field,
    }
}

/// Columns plus data
#[derive(Debug, Clone)]
pub struct Table {
    columns: Vec<Column>,
    batch: Option<RecordBatch>,
}

impl Table {
    /// Table with no columns and no rows
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            batch: None,
        }
    }

    /// Build a table from columns and one array per column
    ///
    /// # Errors
    ///
    /// Fails when counts differ, an array's type cannot hold its column's
    /// logical type, or arrays differ in length.
    pub fn try_new(columns: Vec<Column>, arrays: Vec<ArrayRef>) -> Result<Self, TableError> {
        if columns.len() != arrays.len() {
            return Err(TableError::ColumnCount {
                columns: columns.len(),
                arrays: arrays.len(),
            });
        }
        if columns.is_empty() {
            return Ok(Self::empty());
        }

        let n_rows = arrays[0].len();
        let mut fields = Vec::with_capacity(columns.len());
        for (position, (column, array)) in columns.iter().zip(&arrays).enumerate() {
            let accepted = column_type_for(array.data_type())
                .is_some_and(|inferred| same_family(&inferred, &column.column_type));
            if !accepted {
                return Err(TableError::TypeMismatch {
                    column: column.name.clone(),
                    expected: column.column_type.to_string(),
                    data_type: array.data_type().to_string(),
                });
            }
            if array.len() != n_rows {
                return Err(TableError::LengthMismatch {
                    column: column.name.clone(),
                    expected: n_rows,
                    actual: array.len(),
                });
            }
            fields.push(canonical_field(position, column, array.data_type()));
        }

        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(schema, arrays)?;
        Ok(Self {
            columns,
            batch: Some(batch),
        })
    }

    /// Logical columns, in order
    #[inline]
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column arrays, in order
    #[must_use]
    pub fn arrays(&self) -> &[ArrayRef] {
        self.batch.as_ref().map_or(&[][..], RecordBatch::columns)
    }

    /// Column and array by name
    #[must_use]
    pub fn column(&self, name: &str) -> Option<(&Column, &ArrayRef)> {
        let position = self.columns.iter().position(|c| c.name == name)?;
        Some((&self.columns[position], &self.arrays()[position]))
    }

    /// Number of columns
    #[inline]
    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Number of rows; zero for a table with no columns
    #[inline]
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batch.as_ref().map_or(0, RecordBatch::num_rows)
    }

    /// Check for a table with no columns
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Canonical Arrow schema
    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        self.batch
            .as_ref()
            .map_or_else(|| Arc::new(Schema::empty()), RecordBatch::schema)
    }

    /// The record batch, absent for a table with no columns
    #[inline]
    #[must_use]
    pub fn record_batch(&self) -> Option<&RecordBatch> {
        self.batch.as_ref()
    }

    /// Split into columns and arrays
    #[must_use]
    pub fn into_parts(self) -> (Vec<Column>, Vec<ArrayRef>) {
        let arrays = self
            .batch
            .map(|batch| batch.columns().to_vec())
            .unwrap_or_default();
        (self.columns, arrays)
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns
            && self.num_rows() == other.num_rows()
            && self
                .arrays()
                .iter()
                .zip(other.arrays())
                .all(|(a, b)| a.to_data() == b.to_data())
    }
}
