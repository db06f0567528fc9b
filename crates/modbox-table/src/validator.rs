//! Table Validator
//!
//! Certifies a table file of unknown provenance. Checks run in order:
//! 1. the file is a regular file holding a readable Arrow IPC stream of
//!    at most one record batch (zero bytes is the empty table);
//! 2. the column count is within limits and every column has a usable,
//!    unique name and an on-disk type in the host's type system;
//! 3. the row count is within limits and every array satisfies Arrow's
//!    own invariants (offsets, UTF-8, key bounds);
//! 4. format and unit metadata is safe and valid;
//! 5. dictionaries, floats and dates carry only acceptable values.
//!
//! Nothing from the file is trusted until all checks pass. The certified
//! table is rebuilt with canonical metadata, so re-writing it is stable.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::Cursor;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use arrow::array::{new_empty_array, Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Date32Type, Field, Float32Type, Float64Type, Int64Type};
use arrow::ipc::reader::FileReader;
use arrow::record_batch::RecordBatch;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::column::{Column, ColumnType, DateUnit, FORMAT_METADATA_KEY, UNIT_METADATA_KEY};
use crate::error::ValidationError;
use crate::format::{check_number_format, FormatIssue};
use crate::table::{column_type_for, Table};

/// What to do with metadata that is invalid but not unsafe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataPolicy {
    /// Drop it, record a warning, use the default
    #[default]
    Downgrade,
    /// Reject the table
    Reject,
}

/// Validator limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Most rows accepted
    pub max_rows: usize,
    /// Most columns accepted
    pub max_columns: usize,
    /// Most distinct values in one dictionary-encoded column
    pub max_dictionary_size: usize,
    /// Longest column name, in UTF-8 bytes
    pub max_column_name_bytes: usize,
    /// Largest table file accepted, bytes
    pub max_file_bytes: u64,
    /// Handling of invalid format/unit metadata
    pub metadata_policy: MetadataPolicy,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_rows: 1_000_000,
            max_columns: 1_000,
            max_dictionary_size: 100_000,
            max_column_name_bytes: 120,
            max_file_bytes: 1024 * 1024 * 1024,
            metadata_policy: MetadataPolicy::Downgrade,
        }
    }
}

impl ValidatorConfig {
    /// Set the row ceiling
    #[must_use]
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    /// Set the column ceiling
    #[must_use]
    pub fn with_max_columns(mut self, max_columns: usize) -> Self {
        self.max_columns = max_columns;
        self
    }

    /// Set the dictionary cardinality ceiling
    #[must_use]
    pub fn with_max_dictionary_size(mut self, max_dictionary_size: usize) -> Self {
        self.max_dictionary_size = max_dictionary_size;
        self
    }

    /// Set the file size ceiling
    #[must_use]
    pub fn with_max_file_bytes(mut self, max_file_bytes: u64) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    /// Set the metadata policy
    #[must_use]
    pub fn with_metadata_policy(mut self, metadata_policy: MetadataPolicy) -> Self {
        self.metadata_policy = metadata_policy;
        self
    }
}

/// Metadata dropped under [`MetadataPolicy::Downgrade`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataWarning {
    /// Column the metadata was on
    pub column: String,
    /// Metadata key
    pub key: String,
    /// Why it was dropped
    pub reason: String,
}

impl fmt::Display for MetadataWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "column {:?}: dropped {:?} metadata: {}", self.column, self.key, self.reason)
    }
}

/// A table that passed every check
#[derive(Debug, Clone, PartialEq)]
pub struct CertifiedTable {
    /// The data, with canonical metadata
    pub table: Table,
    /// Metadata that was dropped on the way
    pub warnings: Vec<MetadataWarning>,
}

impl CertifiedTable {
    fn empty() -> Self {
        Self {
            table: Table::empty(),
            warnings: Vec::new(),
        }
    }
}

/// Certifies untrusted table files
#[derive(Debug, Clone, Default)]
pub struct TableValidator {
    config: ValidatorConfig,
}

impl TableValidator {
    /// Create a validator with `config` limits
    #[must_use]
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Active limits
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Certify the file at `path`
    ///
    /// # Errors
    ///
    /// Returns the first check that fails. No partial table is ever returned.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub fn certify(&self, path: &Path) -> Result<CertifiedTable, ValidationError> {
        if !std::fs::symlink_metadata(path)?.file_type().is_file() {
            return Err(ValidationError::NotRegularFile(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(ValidationError::NotRegularFile(path.to_path_buf()));
        }
        let len = metadata.len();
        if len > self.config.max_file_bytes {
            return Err(ValidationError::FileTooLarge {
                actual: len,
                max: self.config.max_file_bytes,
            });
        }
        if len == 0 {
            return self.certify_bytes(&[]);
        }
        // SAFETY: the worker that wrote the file has exited and nothing else
        // writes to the scratch directory while it is certified.
        let map = unsafe { Mmap::map(&file)? };
        self.certify_bytes(&map)
    }

    /// Certify an in-memory file image
    ///
    /// # Errors
    ///
    /// As [`TableValidator::certify`].
    pub fn certify_bytes(&self, bytes: &[u8]) -> Result<CertifiedTable, ValidationError> {
        if bytes.is_empty() {
            debug!("zero-byte table file is the empty table");
            return Ok(CertifiedTable::empty());
        }

        let certified = panic::catch_unwind(AssertUnwindSafe(|| self.inspect(bytes)))
            .map_err(|payload| ValidationError::DecoderPanicked(panic_message(payload.as_ref())))??;

        debug!(
            rows = certified.table.num_rows(),
            columns = certified.table.num_columns(),
            warnings = certified.warnings.len(),
            "table certified"
        );
        Ok(certified)
    }

    fn inspect(&self, bytes: &[u8]) -> Result<CertifiedTable, ValidationError> {
        let mut reader = FileReader::try_new(Cursor::new(bytes), None).map_err(invalid_file)?;
        let schema = reader.schema();
        let n_batches = reader.num_batches();
        if n_batches > 1 {
            return Err(ValidationError::TooManyRecordBatches(n_batches));
        }

        let fields = schema.fields();
        if fields.len() > self.config.max_columns {
            return Err(ValidationError::TooManyColumns {
                actual: fields.len(),
                max: self.config.max_columns,
            });
        }
        if fields.is_empty() {
            return Ok(CertifiedTable::empty());
        }

        self.check_names(fields.iter().map(|f| f.name().as_str()))?;
        let inferred = fields
            .iter()
            .map(|field| {
                column_type_for(field.data_type()).ok_or_else(|| ValidationError::UnsupportedType {
                    column: field.name().clone(),
                    data_type: field.data_type().to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let batch: Option<RecordBatch> = reader.next().transpose().map_err(invalid_file)?;
        let arrays: Vec<ArrayRef> = match &batch {
            Some(batch) => batch.columns().to_vec(),
            None => fields.iter().map(|f| new_empty_array(f.data_type())).collect(),
        };
        let n_rows = arrays.first().map_or(0, |a| a.len());
        if n_rows > self.config.max_rows {
            return Err(ValidationError::TooManyRows {
                actual: n_rows,
                max: self.config.max_rows,
            });
        }

        let mut warnings = Vec::new();
        let mut columns = Vec::with_capacity(fields.len());
        for ((field, inferred), array) in fields.iter().zip(inferred).zip(&arrays) {
            array.to_data().validate_full().map_err(|e| ValidationError::MalformedColumn {
                column: field.name().clone(),
                reason: e.to_string(),
            })?;
            let column_type = self.resolve_metadata(field, inferred, &mut warnings)?;
            self.check_values(field.name(), &column_type, array)?;
            columns.push(Column::new(field.name().clone(), column_type));
        }

        let table = Table::try_new(columns, arrays).map_err(|e| invalid_file(e.to_string()))?;
        Ok(CertifiedTable { table, warnings })
    }

    fn check_names<'a>(&self, names: impl Iterator<Item = &'a str>) -> Result<(), ValidationError> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (position, name) in names.enumerate() {
            let reason = if name.is_empty() {
                Some("empty")
            } else if name.len() > self.config.max_column_name_bytes {
                Some("too long")
            } else if name.chars().any(|c| c.is_ascii_control()) {
                Some("contains control characters")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(ValidationError::InvalidColumnName {
                    position,
                    name: name.to_string(),
                    reason,
                });
            }
            if let Some(first) = seen.insert(name, position) {
                return Err(ValidationError::DuplicateColumnName {
                    name: name.to_string(),
                    first,
                    second: position,
                });
            }
        }
        Ok(())
    }

    /// Confirm the inferred type's metadata, applying the policy to bad entries
    fn resolve_metadata(
        &self,
        field: &Field,
        inferred: ColumnType,
        warnings: &mut Vec<MetadataWarning>,
    ) -> Result<ColumnType, ValidationError> {
        let column = field.name();
        let mut column_type = inferred;

        for (key, value) in field.metadata() {
            match (&mut column_type, key.as_str()) {
                (ColumnType::Number { format }, FORMAT_METADATA_KEY) => match check_number_format(value) {
                    Ok(()) => value.clone_into(format),
                    Err(FormatIssue::Unsafe(reason)) => {
                        return Err(ValidationError::UnsafeMetadata {
                            column: column.clone(),
                            reason,
                        })
                    }
                    Err(FormatIssue::Invalid(reason)) => self.downgrade(column, key, reason, warnings)?,
                },
                (ColumnType::Date { unit }, UNIT_METADATA_KEY) => match value.parse::<DateUnit>() {
                    Ok(parsed) => *unit = parsed,
                    Err(e) => self.downgrade(column, key, e.to_string(), warnings)?,
                },
                (other, _) => {
                    let reason = format!("key does not apply to {} columns", other.name());
                    self.downgrade(column, key, reason, warnings)?;
                }
            }
        }
        Ok(column_type)
    }

    fn downgrade(
        &self,
        column: &str,
        key: &str,
        reason: String,
        warnings: &mut Vec<MetadataWarning>,
    ) -> Result<(), ValidationError> {
        match self.config.metadata_policy {
            MetadataPolicy::Reject => Err(ValidationError::InvalidMetadata {
                column: column.to_string(),
                reason: format!("{key:?}: {reason}"),
            }),
            MetadataPolicy::Downgrade => {
                warn!(column, key, %reason, "dropping invalid column metadata");
                warnings.push(MetadataWarning {
                    column: column.to_string(),
                    key: key.to_string(),
                    reason,
                });
                Ok(())
            }
        }
    }

    fn check_values(&self, column: &str, column_type: &ColumnType, array: &ArrayRef) -> Result<(), ValidationError> {
        match (column_type, array.data_type()) {
            (ColumnType::Text, DataType::Dictionary(..)) => self.check_dictionary(column, array),
            (ColumnType::Number { .. }, DataType::Float32) => check_finite(
                column,
                array.as_primitive::<Float32Type>().iter().map(|v| v.map(f64::from)),
            ),
            (ColumnType::Number { .. }, DataType::Float64) => {
                check_finite(column, array.as_primitive::<Float64Type>().iter())
            }
            (ColumnType::Date { unit }, DataType::Date32) => {
                let values = array.as_primitive::<Date32Type>();
                match values.iter().position(|v| v.is_some_and(|days| !unit.is_aligned(days))) {
                    Some(row) => Err(ValidationError::MisalignedDate {
                        column: column.to_string(),
                        row,
                        unit: *unit,
                    }),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    fn check_dictionary(&self, column: &str, array: &ArrayRef) -> Result<(), ValidationError> {
        let dictionary = array.as_any_dictionary();
        let bad = |reason| ValidationError::InvalidDictionary {
            column: column.to_string(),
            reason,
        };

        let values = dictionary.values().as_string::<i32>();
        if values.len() > self.config.max_dictionary_size {
            return Err(ValidationError::DictionaryTooLarge {
                column: column.to_string(),
                actual: values.len(),
                max: self.config.max_dictionary_size,
            });
        }
        if values.null_count() > 0 {
            return Err(bad("null value"));
        }
        let mut distinct = HashSet::with_capacity(values.len());
        if !values.iter().flatten().all(|v| distinct.insert(v)) {
            return Err(bad("repeated value"));
        }

        // Casting with safe options turns keys that overflow i64 into nulls.
        let keys = dictionary.keys();
        let widened = cast(keys, &DataType::Int64).map_err(|e| invalid_file(e.to_string()))?;
        let out_of_range = || ValidationError::DictionaryKeyOutOfRange {
            column: column.to_string(),
        };
        if widened.null_count() != keys.null_count() {
            return Err(out_of_range());
        }

        let mut used = vec![false; values.len()];
        for key in widened.as_primitive::<Int64Type>().iter().flatten() {
            let slot = usize::try_from(key).ok().and_then(|k| used.get_mut(k)).ok_or_else(out_of_range)?;
            *slot = true;
        }
        if used.contains(&false) {
            return Err(bad("unused value"));
        }
        Ok(())
    }
}

fn check_finite(column: &str, values: impl Iterator<Item = Option<f64>>) -> Result<(), ValidationError> {
    for (row, value) in values.enumerate() {
        if value.is_some_and(|v| !v.is_finite()) {
            return Err(ValidationError::NonFiniteNumber {
                column: column.to_string(),
                row,
            });
        }
    }
    Ok(())
}

fn invalid_file(error: impl ToString) -> ValidationError {
    ValidationError::InvalidArrowFile(error.to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::write_table;
    use arrow::array::{
        BooleanArray, Date32Array, DictionaryArray, Float64Array, Int32Array, Int64Array, StringArray,
        TimestampNanosecondArray,
    };
    use arrow::datatypes::{Int32Type, Schema, TimeUnit};
    use arrow::ipc::writer::FileWriter;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn write_raw(dir: &Path, fields: Vec<Field>, batches: &[Vec<ArrayRef>]) -> PathBuf {
        let path = dir.join("raw.arrow");
        let schema = Arc::new(Schema::new(fields));
        let mut writer = FileWriter::try_new(File::create(&path).unwrap(), &schema).unwrap();
        for arrays in batches {
            let batch = RecordBatch::try_new(schema.clone(), arrays.clone()).unwrap();
            writer.write(&batch).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn one_column(dir: &Path, field: Field, array: ArrayRef) -> PathBuf {
        write_raw(dir, vec![field], &[vec![array]])
    }

    fn with_meta(field: Field, key: &str, value: &str) -> Field {
        field.with_metadata(HashMap::from([(key.to_string(), value.to_string())]))
    }

    fn certify(path: &Path) -> Result<CertifiedTable, ValidationError> {
        TableValidator::default().certify(path)
    }

    #[test]
    fn zero_bytes_is_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.arrow");
        std::fs::write(&path, b"").unwrap();
        let certified = certify(&path).unwrap();
        assert!(certified.table.is_empty());
        assert!(certified.warnings.is_empty());
    }

    #[test]
    fn garbage_and_truncation_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = one_column(
            dir.path(),
            Field::new("A", DataType::Int64, true),
            Arc::new(Int64Array::from(vec![1, 2, 3])),
        );
        let bytes = std::fs::read(&path).unwrap();
        let validator = TableValidator::default();

        assert!(validator.certify_bytes(b"not an arrow file").is_err());
        for cut in [1, 8, bytes.len() / 2, bytes.len() - 1] {
            assert!(validator.certify_bytes(&bytes[..cut]).is_err(), "cut at {cut}");
        }
        assert!(validator.certify_bytes(&bytes).is_ok());
    }

    #[test]
    fn infers_default_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(
            dir.path(),
            vec![
                Field::new("n", DataType::Int32, true),
                Field::new("d", DataType::Date32, true),
                Field::new("t", DataType::Timestamp(TimeUnit::Nanosecond, None), true),
            ],
            &[vec![
                Arc::new(Int32Array::from(vec![1])),
                Arc::new(Date32Array::from(vec![3])),
                Arc::new(TimestampNanosecondArray::from(vec![5])),
            ]],
        );
        let certified = certify(&path).unwrap();
        assert_eq!(
            certified.table.columns(),
            &[
                Column::new("n", ColumnType::number()),
                Column::new("d", ColumnType::date(DateUnit::Day)),
                Column::new("t", ColumnType::Timestamp),
            ]
        );
        let schema = certified.table.schema();
        assert_eq!(schema.field(0).metadata().get("format").map(String::as_str), Some("{:,}"));
        assert_eq!(schema.field(1).metadata().get("unit").map(String::as_str), Some("day"));
    }

    #[test]
    fn unsupported_types_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = one_column(
            dir.path(),
            Field::new("B", DataType::Boolean, true),
            Arc::new(BooleanArray::from(vec![true])),
        );
        assert!(matches!(certify(&path), Err(ValidationError::UnsupportedType { .. })));

        let tz = DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into()));
        let path = one_column(
            dir.path(),
            Field::new("T", tz, true),
            Arc::new(TimestampNanosecondArray::from(vec![1]).with_timezone("UTC")),
        );
        assert!(matches!(certify(&path), Err(ValidationError::UnsupportedType { .. })));
    }

    #[test]
    fn more_than_one_batch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let array: ArrayRef = Arc::new(Int64Array::from(vec![1]));
        let path = write_raw(
            dir.path(),
            vec![Field::new("A", DataType::Int64, true)],
            &[vec![array.clone()], vec![array]],
        );
        assert!(matches!(certify(&path), Err(ValidationError::TooManyRecordBatches(2))));
    }

    #[test]
    fn row_and_column_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(
            dir.path(),
            vec![Field::new("A", DataType::Int64, true), Field::new("B", DataType::Int64, true)],
            &[vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(Int64Array::from(vec![4, 5, 6])),
            ]],
        );
        let rows = TableValidator::new(ValidatorConfig::default().with_max_rows(2));
        assert!(matches!(rows.certify(&path), Err(ValidationError::TooManyRows { actual: 3, max: 2 })));
        let cols = TableValidator::new(ValidatorConfig::default().with_max_columns(1));
        assert!(matches!(cols.certify(&path), Err(ValidationError::TooManyColumns { actual: 2, max: 1 })));
    }

    #[test]
    fn column_names_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let a: ArrayRef = Arc::new(Int64Array::from(vec![1]));

        let path = write_raw(
            dir.path(),
            vec![Field::new("A", DataType::Int64, true), Field::new("A", DataType::Int64, true)],
            &[vec![a.clone(), a.clone()]],
        );
        assert!(matches!(
            certify(&path),
            Err(ValidationError::DuplicateColumnName { first: 0, second: 1, .. })
        ));

        let path = one_column(dir.path(), Field::new("line\nbreak", DataType::Int64, true), a.clone());
        assert!(matches!(certify(&path), Err(ValidationError::InvalidColumnName { .. })));

        let path = one_column(dir.path(), Field::new("x".repeat(121), DataType::Int64, true), a);
        assert!(matches!(certify(&path), Err(ValidationError::InvalidColumnName { reason: "too long", .. })));
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = one_column(
            dir.path(),
            Field::new("F", DataType::Float64, true),
            Arc::new(Float64Array::from(vec![Some(1.0), None, Some(f64::NAN)])),
        );
        assert!(matches!(certify(&path), Err(ValidationError::NonFiniteNumber { row: 2, .. })));
    }

    #[test]
    fn dates_must_sit_on_their_unit() {
        let dir = tempfile::tempdir().unwrap();
        // 1970-01-05 was a Monday
        let field = with_meta(Field::new("D", DataType::Date32, true), "unit", "week");
        let path = one_column(dir.path(), field.clone(), Arc::new(Date32Array::from(vec![4, 11])));
        assert!(certify(&path).is_ok());

        let path = one_column(dir.path(), field, Arc::new(Date32Array::from(vec![4, 12])));
        assert!(matches!(certify(&path), Err(ValidationError::MisalignedDate { row: 1, .. })));
    }

    #[test]
    fn dictionary_values_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let dict_type = DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8));
        let field = Field::new_dict("T", dict_type, true, 0, false);
        let dict = |keys: Vec<i32>, values: Vec<Option<&str>>| -> ArrayRef {
            Arc::new(
                DictionaryArray::<Int32Type>::try_new(
                    Int32Array::from(keys),
                    Arc::new(StringArray::from(values)),
                )
                .unwrap(),
            )
        };

        let ok = one_column(dir.path(), field.clone(), dict(vec![0, 1, 0], vec![Some("a"), Some("b")]));
        assert!(certify(&ok).is_ok());

        let null = one_column(dir.path(), field.clone(), dict(vec![0, 1], vec![Some("a"), None]));
        assert!(matches!(certify(&null), Err(ValidationError::InvalidDictionary { reason: "null value", .. })));

        let repeated = one_column(dir.path(), field.clone(), dict(vec![0, 1], vec![Some("a"), Some("a")]));
        assert!(matches!(
            certify(&repeated),
            Err(ValidationError::InvalidDictionary { reason: "repeated value", .. })
        ));

        let unused = one_column(dir.path(), field.clone(), dict(vec![0, 0], vec![Some("a"), Some("b")]));
        assert!(matches!(
            certify(&unused),
            Err(ValidationError::InvalidDictionary { reason: "unused value", .. })
        ));

        let large = one_column(dir.path(), field, dict(vec![0, 1, 2], vec![Some("a"), Some("b"), Some("c")]));
        let small = TableValidator::new(ValidatorConfig::default().with_max_dictionary_size(2));
        assert!(matches!(small.certify(&large), Err(ValidationError::DictionaryTooLarge { actual: 3, .. })));
    }

    #[test]
    #[allow(unsafe_code)]
    fn out_of_range_dictionary_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dict_type = DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8));
        let field = Field::new_dict("T", dict_type, true, 0, false);
        // SAFETY: the array is only written to disk, never read in memory.
        let dict = unsafe {
            DictionaryArray::<Int32Type>::new_unchecked(
                Int32Array::from(vec![0, 7]),
                Arc::new(StringArray::from(vec!["a"])),
            )
        };
        let path = one_column(dir.path(), field, Arc::new(dict));
        assert!(matches!(
            certify(&path),
            Err(ValidationError::InvalidArrowFile(_)
                | ValidationError::MalformedColumn { .. }
                | ValidationError::DictionaryKeyOutOfRange { .. })
        ));
    }

    #[test]
    fn unsafe_format_is_fatal_under_any_policy() {
        let dir = tempfile::tempdir().unwrap();
        let field = with_meta(Field::new("N", DataType::Int64, true), "format", "{0.__class__}");
        let path = one_column(dir.path(), field, Arc::new(Int64Array::from(vec![1])));
        for policy in [MetadataPolicy::Downgrade, MetadataPolicy::Reject] {
            let validator = TableValidator::new(ValidatorConfig::default().with_metadata_policy(policy));
            assert!(matches!(validator.certify(&path), Err(ValidationError::UnsafeMetadata { .. })));
        }
    }

    #[test]
    fn invalid_metadata_follows_policy() {
        let dir = tempfile::tempdir().unwrap();
        let number = with_meta(Field::new("N", DataType::Int64, true), "format", "{:x}");
        let text = with_meta(Field::new("T", DataType::Utf8, true), "format", "{:,}");
        let date = with_meta(Field::new("D", DataType::Date32, true), "unit", "fortnight");
        let path = write_raw(
            dir.path(),
            vec![number, text, date],
            &[vec![
                Arc::new(Int64Array::from(vec![1])),
                Arc::new(StringArray::from(vec!["x"])),
                Arc::new(Date32Array::from(vec![0])),
            ]],
        );

        let certified = certify(&path).unwrap();
        assert_eq!(certified.warnings.len(), 3);
        assert_eq!(
            certified.table.columns(),
            &[
                Column::new("N", ColumnType::number()),
                Column::new("T", ColumnType::Text),
                Column::new("D", ColumnType::date(DateUnit::Day)),
            ]
        );
        assert!(certified.table.schema().field(1).metadata().is_empty());

        let strict = TableValidator::new(ValidatorConfig::default().with_metadata_policy(MetadataPolicy::Reject));
        assert!(matches!(strict.certify(&path), Err(ValidationError::InvalidMetadata { .. })));
    }

    #[test]
    fn symlinks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.arrow");
        write_table(&target, &Table::empty()).unwrap();
        let link = dir.path().join("link.arrow");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        assert!(matches!(certify(&link), Err(ValidationError::NotRegularFile(_))));
        assert!(matches!(certify(dir.path()), Err(ValidationError::NotRegularFile(_))));
    }

    #[test]
    fn certified_table_rewrites_identically() {
        let dir = tempfile::tempdir().unwrap();
        let field = with_meta(Field::new("N", DataType::Float64, true), "format", "{:.1%}");
        let path = one_column(dir.path(), field, Arc::new(Float64Array::from(vec![0.5, 0.25])));
        let first = certify(&path).unwrap().table;

        let rewritten = dir.path().join("rewritten.arrow");
        write_table(&rewritten, &first).unwrap();
        let second = certify(&rewritten).unwrap().table;
        assert_eq!(first, second);
        assert_eq!(second.columns()[0], Column::new("N", ColumnType::number_with_format("{:.1%}")));
    }

    #[test]
    fn files_over_the_size_ceiling_are_refused_unread() {
        let dir = tempfile::tempdir().unwrap();
        let path = one_column(
            dir.path(),
            Field::new("A", DataType::Int64, true),
            Arc::new(Int64Array::from(vec![1, 2, 3])),
        );
        let len = std::fs::metadata(&path).unwrap().len();

        let tight = TableValidator::new(ValidatorConfig::default().with_max_file_bytes(len - 1));
        let err = tight.certify(&path).unwrap_err();
        assert!(
            matches!(err, ValidationError::FileTooLarge { actual, max } if actual == len && max == len - 1),
            "{err:?}"
        );

        let exact = TableValidator::new(ValidatorConfig::default().with_max_file_bytes(len));
        assert_eq!(exact.certify(&path).unwrap().table.num_rows(), 3);
    }

    #[test]
    fn sparse_giant_file_is_refused_before_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.arrow");
        let file = File::create(&path).unwrap();
        file.set_len(ValidatorConfig::default().max_file_bytes + 1).unwrap();
        assert!(matches!(certify(&path), Err(ValidationError::FileTooLarge { .. })));
    }
}
