//! `Table` as seen by module scripts
//!
//! Columns a script never touches keep their original Arrow arrays, so a
//! table passed through unchanged is written back byte-for-byte. Columns a
//! script sets are rebuilt from script values:
//!
//! | script values        | Arrow type        | column type |
//! |----------------------|-------------------|-------------|
//! | ints and `()`        | Int64             | Number      |
//! | any float            | Float64           | Number      |
//! | strings and `()`     | Utf8              | Text        |
//! | only `()`            | Utf8              | Text        |
//!
//! Timestamps are ints of nanoseconds since the epoch; dates are ints of
//! days since the epoch.

use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{
    Array as _, ArrayRef, AsArray, Date32Array, Float64Array, Int64Array, StringArray, TimestampNanosecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{
    DataType, Date32Type, Float64Type, Int64Type, TimeUnit, TimestampNanosecondType, UInt64Type,
};
use modbox_table::{Column, ColumnType, DateUnit, Table, TableError};
use rhai::{Dynamic, EvalAltResult};

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Mutable table handed to `render()` and built by `new_table()`
#[derive(Debug, Clone, Default)]
pub struct ScriptTable {
    columns: Vec<Column>,
    arrays: Vec<ArrayRef>,
    num_rows: usize,
}

impl From<Table> for ScriptTable {
    fn from(table: Table) -> Self {
        let num_rows = table.num_rows();
        let (columns, arrays) = table.into_parts();
        Self {
            columns,
            arrays,
            num_rows,
        }
    }
}

impl ScriptTable {
    /// Convert back into a host table
    ///
    /// # Errors
    ///
    /// Fails only if the columns and arrays disagree, which the script API
    /// prevents.
    pub fn into_table(self) -> Result<Table, TableError> {
        Table::try_new(self.columns, self.arrays)
    }

    /// Number of rows
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Column names, in order
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn position(&self, name: &str) -> ScriptResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| format!("no column named {name:?}").into())
    }

    /// Values of one column
    ///
    /// # Errors
    ///
    /// Fails for an unknown column.
    pub fn column_values(&self, name: &str) -> ScriptResult<rhai::Array> {
        let position = self.position(name)?;
        to_values(&self.arrays[position]).map_err(Into::into)
    }

    /// Type name of one column: `number`, `text`, `timestamp` or `date`
    ///
    /// # Errors
    ///
    /// Fails for an unknown column.
    pub fn column_type(&self, name: &str) -> ScriptResult<String> {
        let position = self.position(name)?;
        Ok(self.columns[position].column_type.name().to_string())
    }

    /// Number format of a Number column
    ///
    /// # Errors
    ///
    /// Fails for an unknown or non-Number column.
    pub fn number_format(&self, name: &str) -> ScriptResult<String> {
        match &self.columns[self.position(name)?].column_type {
            ColumnType::Number { format } => Ok(format.clone()),
            other => Err(format!("column {name:?} is {}, not number", other.name()).into()),
        }
    }

    /// Replace or append a column built from plain values
    ///
    /// # Errors
    ///
    /// Fails on mixed or unsupported values and on a length mismatch.
    pub fn set_column(&mut self, name: &str, values: &rhai::Array) -> ScriptResult<()> {
        let (array, mut column_type) = from_values(values)?;
        if let (ColumnType::Number { format }, Some(ColumnType::Number { format: existing })) = (
            &mut column_type,
            self.position(name).ok().map(|p| &self.columns[p].column_type),
        ) {
            format.clone_from(existing);
        }
        self.put(name, column_type, array)
    }

    /// Replace or append a Timestamp column of nanoseconds
    ///
    /// # Errors
    ///
    /// Fails on non-integer values and on a length mismatch.
    pub fn set_timestamp_column(&mut self, name: &str, values: &rhai::Array) -> ScriptResult<()> {
        let nanos = ints(values, "timestamp")?;
        let array: ArrayRef = Arc::new(TimestampNanosecondArray::from(nanos));
        self.put(name, ColumnType::Timestamp, array)
    }

    /// Replace or append a Date column of days since the epoch
    ///
    /// # Errors
    ///
    /// Fails on an unknown unit, out-of-range values and a length mismatch.
    pub fn set_date_column(&mut self, name: &str, values: &rhai::Array, unit: &str) -> ScriptResult<()> {
        let unit = DateUnit::from_str(unit).map_err(|e| e.to_string())?;
        let days = ints(values, "date")?
            .into_iter()
            .map(|d| d.map(i32::try_from).transpose())
            .collect::<Result<Vec<Option<i32>>, _>>()
            .map_err(|_| "date out of range".to_string())?;
        let array: ArrayRef = Arc::new(Date32Array::from(days));
        self.put(name, ColumnType::date(unit), array)
    }

    /// Set the display format of a Number column
    ///
    /// The format is not checked here; the host validates it.
    ///
    /// # Errors
    ///
    /// Fails for an unknown or non-Number column.
    pub fn set_number_format(&mut self, name: &str, format: &str) -> ScriptResult<()> {
        let position = self.position(name)?;
        match &mut self.columns[position].column_type {
            ColumnType::Number { format: current } => {
                *current = format.to_string();
                Ok(())
            }
            other => Err(format!("column {name:?} is {}, not number", other.name()).into()),
        }
    }

    /// Remove a column
    ///
    /// # Errors
    ///
    /// Fails for an unknown column.
    pub fn remove_column(&mut self, name: &str) -> ScriptResult<()> {
        let position = self.position(name)?;
        self.columns.remove(position);
        self.arrays.remove(position);
        if self.columns.is_empty() {
            self.num_rows = 0;
        }
        Ok(())
    }

    /// Rename a column in place
    ///
    /// # Errors
    ///
    /// Fails for an unknown column or when `to` is taken.
    pub fn rename_column(&mut self, from: &str, to: &str) -> ScriptResult<()> {
        let position = self.position(from)?;
        if from != to && self.position(to).is_ok() {
            return Err(format!("column {to:?} already exists").into());
        }
        self.columns[position].name = to.to_string();
        Ok(())
    }

    fn put(&mut self, name: &str, column_type: ColumnType, array: ArrayRef) -> ScriptResult<()> {
        if self.columns.is_empty() {
            self.num_rows = array.len();
        } else if array.len() != self.num_rows {
            return Err(format!("column {name:?} has {} values, table has {} rows", array.len(), self.num_rows).into());
        }
        let column = Column::new(name, column_type);
        match self.position(name) {
            Ok(position) => {
                self.columns[position] = column;
                self.arrays[position] = array;
            }
            Err(_) => {
                self.columns.push(column);
                self.arrays.push(array);
            }
        }
        Ok(())
    }
}

fn to_values(array: &ArrayRef) -> Result<rhai::Array, String> {
    let cast_to = |data_type: &DataType| cast(array, data_type).map_err(|e| e.to_string());
    let values = match array.data_type() {
        DataType::Float32 | DataType::Float64 => cast_to(&DataType::Float64)?
            .as_primitive::<Float64Type>()
            .iter()
            .map(|v| v.map_or(Dynamic::UNIT, Dynamic::from_float))
            .collect(),
        #[allow(clippy::cast_precision_loss)]
        DataType::UInt64 => array
            .as_primitive::<UInt64Type>()
            .iter()
            .map(|v| match v {
                None => Dynamic::UNIT,
                Some(n) => i64::try_from(n).map_or_else(|_| Dynamic::from_float(n as f64), Dynamic::from_int),
            })
            .collect(),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => cast_to(&DataType::Int64)?
            .as_primitive::<Int64Type>()
            .iter()
            .map(|v| v.map_or(Dynamic::UNIT, Dynamic::from_int))
            .collect(),
        DataType::Utf8 | DataType::Dictionary(..) => cast_to(&DataType::Utf8)?
            .as_string::<i32>()
            .iter()
            .map(|v| v.map_or(Dynamic::UNIT, |s| Dynamic::from(s.to_string())))
            .collect(),
        DataType::Timestamp(TimeUnit::Nanosecond, None) => array
            .as_primitive::<TimestampNanosecondType>()
            .iter()
            .map(|v| v.map_or(Dynamic::UNIT, Dynamic::from_int))
            .collect(),
        DataType::Date32 => array
            .as_primitive::<Date32Type>()
            .iter()
            .map(|v| v.map_or(Dynamic::UNIT, |d| Dynamic::from_int(i64::from(d))))
            .collect(),
        other => return Err(format!("unsupported column type {other}")),
    };
    Ok(values)
}

fn from_values(values: &rhai::Array) -> ScriptResult<(ArrayRef, ColumnType)> {
    let (mut ints, mut floats, mut texts) = (false, false, false);
    for value in values {
        if value.is_unit() {
            continue;
        } else if value.is_int() {
            ints = true;
        } else if value.is_float() {
            floats = true;
        } else if value.is_string() {
            texts = true;
        } else {
            return Err(format!("unsupported column value of type {}", value.type_name()).into());
        }
    }
    if texts && (ints || floats) {
        return Err("column mixes text and numbers".into());
    }

    let array: ArrayRef = if floats {
        #[allow(clippy::cast_precision_loss)]
        let floats: Float64Array = values
            .iter()
            .map(|v| v.as_float().ok().or_else(|| v.as_int().ok().map(|n| n as f64)))
            .collect();
        Arc::new(floats)
    } else if ints {
        let ints: Int64Array = values.iter().map(|v| v.as_int().ok()).collect();
        Arc::new(ints)
    } else {
        let texts: StringArray = values.iter().map(|v| v.clone().into_string().ok()).collect();
        return Ok((Arc::new(texts), ColumnType::Text));
    };
    Ok((array, ColumnType::number()))
}

fn ints(values: &rhai::Array, what: &str) -> ScriptResult<Vec<Option<i64>>> {
    values
        .iter()
        .map(|v| {
            if v.is_unit() {
                Ok(None)
            } else {
                v.as_int().map(Some).map_err(|t| -> Box<EvalAltResult> {
                    format!("{what} values must be integers, not {t}").into()
                })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use modbox_test_utils::{number_table, text_table};
    use pretty_assertions::assert_eq;

    fn values(items: Vec<Dynamic>) -> rhai::Array {
        items
    }

    #[test]
    fn untouched_table_round_trips() {
        let table = number_table("A", &[1, 2, 3]);
        let script = ScriptTable::from(table.clone());
        assert_eq!(script.into_table().unwrap(), table);
    }

    #[test]
    fn reads_numbers_and_text() {
        let script = ScriptTable::from(number_table("A", &[1, 2]));
        let a = script.column_values("A").unwrap();
        assert_eq!(a.iter().map(|v| v.as_int().unwrap()).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(script.column_type("A").unwrap(), "number");

        let script = ScriptTable::from(text_table("B", &[Some("x"), None]));
        let b = script.column_values("B").unwrap();
        assert_eq!(b[0].clone().into_string().unwrap(), "x");
        assert!(b[1].is_unit());
    }

    #[test]
    fn set_column_infers_types() {
        let mut script = ScriptTable::default();
        script
            .set_column("n", &values(vec![Dynamic::from_int(1), Dynamic::UNIT]))
            .unwrap();
        script
            .set_column("f", &values(vec![Dynamic::from_int(1), Dynamic::from_float(0.5)]))
            .unwrap();
        script
            .set_column("s", &values(vec![Dynamic::from("a".to_string()), Dynamic::UNIT]))
            .unwrap();
        assert_eq!(script.num_rows(), 2);

        let table = script.into_table().unwrap();
        let types: Vec<_> = table.arrays().iter().map(|a| a.data_type().clone()).collect();
        assert_eq!(types, vec![DataType::Int64, DataType::Float64, DataType::Utf8]);
    }

    #[test]
    fn set_column_keeps_existing_number_format() {
        let mut script = ScriptTable::from(number_table("A", &[1]));
        script.set_number_format("A", "{:.2f}").unwrap();
        script.set_column("A", &values(vec![Dynamic::from_int(2)])).unwrap();
        assert_eq!(script.number_format("A").unwrap(), "{:.2f}");
    }

    #[test]
    fn rejects_bad_values() {
        let mut script = ScriptTable::from(number_table("A", &[1, 2]));
        assert!(script.set_column("B", &values(vec![Dynamic::from_int(1)])).is_err());
        assert!(script
            .set_column("B", &values(vec![Dynamic::from_int(1), Dynamic::from("x".to_string())]))
            .is_err());
        assert!(script
            .set_column("B", &values(vec![Dynamic::TRUE, Dynamic::FALSE]))
            .is_err());
        assert!(script.column_values("missing").is_err());
    }

    #[test]
    fn dates_and_timestamps() {
        let mut script = ScriptTable::default();
        script
            .set_date_column("d", &values(vec![Dynamic::from_int(0), Dynamic::UNIT]), "month")
            .unwrap();
        script
            .set_timestamp_column("t", &values(vec![Dynamic::from_int(1_000), Dynamic::from_int(2_000)]))
            .unwrap();
        assert!(script.set_date_column("x", &values(vec![Dynamic::from_int(0), Dynamic::UNIT]), "fortnight").is_err());

        let table = script.into_table().unwrap();
        assert_eq!(table.columns()[0].column_type, ColumnType::date(DateUnit::Month));
        assert_eq!(table.columns()[1].column_type, ColumnType::Timestamp);
    }

    #[test]
    fn rename_and_remove() {
        let mut script = ScriptTable::from(number_table("A", &[1]));
        script.set_column("B", &values(vec![Dynamic::from_int(2)])).unwrap();
        assert!(script.rename_column("A", "B").is_err());
        script.rename_column("A", "C").unwrap();
        script.remove_column("B").unwrap();
        assert_eq!(script.column_names(), vec!["C".to_string()]);
        script.remove_column("C").unwrap();
        assert_eq!(script.num_rows(), 0);
    }
}
