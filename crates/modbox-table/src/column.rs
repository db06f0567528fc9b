//! Column model
//!
//! A column is a name plus one logical type. Display metadata (number
//! format, date unit) lives in the type, and travels as Arrow field
//! metadata under [`FORMAT_METADATA_KEY`] and [`UNIT_METADATA_KEY`].

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Number format applied when a column declares none
pub const DEFAULT_NUMBER_FORMAT: &str = "{:,}";

/// Field metadata key holding a Number column's format
pub const FORMAT_METADATA_KEY: &str = "format";

/// Field metadata key holding a Date column's unit
pub const UNIT_METADATA_KEY: &str = "unit";

/// Days from 0001-01-01 (CE day 1) to 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Granularity of a Date column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateUnit {
    /// Any day
    #[default]
    Day,
    /// Mondays
    Week,
    /// First of the month
    Month,
    /// First of January, April, July or October
    Quarter,
    /// First of January
    Year,
}

impl DateUnit {
    /// Metadata spelling
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        }
    }

    /// Check that a date, in days since the Unix epoch, sits on this unit
    #[must_use]
    pub fn is_aligned(self, days_since_epoch: i32) -> bool {
        let Some(date) = days_since_epoch
            .checked_add(UNIX_EPOCH_DAYS_FROM_CE)
            .and_then(NaiveDate::from_num_days_from_ce_opt)
        else {
            return false;
        };
        match self {
            Self::Day => true,
            Self::Week => date.weekday() == Weekday::Mon,
            Self::Month => date.day() == 1,
            Self::Quarter => date.day() == 1 && matches!(date.month(), 1 | 4 | 7 | 10),
            Self::Year => date.day() == 1 && date.month() == 1,
        }
    }
}

impl fmt::Display for DateUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DateUnit {
    type Err = UnknownDateUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "quarter" => Ok(Self::Quarter),
            "year" => Ok(Self::Year),
            other => Err(UnknownDateUnit(other.to_string())),
        }
    }
}

/// Date unit spelling not in [`DateUnit`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown date unit {0:?}")]
pub struct UnknownDateUnit(pub String);

/// Logical column type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnType {
    /// Integers or floats, shown with a format string
    Number {
        /// Display format, e.g. `{:,.2f}`
        format: String,
    },
    /// UTF-8 text, plain or dictionary-encoded
    Text,
    /// Nanosecond instants, no time zone
    Timestamp,
    /// Calendar dates at a unit granularity
    Date {
        /// Granularity
        unit: DateUnit,
    },
}

impl ColumnType {
    /// Number with the default format
    #[inline]
    #[must_use]
    pub fn number() -> Self {
        Self::Number {
            format: DEFAULT_NUMBER_FORMAT.to_string(),
        }
    }

    /// Number with an explicit format
    #[inline]
    #[must_use]
    pub fn number_with_format(format: impl Into<String>) -> Self {
        Self::Number {
            format: format.into(),
        }
    }

    /// Date at `unit`
    #[inline]
    #[must_use]
    pub fn date(unit: DateUnit) -> Self {
        Self::Date { unit }
    }

    /// Short type name used in messages
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Number { .. } => "number",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
            Self::Date { .. } => "date",
        }
    }

    /// Field metadata entry this type writes, if any
    #[must_use]
    pub fn metadata_entry(&self) -> Option<(&'static str, String)> {
        match self {
            Self::Number { format } => Some((FORMAT_METADATA_KEY, format.clone())),
            Self::Date { unit } => Some((UNIT_METADATA_KEY, unit.as_str().to_string())),
            Self::Text | Self::Timestamp => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number { format } => write!(f, "number({format})"),
            Self::Date { unit } => write!(f, "date({unit})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    /// Column name, unique within a table
    pub name: String,
    /// Logical type
    #[serde(flatten)]
    pub column_type: ColumnType,
}

impl Column {
    /// Create a column
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn days(y: i32, m: u32, d: u32) -> i32 {
        let date = NaiveDate::from_ymd_opt(y, m, d).unwrap();
        date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
    }

    #[test]
    fn epoch_is_day_zero() {
        assert_eq!(days(1970, 1, 1), 0);
    }

    #[test]
    fn unit_alignment() {
        // 2024-01-01 was a Monday
        assert!(DateUnit::Week.is_aligned(days(2024, 1, 1)));
        assert!(!DateUnit::Week.is_aligned(days(2024, 1, 2)));
        assert!(DateUnit::Month.is_aligned(days(2024, 2, 1)));
        assert!(!DateUnit::Month.is_aligned(days(2024, 2, 2)));
        assert!(DateUnit::Quarter.is_aligned(days(2024, 4, 1)));
        assert!(!DateUnit::Quarter.is_aligned(days(2024, 5, 1)));
        assert!(DateUnit::Year.is_aligned(days(1999, 1, 1)));
        assert!(!DateUnit::Year.is_aligned(days(1999, 7, 1)));
        assert!(DateUnit::Day.is_aligned(days(1999, 7, 13)));
    }

    #[test]
    fn out_of_range_dates_are_not_aligned() {
        assert!(!DateUnit::Day.is_aligned(i32::MAX));
        assert!(!DateUnit::Day.is_aligned(i32::MIN));
    }

    #[test]
    fn unit_spelling_round_trips() {
        for unit in [DateUnit::Day, DateUnit::Week, DateUnit::Month, DateUnit::Quarter, DateUnit::Year] {
            assert_eq!(unit.as_str().parse::<DateUnit>(), Ok(unit));
        }
        assert!("fortnight".parse::<DateUnit>().is_err());
    }

    #[test]
    fn metadata_entries() {
        assert_eq!(
            ColumnType::number().metadata_entry(),
            Some((FORMAT_METADATA_KEY, "{:,}".to_string()))
        );
        assert_eq!(
            ColumnType::date(DateUnit::Month).metadata_entry(),
            Some((UNIT_METADATA_KEY, "month".to_string()))
        );
        assert_eq!(ColumnType::Text.metadata_entry(), None);
    }

    #[test]
    fn column_serializes_flat() {
        let column = Column::new("A", ColumnType::number_with_format("{:.2f}"));
        let value = serde_json::to_value(&column).unwrap();
        assert_eq!(value, serde_json::json!({"name": "A", "type": "number", "format": "{:.2f}"}));
    }
}
