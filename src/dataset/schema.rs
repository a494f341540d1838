//! Dynamic per-dataset schema and typed cell values.
//!
//! Each dataset carries a `DataConfiguration`: an ordered list of column
//! definitions with a logical data type, a measurement scale and optional
//! per-type constraints. Cell values are represented by the `Value` sum type;
//! `Value::Null` maps to physical NULL.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::config::is_valid_column_name;
use crate::error::{ConfigError, DatasetError};

/// Logical data type of a column.
///
/// Every logical type maps to exactly one physical encoding. `Undefined` is a
/// fatal configuration error anywhere a physical encoding is needed and is
/// never silently coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Boolean,
    Date,
    DateTime,
    Decimal,
    Integer,
    String,
    Undefined,
}

impl DataType {
    /// Returns the physical SQL type for this logical type.
    pub fn sql_type(self, column: &str) -> Result<&'static str, DatasetError> {
        match self {
            DataType::Boolean => Ok("BOOLEAN"),
            DataType::Date => Ok("DATE"),
            DataType::DateTime => Ok("TIMESTAMP(6)"),
            DataType::Decimal => Ok("DOUBLE PRECISION"),
            DataType::Integer => Ok("BIGINT"),
            DataType::String => Ok("TEXT"),
            DataType::Undefined => Err(DatasetError::UndefinedType(column.to_string())),
        }
    }
}

/// Measurement scale of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scale {
    Nominal,
    Ordinal,
    Interval,
    Ratio,
    Date,
}

/// Inclusive numeric range constraint for Integer/Decimal columns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    /// Whether a numeric value lies within this range.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Definition of one column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfiguration {
    /// Position of the column, contiguous from 0.
    pub index: usize,
    /// Column name; doubles as the physical column identifier.
    pub name: String,
    /// Logical data type.
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Measurement scale.
    pub scale: Scale,
    /// Optional range constraint for numeric columns.
    #[serde(default)]
    pub range: Option<ValueRange>,
}

/// Ordered column definitions of a dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfiguration {
    pub columns: Vec<ColumnConfiguration>,
}

impl DataConfiguration {
    /// Creates a configuration from columns, re-indexing them contiguously.
    pub fn new(mut columns: Vec<ColumnConfiguration>) -> Self {
        for (idx, column) in columns.iter_mut().enumerate() {
            column.index = idx;
        }
        Self { columns }
    }

    /// Validates column identifiers and index contiguity.
    pub fn check(&self) -> Result<(), ConfigError> {
        for (idx, column) in self.columns.iter().enumerate() {
            if !is_valid_column_name(&column.name) {
                return Err(ConfigError::InvalidColumnName(column.name.clone()));
            }
            if column.index != idx {
                return Err(ConfigError::Validation(format!(
                    "column '{}' has index {} but sits at position {}",
                    column.name, column.index, idx
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "column",
                    name: column.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnConfiguration> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Projects this configuration onto the requested column names.
    ///
    /// An empty request selects all columns in original order. Otherwise
    /// every requested name must exist; unknown names are reported together
    /// in a single error. The resulting schema is re-indexed from 0.
    pub fn select(&self, names: &[String]) -> Result<DataConfiguration, DatasetError> {
        if names.is_empty() {
            return Ok(self.clone());
        }

        let unknown: Vec<&str> = names
            .iter()
            .filter(|n| self.column(n).is_none())
            .map(|n| n.as_str())
            .collect();
        if !unknown.is_empty() {
            return Err(DatasetError::UnknownColumns(unknown.join(", ")));
        }

        let columns = names
            .iter()
            .map(|n| self.column(n).cloned().expect("existence checked above"))
            .collect();
        Ok(DataConfiguration::new(columns))
    }
}

/// One typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Decimal(f64),
    Integer(i64),
    String(String),
    Null,
}

/// Timestamp format with microsecond precision.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Date format.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

impl Value {
    /// Whether this is the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts this value into its JSON representation.
    ///
    /// Dates and timestamps serialize as ISO strings; everything else maps to
    /// its natural JSON type.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Date(d) => serde_json::Value::String(d.format(DATE_FORMAT).to_string()),
            Value::DateTime(t) => {
                serde_json::Value::String(t.format(DATE_TIME_FORMAT).to_string())
            }
            Value::Decimal(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Integer(i) => serde_json::Value::Number((*i).into()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Null => serde_json::Value::Null,
        }
    }

    /// Parses a JSON cell against a declared column type.
    ///
    /// Used for fully-typed DATA_SET payloads, where a mismatch is a data
    /// error rather than a transformation error.
    pub fn from_json(
        json: &serde_json::Value,
        data_type: DataType,
        row: usize,
        column: usize,
    ) -> Result<Value, DatasetError> {
        let mismatch = |expected: &'static str| DatasetError::CellType {
            row,
            column,
            expected,
            value: json.to_string(),
        };

        if json.is_null() {
            return Ok(Value::Null);
        }

        match data_type {
            DataType::Boolean => json
                .as_bool()
                .map(Value::Boolean)
                .ok_or_else(|| mismatch("boolean")),
            DataType::Date => json
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok())
                .map(Value::Date)
                .ok_or_else(|| mismatch("date")),
            DataType::DateTime => json
                .as_str()
                .and_then(|s| NaiveDateTime::parse_from_str(s, DATE_TIME_FORMAT).ok())
                .map(Value::DateTime)
                .ok_or_else(|| mismatch("timestamp")),
            DataType::Decimal => json
                .as_f64()
                .map(Value::Decimal)
                .ok_or_else(|| mismatch("decimal")),
            DataType::Integer => json
                .as_i64()
                .map(Value::Integer)
                .ok_or_else(|| mismatch("integer")),
            DataType::String => json
                .as_str()
                .map(|s| Value::String(s.to_string()))
                .ok_or_else(|| mismatch("string")),
            DataType::Undefined => Err(DatasetError::UndefinedType(format!("column {}", column))),
        }
    }
}
