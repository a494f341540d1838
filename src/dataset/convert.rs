//! Conversion of raw input cells into typed values.
//!
//! Conversion never blocks storage: a cell that cannot be converted is stored
//! as NULL, and the reason is recorded out-of-band as a `TransformationError`
//! carrying the raw original value.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::DatasetError;

use super::schema::{ColumnConfiguration, DataConfiguration, DataType, Value, DATE_FORMAT,
    DATE_TIME_FORMAT};

/// Why a raw cell could not be converted to its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    MissingValue,
    FormatError,
    ValueNotInRange,
    ConfigError,
    Other,
}

impl ErrorKind {
    /// Stable string used for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MissingValue => "MISSING_VALUE",
            ErrorKind::FormatError => "FORMAT_ERROR",
            ErrorKind::ValueNotInRange => "VALUE_NOT_IN_RANGE",
            ErrorKind::ConfigError => "CONFIG_ERROR",
            ErrorKind::Other => "OTHER",
        }
    }

    /// Parses the persisted string form; unknown strings map to `Other`.
    pub fn parse(s: &str) -> Self {
        match s {
            "MISSING_VALUE" => ErrorKind::MissingValue,
            "FORMAT_ERROR" => ErrorKind::FormatError,
            "VALUE_NOT_IN_RANGE" => ErrorKind::ValueNotInRange,
            "CONFIG_ERROR" => ErrorKind::ConfigError,
            _ => ErrorKind::Other,
        }
    }
}

/// Per-cell record of a failed conversion, stored alongside the NULL cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationError {
    /// Insertion-order index of the affected row.
    pub row_index: i64,
    /// Index of the affected column in the dataset schema.
    pub column_index: usize,
    /// Why the conversion failed.
    pub kind: ErrorKind,
    /// The raw, pre-validation value.
    pub raw_value: Option<String>,
}

/// Converts one raw row against a schema.
///
/// Returns the typed values (NULL where conversion failed) and the
/// transformation errors produced along the way. An `Undefined` column type
/// is a fatal configuration error, not a transformation error.
pub fn convert_row(
    raw: &[Option<String>],
    config: &DataConfiguration,
    row_index: i64,
) -> Result<(Vec<Value>, Vec<TransformationError>), DatasetError> {
    if raw.len() != config.columns.len() {
        return Err(DatasetError::RowWidthMismatch {
            expected: config.columns.len(),
            actual: raw.len(),
        });
    }

    let mut values = Vec::with_capacity(raw.len());
    let mut errors = Vec::new();

    for (column, cell) in config.columns.iter().zip(raw.iter()) {
        if column.data_type == DataType::Undefined {
            return Err(DatasetError::UndefinedType(column.name.clone()));
        }

        match cell.as_deref().map(str::trim) {
            None | Some("") => {
                values.push(Value::Null);
                errors.push(TransformationError {
                    row_index,
                    column_index: column.index,
                    kind: ErrorKind::MissingValue,
                    raw_value: cell.clone(),
                });
            }
            Some(text) => match convert_cell(text, column) {
                Ok(value) => values.push(value),
                Err(kind) => {
                    values.push(Value::Null);
                    errors.push(TransformationError {
                        row_index,
                        column_index: column.index,
                        kind,
                        raw_value: Some(text.to_string()),
                    });
                }
            },
        }
    }

    Ok((values, errors))
}

/// Converts one trimmed, non-empty raw cell.
fn convert_cell(text: &str, column: &ColumnConfiguration) -> Result<Value, ErrorKind> {
    match column.data_type {
        DataType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Boolean(true)),
            "false" | "0" => Ok(Value::Boolean(false)),
            _ => Err(ErrorKind::FormatError),
        },
        DataType::Date => NaiveDate::parse_from_str(text, DATE_FORMAT)
            .map(Value::Date)
            .map_err(|_| ErrorKind::FormatError),
        DataType::DateTime => NaiveDateTime::parse_from_str(text, DATE_TIME_FORMAT)
            .map(Value::DateTime)
            .map_err(|_| ErrorKind::FormatError),
        DataType::Decimal => {
            let parsed: f64 = text.parse().map_err(|_| ErrorKind::FormatError)?;
            check_range(parsed, column)?;
            Ok(Value::Decimal(parsed))
        }
        DataType::Integer => {
            let parsed: i64 = text.parse().map_err(|_| ErrorKind::FormatError)?;
            check_range(parsed as f64, column)?;
            Ok(Value::Integer(parsed))
        }
        DataType::String => Ok(Value::String(text.to_string())),
        // Caller rejects Undefined before reaching here.
        DataType::Undefined => Err(ErrorKind::ConfigError),
    }
}

fn check_range(value: f64, column: &ColumnConfiguration) -> Result<(), ErrorKind> {
    match &column.range {
        Some(range) if !range.contains(value) => Err(ErrorKind::ValueNotInRange),
        _ => Ok(()),
    }
}
