//! Dataset export: projection of a stored dataset into row/column form.
//!
//! Applies column selection, row filtering (all/valid/error-only), hold-out
//! filtering, pagination and error-cell encoding. Filtering is a predicate
//! over the recorded transformation error set; the stored data is never
//! mutated by an export.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::HoldOutSelectorConfig;
use crate::error::DatasetError;

use super::convert::{ErrorKind, TransformationError};
use super::schema::DataConfiguration;
use super::store::{DatasetStore, StoredRow};

/// Which rows to export, relative to the recorded transformation errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowSelector {
    /// No filter.
    #[default]
    All,
    /// Rows with no transformation error recorded.
    Valid,
    /// Rows with at least one transformation error recorded.
    Errors,
}

/// Hold-out filter over the hidden per-row flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldOutSelector {
    #[default]
    All,
    HoldOut,
    NotHoldOut,
}

impl HoldOutSelector {
    /// The flag value this selector filters on, if any.
    pub fn flag_filter(self) -> Option<bool> {
        match self {
            HoldOutSelector::All => None,
            HoldOutSelector::HoldOut => Some(true),
            HoldOutSelector::NotHoldOut => Some(false),
        }
    }
}

impl From<HoldOutSelectorConfig> for HoldOutSelector {
    fn from(config: HoldOutSelectorConfig) -> Self {
        match config {
            HoldOutSelectorConfig::All => HoldOutSelector::All,
            HoldOutSelectorConfig::HoldOut => HoldOutSelector::HoldOut,
            HoldOutSelectorConfig::NotHoldOut => HoldOutSelector::NotHoldOut,
        }
    }
}

/// 1-based pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Page number, starting at 1.
    pub page: usize,
    /// Rows per page.
    pub page_size: usize,
}

impl Pagination {
    /// The offset into the (filtered) row sequence.
    pub fn offset(&self) -> usize {
        (self.page - 1) * self.page_size
    }
}

/// How an error cell is rendered on export.
///
/// Parsed from configuration strings: `$null` emits a literal null, `$value`
/// emits the recorded raw original value, anything else is a fixed
/// substitute literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorValueEncoding {
    Null,
    OriginalValue,
    Substitute(String),
}

impl ErrorValueEncoding {
    /// Parses the configuration string form.
    pub fn parse(s: &str) -> Self {
        match s {
            "$null" => ErrorValueEncoding::Null,
            "$value" => ErrorValueEncoding::OriginalValue,
            other => ErrorValueEncoding::Substitute(other.to_string()),
        }
    }
}

/// The four independently configurable error-cell encodings.
///
/// The default applies when a more specific per-kind encoding is unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEncodings {
    pub default: ErrorValueEncoding,
    pub missing_value: Option<ErrorValueEncoding>,
    pub format_error: Option<ErrorValueEncoding>,
    pub value_not_in_range: Option<ErrorValueEncoding>,
}

impl Default for ErrorEncodings {
    fn default() -> Self {
        Self {
            default: ErrorValueEncoding::Null,
            missing_value: None,
            format_error: None,
            value_not_in_range: None,
        }
    }
}

impl ErrorEncodings {
    /// Resolves the encoding for an error kind, falling back to the default.
    pub fn resolve(&self, kind: ErrorKind) -> &ErrorValueEncoding {
        let specific = match kind {
            ErrorKind::MissingValue => self.missing_value.as_ref(),
            ErrorKind::FormatError => self.format_error.as_ref(),
            ErrorKind::ValueNotInRange => self.value_not_in_range.as_ref(),
            ErrorKind::ConfigError | ErrorKind::Other => None,
        };
        specific.unwrap_or(&self.default)
    }

    /// Whether every applicable encoding resolves to "emit null".
    ///
    /// Error cells are already stored as NULL, so in that case no rewriting
    /// pass is needed.
    pub fn all_null(&self) -> bool {
        self.default == ErrorValueEncoding::Null
            && [
                &self.missing_value,
                &self.format_error,
                &self.value_not_in_range,
            ]
            .iter()
            .all(|e| matches!(e, None | Some(ErrorValueEncoding::Null)))
    }
}

/// Options for one export call.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Column names to export; empty exports all columns in original order.
    pub columns: Vec<String>,
    /// Row filter relative to the transformation error set.
    pub rows: RowSelector,
    /// Hold-out filter.
    pub hold_out: HoldOutSelector,
    /// Optional 1-based pagination window.
    pub pagination: Option<Pagination>,
    /// Error-cell encodings.
    pub encodings: ErrorEncodings,
}

/// One exported row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedRow {
    /// 0-based position within the filtered sequence.
    pub position: i64,
    /// Cell values in selected-column order.
    pub cells: Vec<serde_json::Value>,
}

/// The result of one export call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedTable {
    /// Selected schema, re-indexed contiguously from 0.
    pub columns: DataConfiguration,
    /// Rows in the requested window.
    pub rows: Vec<ExportedRow>,
    /// Transformation errors affecting the window, column indexes re-mapped
    /// to the selected schema.
    pub errors: Vec<TransformationError>,
    /// Total number of rows in the filtered sequence, ignoring pagination.
    pub total: i64,
}

/// Projects stored datasets into exportable row/column form.
#[derive(Clone)]
pub struct ExportService {
    store: DatasetStore,
}

impl ExportService {
    /// Creates a new export service on the given store.
    pub fn new(store: DatasetStore) -> Self {
        Self { store }
    }

    /// Exports a dataset.
    pub async fn export(
        &self,
        dataset_id: i64,
        schema: &DataConfiguration,
        options: &ExportOptions,
    ) -> Result<ExportedTable, DatasetError> {
        if let Some(p) = &options.pagination {
            if p.page == 0 {
                return Err(DatasetError::InvalidPage(p.page));
            }
        }

        let selected = schema.select(&options.columns)?;
        let flag = options.hold_out.flag_filter();

        let errors = self.store.fetch_transformation_errors(dataset_id).await?;
        let error_rows: HashSet<i64> = errors.iter().map(|e| e.row_index).collect();

        let (window, total) = match options.rows {
            RowSelector::All => {
                // Unfiltered path: positions derive directly from the offset,
                // so the window can come from LIMIT/OFFSET.
                let total = self.store.count(dataset_id, flag).await?;
                let sql_window = options
                    .pagination
                    .map(|p| (p.page_size as i64, p.offset() as i64));
                let offset = options.pagination.map(|p| p.offset()).unwrap_or(0) as i64;
                let rows = self
                    .store
                    .fetch_rows(dataset_id, &selected, flag, sql_window)
                    .await?;
                let window = rows
                    .into_iter()
                    .enumerate()
                    .map(|(i, row)| (offset + i as i64, row))
                    .collect::<Vec<_>>();
                (window, total)
            }
            selector => {
                // Filtered path: materialize the filtered sequence so that
                // positions index it, not the physical table.
                let rows = self
                    .store
                    .fetch_rows(dataset_id, &selected, flag, None)
                    .await?;
                filter_and_window(rows, selector, &error_rows, options.pagination)
            }
        };

        let (rows, window_errors) = encode_window(&window, &selected, schema, &errors, &options.encodings);

        Ok(ExportedTable {
            columns: selected,
            rows,
            errors: window_errors,
            total,
        })
    }
}

/// Applies the row selector and pagination to a materialized row sequence.
///
/// Returns the windowed rows paired with their positions in the filtered
/// sequence, plus the filtered total.
fn filter_and_window(
    rows: Vec<StoredRow>,
    selector: RowSelector,
    error_rows: &HashSet<i64>,
    pagination: Option<Pagination>,
) -> (Vec<(i64, StoredRow)>, i64) {
    let filtered: Vec<StoredRow> = rows
        .into_iter()
        .filter(|row| match selector {
            RowSelector::All => true,
            RowSelector::Valid => !error_rows.contains(&row.row_index),
            RowSelector::Errors => error_rows.contains(&row.row_index),
        })
        .collect();

    let total = filtered.len() as i64;
    let (offset, limit) = match pagination {
        Some(p) => (p.offset(), p.page_size),
        None => (0, filtered.len()),
    };

    let window = filtered
        .into_iter()
        .enumerate()
        .skip(offset)
        .take(limit)
        .map(|(position, row)| (position as i64, row))
        .collect();

    (window, total)
}

/// Encodes the windowed rows and collects the errors affecting the window.
fn encode_window(
    window: &[(i64, StoredRow)],
    selected: &DataConfiguration,
    schema: &DataConfiguration,
    errors: &[TransformationError],
    encodings: &ErrorEncodings,
) -> (Vec<ExportedRow>, Vec<TransformationError>) {
    // Selected columns by their index in the original schema.
    let selected_by_original: HashMap<usize, usize> = selected
        .columns
        .iter()
        .enumerate()
        .filter_map(|(sel_idx, column)| {
            schema.column(&column.name).map(|orig| (orig.index, sel_idx))
        })
        .collect();

    let window_rows: HashSet<i64> = window.iter().map(|(_, row)| row.row_index).collect();

    let error_map: HashMap<(i64, usize), &TransformationError> = errors
        .iter()
        .map(|e| ((e.row_index, e.column_index), e))
        .collect();

    let fast_path = encodings.all_null();

    let rows = window
        .iter()
        .map(|(position, row)| {
            let cells = selected
                .columns
                .iter()
                .zip(row.values.iter())
                .map(|(column, value)| {
                    if fast_path {
                        return value.to_json();
                    }
                    let original_index = schema
                        .column(&column.name)
                        .map(|c| c.index)
                        .unwrap_or(column.index);
                    match error_map.get(&(row.row_index, original_index)) {
                        Some(error) => match encodings.resolve(error.kind) {
                            ErrorValueEncoding::Null => serde_json::Value::Null,
                            ErrorValueEncoding::OriginalValue => error
                                .raw_value
                                .clone()
                                .map(serde_json::Value::String)
                                .unwrap_or(serde_json::Value::Null),
                            ErrorValueEncoding::Substitute(s) => {
                                serde_json::Value::String(s.clone())
                            }
                        },
                        None => value.to_json(),
                    }
                })
                .collect();
            ExportedRow {
                position: *position,
                cells,
            }
        })
        .collect();

    let window_errors = errors
        .iter()
        .filter(|e| window_rows.contains(&e.row_index))
        .filter_map(|e| {
            selected_by_original.get(&e.column_index).map(|&sel_idx| {
                let mut remapped = (*e).clone();
                remapped.column_index = sel_idx;
                remapped
            })
        })
        .collect();

    (rows, window_errors)
}
