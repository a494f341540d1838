//! Dataset persistence and export.
//!
//! This module owns everything about one dataset's tabular data:
//!
//! - `schema`: the dynamic per-dataset column configuration and typed values
//! - `convert`: raw input conversion with out-of-band transformation errors
//! - `store`: the physical per-dataset table, seeded hold-out splitting and
//!   transformation error records
//! - `export`: projection into row/column form with selection, filtering,
//!   pagination and error-cell encoding

pub mod convert;
pub mod export;
pub mod schema;
pub mod store;

pub use convert::{convert_row, ErrorKind, TransformationError};
pub use export::{
    ErrorEncodings, ErrorValueEncoding, ExportOptions, ExportService, ExportedRow, ExportedTable,
    HoldOutSelector, Pagination, RowSelector,
};
pub use schema::{ColumnConfiguration, DataConfiguration, DataType, Scale, Value, ValueRange};
pub use store::{sample_hold_out_indexes, DatasetStore, StoredRow};
