//! Fixed database schema constants.
//!
//! Only the fixed tables live here. Per-dataset tables are created
//! dynamically by the dataset store with names derived from the dataset id.

/// SQL schema for the transformation error records.
///
/// One row per failed cell conversion, keyed by dataset, row and column. The
/// affected cell itself is stored as NULL in the dataset table; the raw
/// original value survives here.
pub const CREATE_TRANSFORMATION_ERRORS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transformation_errors (
    id BIGSERIAL PRIMARY KEY,
    dataset_id BIGINT NOT NULL,
    row_index BIGINT NOT NULL,
    column_index INTEGER NOT NULL,
    error_kind VARCHAR(32) NOT NULL,
    raw_value TEXT,
    UNIQUE(dataset_id, row_index, column_index)
)
"#;

/// SQL for creating all required indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_transformation_errors_dataset
    ON transformation_errors(dataset_id);
CREATE INDEX IF NOT EXISTS idx_transformation_errors_dataset_row
    ON transformation_errors(dataset_id, row_index)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![CREATE_TRANSFORMATION_ERRORS_TABLE, CREATE_INDEXES]
}

/// Prefix of dynamically created per-dataset tables.
pub const DATASET_TABLE_PREFIX: &str = "data_set_";

/// Derives the physical table name for a dataset id.
///
/// Fixed-width zero padding keeps names collision-free and makes existence
/// checks by name possible.
pub fn dataset_table_name(dataset_id: i64) -> String {
    format!("{}{:08}", DATASET_TABLE_PREFIX, dataset_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("transformation_errors"));
        assert!(statements[1].contains("CREATE INDEX"));
    }

    #[test]
    fn test_dataset_table_name_is_zero_padded() {
        assert_eq!(dataset_table_name(1), "data_set_00000001");
        assert_eq!(dataset_table_name(42), "data_set_00000042");
        assert_eq!(dataset_table_name(123_456_789), "data_set_123456789");
    }
}
