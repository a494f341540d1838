//! Physical storage of dataset rows.
//!
//! Each dataset owns a dedicated, dynamically created table whose name is
//! derived from the dataset's numeric id. Every physical row additionally
//! stores an immutable `row_index` (insertion order) and an `is_hold_out`
//! flag, both invisible to the logical schema. All statements are issued as
//! plain SQL against the pooled connection.

use std::collections::HashSet;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::error::DatasetError;
use crate::storage::schema::dataset_table_name;

use super::convert::{ErrorKind, TransformationError};
use super::schema::{ColumnConfiguration, DataConfiguration, DataType, Value, DATE_FORMAT,
    DATE_TIME_FORMAT};

/// Rows per INSERT statement.
const INSERT_CHUNK_SIZE: usize = 500;

/// One physical row read back from a dataset table.
#[derive(Debug, Clone)]
pub struct StoredRow {
    /// Immutable insertion-order index.
    pub row_index: i64,
    /// Hidden hold-out flag.
    pub is_hold_out: bool,
    /// Logical cell values, in schema order.
    pub values: Vec<Value>,
}

/// Store for per-dataset tables and their transformation error records.
#[derive(Clone)]
pub struct DatasetStore {
    pool: PgPool,
}

impl DatasetStore {
    /// Creates a new store on an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the physical table for a dataset.
    ///
    /// Fails without touching the database if any column has an undefined
    /// type or an unsafe identifier.
    pub async fn create_table(
        &self,
        dataset_id: i64,
        config: &DataConfiguration,
    ) -> Result<(), DatasetError> {
        let table = dataset_table_name(dataset_id);

        let mut columns = vec![
            "row_index BIGINT NOT NULL".to_string(),
            "is_hold_out BOOLEAN NOT NULL DEFAULT FALSE".to_string(),
        ];
        for column in &config.columns {
            let sql_type = column.data_type.sql_type(&column.name)?;
            columns.push(format!(r#""{}" {}"#, column.name, sql_type));
        }

        let statement = format!(r#"CREATE TABLE "{}" ({})"#, table, columns.join(", "));
        sqlx::query(&statement).execute(&self.pool).await?;

        info!(dataset_id, table = %table, "created dataset table");
        Ok(())
    }

    /// Whether the physical table for a dataset exists.
    pub async fn table_exists(&self, dataset_id: i64) -> Result<bool, DatasetError> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = 'public' AND table_name = $1
            "#,
        )
        .bind(dataset_table_name(dataset_id))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    /// Appends rows to a dataset table, assigning contiguous row indexes.
    ///
    /// Returns the number of rows inserted. The whole batch commits as one
    /// transaction; on failure the caller is expected to issue a
    /// compensating drop.
    pub async fn insert_rows(
        &self,
        dataset_id: i64,
        config: &DataConfiguration,
        rows: &[Vec<Value>],
    ) -> Result<u64, DatasetError> {
        if rows.is_empty() {
            return Ok(0);
        }
        for row in rows {
            if row.len() != config.columns.len() {
                return Err(DatasetError::RowWidthMismatch {
                    expected: config.columns.len(),
                    actual: row.len(),
                });
            }
        }

        let table = dataset_table_name(dataset_id);
        let column_list = insert_column_list(config);

        let mut tx = self.pool.begin().await?;

        let next_index: i64 =
            sqlx::query_scalar(&format!(
                r#"SELECT COALESCE(MAX(row_index) + 1, 0) FROM "{}""#,
                table
            ))
            .fetch_one(&mut *tx)
            .await?;

        let mut inserted = 0u64;
        for (chunk_number, chunk) in rows.chunks(INSERT_CHUNK_SIZE).enumerate() {
            let base = next_index + (chunk_number * INSERT_CHUNK_SIZE) as i64;
            let tuples: Vec<String> = chunk
                .iter()
                .enumerate()
                .map(|(offset, row)| {
                    let mut literals = vec![(base + offset as i64).to_string()];
                    literals.extend(row.iter().map(sql_literal));
                    format!("({})", literals.join(", "))
                })
                .collect();

            let statement = format!(
                r#"INSERT INTO "{}" ({}) VALUES {}"#,
                table,
                column_list,
                tuples.join(", ")
            );
            let result = sqlx::query(&statement).execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;

        debug!(dataset_id, rows = inserted, "inserted dataset rows");
        Ok(inserted)
    }

    /// Counts rows, optionally filtered by the hidden hold-out flag.
    pub async fn count(
        &self,
        dataset_id: i64,
        hold_out: Option<bool>,
    ) -> Result<i64, DatasetError> {
        let table = dataset_table_name(dataset_id);
        let statement = match hold_out {
            None => format!(r#"SELECT COUNT(*) FROM "{}""#, table),
            Some(flag) => format!(
                r#"SELECT COUNT(*) FROM "{}" WHERE is_hold_out = {}"#,
                table, flag
            ),
        };
        let count: i64 = sqlx::query_scalar(&statement).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Reads rows in insertion order, optionally filtered by the hold-out
    /// flag and windowed with LIMIT/OFFSET.
    pub async fn fetch_rows(
        &self,
        dataset_id: i64,
        config: &DataConfiguration,
        hold_out: Option<bool>,
        window: Option<(i64, i64)>,
    ) -> Result<Vec<StoredRow>, DatasetError> {
        let table = dataset_table_name(dataset_id);

        let select_list: Vec<String> = std::iter::once("row_index".to_string())
            .chain(std::iter::once("is_hold_out".to_string()))
            .chain(config.columns.iter().map(|c| format!(r#""{}""#, c.name)))
            .collect();

        let mut statement = format!(
            r#"SELECT {} FROM "{}""#,
            select_list.join(", "),
            table
        );
        if let Some(flag) = hold_out {
            statement.push_str(&format!(" WHERE is_hold_out = {}", flag));
        }
        statement.push_str(" ORDER BY row_index");
        if let Some((limit, offset)) = window {
            statement.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
        }

        let rows = sqlx::query(&statement).fetch_all(&self.pool).await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let row_index: i64 = row.try_get("row_index")?;
            let is_hold_out: bool = row.try_get("is_hold_out")?;
            let mut values = Vec::with_capacity(config.columns.len());
            for column in &config.columns {
                values.push(decode_value(&row, column)?);
            }
            result.push(StoredRow {
                row_index,
                is_hold_out,
                values,
            });
        }
        Ok(result)
    }

    /// Drops the physical table for a dataset.
    pub async fn drop_table(&self, dataset_id: i64) -> Result<(), DatasetError> {
        let table = dataset_table_name(dataset_id);
        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{}""#, table))
            .execute(&self.pool)
            .await?;
        info!(dataset_id, table = %table, "dropped dataset table");
        Ok(())
    }

    /// Deletes a dataset: drops the table and clears its error records as a
    /// single transaction. The caller resets the metadata flags.
    pub async fn delete(&self, dataset_id: i64) -> Result<(), DatasetError> {
        let table = dataset_table_name(dataset_id);
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{}""#, table))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM transformation_errors WHERE dataset_id = $1")
            .bind(dataset_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(dataset_id, "deleted dataset");
        Ok(())
    }

    /// Generates a reproducible hold-out split.
    ///
    /// The percentage must lie in `[0, 1]`; out-of-range values fail before
    /// any mutation. Previously set flags are cleared and the sampler is
    /// re-seeded, so repeated calls with the same seed and percentage
    /// reproduce the same partition. Returns the number of selected rows.
    pub async fn generate_hold_out_split(
        &self,
        dataset_id: i64,
        seed: u64,
        percentage: f64,
    ) -> Result<u64, DatasetError> {
        if !(0.0..=1.0).contains(&percentage) || percentage.is_nan() {
            return Err(DatasetError::InvalidPercentage(percentage));
        }

        let table = dataset_table_name(dataset_id);
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(r#"UPDATE "{}" SET is_hold_out = FALSE"#, table))
            .execute(&mut *tx)
            .await?;

        let row_count: i64 =
            sqlx::query_scalar(&format!(r#"SELECT COUNT(*) FROM "{}""#, table))
                .fetch_one(&mut *tx)
                .await?;

        let indexes = sample_hold_out_indexes(seed, row_count as usize, percentage);
        let selected = indexes.len() as u64;

        if !indexes.is_empty() {
            sqlx::query(&format!(
                r#"UPDATE "{}" SET is_hold_out = TRUE WHERE row_index = ANY($1)"#,
                table
            ))
            .bind(&indexes)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(dataset_id, seed, percentage, selected, "generated hold-out split");
        Ok(selected)
    }

    /// Records transformation errors for a dataset.
    pub async fn store_transformation_errors(
        &self,
        dataset_id: i64,
        errors: &[TransformationError],
    ) -> Result<(), DatasetError> {
        if errors.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for error in errors {
            sqlx::query(
                r#"
                INSERT INTO transformation_errors
                    (dataset_id, row_index, column_index, error_kind, raw_value)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (dataset_id, row_index, column_index) DO NOTHING
                "#,
            )
            .bind(dataset_id)
            .bind(error.row_index)
            .bind(error.column_index as i32)
            .bind(error.kind.as_str())
            .bind(&error.raw_value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(dataset_id, errors = errors.len(), "stored transformation errors");
        Ok(())
    }

    /// Fetches all transformation errors recorded for a dataset.
    pub async fn fetch_transformation_errors(
        &self,
        dataset_id: i64,
    ) -> Result<Vec<TransformationError>, DatasetError> {
        let rows = sqlx::query(
            r#"
            SELECT row_index, column_index, error_kind, raw_value
            FROM transformation_errors
            WHERE dataset_id = $1
            ORDER BY row_index, column_index
            "#,
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await?;

        let mut errors = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("error_kind")?;
            errors.push(TransformationError {
                row_index: row.try_get("row_index")?,
                column_index: row.try_get::<i32, _>("column_index")? as usize,
                kind: ErrorKind::parse(&kind),
                raw_value: row.try_get("raw_value")?,
            });
        }
        Ok(errors)
    }

    /// Returns the set of row indexes that have at least one recorded error.
    pub async fn error_row_indexes(&self, dataset_id: i64) -> Result<HashSet<i64>, DatasetError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT row_index FROM transformation_errors WHERE dataset_id = $1",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(i,)| i).collect())
    }
}

/// Selects the hold-out row indexes for a dataset of `row_count` rows.
///
/// The target count is `round(row_count × percentage)` and the sampler is
/// seeded explicitly, so the partition is a pure function of its arguments.
pub fn sample_hold_out_indexes(seed: u64, row_count: usize, percentage: f64) -> Vec<i64> {
    let target = (row_count as f64 * percentage).round() as usize;
    if target == 0 {
        return Vec::new();
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut indexes: Vec<i64> = rand::seq::index::sample(&mut rng, row_count, target)
        .into_iter()
        .map(|i| i as i64)
        .collect();
    indexes.sort_unstable();
    indexes
}

/// The quoted column list for INSERT statements, hidden columns first.
fn insert_column_list(config: &DataConfiguration) -> String {
    std::iter::once("row_index".to_string())
        .chain(config.columns.iter().map(|c| format!(r#""{}""#, c.name)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders a typed value as a SQL literal.
///
/// Strings are quoted with `'` doubling; a logical Null maps to SQL NULL.
fn sql_literal(value: &Value) -> String {
    match value {
        Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Date(d) => format!("'{}'", d.format(DATE_FORMAT)),
        Value::DateTime(t) => format!("'{}'", t.format(DATE_TIME_FORMAT)),
        Value::Decimal(f) if f.is_finite() => f.to_string(),
        Value::Decimal(_) => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Null => "NULL".to_string(),
    }
}

/// Decodes one logical cell from a fetched row.
fn decode_value(row: &PgRow, column: &ColumnConfiguration) -> Result<Value, DatasetError> {
    let name = column.name.as_str();
    let value = match column.data_type {
        DataType::Boolean => row
            .try_get::<Option<bool>, _>(name)?
            .map(Value::Boolean)
            .unwrap_or(Value::Null),
        DataType::Date => row
            .try_get::<Option<chrono::NaiveDate>, _>(name)?
            .map(Value::Date)
            .unwrap_or(Value::Null),
        DataType::DateTime => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(name)?
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        DataType::Decimal => row
            .try_get::<Option<f64>, _>(name)?
            .map(Value::Decimal)
            .unwrap_or(Value::Null),
        DataType::Integer => row
            .try_get::<Option<i64>, _>(name)?
            .map(Value::Integer)
            .unwrap_or(Value::Null),
        DataType::String => row
            .try_get::<Option<String>, _>(name)?
            .map(Value::String)
            .unwrap_or(Value::Null),
        DataType::Undefined => return Err(DatasetError::UndefinedType(column.name.clone())),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::schema::{ColumnConfiguration, Scale};
    use chrono::NaiveDate;

    #[test]
    fn test_sample_is_deterministic_for_same_seed() {
        let first = sample_hold_out_indexes(42, 1000, 0.3);
        let second = sample_hold_out_indexes(42, 1000, 0.3);
        assert_eq!(first, second);
        assert_eq!(first.len(), 300);
    }

    #[test]
    fn test_sample_differs_across_seeds() {
        let first = sample_hold_out_indexes(1, 1000, 0.5);
        let second = sample_hold_out_indexes(2, 1000, 0.5);
        assert_eq!(first.len(), 500);
        assert_eq!(second.len(), 500);
        assert_ne!(first, second);
    }

    #[test]
    fn test_sample_target_is_rounded() {
        // round(2 × 0.5) = 1
        assert_eq!(sample_hold_out_indexes(7, 2, 0.5).len(), 1);
        // round(3 × 0.5) = 2
        assert_eq!(sample_hold_out_indexes(7, 3, 0.5).len(), 2);
        // round(10 × 0.04) = 0
        assert!(sample_hold_out_indexes(7, 10, 0.04).is_empty());
        assert_eq!(sample_hold_out_indexes(7, 10, 1.0).len(), 10);
    }

    #[test]
    fn test_sample_indexes_are_unique_and_in_bounds() {
        let indexes = sample_hold_out_indexes(99, 50, 0.8);
        let unique: std::collections::HashSet<_> = indexes.iter().collect();
        assert_eq!(unique.len(), indexes.len());
        assert!(indexes.iter().all(|&i| (0..50).contains(&i)));
    }

    #[test]
    fn test_sql_literal_escapes_quotes() {
        assert_eq!(
            sql_literal(&Value::String("O'Brien's".to_string())),
            "'O''Brien''s'"
        );
    }

    #[test]
    fn test_sql_literal_per_type() {
        let date = NaiveDate::from_ymd_opt(2023, 11, 20).expect("valid date");
        let ts = date
            .and_hms_micro_opt(12, 50, 27, 123_456)
            .expect("valid timestamp");
        assert_eq!(sql_literal(&Value::Boolean(true)), "TRUE");
        assert_eq!(sql_literal(&Value::Date(date)), "'2023-11-20'");
        assert_eq!(
            sql_literal(&Value::DateTime(ts)),
            "'2023-11-20T12:50:27.123456'"
        );
        assert_eq!(sql_literal(&Value::Decimal(2.4)), "2.4");
        assert_eq!(sql_literal(&Value::Integer(42)), "42");
        assert_eq!(sql_literal(&Value::Null), "NULL");
        assert_eq!(sql_literal(&Value::Decimal(f64::NAN)), "NULL");
    }

    #[test]
    fn test_insert_column_list_includes_hidden_row_index() {
        let config = DataConfiguration::new(vec![ColumnConfiguration {
            index: 0,
            name: "age".to_string(),
            data_type: DataType::Integer,
            scale: Scale::Ratio,
            range: None,
        }]);
        assert_eq!(insert_column_list(&config), r#"row_index, "age""#);
    }
}
