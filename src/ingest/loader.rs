use crate::ingest::ddl::quote_identifier;
use crate::ingest::schema::{TypedRow, TypedValue};
use duckdb::types::{TimeUnit, Value};
use duckdb::{Connection, params_from_iter};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Value groups per `INSERT` statement when none is configured.
pub const DEFAULT_ROWS_PER_STATEMENT: usize = 1000;

#[derive(Debug, Error)]
pub enum InsertError {
    #[error("nothing to insert: the batch is empty")]
    EmptyBatch,

    #[error("row {row_index} has {found} values, expected {expected}")]
    RaggedBatch {
        row_index: usize,
        expected: usize,
        found: usize,
    },

    #[error("insert failed: {0}")]
    Driver(#[from] duckdb::Error),
}

/// Outcome of a successful bulk insert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadResult {
    pub rows: usize,
    /// Time spent rendering statements and binding values.
    pub prepare_duration: Duration,
    /// Time spent executing the statements and committing.
    pub execute_duration: Duration,
}

// One rendered statement with its bound values.
struct PreparedChunk {
    sql: String,
    params: Vec<Value>,
}

/// Inserts typed rows into an existing table inside a single transaction.
#[derive(Debug, Clone)]
pub struct BulkLoader {
    rows_per_statement: usize,
}

impl BulkLoader {
    pub fn new() -> Self {
        Self {
            rows_per_statement: DEFAULT_ROWS_PER_STATEMENT,
        }
    }

    pub fn with_rows_per_statement(rows_per_statement: usize) -> Self {
        Self {
            rows_per_statement: rows_per_statement.max(1),
        }
    }

    /// Loads `rows` into `table_name`.
    ///
    /// Either every row is committed or, on any failure, the transaction is
    /// rolled back and the table keeps its previous contents.
    pub fn insert(
        &self,
        conn: &mut Connection,
        table_name: &str,
        rows: Vec<TypedRow>,
    ) -> Result<LoadResult, InsertError> {
        let row_count = rows.len();

        let prepare_start = Instant::now();
        let chunks = self.prepare(table_name, rows)?;
        let prepare_duration = prepare_start.elapsed();
        debug!(
            "Prepared {} insert statements for {} rows in {:?}",
            chunks.len(),
            row_count,
            prepare_duration
        );

        let execute_start = Instant::now();
        let tx = conn.transaction()?;
        for chunk in chunks {
            let mut stmt = tx.prepare(&chunk.sql)?;
            stmt.execute(params_from_iter(chunk.params))?;
        }
        tx.commit()?;
        let execute_duration = execute_start.elapsed();

        info!(
            "Inserted {} rows into {} (prepare {:.6}s, execute {:.6}s)",
            row_count,
            table_name,
            prepare_duration.as_secs_f64(),
            execute_duration.as_secs_f64()
        );

        Ok(LoadResult {
            rows: row_count,
            prepare_duration,
            execute_duration,
        })
    }

    fn prepare(
        &self,
        table_name: &str,
        rows: Vec<TypedRow>,
    ) -> Result<Vec<PreparedChunk>, InsertError> {
        let width = rows.first().map(Vec::len).ok_or(InsertError::EmptyBatch)?;
        if let Some((row_index, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
            return Err(InsertError::RaggedBatch {
                row_index,
                expected: width,
                found: row.len(),
            });
        }

        let table = quote_identifier(table_name);
        let group = format!("({})", vec!["?"; width].join(", "));
        let mut full_sql: Option<String> = None;

        let mut chunks = Vec::with_capacity(rows.len().div_ceil(self.rows_per_statement));
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<TypedRow> = rows.by_ref().take(self.rows_per_statement).collect();

            // Every full chunk shares the same statement text.
            let sql = if chunk.len() == self.rows_per_statement {
                full_sql
                    .get_or_insert_with(|| insert_sql(&table, &group, chunk.len()))
                    .clone()
            } else {
                insert_sql(&table, &group, chunk.len())
            };

            let params = chunk.into_iter().flatten().map(to_duckdb_value).collect();
            chunks.push(PreparedChunk { sql, params });
        }

        Ok(chunks)
    }
}

impl Default for BulkLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_sql(table: &str, group: &str, groups: usize) -> String {
    format!("INSERT INTO {} VALUES {};", table, vec![group; groups].join(", "))
}

fn to_duckdb_value(value: TypedValue) -> Value {
    match value {
        TypedValue::Integer(v) => Value::BigInt(v),
        TypedValue::Float(v) => Value::Double(v),
        TypedValue::Text(v) => Value::Text(v),
        TypedValue::Timestamp(v) => {
            Value::Timestamp(TimeUnit::Microsecond, v.and_utc().timestamp_micros())
        }
    }
}
