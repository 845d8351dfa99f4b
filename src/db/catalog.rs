use crate::db::DbError;
use crate::ingest::ddl::{compile_drop_statement, quote_identifier};
use crate::ingest::schema::{TIMESTAMP_FORMAT, ValueType, validate_identifier};
use crate::util::timing::TimingReport;
use duckdb::Connection;
use duckdb::types::{TimeUnit, Value};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Schema that user tables live in.
pub const DEFAULT_SCHEMA: &str = "main";

/// Number of points in a latency profile when none is configured.
pub const DEFAULT_LATENCY_POINTS: usize = 10;

/// An existing table as reported by `information_schema`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<String>,
    /// Native type names, aligned with `columns`.
    pub column_types: Vec<String>,
}

impl Table {
    /// Normalizes the native types into value types for an import.
    pub fn value_types(&self) -> Result<Vec<ValueType>, DbError> {
        self.columns
            .iter()
            .zip(&self.column_types)
            .map(|(column, native)| {
                ValueType::from_catalog_type(native).ok_or_else(|| {
                    DbError::UnsupportedColumnType {
                        column: column.clone(),
                        native_type: native.clone(),
                    }
                })
            })
            .collect()
    }
}

/// Rows read for display, rendered as text. `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct TableData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    /// Only the fetch phase is filled in.
    pub timing: TimingReport,
}

/// Time taken by `SELECT * ... LIMIT rows`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySample {
    pub rows: u64,
    pub seconds: f64,
}

/// Creates `<data_dir>/<name>.duckdb` and returns its path with an open connection.
pub fn create_database(data_dir: &Path, name: &str) -> Result<(PathBuf, Connection), DbError> {
    if !validate_identifier(name) {
        return Err(DbError::InvalidName(name.to_string()));
    }

    let path = data_dir.join(format!("{}.duckdb", name));
    if path.exists() {
        return Err(DbError::AlreadyExists(path));
    }

    if !data_dir.exists() {
        info!("Creating data directory: {}", data_dir.display());
        std::fs::create_dir_all(data_dir)?;
    }

    let conn = Connection::open(&path)?;
    info!("Created database {}", path.display());
    Ok((path, conn))
}

/// Read access to the tables of one database.
pub struct Catalog<'c> {
    conn: &'c Connection,
}

impl<'c> Catalog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn list_tables(&self) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = ? AND table_type = 'BASE TABLE' ORDER BY table_name",
        )?;
        let tables = stmt
            .query_map([DEFAULT_SCHEMA], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        debug!("Found {} tables", tables.len());
        Ok(tables)
    }

    pub fn describe_table(&self, table_name: &str) -> Result<Table, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
        )?;
        let pairs = stmt
            .query_map([DEFAULT_SCHEMA, table_name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if pairs.is_empty() {
            return Err(DbError::TableNotFound(table_name.to_string()));
        }

        let (columns, column_types) = pairs.into_iter().unzip();
        Ok(Table {
            name: table_name.to_string(),
            columns,
            column_types,
        })
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = ? AND table_name = ?",
            [DEFAULT_SCHEMA, table_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn row_count(&self, table_name: &str) -> Result<u64, DbError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table_name));
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn drop_table(&self, table_name: &str) -> Result<(), DbError> {
        self.conn.execute_batch(&compile_drop_statement(table_name))?;
        info!("Dropped table {}", table_name);
        Ok(())
    }

    /// Reads the table's rows for display, timing the round trip.
    pub fn fetch_rows(&self, table: &Table, limit: Option<u64>) -> Result<TableData, DbError> {
        let column_list: Vec<String> = table.columns.iter().map(|c| quote_identifier(c)).collect();
        let mut sql = format!(
            "SELECT {} FROM {}",
            column_list.join(", "),
            quote_identifier(&table.name)
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let start = Instant::now();
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut data = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(table.columns.len());
            for i in 0..table.columns.len() {
                cells.push(render_value(row.get::<_, Value>(i)?));
            }
            data.push(cells);
        }
        let fetch_duration = start.elapsed();
        let mut timing = TimingReport::default();
        timing.record_fetch(fetch_duration);

        info!(
            "Fetched {} rows from {} in {:.6}s",
            data.len(),
            table.name,
            fetch_duration.as_secs_f64()
        );

        Ok(TableData {
            columns: table.columns.clone(),
            rows: data,
            timing,
        })
    }

    /// Times `SELECT * FROM table LIMIT rows`, including reading every row.
    pub fn query_time(&self, table_name: &str, rows: u64) -> Result<Duration, DbError> {
        let sql = format!("SELECT * FROM {} LIMIT {}", quote_identifier(table_name), rows);

        let start = Instant::now();
        let mut stmt = self.conn.prepare(&sql)?;
        let mut result = stmt.query([])?;
        while result.next()?.is_some() {}
        Ok(start.elapsed())
    }

    /// Measures query time at evenly spaced row limits up to the table size.
    pub fn latency_profile(
        &self,
        table_name: &str,
        points: usize,
    ) -> Result<Vec<LatencySample>, DbError> {
        let total = self.row_count(table_name)?;
        let counts = latency_row_counts(total, points);
        debug!("Profiling {} at row counts {:?}", table_name, counts);

        counts
            .into_iter()
            .map(|rows| {
                let elapsed = self.query_time(table_name, rows)?;
                Ok(LatencySample {
                    rows,
                    seconds: elapsed.as_secs_f64(),
                })
            })
            .collect()
    }
}

/// Row limits for a latency profile: `points` equal steps up to `total`.
pub fn latency_row_counts(total: u64, points: usize) -> Vec<u64> {
    if total == 0 || points == 0 {
        return Vec::new();
    }
    let step = (total / points as u64).max(1);
    (1..=points as u64)
        .map(|i| i * step)
        .take_while(|count| *count <= total)
        .collect()
}

fn render_value(value: Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::Boolean(v) => v.to_string(),
        Value::TinyInt(v) => v.to_string(),
        Value::SmallInt(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::HugeInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Text(v) => v,
        Value::Timestamp(unit, raw) => render_timestamp(unit, raw),
        other => format!("{:?}", other),
    };
    Some(text)
}

fn render_timestamp(unit: TimeUnit, raw: i64) -> String {
    let micros = match unit {
        TimeUnit::Second => raw.saturating_mul(1_000_000),
        TimeUnit::Millisecond => raw.saturating_mul(1_000),
        TimeUnit::Microsecond => raw,
        TimeUnit::Nanosecond => raw / 1_000,
    };
    match chrono::DateTime::from_timestamp_micros(micros) {
        Some(ts) => ts.naive_utc().format(TIMESTAMP_FORMAT).to_string(),
        None => raw.to_string(),
    }
}
