use crate::db::DbError;
use crate::db::catalog::Catalog;
use crate::ingest::ddl::compile_create_statement;
use crate::ingest::loader::{BulkLoader, InsertError, LoadResult};
use crate::ingest::parser::{ParseError, RowParser};
use crate::ingest::schema::{NameMatching, SchemaError, TableSchema, TypedRow, ValueType};
use crate::util::timing::TimingReport;
use duckdb::Connection;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info, warn};

/// Where the rows of an import come from.
pub trait ImportSource {
    fn read_rows(
        &self,
        parser: &RowParser,
        column_types: &[ValueType],
    ) -> Result<Vec<TypedRow>, ParseError>;
}

impl<S: AsRef<str> + Sync> ImportSource for [S] {
    fn read_rows(
        &self,
        parser: &RowParser,
        column_types: &[ValueType],
    ) -> Result<Vec<TypedRow>, ParseError> {
        parser.parse_lines(self, column_types)
    }
}

impl ImportSource for Path {
    fn read_rows(
        &self,
        parser: &RowParser,
        column_types: &[ValueType],
    ) -> Result<Vec<TypedRow>, ParseError> {
        parser.parse_file(self, column_types)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    SchemaValidated,
    TableCreated,
    DataParsed,
    DataLoaded,
    ValidationFailed,
    CreateFailed,
    ParseFailed,
    LoadFailed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("schema rejected: {0}")]
    ValidationFailed(#[from] SchemaError),

    #[error("could not create table '{table}': {source}")]
    CreateFailed {
        table: String,
        source: duckdb::Error,
    },

    #[error("could not inspect table '{table}': {source}")]
    Introspection { table: String, source: DbError },

    #[error("import into '{table}' failed while parsing: {source}")]
    ParseFailed { table: String, source: ParseError },

    #[error("import into '{table}' failed while loading: {source}")]
    LoadFailed { table: String, source: InsertError },

    /// The import failed and the table it created could not be removed.
    #[error("{cause}; dropping table '{table}' also failed: {drop_error}")]
    CompensationFailed {
        table: String,
        cause: Box<LifecycleError>,
        drop_error: DbError,
    },
}

impl LifecycleError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            LifecycleError::ValidationFailed(err) => {
                format!("Invalid table definition: {err}\n\nHint: Fix the schema file and retry.")
            }
            LifecycleError::ParseFailed {
                source: ParseError::Row(row),
                ..
            } => format!(
                "Cannot read import file: {row}\n\n\
                 Hint: Fields are tab-separated; timestamps use YYYY-MM-DD HH:MM:SS.ffffff."
            ),
            LifecycleError::CompensationFailed { table, .. } => format!(
                "{self}\n\nHint: Table '{table}' may be left behind; drop it manually."
            ),
            _ => self.to_string(),
        }
    }
}

/// A finished import.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    pub table: String,
    pub rows: usize,
    pub timing: TimingReport,
}

/// Options shared by every import run through a [`TableLifecycle`].
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub parser: RowParser,
    pub loader: BulkLoader,
    pub name_matching: NameMatching,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            parser: RowParser::new(),
            loader: BulkLoader::new(),
            name_matching: NameMatching::Exact,
        }
    }
}

/// Drives table creation and data import against one connection.
///
/// The connection is borrowed mutably for the controller's whole life, so only
/// one operation can be in flight at a time.
pub struct TableLifecycle<'c> {
    conn: &'c mut Connection,
    options: ImportOptions,
    known_tables: Vec<String>,
    state: LifecycleState,
    transitions: Vec<LifecycleState>,
    timing: TimingReport,
}

impl<'c> TableLifecycle<'c> {
    pub fn new(conn: &'c mut Connection, options: ImportOptions) -> Result<Self, DbError> {
        let known_tables = Catalog::new(conn).list_tables()?;
        Ok(Self {
            conn,
            options,
            known_tables,
            state: LifecycleState::Idle,
            transitions: vec![LifecycleState::Idle],
            timing: TimingReport::default(),
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// States visited by the most recent operation, starting with `Idle`.
    pub fn transitions(&self) -> &[LifecycleState] {
        &self.transitions
    }

    pub fn timing(&self) -> &TimingReport {
        &self.timing
    }

    /// Table names used for collision checks, as of the last refresh.
    pub fn known_tables(&self) -> &[String] {
        &self.known_tables
    }

    pub fn refresh_tables(&mut self) -> Result<(), DbError> {
        self.known_tables = Catalog::new(self.conn).list_tables()?;
        Ok(())
    }

    fn begin(&mut self) {
        self.state = LifecycleState::Idle;
        self.transitions.clear();
        self.transitions.push(LifecycleState::Idle);
    }

    fn enter(&mut self, state: LifecycleState) {
        self.state = state;
        self.transitions.push(state);
    }

    /// Creates the table described by `schema` and fills it from `source`.
    ///
    /// If parsing or loading fails the new table is dropped again, so a failed
    /// import never leaves an empty or half-filled table behind.
    pub fn create_and_load<S>(
        &mut self,
        schema: &TableSchema,
        source: &S,
    ) -> Result<ImportReport, LifecycleError>
    where
        S: ImportSource + ?Sized,
    {
        self.begin();

        let validation =
            schema.validate_with(self.known_tables.as_slice(), self.options.name_matching);
        if let Err(err) = validation {
            warn!("Schema for table {} rejected: {}", schema.name, err);
            self.enter(LifecycleState::ValidationFailed);
            return Err(err.into());
        }
        self.enter(LifecycleState::SchemaValidated);

        let create_sql = compile_create_statement(schema);
        info!("Executing SQL: {}", create_sql);
        if let Err(source) = self.conn.execute_batch(&create_sql) {
            error!("Failed to create table {}: {}", schema.name, source);
            self.enter(LifecycleState::CreateFailed);
            return Err(LifecycleError::CreateFailed {
                table: schema.name.clone(),
                source,
            });
        }
        self.known_tables.push(schema.name.clone());
        self.enter(LifecycleState::TableCreated);

        let rows = match source.read_rows(&self.options.parser, &schema.column_types()) {
            Ok(rows) => rows,
            Err(source) => {
                self.enter(LifecycleState::ParseFailed);
                let cause = LifecycleError::ParseFailed {
                    table: schema.name.clone(),
                    source,
                };
                return Err(self.compensate(&schema.name, cause));
            }
        };
        self.enter(LifecycleState::DataParsed);

        match self.options.loader.insert(self.conn, &schema.name, rows) {
            Ok(result) => Ok(self.finish(&schema.name, result)),
            Err(source) => {
                self.enter(LifecycleState::LoadFailed);
                let cause = LifecycleError::LoadFailed {
                    table: schema.name.clone(),
                    source,
                };
                Err(self.compensate(&schema.name, cause))
            }
        }
    }

    /// Appends rows from `source` to a table that already exists.
    ///
    /// Nothing is created, so nothing is dropped on failure: the load runs in
    /// one transaction and the table keeps its previous contents.
    pub fn append_to_existing<S>(
        &mut self,
        table_name: &str,
        column_types: &[ValueType],
        source: &S,
    ) -> Result<ImportReport, LifecycleError>
    where
        S: ImportSource + ?Sized,
    {
        self.begin();

        let rows = match source.read_rows(&self.options.parser, column_types) {
            Ok(rows) => rows,
            Err(source) => {
                warn!("Import into {} rejected: {}", table_name, source);
                self.enter(LifecycleState::ParseFailed);
                return Err(LifecycleError::ParseFailed {
                    table: table_name.to_string(),
                    source,
                });
            }
        };
        self.enter(LifecycleState::DataParsed);

        match self.options.loader.insert(self.conn, table_name, rows) {
            Ok(result) => Ok(self.finish(table_name, result)),
            Err(source) => {
                error!("Load into {} failed: {}", table_name, source);
                self.enter(LifecycleState::LoadFailed);
                Err(LifecycleError::LoadFailed {
                    table: table_name.to_string(),
                    source,
                })
            }
        }
    }

    /// Looks up the column types of `table_name` and appends rows to it.
    pub fn append_to_table<S>(
        &mut self,
        table_name: &str,
        source: &S,
    ) -> Result<ImportReport, LifecycleError>
    where
        S: ImportSource + ?Sized,
    {
        self.begin();

        let introspection_error = |source| LifecycleError::Introspection {
            table: table_name.to_string(),
            source,
        };
        let column_types = Catalog::new(self.conn)
            .describe_table(table_name)
            .and_then(|table| table.value_types())
            .map_err(introspection_error)?;
        self.append_to_existing(table_name, &column_types, source)
    }

    fn finish(&mut self, table_name: &str, result: LoadResult) -> ImportReport {
        self.timing.record_prepare(result.prepare_duration);
        self.timing.record_execute(result.execute_duration);
        self.enter(LifecycleState::DataLoaded);
        info!("Loaded {} rows into {}", result.rows, table_name);
        ImportReport {
            table: table_name.to_string(),
            rows: result.rows,
            timing: self.timing,
        }
    }

    // Drops a table created earlier in the same operation.
    fn compensate(&mut self, table_name: &str, cause: LifecycleError) -> LifecycleError {
        warn!("{}; dropping table {}", cause, table_name);
        match Catalog::new(self.conn).drop_table(table_name) {
            Ok(()) => {
                self.known_tables.retain(|t| t != table_name);
                self.enter(LifecycleState::Idle);
                cause
            }
            Err(drop_error) => {
                error!("Failed to drop table {}: {}", table_name, drop_error);
                LifecycleError::CompensationFailed {
                    table: table_name.to_string(),
                    cause: Box::new(cause),
                    drop_error,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;
    use super::*;
    use crate::ingest::parser::{RowFailure, RowParseError};
    use crate::ingest::schema::ColumnDefinition;
    use crate::ingest::schema::ValueType::{Integer, Text};

    fn people_schema() -> TableSchema {
        TableSchema::new(
            "people",
            vec![
                ColumnDefinition::new("id", Integer).unique(),
                ColumnDefinition::new("name", Text),
            ],
        )
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        Catalog::new(conn).list_tables().unwrap()
    }

    #[test]
    fn successful_import_walks_every_state() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut lifecycle = TableLifecycle::new(&mut conn, ImportOptions::default()).unwrap();

        let lines = ["1\tada", "2\tgrace", "3\tedsger"];
        let report = lifecycle
            .create_and_load(&people_schema(), &lines[..])
            .unwrap();

        assert_eq!(report.rows, 3);
        assert!(report.timing.prepare.is_some());
        assert!(report.timing.execute.is_some());
        assert_eq!(report.timing.fetch, None);
        assert_eq!(
            lifecycle.transitions(),
            &[Idle, SchemaValidated, TableCreated, DataParsed, DataLoaded]
        );
        assert_eq!(lifecycle.known_tables(), &["people".to_string()]);
        drop(lifecycle);

        assert_eq!(Catalog::new(&conn).row_count("people").unwrap(), 3);
    }

    #[test]
    fn load_failure_drops_the_new_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut lifecycle = TableLifecycle::new(&mut conn, ImportOptions::default()).unwrap();

        // Repeated key makes the insert fail after the table exists.
        let lines = ["1\tada", "2\tgrace", "1\tagain"];
        let err = lifecycle
            .create_and_load(&people_schema(), &lines[..])
            .unwrap_err();

        assert!(matches!(err, LifecycleError::LoadFailed { .. }));
        assert_eq!(
            lifecycle.transitions(),
            &[Idle, SchemaValidated, TableCreated, DataParsed, LoadFailed, Idle]
        );
        assert!(lifecycle.known_tables().is_empty());
        drop(lifecycle);

        assert!(table_names(&conn).is_empty());
    }

    #[test]
    fn parse_failure_drops_the_new_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut lifecycle = TableLifecycle::new(&mut conn, ImportOptions::default()).unwrap();

        let lines = ["1\tada", "two\tgrace"];
        let err = lifecycle
            .create_and_load(&people_schema(), &lines[..])
            .unwrap_err();

        match err {
            LifecycleError::ParseFailed {
                source: ParseError::Row(row),
                ..
            } => assert_eq!(row.line_index, 1),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            lifecycle.transitions(),
            &[Idle, SchemaValidated, TableCreated, ParseFailed, Idle]
        );
        drop(lifecycle);

        assert!(table_names(&conn).is_empty());
    }

    #[test]
    fn invalid_schema_never_reaches_the_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut lifecycle = TableLifecycle::new(&mut conn, ImportOptions::default()).unwrap();

        let schema = TableSchema::new(
            "people",
            vec![
                ColumnDefinition::new("id", Integer).unique(),
                ColumnDefinition::new("id", Text),
            ],
        );
        let err = lifecycle
            .create_and_load(&schema, &["1\tx"][..])
            .unwrap_err();

        assert!(matches!(
            err,
            LifecycleError::ValidationFailed(SchemaError::DuplicateColumnName(_))
        ));
        assert_eq!(lifecycle.state(), ValidationFailed);
        drop(lifecycle);

        assert!(table_names(&conn).is_empty());
    }

    #[test]
    fn existing_table_name_is_a_collision() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE people (id int);").unwrap();
        let mut lifecycle = TableLifecycle::new(&mut conn, ImportOptions::default()).unwrap();

        let err = lifecycle
            .create_and_load(&people_schema(), &["1\tada"][..])
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::ValidationFailed(SchemaError::NameCollision(_))
        ));
    }

    #[test]
    fn create_failure_needs_no_compensation() {
        let mut conn = Connection::open_in_memory().unwrap();
        let other = conn.try_clone().unwrap();
        let mut lifecycle = TableLifecycle::new(&mut conn, ImportOptions::default()).unwrap();

        // Created behind the controller's back, so its table list is stale.
        other
            .execute_batch("CREATE TABLE people (id int); INSERT INTO people VALUES (7);")
            .unwrap();

        let err = lifecycle
            .create_and_load(&people_schema(), &["1\tada"][..])
            .unwrap_err();

        assert!(matches!(err, LifecycleError::CreateFailed { .. }));
        assert_eq!(
            lifecycle.transitions(),
            &[Idle, SchemaValidated, CreateFailed]
        );
        drop(lifecycle);

        assert_eq!(Catalog::new(&other).row_count("people").unwrap(), 1);
    }

    #[test]
    fn refreshed_table_list_catches_new_collisions() {
        let mut conn = Connection::open_in_memory().unwrap();
        let other = conn.try_clone().unwrap();
        let mut lifecycle = TableLifecycle::new(&mut conn, ImportOptions::default()).unwrap();
        assert!(lifecycle.known_tables().is_empty());

        other.execute_batch("CREATE TABLE people (id int);").unwrap();
        lifecycle.refresh_tables().unwrap();
        assert_eq!(lifecycle.known_tables(), &["people".to_string()]);

        let err = lifecycle
            .create_and_load(&people_schema(), &["1\tada"][..])
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::ValidationFailed(SchemaError::NameCollision(_))
        ));
        assert_eq!(lifecycle.transitions(), &[Idle, ValidationFailed]);
    }

    #[test]
    fn append_failure_leaves_existing_rows_alone() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE people (id int PRIMARY KEY NOT NULL, name text);
             INSERT INTO people VALUES (1, 'ada'), (2, 'grace');",
        )
        .unwrap();
        let mut lifecycle = TableLifecycle::new(&mut conn, ImportOptions::default()).unwrap();

        let err = lifecycle
            .append_to_existing("people", &[Integer, Text], &["3\tedsger", "2\tdup"][..])
            .unwrap_err();

        assert!(matches!(err, LifecycleError::LoadFailed { .. }));
        assert_eq!(lifecycle.transitions(), &[Idle, DataParsed, LoadFailed]);
        drop(lifecycle);

        let catalog = Catalog::new(&conn);
        assert_eq!(catalog.row_count("people").unwrap(), 2);
        assert_eq!(table_names(&conn), vec!["people".to_string()]);
    }

    #[test]
    fn append_looks_up_column_types() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE people (id int PRIMARY KEY NOT NULL, name text);")
            .unwrap();
        let mut lifecycle = TableLifecycle::new(&mut conn, ImportOptions::default()).unwrap();

        let report = lifecycle
            .append_to_table("people", &["1\tada", "2\tgrace"][..])
            .unwrap();
        assert_eq!(report.rows, 2);
        assert_eq!(lifecycle.transitions(), &[Idle, DataParsed, DataLoaded]);

        let err = lifecycle
            .append_to_table("missing", &["1\tada"][..])
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Introspection {
                source: DbError::TableNotFound(_),
                ..
            }
        ));
        assert_eq!(lifecycle.state(), Idle);
        assert_eq!(lifecycle.transitions(), &[Idle]);
    }

    // Removes the freshly created table through a second handle, then fails,
    // so the compensating drop has nothing left to drop.
    struct TableVanishesThenFails {
        other: Connection,
    }

    impl ImportSource for TableVanishesThenFails {
        fn read_rows(
            &self,
            _parser: &RowParser,
            _column_types: &[ValueType],
        ) -> Result<Vec<TypedRow>, ParseError> {
            self.other.execute_batch("DROP TABLE people;").unwrap();
            Err(ParseError::Row(RowParseError {
                line_index: 0,
                column: None,
                reason: RowFailure::ArityMismatch {
                    expected: 2,
                    found: 1,
                },
            }))
        }
    }

    #[test]
    fn failed_compensation_is_reported_separately() {
        let mut conn = Connection::open_in_memory().unwrap();
        let source = TableVanishesThenFails {
            other: conn.try_clone().unwrap(),
        };
        let mut lifecycle = TableLifecycle::new(&mut conn, ImportOptions::default()).unwrap();

        let err = lifecycle
            .create_and_load(&people_schema(), &source)
            .unwrap_err();

        let LifecycleError::CompensationFailed {
            table,
            cause,
            drop_error,
        } = &err
        else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(table, "people");
        assert!(matches!(**cause, LifecycleError::ParseFailed { .. }));
        assert!(matches!(drop_error, DbError::Driver(_)));
        assert_eq!(lifecycle.state(), ParseFailed);
        assert_eq!(
            lifecycle.transitions(),
            &[Idle, SchemaValidated, TableCreated, ParseFailed]
        );
        assert!(err.user_message().contains("drop it manually"));
    }

    #[test]
    fn empty_import_is_rolled_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut lifecycle = TableLifecycle::new(&mut conn, ImportOptions::default()).unwrap();

        let empty: [&str; 0] = [];
        let err = lifecycle
            .create_and_load(&people_schema(), &empty[..])
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::LoadFailed {
                source: InsertError::EmptyBatch,
                ..
            }
        ));
        drop(lifecycle);

        assert!(table_names(&conn).is_empty());
    }
}
