use clap::Parser;
use r2d2::{Pool, PooledConnection};
use std::path::{Path, PathBuf};
use tabledesk::config::{AppConfig, CliArgs, Command};
use tabledesk::db::DbError;
use tabledesk::db::catalog::{Catalog, create_database};
use tabledesk::db::db_pool::DuckDBConnectionManager;
use tabledesk::ingest::{ImportReport, LifecycleError, TableLifecycle, TableSchema};
use tabledesk::util::logging::init_tracing;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Import(#[from] LifecycleError),

    #[error("Cannot read schema file {path}: {source}")]
    SchemaFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid schema file {path}: {source}")]
    SchemaFormat {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CliError {
    fn user_message(&self) -> String {
        match self {
            CliError::Db(e) => e.user_message(),
            CliError::Import(e) => e.user_message(),
            CliError::SchemaFormat { .. } => format!(
                "{self}\n\nHint: Expected {{\"name\": ..., \"columns\": [{{\"name\", \"value_type\", \
                 \"is_unique\", \"allows_null\"}}]}}"
            ),
            _ => self.to_string(),
        }
    }
}

impl From<r2d2::Error> for CliError {
    fn from(e: r2d2::Error) -> Self {
        CliError::Db(DbError::Pool(e))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Initialize logging
    init_tracing(args.log_json);

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    match run(args.command, config).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("{}", e.user_message());
            Err(e.into())
        }
    }
}

async fn run(command: Command, config: AppConfig) -> Result<(), CliError> {
    // DuckDB work is blocking; keep it off the async workers
    tokio::task::spawn_blocking(move || execute(command, &config)).await?
}

fn connection_pool(
    config: &AppConfig,
    writes: bool,
) -> Result<Pool<DuckDBConnectionManager>, CliError> {
    let path = &config.database.path;
    let manager = if writes {
        DuckDBConnectionManager::new(path)
    } else {
        if !path.exists() {
            return Err(DbError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("database file {} does not exist", path.display()),
            ))
            .into());
        }
        DuckDBConnectionManager::read_only(path)
    };

    info!(
        "Opening {} ({})",
        path.display(),
        if writes { "read-write" } else { "read-only" }
    );
    // Connections are opened on demand, never ahead of the first checkout.
    let pool = Pool::builder()
        .max_size(config.database.pool_size.max(1) as u32)
        .min_idle(Some(0))
        .build(manager)?;
    Ok(pool)
}

fn checkout(
    config: &AppConfig,
    writes: bool,
) -> Result<PooledConnection<DuckDBConnectionManager>, CliError> {
    Ok(connection_pool(config, writes)?.get()?)
}

fn execute(command: Command, config: &AppConfig) -> Result<(), CliError> {
    match command {
        Command::CreateDb { name } => {
            let (path, _conn) = create_database(&config.data_dir, &name)?;
            println!("{}", path.display());
        }
        Command::Tables => {
            let conn = checkout(config, false)?;
            for table in Catalog::new(&conn).list_tables()? {
                println!("{}", table);
            }
        }
        Command::Describe { table } => {
            let conn = checkout(config, false)?;
            let table = Catalog::new(&conn).describe_table(&table)?;
            for (column, native_type) in table.columns.iter().zip(&table.column_types) {
                println!("{}\t{}", column, native_type);
            }
        }
        Command::Create { schema, data } => {
            let schema = read_schema(&schema)?;
            let mut conn = checkout(config, true)?;
            let mut lifecycle = TableLifecycle::new(&mut conn, config.import.import_options())?;
            let report = lifecycle.create_and_load(&schema, data.as_path())?;
            print_report(&report);
        }
        Command::Append { table, data } => {
            let mut conn = checkout(config, true)?;
            let mut lifecycle = TableLifecycle::new(&mut conn, config.import.import_options())?;
            let report = lifecycle.append_to_table(&table, data.as_path())?;
            print_report(&report);
        }
        Command::Show { table, limit } => {
            let conn = checkout(config, false)?;
            let catalog = Catalog::new(&conn);
            let table = catalog.describe_table(&table)?;
            let data = catalog.fetch_rows(&table, limit)?;

            println!("{}", data.columns.join("\t"));
            for row in &data.rows {
                let cells: Vec<&str> = row.iter().map(|v| v.as_deref().unwrap_or("")).collect();
                println!("{}", cells.join("\t"));
            }
            println!("\n{} rows", data.rows.len());
            print!("{}", data.timing);
        }
        Command::Latency { table, points } => {
            let conn = checkout(config, false)?;
            let points = points.unwrap_or(config.latency.points);
            let samples = Catalog::new(&conn).latency_profile(&table, points)?;

            println!("{:>12}  {:>12}", "rows", "seconds");
            for sample in samples {
                println!("{:>12}  {:>12.6}", sample.rows, sample.seconds);
            }
        }
    }

    Ok(())
}

fn read_schema(path: &Path) -> Result<TableSchema, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::SchemaFile {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::SchemaFormat {
        path: path.to_path_buf(),
        source,
    })
}

fn print_report(report: &ImportReport) {
    println!("Loaded {} rows into {}", report.rows, report.table);
    print!("{}", report.timing);
}
