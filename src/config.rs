use crate::db::catalog::DEFAULT_LATENCY_POINTS;
use crate::ingest::loader::DEFAULT_ROWS_PER_STATEMENT;
use crate::ingest::parser::DEFAULT_PARSE_WORKERS;
use crate::ingest::{BulkLoader, ImportOptions, NameMatching, RowParser};
use clap::{Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub pool_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    pub parse_workers: usize,
    pub rows_per_statement: usize,
    pub name_matching: NameMatching,
}

impl ImportConfig {
    pub fn import_options(&self) -> ImportOptions {
        ImportOptions {
            parser: RowParser::with_workers(self.parse_workers),
            loader: BulkLoader::with_rows_per_statement(self.rows_per_statement),
            name_matching: self.name_matching,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LatencyConfig {
    pub points: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub data_dir: PathBuf,
    pub import: ImportConfig,
    pub latency: LatencyConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Database file to operate on
    #[arg(short, long, value_name = "PATH", global = true)]
    pub database: Option<PathBuf>,

    /// Directory new databases are created in
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Create a new, empty database file in the data directory
    CreateDb { name: String },

    /// List the tables of the database
    Tables,

    /// Show the columns of a table with their native types
    Describe { table: String },

    /// Create a table from a JSON schema file and load a tab-separated data file into it
    Create {
        #[arg(long, value_name = "FILE")]
        schema: PathBuf,
        #[arg(long, value_name = "FILE")]
        data: PathBuf,
    },

    /// Append a tab-separated data file to an existing table
    Append {
        table: String,
        #[arg(long, value_name = "FILE")]
        data: PathBuf,
    },

    /// Print the rows of a table
    Show {
        table: String,
        #[arg(short, long)]
        limit: Option<u64>,
    },

    /// Time full reads of a table at increasing row limits
    Latency {
        table: String,
        #[arg(short, long)]
        points: Option<usize>,
    },
}

const DEFAULT_LOCATIONS: [&str; 2] = ["tabledesk.toml", "config/tabledesk.toml"];

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = Self::load(args.config.as_deref())?;

        // Command line args win over every other source
        if let Some(database) = &args.database {
            config.database.path = database.clone();
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }

        Ok(config)
    }

    /// Defaults, then the config file, then `TABLEDESK__*` environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder()
            .set_default("database.path", "tabledesk.duckdb")?
            .set_default("database.pool_size", 4_i64)?
            .set_default("data_dir", "data")?
            .set_default("import.parse_workers", DEFAULT_PARSE_WORKERS as i64)?
            .set_default("import.rows_per_statement", DEFAULT_ROWS_PER_STATEMENT as i64)?
            .set_default("import.name_matching", "exact")?
            .set_default("latency.points", DEFAULT_LATENCY_POINTS as i64)?;

        if let Some(config_path) = config_file {
            config_builder = config_builder.add_source(File::from(config_path));
        } else if let Some(location) = DEFAULT_LOCATIONS
            .iter()
            .find(|location| Path::new(location).exists())
        {
            config_builder =
                config_builder.add_source(File::new(location, config::FileFormat::Toml));
        }

        config_builder = config_builder.add_source(
            Environment::with_prefix("TABLEDESK")
                .separator("__")
                .try_parsing(true),
        );

        config_builder.build()?.try_deserialize()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: PathBuf::from("tabledesk.duckdb"),
                pool_size: 4,
            },
            data_dir: PathBuf::from("data"),
            import: ImportConfig {
                parse_workers: DEFAULT_PARSE_WORKERS,
                rows_per_statement: DEFAULT_ROWS_PER_STATEMENT,
                name_matching: NameMatching::Exact,
            },
            latency: LatencyConfig {
                points: DEFAULT_LATENCY_POINTS,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "data_dir = \"dbs\"\n\n[import]\nrows_per_statement = 50\nname_matching = \"case_insensitive\""
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("dbs"));
        assert_eq!(config.import.rows_per_statement, 50);
        assert_eq!(config.import.name_matching, NameMatching::CaseInsensitive);
        // untouched keys keep their defaults
        assert_eq!(config.import.parse_workers, 5);
        assert_eq!(config.latency.points, 10);
        assert_eq!(config.database.path, PathBuf::from("tabledesk.duckdb"));
    }

    #[test]
    fn cli_flags_are_applied_last() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[database]\npath = \"from_file.duckdb\"").unwrap();

        let config_path = file.path().to_str().unwrap();
        let args = CliArgs::try_parse_from([
            "tabledesk",
            "tables",
            "--config",
            config_path,
            "--database",
            "from_cli.duckdb",
        ])
        .unwrap();

        let config = AppConfig::new(&args).unwrap();
        assert_eq!(config.database.path, PathBuf::from("from_cli.duckdb"));
        assert_eq!(args.command, Command::Tables);
    }

    #[test]
    fn subcommands_parse() {
        let args = CliArgs::try_parse_from([
            "tabledesk",
            "create",
            "--schema",
            "people.json",
            "--data",
            "people.tsv",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Command::Create {
                schema: PathBuf::from("people.json"),
                data: PathBuf::from("people.tsv"),
            }
        );

        let args = CliArgs::try_parse_from(["tabledesk", "create-db", "sales"]).unwrap();
        assert_eq!(
            args.command,
            Command::CreateDb {
                name: "sales".to_string()
            }
        );

        let args = CliArgs::try_parse_from(["tabledesk", "latency", "events", "--points", "4"])
            .unwrap();
        assert_eq!(
            args.command,
            Command::Latency {
                table: "events".to_string(),
                points: Some(4)
            }
        );
    }

    #[test]
    fn import_options_follow_config() {
        let mut config = AppConfig::default();
        config.import.parse_workers = 2;
        let options = config.import.import_options();
        assert_eq!(options.parser.workers(), 2);
        assert_eq!(options.name_matching, NameMatching::Exact);
    }
}
