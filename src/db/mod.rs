pub mod catalog;
pub mod db_pool;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Driver(#[from] duckdb::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{column}' has type {native_type}, which cannot be imported")]
    UnsupportedColumnType { column: String, native_type: String },

    #[error("Invalid database name '{0}'")]
    InvalidName(String),

    #[error("Database already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            DbError::TableNotFound(table) => {
                format!("Table '{table}' not found.\n\nHint: Run 'tabledesk tables' to list tables.")
            }
            DbError::InvalidName(name) => format!(
                "Invalid database name '{name}'.\n\n\
                 Hint: Use only lowercase letters, digits and '_'."
            ),
            DbError::AlreadyExists(path) => format!(
                "Database already exists: {}\n\nHint: Pass it with --database to connect instead.",
                path.display()
            ),
            _ => self.to_string(),
        }
    }
}
