use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Format used for timestamp values, both in import files and when rendering.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]+$").expect("identifier pattern is valid"));

/// Returns true if `text` is usable as a table or column name.
///
/// Identifiers are interpolated into DDL unquoted, so this character set is
/// the only thing standing between user input and the statement text.
pub fn validate_identifier(text: &str) -> bool {
    IDENTIFIER.is_match(text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Integer,
    Float,
    Text,
    Timestamp,
}

impl ValueType {
    /// Type name used in generated `CREATE TABLE` statements.
    pub fn to_sql_type(&self) -> &'static str {
        match self {
            ValueType::Integer => "int",
            ValueType::Float => "double precision",
            ValueType::Text => "text",
            ValueType::Timestamp => "timestamp",
        }
    }

    /// Maps a type name reported by `information_schema.columns` back onto a
    /// value type. Returns `None` for types the importer cannot produce.
    pub fn from_catalog_type(native: &str) -> Option<Self> {
        let native = native.trim().to_lowercase();
        match native.as_str() {
            "integer" | "int" | "int4" | "int8" | "bigint" | "smallint" | "tinyint"
            | "hugeint" => Some(ValueType::Integer),
            "double precision" | "double" | "float" | "float4" | "float8" | "real" => {
                Some(ValueType::Float)
            }
            "text" | "varchar" | "character varying" | "string" => Some(ValueType::Text),
            "timestamp" | "timestamp without time zone" | "datetime" => {
                Some(ValueType::Timestamp)
            }
            other if other.starts_with("varchar(") => Some(ValueType::Text),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::Text => "text",
            ValueType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// A single parsed cell. The variant always matches the column's `ValueType`.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl TypedValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            TypedValue::Integer(_) => ValueType::Integer,
            TypedValue::Float(_) => ValueType::Float,
            TypedValue::Text(_) => ValueType::Text,
            TypedValue::Timestamp(_) => ValueType::Timestamp,
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Integer(v) => write!(f, "{}", v),
            TypedValue::Float(v) => write!(f, "{}", v),
            TypedValue::Text(v) => f.write_str(v),
            TypedValue::Timestamp(v) => write!(f, "{}", v.format(TIMESTAMP_FORMAT)),
        }
    }
}

/// One row of an import batch, positionally aligned with the target columns.
pub type TypedRow = Vec<TypedValue>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("invalid name '{0}': only lowercase letters, digits and '_' are allowed")]
    InvalidName(String),

    #[error("column '{0}' cannot be both unique and nullable")]
    IllegalNullableUnique(String),

    #[error("column name '{0}' is used more than once")]
    DuplicateColumnName(String),

    #[error("table '{0}' already exists")]
    NameCollision(String),

    #[error("table '{0}' has no columns")]
    NoColumns(String),
}

/// How names are compared when looking for duplicates and collisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameMatching {
    /// Byte-for-byte comparison.
    #[default]
    Exact,
    /// Trimmed, lowercased comparison.
    CaseInsensitive,
}

impl NameMatching {
    fn key(&self, name: &str) -> String {
        match self {
            NameMatching::Exact => name.to_string(),
            NameMatching::CaseInsensitive => name.trim().to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default = "default_allows_null")]
    pub allows_null: bool,
}

// New columns start out nullable, matching the checkbox default of the column editor.
fn default_allows_null() -> bool {
    true
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            is_unique: false,
            allows_null: true,
        }
    }

    /// Marks the column as the table's key. Key columns never accept nulls.
    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self.allows_null = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.allows_null = false;
        self
    }

    pub fn nullable(mut self, allows_null: bool) -> Self {
        self.allows_null = allows_null;
        self
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if !validate_identifier(&self.name) {
            return Err(SchemaError::InvalidName(self.name.clone()));
        }
        if self.is_unique && self.allows_null {
            return Err(SchemaError::IllegalNullableUnique(self.name.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDefinition>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn column_types(&self) -> Vec<ValueType> {
        self.columns.iter().map(|c| c.value_type).collect()
    }

    pub fn validate<S: AsRef<str>>(&self, existing_table_names: &[S]) -> Result<(), SchemaError> {
        self.validate_with(existing_table_names, NameMatching::Exact)
    }

    /// Validates the schema, stopping at the first problem found.
    ///
    /// Checks run in a fixed order: table name, column presence, duplicate
    /// column names, collision with an existing table, then each column in
    /// declared order.
    pub fn validate_with<S: AsRef<str>>(
        &self,
        existing_table_names: &[S],
        matching: NameMatching,
    ) -> Result<(), SchemaError> {
        if !validate_identifier(&self.name) {
            return Err(SchemaError::InvalidName(self.name.clone()));
        }

        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns(self.name.clone()));
        }

        let mut seen = HashSet::with_capacity(self.columns.len());
        for column in &self.columns {
            if !seen.insert(matching.key(&column.name)) {
                return Err(SchemaError::DuplicateColumnName(column.name.clone()));
            }
        }

        let table_key = matching.key(&self.name);
        if existing_table_names
            .iter()
            .any(|existing| matching.key(existing.as_ref()) == table_key)
        {
            return Err(SchemaError::NameCollision(self.name.clone()));
        }

        for column in &self.columns {
            column.validate()?;
        }

        Ok(())
    }
}
