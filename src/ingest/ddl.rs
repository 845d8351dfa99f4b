use crate::ingest::schema::{ColumnDefinition, TableSchema};

impl ColumnDefinition {
    pub fn to_sql_definition(&self) -> String {
        let key_str = if self.is_unique { " PRIMARY KEY" } else { "" };
        let nullable_str = if self.allows_null { "" } else { " NOT NULL" };
        format!(
            "{} {}{}{}",
            self.name,
            self.value_type.to_sql_type(),
            key_str,
            nullable_str
        )
    }
}

/// Builds the `CREATE TABLE` statement for a schema.
///
/// The schema must already have passed [`TableSchema::validate`]: names are
/// written into the statement as bare identifiers.
pub fn compile_create_statement(schema: &TableSchema) -> String {
    let columns_sql: Vec<String> = schema
        .columns
        .iter()
        .map(|col| col.to_sql_definition())
        .collect();

    format!("CREATE TABLE {} ({});", schema.name, columns_sql.join(", "))
}

/// Builds a `DROP TABLE` statement for a table name coming from the catalog.
pub fn compile_drop_statement(table_name: &str) -> String {
    format!("DROP TABLE {};", quote_identifier(table_name))
}

/// Double-quotes an identifier, escaping embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
