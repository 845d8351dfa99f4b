// Table definition and bulk import: schema model, DDL, parsing, loading and
// the lifecycle that ties them together.
pub mod ddl;
pub mod lifecycle;
pub mod loader;
pub mod parser;
pub mod schema;

pub use ddl::compile_create_statement;
pub use lifecycle::{
    ImportOptions, ImportReport, ImportSource, LifecycleError, LifecycleState, TableLifecycle,
};
pub use loader::{BulkLoader, InsertError, LoadResult};
pub use parser::{ParseError, RowFailure, RowParseError, RowParser};
pub use schema::{
    ColumnDefinition, NameMatching, SchemaError, TableSchema, TypedRow, TypedValue, ValueType,
    validate_identifier,
};
