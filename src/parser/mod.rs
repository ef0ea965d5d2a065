// Parser module: table DDL (columns + PK) and INSERT statement helpers.

pub mod insert;
pub mod schema;

pub use insert::{escape_sql_value, quote_ident, render_insert, ScriptParser, TargetTable};
pub use schema::{ColumnDef, SchemaParser, TableSpec};
