//! SQL utilities for safe identifier handling and statement building.
//!
//! This module provides:
//! 1. **Validation**: Ensures configured schema names are safe PostgreSQL identifiers
//! 2. **Quoting**: Properly escapes identifiers for use in SQL statements
//! 3. **Statement Building**: Helpers for the statements the builder issues
//!
//! # Security Model
//!
//! Identifiers (schemas, tables, columns) cannot be bound as parameters, so they are
//! interpolated, but only after passing through this module:
//!
//! ```text
//! Config value → validate_identifier() → quote_identifier() → SQL statement
//!                (sqlparser check)        (pg_escape quoting)
//! ```
//!
//! Values that filter a partition (`service_type`, `source_year`, `source_month`) are bound as
//! `$1`, `$2`, `$3` by every statement built here.

use pg_escape::quote_identifier;
use sqlparser::{dialect::PostgreSqlDialect, parser::Parser};

/// CSV options shared by the export and import halves of a partition copy.
///
/// Both sides must agree on these exactly, otherwise the import misreads the buffer.
const COPY_CSV_OPTIONS: &str = "FORMAT CSV, DELIMITER '|'";

/// Errors that occur during SQL identifier validation.
#[derive(Debug, thiserror::Error)]
pub enum ValidateIdentifierError {
    /// Identifier is empty
    #[error("Identifier cannot be empty")]
    Empty,

    /// Identifier exceeds PostgreSQL's 63-byte limit
    #[error("Identifier exceeds PostgreSQL limit of 63 bytes (got {length})")]
    TooLong { length: usize },

    /// Identifier contains invalid characters
    #[error("Identifier contains invalid character: '{character}'")]
    InvalidCharacter { character: char },

    /// Identifier must start with letter or underscore
    #[error("Identifier must start with letter or underscore, got '{first_char}'")]
    InvalidFirstCharacter { first_char: char },

    /// Identifier failed SQL parser validation
    #[error("Not a valid SQL identifier: {reason}")]
    ParserError { reason: String },

    /// Identifier parsed as multiple SQL statements (injection attempt)
    #[error("Identifier parsed as multiple SQL statements")]
    MultipleStatements,
}

/// Validate that a string is a safe PostgreSQL identifier.
///
/// Accepts only simple, unqualified identifiers: `[A-Za-z_][A-Za-z0-9_$]*`, at most 63 bytes,
/// that parse as a single `SELECT * FROM <name>` statement.
///
/// # Example
/// ```
/// use obt_builder::sql::validate_identifier;
///
/// assert!(validate_identifier("analytics").is_ok());
/// assert!(validate_identifier("raw; DROP TABLE").is_err());
/// assert!(validate_identifier("raw.trips").is_err());
/// ```
pub fn validate_identifier(name: &str) -> Result<(), ValidateIdentifierError> {
    let Some(first_char) = name.chars().next() else {
        return Err(ValidateIdentifierError::Empty);
    };

    // Check PostgreSQL length limit (63 bytes for identifiers)
    if name.len() > 63 {
        return Err(ValidateIdentifierError::TooLong { length: name.len() });
    }

    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '_' && ch != '$' {
            return Err(ValidateIdentifierError::InvalidCharacter { character: ch });
        }
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ValidateIdentifierError::InvalidFirstCharacter { first_char });
    }

    // Use sqlparser to validate that this is a valid SQL identifier
    let sql = format!("SELECT * FROM {}", name);
    let dialect = PostgreSqlDialect {};

    match Parser::parse_sql(&dialect, &sql) {
        Ok(statements) => {
            if statements.len() != 1 {
                return Err(ValidateIdentifierError::MultipleStatements);
            }
            Ok(())
        }
        Err(e) => Err(ValidateIdentifierError::ParserError {
            reason: e.to_string(),
        }),
    }
}

/// Format a schema-qualified table name with both parts quoted.
///
/// **Safety**: Assumes `schema` has been validated using [`validate_identifier`]; `table` is one
/// of the crate's fixed table or index names.
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

/// Quote a column name for safe use in SQL.
pub fn quote_column(column_name: &str) -> String {
    quote_identifier(column_name).to_string()
}

/// Format `CREATE SCHEMA IF NOT EXISTS`.
pub fn create_schema(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_identifier(schema))
}

/// Format the export half of a partition copy.
///
/// # Example
/// ```ignore
/// let sql = copy_to_stdout("SELECT 1");
/// // Produces: COPY (SELECT 1) TO STDOUT WITH (FORMAT CSV, DELIMITER '|')
/// ```
pub fn copy_to_stdout(query: &str) -> String {
    format!("COPY ({}) TO STDOUT WITH ({})", query, COPY_CSV_OPTIONS)
}

/// Format the import half of a partition copy with an explicit column list.
///
/// # Example
/// ```ignore
/// let sql = copy_from_stdin("analytics.obt_trips", &["service_type", "run_id"]);
/// // Produces: COPY analytics.obt_trips (service_type, run_id) FROM STDIN WITH (FORMAT CSV, DELIMITER '|')
/// ```
pub fn copy_from_stdin(qualified_table: &str, columns: &[&str]) -> String {
    let columns = columns
        .iter()
        .map(|c| quote_column(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "COPY {} ({}) FROM STDIN WITH ({})",
        qualified_table, columns, COPY_CSV_OPTIONS
    )
}

/// Format a row count over one partition key.
///
/// Execute with: `.bind(service).bind(year).bind(month)`
pub fn count_partition(qualified_table: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM {} WHERE service_type = $1 AND source_year = $2 AND source_month = $3",
        qualified_table
    )
}

/// Format a delete of every row of one partition key.
///
/// Execute with: `.bind(service).bind(year).bind(month)`
pub fn delete_partition(qualified_table: &str) -> String {
    format!(
        "DELETE FROM {} WHERE service_type = $1 AND source_year = $2 AND source_month = $3",
        qualified_table
    )
}

/// Format `VACUUM ANALYZE` for one table.
pub fn vacuum_analyze(qualified_table: &str) -> String {
    format!("VACUUM ANALYZE {}", qualified_table)
}

/// Format a non-blocking index build.
///
/// Must run outside a transaction block; PostgreSQL rejects `CONCURRENTLY` otherwise.
pub fn create_index_concurrently(index_name: &str, qualified_table: &str, columns: &[&str]) -> String {
    let columns = columns
        .iter()
        .map(|c| quote_column(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS {} ON {} ({})",
        quote_identifier(index_name),
        qualified_table,
        columns
    )
}

/// Format a non-blocking drop of a leftover index.
pub fn drop_index_concurrently(qualified_index: &str) -> String {
    format!("DROP INDEX CONCURRENTLY IF EXISTS {}", qualified_index)
}

/// Whether an index exists but is marked invalid, as a failed concurrent build leaves it.
///
/// Bind the qualified index name as `$1`; returns no row when the index does not exist.
pub const INDEX_IS_INVALID: &str =
    "SELECT NOT i.indisvalid FROM pg_index i WHERE i.indexrelid = to_regclass($1)";
