//! Error types for the dump library.

use thiserror::Error;

/// Exit code for configuration errors (bad YAML, invalid values, unknown format).
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for connection and pool failures.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for query and cursor failures.
pub const EXIT_QUERY_ERROR: u8 = 3;
/// Exit code when the run finished but some tables failed.
pub const EXIT_PARTIAL_FAILURE: u8 = 4;
/// Exit code for file I/O failures.
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code when the run was cancelled by a signal.
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for dump operations.
#[derive(Error, Debug)]
pub enum DumpError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Output format selector not recognized
    #[error("Unknown dump format '{0}' (expected sql, csv or tsv)")]
    UnknownFormat(String),

    /// Database selection pattern failed to compile
    #[error("Invalid database regexp: {0}")]
    Regex(#[from] regex::Error),

    /// Connection or authentication failure
    #[error("Connection error: {message}\n  Context: {context}")]
    Connection { message: String, context: String },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Query execution failed
    #[error("Query failed: {message}\n  Query: {sql}")]
    Query { sql: String, message: String },

    /// Reading from a streaming cursor failed
    #[error("Cursor error: {0}")]
    Cursor(String),

    /// MySQL driver error
    #[error("MySQL error: {0}")]
    Mysql(#[from] mysql_async::Error),

    /// Dump failed for a specific table
    #[error("Dump failed for table {database}.{table}: {message}")]
    Table {
        database: String,
        table: String,
        message: String,
    },

    /// The run completed but one or more tables failed
    #[error("{failed} of {total} tables failed to dump")]
    TablesFailed { failed: usize, total: usize },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Delimited output encoding error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Dump was cancelled (SIGINT, etc.)
    #[error("Dump cancelled")]
    Cancelled,
}

impl DumpError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        DumpError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Connection error with context about where it occurred
    pub fn connection(message: impl ToString, context: impl Into<String>) -> Self {
        DumpError::Connection {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Query error
    pub fn query(sql: impl Into<String>, message: impl ToString) -> Self {
        DumpError::Query {
            sql: sql.into(),
            message: message.to_string(),
        }
    }

    /// Create a Table error
    pub fn table(
        database: impl Into<String>,
        table: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        DumpError::Table {
            database: database.into(),
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Whether retrying on a fresh session may succeed.
    ///
    /// Only connectivity failures qualify; a query the server rejected will
    /// be rejected again.
    pub fn is_transient(&self) -> bool {
        match self {
            DumpError::Connection { .. } => true,
            DumpError::Mysql(mysql_async::Error::Io(_)) => true,
            DumpError::Mysql(mysql_async::Error::Driver(
                mysql_async::DriverError::ConnectionClosed,
            )) => true,
            DumpError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            DumpError::Config(_)
            | DumpError::UnknownFormat(_)
            | DumpError::Regex(_)
            | DumpError::Yaml(_) => EXIT_CONFIG_ERROR,
            DumpError::Connection { .. } | DumpError::Pool { .. } => EXIT_CONNECTION_ERROR,
            DumpError::Query { .. }
            | DumpError::Cursor(_)
            | DumpError::Mysql(_)
            | DumpError::Table { .. } => EXIT_QUERY_ERROR,
            DumpError::TablesFailed { .. } => EXIT_PARTIAL_FAILURE,
            DumpError::Io(_) | DumpError::Csv(_) | DumpError::Json(_) => EXIT_IO_ERROR,
            DumpError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for dump operations.
pub type Result<T> = std::result::Result<T, DumpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_are_transient() {
        assert!(DumpError::connection("reset by peer", "streaming rows").is_transient());
        assert!(DumpError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .is_transient());
    }

    #[test]
    fn test_query_errors_are_not_transient() {
        assert!(!DumpError::query("SELECT 1", "syntax error").is_transient());
        assert!(!DumpError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_transient());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(DumpError::Config("x".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(DumpError::UnknownFormat("xml".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(DumpError::pool("x", "y").exit_code(), EXIT_CONNECTION_ERROR);
        assert_eq!(DumpError::table("db", "t", "x").exit_code(), EXIT_QUERY_ERROR);
        assert_eq!(
            DumpError::TablesFailed { failed: 1, total: 2 }.exit_code(),
            EXIT_PARTIAL_FAILURE
        );
        assert_eq!(DumpError::Cancelled.exit_code(), EXIT_CANCELLED);
    }

    #[test]
    fn test_table_error_message() {
        let err = DumpError::table("shop", "orders", "disk full");
        assert_eq!(err.to_string(), "Dump failed for table shop.orders: disk full");
    }
}
