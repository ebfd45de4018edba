//! Configuration type definitions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DumpError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Source server (MySQL) configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Dump behavior configuration.
    #[serde(default)]
    pub dump: DumpConfig,
}

/// Source server (MySQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Server host (default: 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Statements executed on every new session (e.g. `SET SESSION ...`).
    #[serde(default)]
    pub session_vars: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_mysql_port(),
            user: String::new(),
            password: String::new(),
            session_vars: Vec::new(),
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("session_vars", &self.session_vars)
            .finish()
    }
}

/// Dump behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// Output directory (default: ./dumper-sql).
    #[serde(default = "default_outdir")]
    pub outdir: PathBuf,

    /// Total number of data sessions (default: 16).
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Chunk file size threshold in MB (default: 128).
    #[serde(default = "default_chunksize_mb")]
    pub chunksize_mb: u64,

    /// Bytes of row tuples per INSERT statement (default: 1000000).
    #[serde(default = "default_stmt_size")]
    pub stmt_size: usize,

    /// Output format (default: sql).
    #[serde(default)]
    pub format: OutputFormat,

    /// Progress report interval in milliseconds (default: 10000).
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Comma-separated database list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Database name pattern; takes priority over `database`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_regexp: Option<String>,

    /// Select databases NOT matching `database_regexp`.
    #[serde(default)]
    pub database_invert_regexp: bool,

    /// Comma-separated table list, applied to every selected database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    /// What to do when a single table fails (default: continue).
    #[serde(default)]
    pub on_table_error: FailurePolicy,

    /// Retries for transient errors on read-only queries (default: 3).
    #[serde(default = "default_query_retries")]
    pub query_retries: u32,

    /// Base delay between retries in milliseconds (default: 500).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Columns left out of the dump, keyed by table name.
    #[serde(default)]
    pub filters: HashMap<String, HashSet<String>>,

    /// Select expressions replacing columns, keyed by table then column.
    #[serde(default)]
    pub selects: HashMap<String, HashMap<String, String>>,

    /// WHERE predicates, keyed by table name.
    #[serde(default)]
    pub wheres: HashMap<String, String>,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            outdir: default_outdir(),
            threads: default_threads(),
            chunksize_mb: default_chunksize_mb(),
            stmt_size: default_stmt_size(),
            format: OutputFormat::default(),
            interval_ms: default_interval_ms(),
            database: None,
            database_regexp: None,
            database_invert_regexp: false,
            table: None,
            on_table_error: FailurePolicy::default(),
            query_retries: default_query_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            filters: HashMap::new(),
            selects: HashMap::new(),
            wheres: HashMap::new(),
        }
    }
}

impl DumpConfig {
    /// Chunk threshold in bytes.
    pub fn chunk_bytes(&self) -> u64 {
        self.chunksize_mb.saturating_mul(1024 * 1024)
    }

    /// Resolve which databases to dump: pattern first, then list, then all.
    pub fn database_selection(&self) -> Result<DatabaseSelection> {
        if let Some(pattern) = self.database_regexp.as_deref().filter(|p| !p.is_empty()) {
            return Ok(DatabaseSelection::Matching {
                pattern: Regex::new(pattern)?,
                invert: self.database_invert_regexp,
            });
        }
        match self.database.as_deref().map(split_list) {
            Some(list) if !list.is_empty() => Ok(DatabaseSelection::List(list)),
            _ => Ok(DatabaseSelection::All),
        }
    }

    /// Resolve which tables to dump in each database.
    pub fn table_selection(&self) -> TableSelection {
        match self.table.as_deref().map(split_list) {
            Some(list) if !list.is_empty() => TableSelection::List(list),
            _ => TableSelection::All,
        }
    }

    /// Column rules for a table.
    pub fn rules_for(&self, table: &str) -> TableRules<'_> {
        TableRules {
            filters: self.filters.get(table),
            selects: self.selects.get(table),
            predicate: self.wheres.get(table).map(String::as_str),
        }
    }
}

/// Split a comma-separated list, keeping order and dropping blanks.
fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Which databases a run covers.
#[derive(Debug, Clone)]
pub enum DatabaseSelection {
    /// Every server database whose name matches (or, inverted, does not match).
    Matching { pattern: Regex, invert: bool },
    /// Exactly these databases, in this order, without an existence check.
    List(Vec<String>),
    /// Every database the server reports.
    All,
}

/// Which tables a run covers in each database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSelection {
    /// Exactly these tables, in this order.
    List(Vec<String>),
    /// Every table the server reports.
    All,
}

/// Per-table column rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableRules<'a> {
    filters: Option<&'a HashSet<String>>,
    selects: Option<&'a HashMap<String, String>>,
    predicate: Option<&'a str>,
}

impl<'a> TableRules<'a> {
    /// Whether a column is excluded from the dump.
    pub fn is_filtered(&self, column: &str) -> bool {
        self.filters.is_some_and(|f| f.contains(column))
    }

    /// Replacement select expression for a column.
    pub fn replacement(&self, column: &str) -> Option<&'a str> {
        self.selects
            .and_then(|s| s.get(column))
            .map(String::as_str)
    }

    /// WHERE predicate for the table.
    pub fn predicate(&self) -> Option<&'a str> {
        self.predicate.filter(|p| !p.trim().is_empty())
    }
}

/// Output format of data chunk files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-row INSERT statements.
    #[default]
    #[serde(alias = "mysql")]
    Sql,

    /// Comma-separated values with a header row.
    Csv,

    /// Tab-separated values with a header row.
    Tsv,
}

impl OutputFormat {
    /// Field separator for delimited formats.
    pub fn separator(&self) -> Option<u8> {
        match self {
            OutputFormat::Sql => None,
            OutputFormat::Csv => Some(b','),
            OutputFormat::Tsv => Some(b'\t'),
        }
    }

    /// File extension of data chunks. TSV shares `.csv`.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Sql => "sql",
            OutputFormat::Csv | OutputFormat::Tsv => "csv",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = DumpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sql" | "mysql" => Ok(OutputFormat::Sql),
            "csv" => Ok(OutputFormat::Csv),
            "tsv" => Ok(OutputFormat::Tsv),
            _ => Err(DumpError::UnknownFormat(s.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Sql => write!(f, "sql"),
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Tsv => write!(f, "tsv"),
        }
    }
}

/// What the run does when one table's dump fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep dumping the other tables; report the failure at the end.
    #[default]
    Continue,

    /// Cancel every in-flight table and fail the run.
    Abort,
}

impl FromStr for FailurePolicy {
    type Err = DumpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(FailurePolicy::Continue),
            "abort" => Ok(FailurePolicy::Abort),
            _ => Err(DumpError::Config(format!(
                "on_table_error must be 'continue' or 'abort', got '{}'",
                s
            ))),
        }
    }
}

// Default value functions for serde
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_outdir() -> PathBuf {
    PathBuf::from("./dumper-sql")
}

fn default_threads() -> usize {
    16
}

fn default_chunksize_mb() -> u64 {
    128
}

fn default_stmt_size() -> usize {
    1_000_000
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_query_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regexp_wins_over_list() {
        let config = DumpConfig {
            database: Some("a,b".into()),
            database_regexp: Some("^shop_".into()),
            database_invert_regexp: true,
            ..Default::default()
        };
        match config.database_selection().unwrap() {
            DatabaseSelection::Matching { pattern, invert } => {
                assert_eq!(pattern.as_str(), "^shop_");
                assert!(invert);
            }
            other => panic!("expected pattern selection, got {:?}", other),
        }
    }

    #[test]
    fn test_database_list_keeps_order() {
        let config = DumpConfig {
            database: Some("zeta, alpha,,beta".into()),
            ..Default::default()
        };
        match config.database_selection().unwrap() {
            DatabaseSelection::List(list) => assert_eq!(list, vec!["zeta", "alpha", "beta"]),
            other => panic!("expected list selection, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_selection_means_all() {
        let config = DumpConfig {
            database: Some(" , ".into()),
            database_regexp: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(
            config.database_selection().unwrap(),
            DatabaseSelection::All
        ));
        assert_eq!(config.table_selection(), TableSelection::All);
    }

    #[test]
    fn test_bad_regexp_is_an_error() {
        let config = DumpConfig {
            database_regexp: Some("(".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.database_selection(),
            Err(DumpError::Regex(_))
        ));
    }

    #[test]
    fn test_table_rules() {
        let mut config = DumpConfig::default();
        config
            .filters
            .insert("users".into(), HashSet::from(["password".to_string()]));
        config.selects.insert(
            "users".into(),
            HashMap::from([("email".to_string(), "'hidden'".to_string())]),
        );
        config.wheres.insert("users".into(), "id > 10".into());

        let rules = config.rules_for("users");
        assert!(rules.is_filtered("password"));
        assert!(!rules.is_filtered("email"));
        assert_eq!(rules.replacement("email"), Some("'hidden'"));
        assert_eq!(rules.predicate(), Some("id > 10"));

        let none = config.rules_for("orders");
        assert!(!none.is_filtered("password"));
        assert_eq!(none.replacement("email"), None);
        assert_eq!(none.predicate(), None);
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("sql".parse::<OutputFormat>().unwrap(), OutputFormat::Sql);
        assert_eq!("mysql".parse::<OutputFormat>().unwrap(), OutputFormat::Sql);
        assert_eq!("CSV".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert_eq!("tsv".parse::<OutputFormat>().unwrap(), OutputFormat::Tsv);
        assert!(matches!(
            "xml".parse::<OutputFormat>(),
            Err(DumpError::UnknownFormat(_))
        ));
        assert_eq!(OutputFormat::Tsv.extension(), "csv");
        assert_eq!(OutputFormat::Tsv.separator(), Some(b'\t'));
    }

    #[test]
    fn test_chunk_bytes() {
        let config = DumpConfig {
            chunksize_mb: 2,
            ..Default::default()
        };
        assert_eq!(config.chunk_bytes(), 2 * 1024 * 1024);
    }
}
