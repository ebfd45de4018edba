//! # mydumper
//!
//! Parallel MySQL dump library.
//!
//! Connects to a MySQL server, enumerates databases and tables, and streams
//! their schema and rows into size-bounded flat files, with:
//!
//! - **Fixed-size session pools** (one global, one per database)
//! - **Database/table selection** by list, regular expression, or everything
//! - **Streaming dumps** that never buffer a whole table in memory
//! - **SQL or CSV/TSV output** split by statement size and chunk size
//! - **Live throughput reporting** from lock-free counters
//!
//! ## Example
//!
//! ```rust,no_run
//! use mydumper::{Config, Dumper, MysqlConnector};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mydumper::Result<()> {
//!     let config = Config::load("dump.yaml")?;
//!     let connector = MysqlConnector::new(config.source.clone());
//!     let dumper = Dumper::new(config, connector)?;
//!     let result = dumper.run(CancellationToken::new()).await?;
//!     println!("Dumped {} rows", result.rows);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod core;
pub mod drivers;
pub mod dump;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod schema;

// Re-exports for convenient access
pub use config::{Config, DumpConfig, FailurePolicy, OutputFormat, SourceConfig};
pub use core::{Connector, Field, FieldKind, RowCursor, Session, SqlValue, TableRef};
pub use drivers::memory::{MemoryConnector, MemoryServer, MemoryTable};
pub use drivers::mysql::MysqlConnector;
pub use error::{DumpError, Result};
pub use orchestrator::{DatabasePlan, DumpPlan, DumpResult, Dumper};
pub use pool::{ConnectionPool, PooledSession};
pub use progress::{DumpProgress, ProgressMode, ProgressReporter, ProgressSnapshot};
