//! Session drivers.
//!
//! - [`mysql`]: MySQL/MariaDB over `mysql_async`
//! - [`memory`]: in-memory fixtures for tests and dry runs
//!
//! Each driver implements [`Connector`](crate::core::Connector) and its
//! session and cursor types; the dump engine is generic over the connector.

pub mod memory;
pub mod mysql;

pub use memory::{MemoryConnector, MemoryServer, MemorySession, MemoryTable};
pub use mysql::{MysqlConnector, MysqlSession};
