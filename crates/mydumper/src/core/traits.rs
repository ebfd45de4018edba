//! Session abstractions used by the dump engine.
//!
//! - [`Connector`]: opens sessions against one server
//! - [`Session`]: one server connection that runs metadata queries and
//!   opens streaming cursors
//! - [`RowCursor`]: forward-only row stream over one query result
//!
//! The MySQL driver implements these over `mysql_async`; the in-memory
//! driver implements them over fixtures for tests and dry runs.

use async_trait::async_trait;

use crate::error::Result;

use super::value::{Field, SqlValue};

/// Opens sessions against a server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Session type produced by this connector.
    type Session: Session + 'static;

    /// Open a session, optionally with a default database.
    ///
    /// Implementations apply the configured session variables before
    /// returning.
    async fn connect(&self, database: Option<&str>) -> Result<Self::Session>;

    /// Human-readable server address for logs.
    fn endpoint(&self) -> String;
}

/// One live server session.
#[async_trait]
pub trait Session: Send {
    /// Server-side connection id.
    fn id(&self) -> u32;

    /// Run a query and collect every row. Intended for small metadata results.
    async fn fetch(&mut self, sql: &str) -> Result<Vec<Vec<SqlValue>>>;

    /// Run a query and stream its rows.
    ///
    /// The session is borrowed for the cursor's lifetime; callers must
    /// close the cursor before issuing another query.
    async fn stream<'a>(&'a mut self, sql: &'a str) -> Result<Box<dyn RowCursor + 'a>>;

    /// Replace the underlying connection after a transient failure.
    async fn reconnect(&mut self) -> Result<()>;

    /// Close the session. Further use is an error.
    async fn close(&mut self) -> Result<()>;
}

/// Forward-only row stream.
#[async_trait]
pub trait RowCursor: Send {
    /// Result columns, in order.
    fn fields(&self) -> &[Field];

    /// Next row, or `None` when the result is exhausted.
    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>>;

    /// Drain and release the result so the session can be reused.
    async fn close(self: Box<Self>) -> Result<()>;
}
