//! Database and table enumeration.
//!
//! Metadata queries are small and read-only, so they go through
//! [`fetch_with_retry`], which reconnects and retries on transient errors.

use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::{DatabaseSelection, DumpConfig, TableSelection};
use crate::core::identifier::quote_mysql;
use crate::core::{Session, SqlValue};
use crate::error::{DumpError, Result};

/// Bounded retry with linear backoff for read-only work.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    /// Delay before retry `n` is `n * delay`.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DumpConfig) -> Self {
        Self {
            retries: config.query_retries,
            delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// No retries.
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }

    /// Sleep before retry number `attempt` (1-based).
    pub async fn backoff(&self, attempt: u32) {
        let delay = self.delay.saturating_mul(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Run a metadata query, reconnecting and retrying on transient errors.
pub async fn fetch_with_retry<S: Session + ?Sized>(
    session: &mut S,
    sql: &str,
    retry: RetryPolicy,
) -> Result<Vec<Vec<SqlValue>>> {
    let mut attempt = 0;
    loop {
        match session.fetch(sql).await {
            Ok(rows) => return Ok(rows),
            Err(e) if e.is_transient() && attempt < retry.retries => {
                attempt += 1;
                warn!(
                    "Transient error on session {} running {:?}, retry {}/{}: {}",
                    session.id(),
                    sql,
                    attempt,
                    retry.retries,
                    e
                );
                retry.backoff(attempt).await;
                if let Err(re) = session.reconnect().await {
                    debug!("Reconnect failed: {}", re);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Every database on the server, in server order.
pub async fn list_databases<S: Session + ?Sized>(
    session: &mut S,
    retry: RetryPolicy,
) -> Result<Vec<String>> {
    let rows = fetch_with_retry(session, "SHOW DATABASES", retry).await?;
    first_column("SHOW DATABASES", rows)
}

/// Databases whose names match `pattern`, or with `invert` those that don't.
pub async fn list_databases_matching<S: Session + ?Sized>(
    session: &mut S,
    pattern: &Regex,
    invert: bool,
    retry: RetryPolicy,
) -> Result<Vec<String>> {
    let all = list_databases(session, retry).await?;
    Ok(all
        .into_iter()
        .filter(|db| pattern.is_match(db) != invert)
        .collect())
}

/// Every table in a database, in server order.
pub async fn list_tables<S: Session + ?Sized>(
    session: &mut S,
    database: &str,
    retry: RetryPolicy,
) -> Result<Vec<String>> {
    let sql = format!("SHOW TABLES FROM {}", quote_mysql(database)?);
    let rows = fetch_with_retry(session, &sql, retry).await?;
    first_column(&sql, rows)
}

/// Resolve the database list for a run.
pub async fn resolve_databases<S: Session + ?Sized>(
    session: &mut S,
    selection: &DatabaseSelection,
    retry: RetryPolicy,
) -> Result<Vec<String>> {
    let databases = match selection {
        DatabaseSelection::Matching { pattern, invert } => {
            list_databases_matching(session, pattern, *invert, retry).await?
        }
        DatabaseSelection::List(list) => list.clone(),
        DatabaseSelection::All => list_databases(session, retry).await?,
    };
    debug!("Resolved databases: {:?}", databases);
    Ok(databases)
}

/// Resolve the table list of one database.
pub async fn resolve_tables<S: Session + ?Sized>(
    session: &mut S,
    database: &str,
    selection: &TableSelection,
    retry: RetryPolicy,
) -> Result<Vec<String>> {
    let tables = match selection {
        TableSelection::List(list) => list.clone(),
        TableSelection::All => list_tables(session, database, retry).await?,
    };
    debug!("Resolved tables in {}: {:?}", database, tables);
    Ok(tables)
}

fn first_column(sql: &str, rows: Vec<Vec<SqlValue>>) -> Result<Vec<String>> {
    rows.into_iter()
        .map(|row| {
            row.first()
                .and_then(SqlValue::as_bytes)
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .ok_or_else(|| DumpError::query(sql, "unexpected NULL or empty row"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Connector, Field, FieldKind};
    use crate::drivers::memory::{MemoryConnector, MemoryServer, MemoryTable};

    fn server() -> MemoryServer {
        let server = MemoryServer::new();
        for db in ["shop_eu", "shop_us", "crm"] {
            server.add_database(db);
        }
        for table in ["orders", "customers"] {
            server.add_table(
                "shop_eu",
                table,
                MemoryTable::new(vec![Field::new("id", FieldKind::Signed)]),
            );
        }
        server
    }

    #[tokio::test]
    async fn test_regex_selection() {
        let connector = MemoryConnector::new(server());
        let mut session = connector.connect(None).await.unwrap();
        let pattern = Regex::new("^shop_").unwrap();

        let matching = resolve_databases(
            &mut session,
            &DatabaseSelection::Matching {
                pattern: pattern.clone(),
                invert: false,
            },
            RetryPolicy::none(),
        )
        .await
        .unwrap();
        assert_eq!(matching, vec!["shop_eu", "shop_us"]);

        let inverted = resolve_databases(
            &mut session,
            &DatabaseSelection::Matching {
                pattern,
                invert: true,
            },
            RetryPolicy::none(),
        )
        .await
        .unwrap();
        assert_eq!(inverted, vec!["crm"]);
    }

    #[tokio::test]
    async fn test_list_selection_skips_server() {
        let server = server();
        let connector = MemoryConnector::new(server.clone());
        let mut session = connector.connect(None).await.unwrap();
        let dbs = resolve_databases(
            &mut session,
            &DatabaseSelection::List(vec!["zeta".into(), "crm".into()]),
            RetryPolicy::none(),
        )
        .await
        .unwrap();
        assert_eq!(dbs, vec!["zeta", "crm"]);
        assert!(server.queries().is_empty());
    }

    #[tokio::test]
    async fn test_all_tables() {
        let connector = MemoryConnector::new(server());
        let mut session = connector.connect(None).await.unwrap();
        let tables = resolve_tables(
            &mut session,
            "shop_eu",
            &TableSelection::All,
            RetryPolicy::none(),
        )
        .await
        .unwrap();
        assert_eq!(tables, vec!["customers", "orders"]);

        let listed = resolve_tables(
            &mut session,
            "shop_eu",
            &TableSelection::List(vec!["orders".into()]),
            RetryPolicy::none(),
        )
        .await
        .unwrap();
        assert_eq!(listed, vec!["orders"]);
    }

    #[tokio::test]
    async fn test_unknown_database_is_query_error() {
        let connector = MemoryConnector::new(server());
        let mut session = connector.connect(None).await.unwrap();
        let err = list_tables(&mut session, "nope", RetryPolicy::none())
            .await
            .unwrap_err();
        assert!(matches!(err, DumpError::Query { .. }));
    }
}
