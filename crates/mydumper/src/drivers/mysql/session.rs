//! `mysql_async` session and streaming cursor.

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, QueryResult, Row, TextProtocol, Value};
use tracing::{debug, warn};

use super::field_from_column;
use crate::core::{Field, RowCursor, Session, SqlValue};
use crate::error::{DumpError, Result};

/// One MySQL connection.
///
/// The connection sits in an `Option` so that `close` and `reconnect` can
/// take ownership of it; using a closed session is an error.
pub struct MysqlSession {
    conn: Option<Conn>,
    opts: OptsBuilder,
    endpoint: String,
    id: u32,
}

impl MysqlSession {
    pub(super) async fn open(opts: OptsBuilder, endpoint: String) -> Result<Self> {
        let conn = Conn::new(opts.clone())
            .await
            .map_err(|e| DumpError::connection(e, format!("connecting to {}", endpoint)))?;
        Ok(Self {
            id: conn.id(),
            conn: Some(conn),
            opts,
            endpoint,
        })
    }

    fn conn_mut(&mut self) -> Result<&mut Conn> {
        self.conn.as_mut().ok_or_else(|| {
            DumpError::connection(
                "session is closed",
                format!("using session to {}", self.endpoint),
            )
        })
    }
}

#[async_trait]
impl Session for MysqlSession {
    fn id(&self) -> u32 {
        self.id
    }

    async fn fetch(&mut self, sql: &str) -> Result<Vec<Vec<SqlValue>>> {
        let conn = self.conn_mut()?;
        let rows: Vec<Row> = conn.query(sql).await.map_err(|e| query_error(sql, e))?;
        Ok(rows.into_iter().map(row_values).collect())
    }

    async fn stream<'a>(&'a mut self, sql: &'a str) -> Result<Box<dyn RowCursor + 'a>> {
        let conn = self.conn_mut()?;
        let result = conn.query_iter(sql).await.map_err(|e| query_error(sql, e))?;
        let fields = result
            .columns()
            .map(|columns| columns.iter().map(field_from_column).collect())
            .unwrap_or_default();
        Ok(Box::new(MysqlCursor { result, fields, sql }))
    }

    async fn reconnect(&mut self) -> Result<()> {
        if let Some(old) = self.conn.take() {
            if let Err(e) = old.disconnect().await {
                debug!("Discarding broken session {}: {}", self.id, e);
            }
        }
        let conn = Conn::new(self.opts.clone())
            .await
            .map_err(|e| DumpError::connection(e, format!("reconnecting to {}", self.endpoint)))?;
        debug!("Session {} replaced by {}", self.id, conn.id());
        self.id = conn.id();
        self.conn = Some(conn);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.disconnect()
                .await
                .map_err(|e| DumpError::connection(e, format!("closing session {}", self.id)))?;
        }
        Ok(())
    }
}

impl Drop for MysqlSession {
    fn drop(&mut self) {
        if self.conn.is_some() {
            warn!("Session {} dropped without close", self.id);
        }
    }
}

/// Streaming text-protocol result.
pub struct MysqlCursor<'a> {
    result: QueryResult<'a, 'static, TextProtocol>,
    fields: Vec<Field>,
    sql: &'a str,
}

#[async_trait]
impl<'a> RowCursor for MysqlCursor<'a> {
    fn fields(&self) -> &[Field] {
        &self.fields
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        let row = self
            .result
            .next()
            .await
            .map_err(|e| query_error(self.sql, e))?;
        Ok(row.map(row_values))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.result
            .drop_result()
            .await
            .map_err(|e| query_error(this.sql, e))
    }
}

/// Server-side rejections carry the statement; connectivity errors stay
/// driver errors so they can be classified as transient.
fn query_error(sql: &str, e: mysql_async::Error) -> DumpError {
    match e {
        mysql_async::Error::Server(_) => DumpError::query(sql, e),
        other => DumpError::Mysql(other),
    }
}

fn row_values(row: Row) -> Vec<SqlValue> {
    row.unwrap().into_iter().map(to_sql_value).collect()
}

/// The text protocol yields `Bytes` or `NULL`; the other arms cover values
/// the driver decoded anyway and render them the way the server would.
fn to_sql_value(value: Value) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Bytes(b) => SqlValue::Raw(b),
        Value::Int(n) => SqlValue::text(n.to_string()),
        Value::UInt(n) => SqlValue::text(n.to_string()),
        Value::Float(f) => SqlValue::text(f.to_string()),
        Value::Double(d) => SqlValue::text(d.to_string()),
        Value::Date(year, month, day, hour, min, sec, micro) => {
            let mut s = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, min, sec
            );
            if micro > 0 {
                s.push_str(&format!(".{:06}", micro));
            }
            SqlValue::text(s)
        }
        Value::Time(neg, days, hours, mins, secs, micro) => {
            let total_hours = days * 24 + u32::from(hours);
            let mut s = format!(
                "{}{:02}:{:02}:{:02}",
                if neg { "-" } else { "" },
                total_hours,
                mins,
                secs
            );
            if micro > 0 {
                s.push_str(&format!(".{:06}", micro));
            }
            SqlValue::text(s)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_protocol_values() {
        assert_eq!(to_sql_value(Value::NULL), SqlValue::Null);
        assert_eq!(
            to_sql_value(Value::Bytes(b"O'Brien".to_vec())),
            SqlValue::text("O'Brien")
        );
        assert_eq!(to_sql_value(Value::Int(-7)), SqlValue::text("-7"));
        assert_eq!(to_sql_value(Value::UInt(7)), SqlValue::text("7"));
    }

    #[test]
    fn test_temporal_values() {
        assert_eq!(
            to_sql_value(Value::Date(2024, 2, 29, 13, 5, 9, 0)),
            SqlValue::text("2024-02-29 13:05:09")
        );
        assert_eq!(
            to_sql_value(Value::Time(true, 1, 2, 3, 4, 500)),
            SqlValue::text("-26:03:04.000500")
        );
    }

    #[test]
    fn test_server_errors_keep_statement() {
        let err = query_error(
            "SELECT nope",
            mysql_async::Error::Server(mysql_async::ServerError {
                code: 1054,
                message: "Unknown column 'nope'".into(),
                state: "42S22".into(),
            }),
        );
        assert!(matches!(err, DumpError::Query { .. }));
        assert!(!err.is_transient());
    }
}
