//! MySQL/MariaDB driver.
//!
//! - [`MysqlConnector`]: opens sessions from a [`SourceConfig`]
//! - [`MysqlSession`]: one `mysql_async` connection
//!
//! Rows are read over the text protocol, so every value arrives as the
//! server's own text rendering and is written out byte-for-byte.
//!
//! # Supported Versions
//!
//! - MySQL 5.7+, 8.0+
//! - MariaDB 10.2+

mod session;

pub use session::{MysqlCursor, MysqlSession};

use async_trait::async_trait;
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::{Column, OptsBuilder};
use tracing::debug;

use crate::config::SourceConfig;
use crate::core::{Connector, Field, FieldKind, Session};
use crate::error::Result;

/// Opens `mysql_async` sessions against the configured server.
#[derive(Debug, Clone)]
pub struct MysqlConnector {
    config: SourceConfig,
}

impl MysqlConnector {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn opts(&self, database: Option<&str>) -> OptsBuilder {
        OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone())
            .tcp_port(self.config.port)
            .user(Some(self.config.user.clone()))
            .pass(Some(self.config.password.clone()))
            .db_name(database.map(str::to_string))
            .init(self.config.session_vars.clone())
    }
}

#[async_trait]
impl Connector for MysqlConnector {
    type Session = MysqlSession;

    async fn connect(&self, database: Option<&str>) -> Result<MysqlSession> {
        let opts = self.opts(database);
        let session = MysqlSession::open(opts, self.endpoint()).await?;
        debug!(
            "Opened session {} to {} (database: {})",
            session.id(),
            self.endpoint(),
            database.unwrap_or("-")
        );
        Ok(session)
    }

    fn endpoint(&self) -> String {
        self.config.address()
    }
}

/// Map a result column to its name and type class.
pub(crate) fn field_from_column(column: &Column) -> Field {
    Field::new(column.name_str().into_owned(), kind_of(column))
}

fn kind_of(column: &Column) -> FieldKind {
    let unsigned = column.flags().contains(ColumnFlags::UNSIGNED_FLAG);
    match column.column_type() {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => {
            if unsigned {
                FieldKind::Unsigned
            } else {
                FieldKind::Signed
            }
        }
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => FieldKind::Float,
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => FieldKind::Decimal,
        _ => FieldKind::Other,
    }
}
