//! In-memory server for tests and dry runs.
//!
//! [`MemoryServer`] holds databases and tables as plain fixtures and answers
//! the small set of statements the dumper issues:
//!
//! - `SHOW DATABASES`
//! - ``SHOW TABLES FROM `db` ``
//! - ``SHOW CREATE TABLE `db`.`t` ``
//! - ``SELECT <list> FROM `db`.`t` [WHERE ...] [LIMIT 1]``
//! - `SELECT 1`
//!
//! WHERE predicates are recorded in the query log but not evaluated.
//! Failures, slow rows, and connection limits can be injected per table.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{Connector, Field, FieldKind, RowCursor, Session, SqlValue};
use crate::error::{DumpError, Result};

/// One fixture table.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    create_sql: Option<String>,
    fields: Vec<Field>,
    rows: Vec<Vec<SqlValue>>,
}

impl MemoryTable {
    /// Table with the given columns and no rows.
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            create_sql: None,
            fields,
            rows: Vec::new(),
        }
    }

    /// Override the `SHOW CREATE TABLE` text.
    pub fn with_create_sql(mut self, sql: impl Into<String>) -> Self {
        self.create_sql = Some(sql.into());
        self
    }

    /// Append a row. Its width must match the column count.
    pub fn with_row(mut self, row: Vec<SqlValue>) -> Self {
        self.rows.push(row);
        self
    }

    /// Append many rows.
    pub fn with_rows(mut self, rows: impl IntoIterator<Item = Vec<SqlValue>>) -> Self {
        self.rows.extend(rows);
        self
    }

    fn create_sql(&self, name: &str) -> String {
        if let Some(sql) = &self.create_sql {
            return sql.clone();
        }
        let columns: Vec<String> = self
            .fields
            .iter()
            .map(|f| {
                let ty = match f.kind {
                    FieldKind::Signed => "bigint",
                    FieldKind::Unsigned => "bigint unsigned",
                    FieldKind::Float => "double",
                    FieldKind::Decimal => "decimal(20,6)",
                    FieldKind::Other => "text",
                };
                format!("  `{}` {}", f.name.replace('`', "``"), ty)
            })
            .collect();
        format!(
            "CREATE TABLE `{}` (\n{}\n) ENGINE=InnoDB",
            name.replace('`', "``"),
            columns.join(",\n")
        )
    }
}

#[derive(Debug, Default)]
struct ServerState {
    databases: BTreeMap<String, BTreeMap<String, MemoryTable>>,
    failing: HashSet<(String, String)>,
    transient: HashMap<(String, String), u32>,
    fail_after_rows: HashMap<(String, String), usize>,
    max_sessions: Option<usize>,
    open_sessions: usize,
    row_delay: Option<Duration>,
    active_streams: usize,
    peak_streams: usize,
    queries: Vec<String>,
}

/// Shared in-memory server. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
    next_id: Arc<AtomicU32>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty database.
    pub fn add_database(&self, database: &str) -> &Self {
        self.state()
            .databases
            .entry(database.to_string())
            .or_default();
        self
    }

    /// Add (or replace) a table, creating its database if needed.
    pub fn add_table(&self, database: &str, table: &str, fixture: MemoryTable) -> &Self {
        self.state()
            .databases
            .entry(database.to_string())
            .or_default()
            .insert(table.to_string(), fixture);
        self
    }

    /// Every SELECT on the table fails with a server error.
    pub fn fail_table(&self, database: &str, table: &str) -> &Self {
        self.state()
            .failing
            .insert((database.to_string(), table.to_string()));
        self
    }

    /// The next `attempts` streaming SELECTs on the table fail with a
    /// connection error before returning any row.
    pub fn fail_transiently(&self, database: &str, table: &str, attempts: u32) -> &Self {
        self.state()
            .transient
            .insert((database.to_string(), table.to_string()), attempts);
        self
    }

    /// Streaming SELECTs on the table lose the connection after `rows` rows.
    pub fn fail_after_rows(&self, database: &str, table: &str, rows: usize) -> &Self {
        self.state()
            .fail_after_rows
            .insert((database.to_string(), table.to_string()), rows);
        self
    }

    /// Refuse connections beyond `max` open sessions.
    pub fn set_session_limit(&self, max: usize) -> &Self {
        self.state().max_sessions = Some(max);
        self
    }

    /// Sleep before yielding each streamed row.
    pub fn set_row_delay(&self, delay: Duration) -> &Self {
        self.state().row_delay = Some(delay);
        self
    }

    /// Every statement received, in arrival order.
    pub fn queries(&self) -> Vec<String> {
        self.state().queries.clone()
    }

    /// Highest number of simultaneously open streaming cursors.
    pub fn peak_streams(&self) -> usize {
        self.state().peak_streams
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    fn execute(&self, sql: &str) -> Result<Answer> {
        let mut state = self.state();
        state.queries.push(sql.to_string());
        let trimmed = sql.trim();

        if trimmed.eq_ignore_ascii_case("SELECT 1") {
            return Ok(Answer::rows(
                vec![Field::new("1", FieldKind::Signed)],
                vec![vec![SqlValue::text("1")]],
            ));
        }

        if trimmed.eq_ignore_ascii_case("SHOW DATABASES") {
            let rows = state
                .databases
                .keys()
                .map(|db| vec![SqlValue::text(db)])
                .collect();
            return Ok(Answer::rows(
                vec![Field::new("Database", FieldKind::Other)],
                rows,
            ));
        }

        if let Some(rest) = trimmed.strip_prefix("SHOW TABLES FROM ") {
            let (database, _) = parse_ident(rest).ok_or_else(|| malformed(sql))?;
            let tables = state
                .databases
                .get(&database)
                .ok_or_else(|| DumpError::query(sql, format!("Unknown database '{}'", database)))?;
            let rows = tables.keys().map(|t| vec![SqlValue::text(t)]).collect();
            return Ok(Answer::rows(
                vec![Field::new(
                    format!("Tables_in_{}", database),
                    FieldKind::Other,
                )],
                rows,
            ));
        }

        if let Some(rest) = trimmed.strip_prefix("SHOW CREATE TABLE ") {
            let (database, table, _) = parse_qualified(rest).ok_or_else(|| malformed(sql))?;
            let fixture = lookup(&state, sql, &database, &table)?;
            let row = vec![
                SqlValue::text(&table),
                SqlValue::text(fixture.create_sql(&table)),
            ];
            return Ok(Answer::rows(
                vec![
                    Field::new("Table", FieldKind::Other),
                    Field::new("Create Table", FieldKind::Other),
                ],
                vec![row],
            ));
        }

        if let Some(rest) = trimmed.strip_prefix("SELECT ") {
            return self.select(&mut state, sql, rest);
        }

        Err(DumpError::query(sql, "statement not supported"))
    }

    fn select(&self, state: &mut ServerState, sql: &str, rest: &str) -> Result<Answer> {
        let from = rest.find(" FROM `").ok_or_else(|| malformed(sql))?;
        let list = &rest[..from];
        let (database, table, tail) =
            parse_qualified(&rest[from + " FROM ".len()..]).ok_or_else(|| malformed(sql))?;
        let tail = tail.trim();
        let limit_one = tail.ends_with("LIMIT 1");

        let key = (database.clone(), table.clone());
        if state.failing.contains(&key) {
            return Err(DumpError::query(sql, "injected failure"));
        }
        if !limit_one {
            if let Some(remaining) = state.transient.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DumpError::connection(
                        "connection reset by peer",
                        format!("streaming {}.{}", database, table),
                    ));
                }
            }
        }
        let fail_after = if limit_one {
            None
        } else {
            state.fail_after_rows.get(&key).copied()
        };

        let fixture = lookup(state, sql, &database, &table)?;
        let mut columns: Vec<Projection> = Vec::new();
        for item in split_select_list(list) {
            columns.extend(project(item, fixture, sql)?);
        }

        let fields = columns.iter().map(|p| p.field(fixture)).collect();
        let take = if limit_one { 1 } else { fixture.rows.len() };
        let rows = fixture
            .rows
            .iter()
            .take(take)
            .map(|row| columns.iter().map(|p| p.value(row)).collect())
            .collect();

        Ok(Answer {
            fields,
            rows,
            fail_after,
        })
    }

    fn open_stream(&self) -> Option<Duration> {
        let mut state = self.state();
        state.active_streams += 1;
        state.peak_streams = state.peak_streams.max(state.active_streams);
        state.row_delay
    }

    fn close_stream(&self) {
        let mut state = self.state();
        state.active_streams = state.active_streams.saturating_sub(1);
    }
}

struct Answer {
    fields: Vec<Field>,
    rows: Vec<Vec<SqlValue>>,
    fail_after: Option<usize>,
}

impl Answer {
    fn rows(fields: Vec<Field>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            fields,
            rows,
            fail_after: None,
        }
    }
}

enum Projection {
    Column(usize),
    Constant { alias: String, text: String },
}

impl Projection {
    fn field(&self, table: &MemoryTable) -> Field {
        match self {
            Projection::Column(i) => table.fields[*i].clone(),
            Projection::Constant { alias, .. } => Field::new(alias.clone(), FieldKind::Other),
        }
    }

    fn value(&self, row: &[SqlValue]) -> SqlValue {
        match self {
            Projection::Column(i) => row.get(*i).cloned().unwrap_or(SqlValue::Null),
            Projection::Constant { text, .. } => SqlValue::text(text),
        }
    }
}

fn project(item: &str, table: &MemoryTable, sql: &str) -> Result<Vec<Projection>> {
    if item == "*" {
        return Ok((0..table.fields.len()).map(Projection::Column).collect());
    }
    if let Some((name, rest)) = parse_ident(item) {
        if rest.trim().is_empty() {
            let index = table
                .fields
                .iter()
                .position(|f| f.name == name)
                .ok_or_else(|| DumpError::query(sql, format!("Unknown column '{}'", name)))?;
            return Ok(vec![Projection::Column(index)]);
        }
    }
    let at = item.rfind(" AS `").ok_or_else(|| malformed(sql))?;
    let (alias, _) = parse_ident(&item[at + " AS ".len()..]).ok_or_else(|| malformed(sql))?;
    let expr = item[..at].trim();
    let text = expr
        .strip_prefix('\'')
        .and_then(|e| e.strip_suffix('\''))
        .unwrap_or(expr)
        .to_string();
    Ok(vec![Projection::Constant { alias, text }])
}

fn lookup<'s>(
    state: &'s ServerState,
    sql: &str,
    database: &str,
    table: &str,
) -> Result<&'s MemoryTable> {
    state
        .databases
        .get(database)
        .and_then(|tables| tables.get(table))
        .ok_or_else(|| {
            DumpError::query(sql, format!("Table '{}.{}' doesn't exist", database, table))
        })
}

fn malformed(sql: &str) -> DumpError {
    DumpError::query(sql, "malformed statement")
}

/// Parse a backtick-quoted identifier at the start of `s`.
fn parse_ident(s: &str) -> Option<(String, &str)> {
    let s = s.trim_start();
    let body = s.strip_prefix('`')?;
    let mut name = String::new();
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '`' {
            if matches!(chars.peek(), Some((_, '`'))) {
                chars.next();
                name.push('`');
            } else {
                return Some((name, &body[i + 1..]));
            }
        } else {
            name.push(c);
        }
    }
    None
}

fn parse_qualified(s: &str) -> Option<(String, String, &str)> {
    let (database, rest) = parse_ident(s)?;
    let rest = rest.strip_prefix('.')?;
    let (table, rest) = parse_ident(rest)?;
    Some((database, table, rest))
}

/// Split a select list on top-level commas.
fn split_select_list(list: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, ',') if depth == 0 => {
                items.push(list[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(list[start..].trim());
    items.retain(|s| !s.is_empty());
    items
}

/// Connector over a [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

impl MemoryConnector {
    pub fn new(server: MemoryServer) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &MemoryServer {
        &self.server
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self, database: Option<&str>) -> Result<MemorySession> {
        {
            let mut state = self.server.state();
            if let Some(db) = database {
                if !state.databases.contains_key(db) {
                    return Err(DumpError::connection(
                        format!("Unknown database '{}'", db),
                        format!("connecting to {}", self.endpoint()),
                    ));
                }
            }
            if let Some(max) = state.max_sessions {
                if state.open_sessions >= max {
                    return Err(DumpError::connection(
                        "Too many connections",
                        format!("connecting to {}", self.endpoint()),
                    ));
                }
            }
            state.open_sessions += 1;
        }
        Ok(MemorySession {
            server: self.server.clone(),
            id: self.server.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            open: true,
        })
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}

/// Session on a [`MemoryServer`].
#[derive(Debug)]
pub struct MemorySession {
    server: MemoryServer,
    id: u32,
    open: bool,
}

impl MemorySession {
    fn check_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(DumpError::connection(
                "session is closed",
                format!("using session {}", self.id),
            ))
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> u32 {
        self.id
    }

    async fn fetch(&mut self, sql: &str) -> Result<Vec<Vec<SqlValue>>> {
        self.check_open()?;
        Ok(self.server.execute(sql)?.rows)
    }

    async fn stream<'a>(&'a mut self, sql: &'a str) -> Result<Box<dyn RowCursor + 'a>> {
        self.check_open()?;
        let answer = self.server.execute(sql)?;
        let delay = self.server.open_stream();
        Ok(Box::new(MemoryCursor {
            server: self.server.clone(),
            fields: answer.fields,
            rows: answer.rows.into_iter(),
            served: 0,
            fail_after: answer.fail_after,
            delay,
            _session: std::marker::PhantomData,
        }))
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.id = self.server.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            let mut state = self.server.state();
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.open {
            let mut state = self.server.state();
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
    }
}

struct MemoryCursor<'a> {
    server: MemoryServer,
    fields: Vec<Field>,
    rows: std::vec::IntoIter<Vec<SqlValue>>,
    served: usize,
    fail_after: Option<usize>,
    delay: Option<Duration>,
    _session: std::marker::PhantomData<&'a mut MemorySession>,
}

#[async_trait]
impl<'a> RowCursor for MemoryCursor<'a> {
    fn fields(&self) -> &[Field] {
        &self.fields
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_after == Some(self.served) {
            return Err(DumpError::connection(
                "connection lost while streaming",
                format!("after {} rows", self.served),
            ));
        }
        let row = self.rows.next();
        if row.is_some() {
            self.served += 1;
        }
        Ok(row)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl Drop for MemoryCursor<'_> {
    fn drop(&mut self) {
        self.server.close_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> MemoryServer {
        let server = MemoryServer::new();
        server.add_table(
            "shop",
            "users",
            MemoryTable::new(vec![
                Field::new("id", FieldKind::Signed),
                Field::new("email", FieldKind::Other),
            ])
            .with_row(vec![SqlValue::from(1i64), SqlValue::from("a@x")])
            .with_row(vec![SqlValue::from(2i64), SqlValue::Null]),
        );
        server.add_database("empty");
        server
    }

    #[test]
    fn test_parse_ident() {
        assert_eq!(
            parse_ident("`a``b` rest"),
            Some(("a`b".to_string(), " rest"))
        );
        assert_eq!(parse_ident("plain"), None);
        assert_eq!(parse_ident("`open"), None);
    }

    #[test]
    fn test_split_select_list() {
        assert_eq!(
            split_select_list("`a`, CONCAT(`b`, ',') AS `c`, 'x,y' AS `d`"),
            vec!["`a`", "CONCAT(`b`, ',') AS `c`", "'x,y' AS `d`"]
        );
    }

    #[tokio::test]
    async fn test_metadata_queries() {
        let connector = MemoryConnector::new(server());
        let mut session = connector.connect(None).await.unwrap();

        let dbs = session.fetch("SHOW DATABASES").await.unwrap();
        assert_eq!(dbs, vec![vec![SqlValue::text("empty")], vec![SqlValue::text("shop")]]);

        let tables = session.fetch("SHOW TABLES FROM `shop`").await.unwrap();
        assert_eq!(tables, vec![vec![SqlValue::text("users")]]);

        let create = session
            .fetch("SHOW CREATE TABLE `shop`.`users`")
            .await
            .unwrap();
        let ddl = String::from_utf8(create[0][1].as_bytes().unwrap().to_vec()).unwrap();
        assert!(ddl.starts_with("CREATE TABLE `users`"));

        session.close().await.unwrap();
        assert_eq!(connector.server().open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_select_projection() {
        let connector = MemoryConnector::new(server());
        let mut session = connector.connect(Some("shop")).await.unwrap();
        let sql = "SELECT `id`, 'hidden' AS `email` FROM `shop`.`users` WHERE id > 0";
        let mut cursor = session.stream(sql).await.unwrap();
        assert_eq!(cursor.fields()[1], Field::new("email", FieldKind::Other));
        let first = cursor.next_row().await.unwrap().unwrap();
        assert_eq!(first, vec![SqlValue::text("1"), SqlValue::text("hidden")]);
        assert!(cursor.next_row().await.unwrap().is_some());
        assert!(cursor.next_row().await.unwrap().is_none());
        cursor.close().await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_table_and_column() {
        let connector = MemoryConnector::new(server());
        let mut session = connector.connect(None).await.unwrap();
        assert!(session.fetch("SELECT * FROM `shop`.`nope` LIMIT 1").await.is_err());
        assert!(session
            .fetch("SELECT `missing` FROM `shop`.`users`")
            .await
            .is_err());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_limit() {
        let server = server();
        server.set_session_limit(1);
        let connector = MemoryConnector::new(server);
        let mut first = connector.connect(None).await.unwrap();
        let err = connector.connect(None).await.unwrap_err();
        assert!(err.is_transient());
        first.close().await.unwrap();
        assert!(connector.connect(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let server = server();
        server.fail_transiently("shop", "users", 1);
        let connector = MemoryConnector::new(server);
        let mut session = connector.connect(None).await.unwrap();
        let sql = "SELECT `id` FROM `shop`.`users`";
        assert!(session.stream(sql).await.err().unwrap().is_transient());
        let cursor = session.stream(sql).await.unwrap();
        cursor.close().await.unwrap();
    }
}
