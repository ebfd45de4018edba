//! Per-table streaming dump.
//!
//! [`TableDumper::dump`] probes a table for its columns, builds the select
//! list from the column rules, streams the rows through a cursor, and hands
//! each row to the format's chunk writer:
//!
//! - [`sql`]: multi-row INSERT statements
//! - [`delimited`]: CSV/TSV with a header row per file
//! - [`escape`]: backslash escaping shared by both

pub mod delimited;
pub mod escape;
pub mod sql;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::RetryPolicy;
use crate::config::{DumpConfig, TableRules};
use crate::core::identifier::{file_component, qualify_mysql, quote_mysql};
use crate::core::{Field, FieldKind, RowCursor, Session, SqlValue, TableRef};
use crate::error::{DumpError, Result};
use crate::progress::DumpProgress;

use delimited::DelimitedChunkWriter;
use sql::SqlChunkWriter;

/// Write buffer of each open chunk file.
const CHUNK_BUFFER_BYTES: usize = 256 * 1024;

/// Sequentially numbered output files of one table.
pub struct ChunkFiles {
    outdir: PathBuf,
    stem: String,
    extension: &'static str,
    paths: Vec<PathBuf>,
}

impl ChunkFiles {
    pub fn new(outdir: &Path, table: &TableRef, extension: &'static str) -> Self {
        Self {
            outdir: outdir.to_path_buf(),
            stem: format!(
                "{}.{}",
                file_component(&table.database),
                file_component(&table.table)
            ),
            extension,
            paths: Vec::new(),
        }
    }

    /// `<outdir>/<db>.<table>.<NNNNN>.<ext>`, numbered from 1.
    pub fn path_for(&self, seq: usize) -> PathBuf {
        self.outdir
            .join(format!("{}.{:05}.{}", self.stem, seq, self.extension))
    }

    /// Files opened so far.
    pub fn opened(&self) -> usize {
        self.paths.len()
    }

    /// Create (or truncate) the next file in sequence.
    pub async fn open_next(&mut self) -> Result<ChunkFile> {
        let path = self.path_for(self.paths.len() + 1);
        let file = File::create(&path).await?;
        debug!("Opened chunk {}", path.display());
        self.paths.push(path);
        Ok(ChunkFile {
            out: BufWriter::with_capacity(CHUNK_BUFFER_BYTES, file),
            bytes: 0,
        })
    }

    pub fn into_paths(self) -> Vec<PathBuf> {
        self.paths
    }
}

/// One open chunk file with its running byte count.
pub struct ChunkFile {
    out: BufWriter<File>,
    bytes: u64,
}

impl ChunkFile {
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.out.write_all(buf).await?;
        self.bytes += buf.len() as u64;
        Ok(())
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Flush buffered bytes and close the file.
    pub async fn close(mut self) -> Result<()> {
        self.out.flush().await?;
        self.out.shutdown().await?;
        Ok(())
    }
}

/// What a chunk writer produced.
#[derive(Debug, Clone, Default)]
pub struct ChunkSummary {
    pub files: Vec<PathBuf>,
    pub rows: u64,
    pub bytes: u64,
}

/// Columns emitted for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPlan {
    /// Emitted column names, in table order. Also the CSV header.
    pub names: Vec<String>,
    /// Select expressions, one per emitted column.
    pub selects: Vec<String>,
}

impl ColumnPlan {
    /// Apply the column rules to the probed fields.
    ///
    /// Filtered columns are dropped; a column with a replacement expression
    /// is selected as `<expr> AS `col``.
    pub fn build(fields: &[Field], rules: &TableRules<'_>) -> Result<Self> {
        let mut names = Vec::with_capacity(fields.len());
        let mut selects = Vec::with_capacity(fields.len());
        for field in fields {
            if rules.is_filtered(&field.name) {
                continue;
            }
            let quoted = quote_mysql(&field.name)?;
            let select = match rules.replacement(&field.name) {
                Some(expr) => format!("{} AS {}", expr, quoted),
                None => quoted,
            };
            names.push(field.name.clone());
            selects.push(select);
        }
        if names.is_empty() {
            return Err(DumpError::Config(
                "every column of the table is filtered out".into(),
            ));
        }
        Ok(Self { names, selects })
    }

    /// `SELECT <selects> FROM <qualified>[ WHERE <predicate>]`
    pub fn select_sql(&self, qualified: &str, predicate: Option<&str>) -> String {
        let mut sql = format!("SELECT {} FROM {}", self.selects.join(", "), qualified);
        if let Some(predicate) = predicate {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        sql
    }
}

/// Result of dumping one table.
#[derive(Debug, Clone)]
pub struct TableStats {
    pub table: TableRef,
    pub rows: u64,
    pub bytes: u64,
    pub files: Vec<PathBuf>,
    pub duration: Duration,
    /// Attempts used, 1 when no retry was needed.
    pub attempts: u32,
}

enum RowWriter {
    Sql(SqlChunkWriter),
    Delimited(DelimitedChunkWriter),
}

impl RowWriter {
    async fn write_row(&mut self, row: &[SqlValue]) -> Result<u64> {
        match self {
            RowWriter::Sql(w) => w.write_row(row).await,
            RowWriter::Delimited(w) => w.write_row(row).await,
        }
    }

    fn rows(&self) -> u64 {
        match self {
            RowWriter::Sql(w) => w.rows(),
            RowWriter::Delimited(w) => w.rows(),
        }
    }

    async fn finish(self, complete: bool) -> Result<(ChunkSummary, u64)> {
        match self {
            RowWriter::Sql(w) => w.finish().await,
            RowWriter::Delimited(w) => w.finish(complete).await,
        }
    }
}

/// A failed attempt and how many rows reached disk before it failed.
struct Failure {
    error: DumpError,
    rows: u64,
}

impl From<DumpError> for Failure {
    fn from(error: DumpError) -> Self {
        Self { error, rows: 0 }
    }
}

/// Dumps single tables. Shared by every worker of a run.
pub struct TableDumper {
    config: Arc<DumpConfig>,
    progress: Arc<DumpProgress>,
    retry: RetryPolicy,
}

impl TableDumper {
    pub fn new(config: Arc<DumpConfig>, progress: Arc<DumpProgress>) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            config,
            progress,
            retry,
        }
    }

    /// Dump one table on a leased session.
    ///
    /// Transient errors are retried on a reconnected session as long as no
    /// row has been written; after that the table fails.
    pub async fn dump<S: Session + ?Sized>(
        &self,
        session: &mut S,
        table: &TableRef,
        cancel: &CancellationToken,
    ) -> Result<TableStats> {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match self.dump_once(session, table, cancel).await {
                Ok(summary) => {
                    let stats = TableStats {
                        table: table.clone(),
                        rows: summary.rows,
                        bytes: summary.bytes,
                        files: summary.files,
                        duration: start.elapsed(),
                        attempts: attempt + 1,
                    };
                    info!(
                        "Dumped {} on session {}: {} rows, {} bytes, {} files in {:.2}s",
                        table,
                        session.id(),
                        stats.rows,
                        stats.bytes,
                        stats.files.len(),
                        stats.duration.as_secs_f64()
                    );
                    return Ok(stats);
                }
                Err(failure)
                    if failure.rows == 0
                        && failure.error.is_transient()
                        && attempt < self.retry.retries =>
                {
                    attempt += 1;
                    warn!(
                        "Transient error dumping {} on session {}, retry {}/{}: {}",
                        table,
                        session.id(),
                        attempt,
                        self.retry.retries,
                        failure.error
                    );
                    self.retry.backoff(attempt).await;
                    if let Err(e) = session.reconnect().await {
                        warn!("Reconnect for {} failed: {}", table, e);
                    }
                }
                Err(failure) => {
                    if !matches!(failure.error, DumpError::Cancelled) {
                        warn!(
                            "Dump of {} failed after {} rows: {}",
                            table, failure.rows, failure.error
                        );
                    }
                    return Err(failure.error);
                }
            }
        }
    }

    async fn dump_once<S: Session + ?Sized>(
        &self,
        session: &mut S,
        table: &TableRef,
        cancel: &CancellationToken,
    ) -> std::result::Result<ChunkSummary, Failure> {
        if cancel.is_cancelled() {
            return Err(DumpError::Cancelled.into());
        }

        let qualified = qualify_mysql(&table.database, &table.table)?;
        let fields = probe(session, &qualified).await?;
        let rules = self.config.rules_for(&table.table);
        let plan = ColumnPlan::build(&fields, &rules)
            .map_err(|e| DumpError::table(&table.database, &table.table, e))?;
        let sql = plan.select_sql(&qualified, rules.predicate());
        debug!("Session {} streaming: {}", session.id(), sql);

        let mut cursor = session.stream(&sql).await?;
        // Quoting follows the types of the main query, which reflect any
        // replacement expressions.
        let kinds: Vec<FieldKind> = cursor.fields().iter().map(|f| f.kind).collect();
        let writer = if kinds.len() == plan.names.len() {
            self.writer(table, &plan, kinds)
        } else {
            Err(DumpError::query(
                &sql,
                format!(
                    "returned {} columns, expected {}",
                    kinds.len(),
                    plan.names.len()
                ),
            ))
        };
        let mut writer = match writer {
            Ok(writer) => writer,
            Err(e) => {
                if let Err(close_err) = cursor.close().await {
                    debug!("Closing cursor for {} failed: {}", table, close_err);
                }
                return Err(e.into());
            }
        };

        let copied = self.copy_rows(&mut *cursor, &mut writer, cancel).await;
        let outcome = match copied {
            // Cancelled cursors are dropped rather than drained.
            Err(DumpError::Cancelled) => {
                drop(cursor);
                Err(DumpError::Cancelled)
            }
            Err(e) => {
                if let Err(close_err) = cursor.close().await {
                    debug!("Closing cursor for {} failed: {}", table, close_err);
                }
                Err(e)
            }
            Ok(()) => cursor.close().await,
        };

        let rows = writer.rows();
        match outcome {
            Ok(()) => {
                let (summary, tail) = writer
                    .finish(true)
                    .await
                    .map_err(|error| Failure { error, rows })?;
                self.progress.add_bytes(tail);
                Ok(summary)
            }
            Err(error) => {
                // Keep what was written loadable.
                match writer.finish(false).await {
                    Ok((_, tail)) => self.progress.add_bytes(tail),
                    Err(e) => warn!("Closing chunk for {} failed: {}", table, e),
                }
                Err(Failure { error, rows })
            }
        }
    }

    async fn copy_rows<C: RowCursor + ?Sized>(
        &self,
        cursor: &mut C,
        writer: &mut RowWriter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DumpError::Cancelled),
                row = cursor.next_row() => row?,
            };
            let Some(row) = next else {
                return Ok(());
            };
            let bytes = writer.write_row(&row).await?;
            self.progress.add_row(bytes);
        }
    }

    fn writer(
        &self,
        table: &TableRef,
        plan: &ColumnPlan,
        kinds: Vec<FieldKind>,
    ) -> Result<RowWriter> {
        let format = self.config.format;
        let files = ChunkFiles::new(&self.config.outdir, table, format.extension());
        let chunk_bytes = self.config.chunk_bytes();
        Ok(match format.separator() {
            None => RowWriter::Sql(SqlChunkWriter::new(
                files,
                &table.table,
                &plan.names,
                kinds,
                self.config.stmt_size,
                chunk_bytes,
            )?),
            Some(separator) => RowWriter::Delimited(DelimitedChunkWriter::new(
                files,
                separator,
                &plan.names,
                kinds,
                chunk_bytes,
            )?),
        })
    }
}

/// Column list of a table from a one-row query.
async fn probe<S: Session + ?Sized>(session: &mut S, qualified: &str) -> Result<Vec<Field>> {
    let sql = format!("SELECT * FROM {} LIMIT 1", qualified);
    let cursor = session.stream(&sql).await?;
    let fields = cursor.fields().to_vec();
    cursor.close().await?;
    Ok(fields)
}
