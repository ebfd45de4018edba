//! Dump orchestrator - main workflow coordinator.
//!
//! A run goes through these phases:
//!
//! 1. Open the global pool (`threads` sessions) and write `metadata`.
//! 2. Resolve databases, write each database's schema.
//! 3. Resolve tables, write each table's schema. All of this runs on one
//!    global session, sequentially.
//! 4. Per database, open a sub-pool of `threads / databases` sessions and
//!    dump every table in its own task, leasing from that sub-pool.
//! 5. Join, log the summary, close every pool.
//!
//! When there are more databases than threads, sub-pools get one session
//! each and a database slot semaphore keeps at most `threads` databases
//! dumping at once, so no more than `threads` data sessions are ever leased.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::{fetch_with_retry, resolve_databases, resolve_tables, RetryPolicy};
use crate::config::{Config, DumpConfig, FailurePolicy};
use crate::core::{Connector, Session, TableRef};
use crate::dump::{TableDumper, TableStats};
use crate::error::{DumpError, Result};
use crate::pool::ConnectionPool;
use crate::progress::{DumpProgress, ProgressMode, ProgressReporter};
use crate::schema::{dump_database_schema, dump_table_schema, write_metadata};

/// Tables to dump, grouped by database, in resolution order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DumpPlan {
    pub databases: Vec<DatabasePlan>,
}

/// One database and its tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabasePlan {
    pub name: String,
    pub tables: Vec<String>,
}

impl DumpPlan {
    pub fn total_tables(&self) -> usize {
        self.databases.iter().map(|d| d.tables.len()).sum()
    }

    /// Every table as a [`TableRef`], database by database.
    pub fn table_refs(&self) -> impl Iterator<Item = TableRef> + '_ {
        self.databases
            .iter()
            .flat_map(|d| d.tables.iter().map(move |t| TableRef::new(&d.name, t)))
    }
}

/// Result of a dump run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status: completed, failed, or cancelled.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Databases covered.
    pub databases: usize,

    /// Total tables processed.
    pub tables_total: usize,

    /// Tables dumped completely.
    pub tables_success: usize,

    /// Tables that failed or were cancelled.
    pub tables_failed: usize,

    /// Rows written.
    pub rows: u64,

    /// Bytes written.
    pub bytes: u64,

    /// Average throughput (bytes/second).
    pub bytes_per_second: f64,

    /// `db.table` of every table that did not complete.
    pub failed_tables: Vec<String>,
}

impl DumpResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The error a caller should exit with, if the run was not complete.
    pub fn error(&self) -> Option<DumpError> {
        match self.status.as_str() {
            "cancelled" => Some(DumpError::Cancelled),
            "failed" => Some(DumpError::TablesFailed {
                failed: self.tables_failed,
                total: self.tables_total,
            }),
            _ => None,
        }
    }
}

struct TableOutcome {
    table: TableRef,
    result: Result<TableStats>,
}

/// Shared by every database task of a run.
struct RunContext<C: Connector> {
    connector: Arc<C>,
    dumper: Arc<TableDumper>,
    slots: Arc<Semaphore>,
    sessions_per_database: usize,
    policy: FailurePolicy,
    cancel: CancellationToken,
}

impl<C: Connector> RunContext<C> {
    fn record_failure(&self, table: &TableRef, e: &DumpError) {
        if matches!(e, DumpError::Cancelled) {
            return;
        }
        error!("{}: failed - {}", table, e);
        if self.policy == FailurePolicy::Abort && !self.cancel.is_cancelled() {
            warn!("Aborting remaining tables after failure of {}", table);
            self.cancel.cancel();
        }
    }
}

/// Dump orchestrator.
pub struct Dumper<C: Connector> {
    config: Config,
    dump_config: Arc<DumpConfig>,
    connector: Arc<C>,
    progress_mode: ProgressMode,
}

impl<C: Connector> Dumper<C> {
    /// Create a dumper. The configuration is validated here.
    pub fn new(config: Config, connector: C) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dump_config: Arc::new(config.dump.clone()),
            config,
            connector: Arc::new(connector),
            progress_mode: ProgressMode::Log,
        })
    }

    /// Also emit JSON progress lines on stderr.
    pub fn with_progress(mut self, mode: ProgressMode) -> Self {
        self.progress_mode = mode;
        self
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config.dump)
    }

    /// Open one session and run `SELECT 1`. Returns the session id.
    pub async fn health_check(&self) -> Result<u32> {
        let mut session = self.connector.connect(None).await?;
        let result = fetch_with_retry(&mut session, "SELECT 1", self.retry()).await;
        let id = session.id();
        if let Err(e) = session.close().await {
            debug!("Closing health check session failed: {}", e);
        }
        result?;
        info!("Connected to {} (session {})", self.connector.endpoint(), id);
        Ok(id)
    }

    /// Resolve databases and tables without writing anything.
    pub async fn plan(&self) -> Result<DumpPlan> {
        let mut session = self.connector.connect(None).await?;
        let plan = self.resolve_plan(&mut session).await;
        if let Err(e) = session.close().await {
            debug!("Closing planning session failed: {}", e);
        }
        plan
    }

    async fn resolve_plan<S: Session + ?Sized>(&self, session: &mut S) -> Result<DumpPlan> {
        let retry = self.retry();
        let databases =
            resolve_databases(session, &self.config.dump.database_selection()?, retry).await?;
        let table_selection = self.config.dump.table_selection();
        let mut plan = DumpPlan::default();
        for name in databases {
            let tables = resolve_tables(session, &name, &table_selection, retry).await?;
            plan.databases.push(DatabasePlan { name, tables });
        }
        Ok(plan)
    }

    /// Run the dump.
    ///
    /// Returns the result when every table was attempted; its status tells
    /// whether all of them completed. With `on_table_error: abort` the
    /// first table error is returned instead.
    pub async fn run(&self, cancel: CancellationToken) -> Result<DumpResult> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let threads = self.config.dump.threads;

        info!(
            "Starting dump run {} from {} into {} ({} threads, format {})",
            run_id,
            self.connector.endpoint(),
            self.config.dump.outdir.display(),
            threads,
            self.config.dump.format
        );

        let global =
            ConnectionPool::connect(self.connector.as_ref(), threads, None, "global").await?;
        let outcome = self.run_with_pool(&global, &cancel).await;
        if let Err(e) = global.close().await {
            warn!("Closing global pool failed: {}", e);
        }
        let (plan, outcomes, progress) = outcome?;

        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        let snapshot = progress.snapshot();

        let mut tables_success = 0;
        let mut failed_tables = Vec::new();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome.result {
                Ok(_) => tables_success += 1,
                Err(e) => {
                    failed_tables.push(outcome.table.to_string());
                    if !matches!(e, DumpError::Cancelled) {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        let status = if cancel.is_cancelled() {
            "cancelled"
        } else if !failed_tables.is_empty() {
            "failed"
        } else {
            "completed"
        };

        let bytes_per_second = if duration > 0.0 {
            snapshot.bytes as f64 / duration
        } else {
            0.0
        };

        let result = DumpResult {
            run_id,
            status: status.to_string(),
            duration_seconds: duration,
            started_at,
            completed_at,
            databases: plan.databases.len(),
            tables_total: plan.total_tables(),
            tables_success,
            tables_failed: failed_tables.len(),
            rows: snapshot.rows,
            bytes: snapshot.bytes,
            bytes_per_second,
            failed_tables,
        };

        info!(
            "Dump {}: cost {:.2}s, {} tables ({} failed), {} rows, {} bytes, {:.2}MB/s",
            result.status,
            result.duration_seconds,
            result.tables_total,
            result.tables_failed,
            result.rows,
            result.bytes,
            result.bytes_per_second / (1024.0 * 1024.0)
        );

        if self.config.dump.on_table_error == FailurePolicy::Abort && !cancel.is_cancelled() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(result)
    }

    async fn run_with_pool(
        &self,
        global: &ConnectionPool<C::Session>,
        cancel: &CancellationToken,
    ) -> Result<(DumpPlan, Vec<TableOutcome>, Arc<DumpProgress>)> {
        let outdir = self.config.dump.outdir.as_path();
        let retry = self.retry();
        let policy = self.config.dump.on_table_error;

        // Phase 1: start marker
        write_metadata(outdir).await?;

        // Phase 2-3: enumeration and schemas on one global session
        let mut session = global.acquire().await?;
        let plan = self.resolve_plan(&mut *session).await?;
        for database in &plan.databases {
            dump_database_schema(outdir, &database.name).await?;
        }

        let mut outcomes = Vec::new();
        let mut pending = DumpPlan::default();
        for database in &plan.databases {
            let mut tables = Vec::new();
            for table in &database.tables {
                if cancel.is_cancelled() {
                    return Err(DumpError::Cancelled);
                }
                match schema_for(&mut *session, outdir, &database.name, table, retry).await {
                    Ok(()) => tables.push(table.clone()),
                    Err(e) if policy == FailurePolicy::Continue => {
                        error!("{}.{}: schema failed - {}", database.name, table, e);
                        outcomes.push(TableOutcome {
                            table: TableRef::new(&database.name, table),
                            result: Err(e),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
            pending.databases.push(DatabasePlan {
                name: database.name.clone(),
                tables,
            });
        }
        session.release();

        info!(
            "Resolved {} databases, {} tables",
            plan.databases.len(),
            plan.total_tables()
        );

        // Phase 4: data
        let progress = Arc::new(DumpProgress::new());
        let reporter = ProgressReporter::spawn(
            Arc::clone(&progress),
            std::time::Duration::from_millis(self.config.dump.interval_ms),
            self.progress_mode,
        );

        outcomes.extend(self.dump_data(&pending, Arc::clone(&progress), cancel).await);

        reporter.stop().await;
        Ok((plan, outcomes, progress))
    }

    async fn dump_data(
        &self,
        plan: &DumpPlan,
        progress: Arc<DumpProgress>,
        cancel: &CancellationToken,
    ) -> Vec<TableOutcome> {
        let threads = self.config.dump.threads;
        let databases = plan.databases.len().max(1);
        let sessions_per_database = (threads / databases).max(1);
        let slots = (threads / sessions_per_database).max(1);
        debug!(
            "{} sessions per database, {} databases at a time",
            sessions_per_database, slots
        );

        let ctx = Arc::new(RunContext {
            connector: Arc::clone(&self.connector),
            dumper: Arc::new(TableDumper::new(Arc::clone(&self.dump_config), progress)),
            slots: Arc::new(Semaphore::new(slots)),
            sessions_per_database,
            policy: self.config.dump.on_table_error,
            cancel: cancel.child_token(),
        });

        let mut handles: Vec<(DatabasePlan, JoinHandle<Vec<TableOutcome>>)> = Vec::new();
        for database in &plan.databases {
            if database.tables.is_empty() {
                continue;
            }
            let ctx = Arc::clone(&ctx);
            let job = database.clone();
            let handle = tokio::spawn(async move { dump_database(ctx, job).await });
            handles.push((database.clone(), handle));
        }

        let mut outcomes = Vec::new();
        for (database, handle) in handles {
            match handle.await {
                Ok(results) => outcomes.extend(results),
                Err(e) => {
                    error!("{}: task panicked - {}", database.name, e);
                    for table in &database.tables {
                        outcomes.push(TableOutcome {
                            table: TableRef::new(&database.name, table),
                            result: Err(DumpError::table(
                                &database.name,
                                table,
                                format!("task panicked: {}", e),
                            )),
                        });
                    }
                }
            }
        }
        outcomes
    }
}

async fn schema_for<S: Session + ?Sized>(
    session: &mut S,
    outdir: &Path,
    database: &str,
    table: &str,
    retry: RetryPolicy,
) -> Result<()> {
    dump_table_schema(session, outdir, database, table, retry)
        .await
        .map(|_| ())
}

/// Dump every table of one database on its own sub-pool.
async fn dump_database<C: Connector>(ctx: Arc<RunContext<C>>, job: DatabasePlan) -> Vec<TableOutcome> {
    let fail_all = |message: String| -> Vec<TableOutcome> {
        job.tables
            .iter()
            .map(|t| TableOutcome {
                table: TableRef::new(&job.name, t),
                result: Err(DumpError::table(&job.name, t, &message)),
            })
            .collect()
    };
    let cancel_all = || -> Vec<TableOutcome> {
        job.tables
            .iter()
            .map(|t| TableOutcome {
                table: TableRef::new(&job.name, t),
                result: Err(DumpError::Cancelled),
            })
            .collect()
    };

    let slot = tokio::select! {
        _ = ctx.cancel.cancelled() => return cancel_all(),
        slot = Arc::clone(&ctx.slots).acquire_owned() => slot,
    };
    let _slot = match slot {
        Ok(slot) => slot,
        Err(e) => return fail_all(e.to_string()),
    };
    if ctx.cancel.is_cancelled() {
        return cancel_all();
    }

    let pool = match ConnectionPool::connect(
        ctx.connector.as_ref(),
        ctx.sessions_per_database,
        Some(job.name.as_str()),
        format!("db:{}", job.name),
    )
    .await
    {
        Ok(pool) => pool,
        Err(e) => {
            let outcomes = fail_all(e.to_string());
            if let Some(first) = outcomes.first() {
                ctx.record_failure(&first.table, &e);
            }
            return outcomes;
        }
    };
    info!(
        "Dumping {} tables of {} with {} sessions",
        job.tables.len(),
        job.name,
        pool.size()
    );

    let mut handles = Vec::with_capacity(job.tables.len());
    for table in &job.tables {
        let table = TableRef::new(&job.name, table);
        let ctx = Arc::clone(&ctx);
        let pool = pool.clone();
        let task_table = table.clone();
        let handle = tokio::spawn(async move {
            let result = dump_table(&ctx, &pool, &task_table).await;
            if let Err(e) = &result {
                ctx.record_failure(&task_table, e);
            }
            result
        });
        handles.push((table, handle));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (table, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("{}: task panicked - {}", table, e);
                Err(DumpError::table(
                    &table.database,
                    &table.table,
                    format!("task panicked: {}", e),
                ))
            }
        };
        outcomes.push(TableOutcome { table, result });
    }

    debug!(
        "{}: peak {} of {} sessions in use",
        job.name,
        pool.peak_in_use(),
        pool.size()
    );
    if let Err(e) = pool.close().await {
        warn!("Closing pool for {} failed: {}", job.name, e);
    }
    outcomes
}

async fn dump_table<C: Connector>(
    ctx: &RunContext<C>,
    pool: &ConnectionPool<C::Session>,
    table: &TableRef,
) -> Result<TableStats> {
    let mut session = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(DumpError::Cancelled),
        session = pool.acquire() => session?,
    };
    debug!("{}: leased session {}", table, session.id());
    let result = ctx.dumper.dump(&mut *session, table, &ctx.cancel).await;
    session.release();
    result
}
