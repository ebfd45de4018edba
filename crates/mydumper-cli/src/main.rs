//! mydumper CLI - parallel MySQL dump into size-bounded files.

use clap::{Args, Parser, Subcommand};
use mydumper::{Config, DumpError, Dumper, FailurePolicy, MysqlConnector, OutputFormat, ProgressMode};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mydumper")]
#[command(about = "Parallel MySQL dump into size-bounded SQL or CSV files")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump schemas and rows into the output directory
    Dump {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        dump: DumpArgs,
    },

    /// Show which databases and tables a dump would cover
    List {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        dump: DumpArgs,
    },

    /// Test the server connection
    HealthCheck {
        #[command(flatten)]
        source: SourceArgs,
    },
}

/// Connection overrides.
#[derive(Args, Default)]
struct SourceArgs {
    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Username
    #[arg(long)]
    user: Option<String>,

    /// Password
    #[arg(long)]
    password: Option<String>,

    /// Session variables, e.g. "wait_timeout=28800;net_write_timeout=600"
    #[arg(long)]
    vars: Option<String>,
}

/// Dump behavior overrides.
#[derive(Args, Default)]
struct DumpArgs {
    /// Comma-separated databases to dump
    #[arg(long)]
    database: Option<String>,

    /// Dump databases matching this pattern (wins over --database)
    #[arg(long)]
    database_regexp: Option<String>,

    /// Dump databases NOT matching --database-regexp
    #[arg(long)]
    database_invert_regexp: bool,

    /// Comma-separated tables to dump in every database
    #[arg(long)]
    table: Option<String>,

    /// Output directory
    #[arg(long)]
    outdir: Option<PathBuf>,

    /// Number of data sessions
    #[arg(long)]
    threads: Option<usize>,

    /// Chunk file size in MB
    #[arg(long)]
    chunksize: Option<u64>,

    /// Bytes of row data per INSERT statement
    #[arg(long)]
    stmtsize: Option<usize>,

    /// Output format: sql, csv or tsv
    #[arg(long)]
    format: Option<String>,

    /// Progress report interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// On a table failure: continue or abort
    #[arg(long)]
    on_table_error: Option<String>,
}

impl SourceArgs {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.source.host = host;
        }
        if let Some(port) = self.port {
            config.source.port = port;
        }
        if let Some(user) = self.user {
            config.source.user = user;
        }
        if let Some(password) = self.password {
            config.source.password = password;
        }
        if let Some(vars) = self.vars {
            config.source.session_vars.extend(session_statements(&vars));
        }
    }
}

impl DumpArgs {
    fn apply(self, config: &mut Config) -> Result<(), DumpError> {
        let dump = &mut config.dump;
        if let Some(database) = self.database {
            dump.database = Some(database);
        }
        if let Some(pattern) = self.database_regexp {
            dump.database_regexp = Some(pattern);
        }
        if self.database_invert_regexp {
            dump.database_invert_regexp = true;
        }
        if let Some(table) = self.table {
            dump.table = Some(table);
        }
        if let Some(outdir) = self.outdir {
            dump.outdir = outdir;
        }
        if let Some(threads) = self.threads {
            dump.threads = threads;
        }
        if let Some(chunksize) = self.chunksize {
            dump.chunksize_mb = chunksize;
        }
        if let Some(stmtsize) = self.stmtsize {
            dump.stmt_size = stmtsize;
        }
        if let Some(format) = self.format {
            dump.format = format.parse::<OutputFormat>()?;
        }
        if let Some(interval) = self.interval_ms {
            dump.interval_ms = interval;
        }
        if let Some(policy) = self.on_table_error {
            dump.on_table_error = policy.parse::<FailurePolicy>()?;
        }
        Ok(())
    }
}

/// Split `a=1;SET b=2` into session statements.
fn session_statements(vars: &str) -> Vec<String> {
    vars.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("SET ")) {
                s.to_string()
            } else {
                format!("SET SESSION {}", s)
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), DumpError> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.verbosity, &cli.log_format).map_err(DumpError::Config)?;

    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::load_unvalidated(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => Config::default(),
    };

    match cli.command {
        Commands::Dump { source, dump } => {
            source.apply(&mut config);
            dump.apply(&mut config)?;

            let connector = MysqlConnector::new(config.source.clone());
            let mut dumper = Dumper::new(config, connector)?;
            if cli.progress {
                dumper = dumper.with_progress(ProgressMode::Json);
            }

            // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
            let cancel_token = setup_signal_handler()?;
            let result = dumper.run(cancel_token).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\nDump {}!", result.status);
                println!("  Run ID: {}", result.run_id);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!(
                    "  Tables: {}/{} in {} databases",
                    result.tables_success, result.tables_total, result.databases
                );
                println!("  Rows: {}", result.rows);
                println!("  Bytes: {}", result.bytes);
                println!(
                    "  Throughput: {:.2} MB/s",
                    result.bytes_per_second / (1024.0 * 1024.0)
                );
                if !result.failed_tables.is_empty() {
                    println!("  Failed tables: {:?}", result.failed_tables);
                }
            }

            if let Some(e) = result.error() {
                return Err(e);
            }
        }

        Commands::List { source, dump } => {
            source.apply(&mut config);
            dump.apply(&mut config)?;

            let connector = MysqlConnector::new(config.source.clone());
            let dumper = Dumper::new(config, connector)?;
            let plan = dumper.plan().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                for database in &plan.databases {
                    println!("{} ({} tables)", database.name, database.tables.len());
                    for table in &database.tables {
                        println!("  {}", table);
                    }
                }
                println!(
                    "\n{} databases, {} tables",
                    plan.databases.len(),
                    plan.total_tables()
                );
            }
        }

        Commands::HealthCheck { source } => {
            source.apply(&mut config);

            let connector = MysqlConnector::new(config.source.clone());
            let endpoint = config.source.address();
            let dumper = Dumper::new(config, connector)?;
            let start = std::time::Instant::now();
            let session_id = dumper.health_check().await?;
            let latency_ms = start.elapsed().as_millis();

            if cli.output_json {
                let report = serde_json::json!({
                    "endpoint": endpoint,
                    "healthy": true,
                    "session_id": session_id,
                    "latency_ms": latency_ms,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Health Check Results:");
                println!("  Source (MySQL {}): OK ({}ms)", endpoint, latency_ms);
                println!("  Session id: {}", session_id);
            }
        }
    }

    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, DumpError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!("\nReceived {}. Stopping in-flight tables...", name);
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, DumpError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping in-flight tables...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_statements() {
        assert_eq!(
            session_statements("wait_timeout=28800; SET NAMES utf8mb4;;"),
            vec!["SET SESSION wait_timeout=28800", "SET NAMES utf8mb4"]
        );
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = Config::default();
        SourceArgs {
            user: Some("root".into()),
            port: Some(3307),
            ..Default::default()
        }
        .apply(&mut config);
        DumpArgs {
            format: Some("tsv".into()),
            threads: Some(4),
            on_table_error: Some("abort".into()),
            ..Default::default()
        }
        .apply(&mut config)
        .unwrap();

        assert_eq!(config.source.user, "root");
        assert_eq!(config.source.port, 3307);
        assert_eq!(config.dump.format, OutputFormat::Tsv);
        assert_eq!(config.dump.threads, 4);
        assert_eq!(config.dump.on_table_error, FailurePolicy::Abort);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let mut config = Config::default();
        let err = DumpArgs {
            format: Some("xml".into()),
            ..Default::default()
        }
        .apply(&mut config)
        .unwrap_err();
        assert!(matches!(err, DumpError::UnknownFormat(_)));
    }
}
