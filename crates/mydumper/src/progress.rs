//! Run-wide totals and the periodic throughput reporter.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const MB: f64 = 1024.0 * 1024.0;

/// Byte and row totals shared by every table worker.
///
/// Workers only add; readers take snapshots. No lock is involved.
#[derive(Debug)]
pub struct DumpProgress {
    bytes: AtomicU64,
    rows: AtomicU64,
    start: Instant,
}

impl Default for DumpProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpProgress {
    pub fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            rows: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// Count one written row and its bytes.
    pub fn add_row(&self, bytes: u64) {
        self.rows.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count bytes not tied to a row (statement terminators, headers).
    pub fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            rows: self.rows.load(Ordering::Relaxed),
            elapsed: self.start.elapsed(),
        }
    }
}

/// Point-in-time view of [`DumpProgress`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProgressSnapshot {
    pub bytes: u64,
    pub rows: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn megabytes(&self) -> f64 {
        self.bytes as f64 / MB
    }

    /// Average throughput since the start of the run.
    pub fn mb_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.megabytes() / secs
        } else {
            0.0
        }
    }

    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Where progress lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressMode {
    /// `info!` log lines only.
    #[default]
    Log,
    /// Log lines plus one JSON object per tick on stderr.
    Json,
}

#[derive(Serialize)]
struct ProgressLine {
    phase: &'static str,
    rows: u64,
    bytes: u64,
    elapsed_seconds: f64,
    mb_per_second: f64,
}

/// Background task logging throughput on a fixed interval.
pub struct ProgressReporter {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

impl ProgressReporter {
    /// Start ticking. The first report comes one `interval` after start.
    pub fn spawn(progress: Arc<DumpProgress>, interval: Duration, mode: ProgressMode) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            let period = interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => report(&progress.snapshot(), mode),
                }
            }
            debug!("Progress reporter stopped");
        });
        Self { handle, stop }
    }

    /// Stop ticking and wait for the task to end.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            debug!("Progress reporter ended abnormally: {}", e);
        }
    }
}

fn report(snapshot: &ProgressSnapshot, mode: ProgressMode) {
    info!(
        "Dumping: {:.2}MB, {} rows, {:.2}s, {:.2}MB/s",
        snapshot.megabytes(),
        snapshot.rows,
        snapshot.elapsed.as_secs_f64(),
        snapshot.mb_per_second()
    );
    if mode == ProgressMode::Json {
        let line = ProgressLine {
            phase: "dumping",
            rows: snapshot.rows,
            bytes: snapshot.bytes,
            elapsed_seconds: snapshot.elapsed.as_secs_f64(),
            mb_per_second: snapshot.mb_per_second(),
        };
        if let Ok(json) = serde_json::to_string(&line) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_accumulate() {
        let progress = DumpProgress::new();
        progress.add_row(10);
        progress.add_row(5);
        progress.add_bytes(2);
        let snap = progress.snapshot();
        assert_eq!(snap.rows, 2);
        assert_eq!(snap.bytes, 17);
    }

    #[test]
    fn test_concurrent_adds() {
        let progress = Arc::new(DumpProgress::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&progress);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        p.add_row(3);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = progress.snapshot();
        assert_eq!(snap.rows, 8000);
        assert_eq!(snap.bytes, 24000);
    }

    #[test]
    fn test_rates() {
        let snap = ProgressSnapshot {
            bytes: 4 * 1024 * 1024,
            rows: 10,
            elapsed: Duration::from_secs(2),
        };
        assert!((snap.megabytes() - 4.0).abs() < f64::EPSILON);
        assert!((snap.mb_per_second() - 2.0).abs() < f64::EPSILON);

        let zero = ProgressSnapshot {
            bytes: 1,
            rows: 1,
            elapsed: Duration::ZERO,
        };
        assert_eq!(zero.mb_per_second(), 0.0);
    }

    #[tokio::test]
    async fn test_reporter_stops() {
        let progress = Arc::new(DumpProgress::new());
        let reporter = ProgressReporter::spawn(progress, Duration::from_millis(5), ProgressMode::Log);
        tokio::time::sleep(Duration::from_millis(20)).await;
        reporter.stop().await;
    }
}
