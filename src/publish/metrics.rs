//! Upload progress counters and periodic reporting.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters shared by upload workers.
#[derive(Debug, Default)]
pub struct UploadMetrics {
    /// Bytes sent for successful uploads
    pub bytes_uploaded: AtomicU64,

    /// Objects stored
    pub objects_uploaded: AtomicU64,

    /// Objects that exhausted their retries
    pub objects_failed: AtomicU64,

    /// Retry attempts across all objects
    pub retries: AtomicU64,

    start_time: Option<Instant>,
}

impl UploadMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.objects_uploaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_failed(&self) {
        self.objects_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Objects finished per second, successful or not.
    pub fn objects_per_second(&self) -> f64 {
        let done = self.objects_uploaded.load(Ordering::Relaxed)
            + self.objects_failed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            done as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            objects_uploaded: self.objects_uploaded.load(Ordering::Relaxed),
            objects_failed: self.objects_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            objects_per_second: self.objects_per_second(),
        }
    }
}

/// Point-in-time view of [`UploadMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct UploadSnapshot {
    pub bytes_uploaded: u64,
    pub objects_uploaded: u64,
    pub objects_failed: u64,
    pub retries: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub objects_per_second: f64,
}

impl std::fmt::Display for UploadSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Objects: {} uploaded, {} failed | Retries: {} | Sent: {:.2} MB | \
             Rate: {:.1} objects/s | Elapsed: {:.1}s",
            self.objects_uploaded,
            self.objects_failed,
            self.retries,
            self.bytes_uploaded as f64 / (1024.0 * 1024.0),
            self.objects_per_second,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Logs upload progress on a fixed interval until told to stop.
pub struct MetricsReporter {
    metrics: Arc<UploadMetrics>,
    interval_secs: u64,
    total_objects: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<UploadMetrics>, interval_secs: u64, total_objects: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_objects,
        }
    }

    /// Percent of planned objects finished.
    fn progress(&self, snapshot: &UploadSnapshot) -> f64 {
        if self.total_objects > 0 {
            (snapshot.objects_uploaded + snapshot.objects_failed) as f64 / self.total_objects as f64
                * 100.0
        } else {
            0.0
        }
    }

    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("[{:.1}%] {}", self.progress(&snapshot), snapshot);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Upload finished: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }
}
