//! Concurrent, retrying upload of the tile tree and sidecar files.

use crate::config::{PublishConfig, RetryConfig};
use crate::error::{PipelineError, Result};
use crate::publish::headers::ObjectHeaders;
use crate::publish::metrics::{MetricsReporter, UploadMetrics};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// Key segment under which the tile tree is published.
pub const TILES_KEY: &str = "tiles";

/// One local file to store under `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub local: PathBuf,
    pub key: String,
    pub headers: ObjectHeaders,
}

/// An object that could not be stored.
#[derive(Debug, Clone, Serialize)]
pub struct UploadFailure {
    pub key: String,
    pub error: String,
    pub attempts: usize,
}

/// Summary of a publish run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishReport {
    /// Sorted by key
    pub uploaded: Vec<String>,
    pub bytes: u64,
    pub retries: u64,
    /// Sorted by key
    pub failed: Vec<UploadFailure>,
}

impl PublishReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_keys(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.key.clone()).collect()
    }

    /// Convert into an error if any object failed.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(PipelineError::Upload {
                failed: self.failed_keys(),
            })
        }
    }
}

/// Whether publishing ran.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishOutcome {
    /// No bucket configured
    Skipped,
    Completed(PublishReport),
}

/// Join a key prefix and a relative key.
pub fn object_key(prefix: &str, rel: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let rel = rel.trim_start_matches('/');
    if prefix.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", prefix, rel)
    }
}

/// Plan uploads for a tile tree and a set of sidecar files.
///
/// Tiles land under `{prefix}/tiles/...` mirroring the local layout; each
/// sidecar file lands at `{prefix}/{file name}`. Hidden and temporary files
/// are skipped. Tasks are sorted by key.
pub fn plan_uploads(
    tiles_dir: Option<&Path>,
    prefix: &str,
    files: &[PathBuf],
) -> Result<Vec<UploadTask>> {
    let mut tasks = Vec::new();

    if let Some(root) = tiles_dir {
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                PipelineError::io(&path, e.into())
            })?;
            if !entry.file_type().is_file() || is_temporary(entry.path()) {
                continue;
            }
            let rel = match entry.path().strip_prefix(root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let rel_key: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let key = object_key(prefix, &format!("{}/{}", TILES_KEY, rel_key.join("/")));
            tasks.push(UploadTask {
                local: entry.path().to_path_buf(),
                key,
                headers: ObjectHeaders::for_path(entry.path()),
            });
        }
    }

    for file in files {
        let name = file.file_name().ok_or_else(|| {
            PipelineError::Config(format!("cannot publish {}: no file name", file.display()))
        })?;
        tasks.push(UploadTask {
            local: file.clone(),
            key: object_key(prefix, &name.to_string_lossy()),
            headers: ObjectHeaders::for_path(file),
        });
    }

    tasks.sort_by(|a, b| a.key.cmp(&b.key));
    tasks.dedup_by(|a, b| a.key == b.key);
    Ok(tasks)
}

fn is_temporary(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    name.starts_with('.') || name.ends_with(".tmp") || name.ends_with(".partial")
}

/// Uploads files to an object store through a bounded worker pool.
pub struct Publisher {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
    retry: RetryConfig,
    metrics_interval_secs: u64,
}

impl Publisher {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize, retry: RetryConfig) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
            retry,
            metrics_interval_secs: 10,
        }
    }

    pub fn from_config(store: Arc<dyn ObjectStore>, config: &PublishConfig) -> Self {
        Self {
            metrics_interval_secs: config.metrics_interval_secs,
            ..Self::new(store, config.concurrency, config.retry.clone())
        }
    }

    /// Upload every task, at most `concurrency` at a time.
    ///
    /// A failing object never aborts the others; failures are collected in
    /// the report. Re-publishing the same tasks overwrites the same keys.
    pub async fn publish(&self, tasks: Vec<UploadTask>) -> PublishReport {
        let total = tasks.len();
        tracing::info!(
            "Publishing {} objects with concurrency {}",
            total,
            self.concurrency
        );

        let metrics = UploadMetrics::new();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let reporter = MetricsReporter::new(metrics.clone(), self.metrics_interval_secs, total as u64);
        let reporter_handle = tokio::spawn(reporter.run(shutdown_rx));

        let results: Vec<std::result::Result<(String, u64), UploadFailure>> = stream::iter(tasks)
            .map(|task| self.upload_one(task, metrics.clone()))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let _ = shutdown_tx.send(()).await;
        let _ = reporter_handle.await;

        let mut report = PublishReport {
            retries: metrics.snapshot().retries,
            ..Default::default()
        };
        for result in results {
            match result {
                Ok((key, bytes)) => {
                    report.uploaded.push(key);
                    report.bytes += bytes;
                }
                Err(failure) => report.failed.push(failure),
            }
        }
        report.uploaded.sort();
        report.failed.sort_by(|a, b| a.key.cmp(&b.key));

        if report.is_success() {
            tracing::info!("Published {} objects ({} bytes)", report.uploaded.len(), report.bytes);
        } else {
            for failure in &report.failed {
                tracing::error!(
                    "Upload failed for {} after {} attempt(s): {}",
                    failure.key,
                    failure.attempts,
                    failure.error
                );
            }
        }
        report
    }

    async fn upload_one(
        &self,
        task: UploadTask,
        metrics: Arc<UploadMetrics>,
    ) -> std::result::Result<(String, u64), UploadFailure> {
        // Local read problems are not transient
        let data = match tokio::fs::read(&task.local).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                metrics.add_failed();
                return Err(UploadFailure {
                    key: task.key,
                    error: format!("failed to read {}: {}", task.local.display(), e),
                    attempts: 0,
                });
            }
        };

        let location = ObjectPath::from(task.key.as_str());
        let attributes = task.headers.to_attributes();
        let size = data.len() as u64;

        let (result, attempts) = with_retries(&self.retry, &task.key, &metrics, is_transient, || {
            let opts = PutOptions {
                mode: PutMode::Overwrite,
                attributes: attributes.clone(),
                ..Default::default()
            };
            self.store
                .put_opts(&location, PutPayload::from(data.clone()), opts)
        })
        .await;

        match result {
            Ok(_) => {
                metrics.add_uploaded(size);
                tracing::debug!("Uploaded {} ({} bytes)", task.key, size);
                Ok((task.key, size))
            }
            Err(e) => {
                metrics.add_failed();
                Err(UploadFailure {
                    key: task.key,
                    error: e.to_string(),
                    attempts,
                })
            }
        }
    }
}

/// Whether a store error may succeed on a later attempt.
fn is_transient(err: &object_store::Error) -> bool {
    !matches!(
        err,
        object_store::Error::NotImplemented
            | object_store::Error::NotSupported { .. }
            | object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. }
    )
}

/// Run `op` until it succeeds, fails permanently, or `retry.max_retries`
/// retries are spent.
///
/// Returns the last result and the number of attempts made.
async fn with_retries<T, E, R, F, Fut>(
    retry: &RetryConfig,
    key: &str,
    metrics: &UploadMetrics,
    retryable: R,
    mut op: F,
) -> (std::result::Result<T, E>, usize)
where
    R: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if attempt <= retry.max_retries && retryable(&e) => {
                let backoff = retry.backoff_for(attempt);
                tracing::warn!(
                    "Upload of {} failed (attempt {}), retrying in {}ms: {}",
                    key,
                    attempt,
                    backoff,
                    e
                );
                metrics.add_retry();
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}
