//! Object store construction for the publish target.

use crate::config::PublishConfig;
use crate::error::{PipelineError, Result};
use object_store::aws::AmazonS3Builder;
use object_store::{BackoffConfig, ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Split `s3://bucket/key/prefix` into bucket and key prefix.
///
/// The key part may be empty (`s3://bucket` or `s3://bucket/`).
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri.strip_prefix("s3://").ok_or_else(|| {
        PipelineError::Config(format!("invalid S3 URI '{}': expected 's3://' prefix", uri))
    })?;

    let (bucket, key) = without_scheme.split_once('/').unwrap_or((without_scheme, ""));
    if bucket.is_empty() {
        return Err(PipelineError::Config(format!(
            "invalid S3 URI '{}': missing bucket",
            uri
        )));
    }
    Ok((bucket, key.trim_matches('/')))
}

/// HTTP client options for many small tile uploads.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(60))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(64)
}

/// HTTP-level retries for throttling and 5xx responses.
///
/// The publisher applies its own per-object policy on top of this.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        backoff: BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an authenticated S3 store for the configured bucket.
///
/// Credentials come from the standard AWS environment variables, config
/// files or instance profile. `endpoint_url` targets S3-compatible services.
pub fn create_publish_store(config: &PublishConfig) -> Result<Arc<dyn ObjectStore>> {
    let bucket = config
        .bucket
        .as_deref()
        .ok_or_else(|| PipelineError::Config("publish.bucket is not set".to_string()))?;

    tracing::info!("Creating S3 client for bucket: {}", bucket);

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config());

    if let Some(region) = &config.region {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = &config.endpoint_url {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"))
            .with_virtual_hosted_style_request(false);
    }

    let store = builder
        .build()
        .map_err(|e| PipelineError::Config(format!("failed to create S3 client: {}", e)))?;
    Ok(Arc::new(store))
}
