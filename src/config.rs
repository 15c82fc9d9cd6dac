//! Configuration for the FIM tiling pipeline.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Highest zoom level tippecanoe accepts.
pub const MAX_SUPPORTED_ZOOM: u8 = 22;

/// Main configuration for the tiling pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Input configuration
    #[serde(default)]
    pub input: InputConfig,

    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,

    /// Tile builder (tippecanoe) configuration
    #[serde(default)]
    pub builder: BuilderConfig,

    /// Tile archive extraction configuration
    #[serde(default)]
    pub extract: ExtractConfig,

    /// Object storage publishing configuration
    #[serde(default)]
    pub publish: PublishConfig,

    /// Manifest and integration snippet configuration
    #[serde(default)]
    pub manifest: ManifestConfig,

    /// Runtime tuning
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Input data configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    /// Extent source: GeoParquet (.parquet) or GeoJSON (.geojson/.json)
    #[serde(default)]
    pub source: Option<PathBuf>,

    /// Optional catalog JSON keyed by `id`
    #[serde(default)]
    pub catalog: Option<PathBuf>,

    /// Extra fields to carry into the tiles, after `id`, `tier`, `site`
    #[serde(default)]
    pub include: Vec<String>,

    /// Topology-preserving simplification tolerance in degrees
    #[serde(default)]
    pub simplify_tolerance: Option<f64>,
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving the GeoJSON, archive, tile tree and manifest
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// Vector tile layer name shared by the archive, manifest and snippet
    #[serde(default = "default_layer_name")]
    pub layer_name: String,

    /// Minimum zoom level
    #[serde(default = "default_min_zoom")]
    pub min_zoom: u8,

    /// Maximum zoom level
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,

    /// Leave the archive packed instead of exploding it into {z}/{x}/{y}.pbf
    #[serde(default)]
    pub skip_extract: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            layer_name: default_layer_name(),
            min_zoom: default_min_zoom(),
            max_zoom: default_max_zoom(),
            skip_extract: false,
        }
    }
}

impl OutputConfig {
    /// Path of the minimized GeoJSON handed to the tile builder.
    pub fn geojson_path(&self) -> PathBuf {
        self.dir.join("fimextent.geojson")
    }

    /// Path of the packed tile archive.
    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(format!("{}.mbtiles", self.layer_name))
    }

    /// Root of the exploded tile tree.
    pub fn tiles_dir(&self) -> PathBuf {
        self.dir.join("tiles")
    }
}

/// External tile builder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// tippecanoe executable (name on PATH or absolute path)
    #[serde(default = "default_tippecanoe")]
    pub program: PathBuf,

    /// Kill the builder after this many seconds
    #[serde(default = "default_builder_timeout")]
    pub timeout_secs: u64,

    /// Extra flags appended after the standard argument list
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            program: default_tippecanoe(),
            timeout_secs: default_builder_timeout(),
            extra_args: Vec::new(),
        }
    }
}

/// How the tile archive is exploded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractMethod {
    /// Read the MBTiles SQLite database directly
    #[default]
    Native,
    /// Shell out to `mb-util`
    MbUtil,
}

/// Tile archive extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Extraction backend
    #[serde(default)]
    pub method: ExtractMethod,

    /// mb-util executable, used when method is `mb-util`
    #[serde(default = "default_mbutil")]
    pub program: PathBuf,

    /// Kill mb-util after this many seconds
    #[serde(default = "default_extract_timeout")]
    pub timeout_secs: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            method: ExtractMethod::Native,
            program: default_mbutil(),
            timeout_secs: default_extract_timeout(),
        }
    }
}

/// Object storage publishing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Target S3 bucket; publishing is skipped when unset
    #[serde(default)]
    pub bucket: Option<String>,

    /// Key prefix inside the bucket (e.g. "FIM_Database/FIM_Viz")
    #[serde(default)]
    pub prefix: Option<String>,

    /// CDN domain fronting the bucket, used for the manifest URL template
    #[serde(default)]
    pub cdn_domain: Option<String>,

    /// AWS region override (otherwise taken from the environment)
    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3 endpoint (MinIO, LocalStack, ...)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Number of concurrent uploads
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-object retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Seconds between progress reports while uploading
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            prefix: None,
            cdn_domain: None,
            region: None,
            endpoint_url: None,
            concurrency: default_concurrency(),
            retry: RetryConfig::default(),
            metrics_interval_secs: default_metrics_interval(),
        }
    }
}

impl PublishConfig {
    /// Normalized key prefix without leading or trailing slashes.
    pub fn key_prefix(&self) -> String {
        self.prefix
            .as_deref()
            .unwrap_or("")
            .trim_matches('/')
            .to_string()
    }
}

/// Retry configuration for transient upload failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the first try
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff_for(&self, attempt: usize) -> u64 {
        let shift = attempt.saturating_sub(1).min(32) as u32;
        self.initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms)
    }
}

/// Manifest configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Attribution string shown by the map client
    #[serde(default)]
    pub attribution: Option<String>,

    /// Write the front-end integration snippet next to the manifest
    #[serde(default = "default_true")]
    pub snippet: bool,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            attribution: None,
            snippet: true,
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of Tokio worker threads (None = num CPUs)
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Invalid JSON config {}", path.display()))?,
            // YAML also covers extension-less files and JSON documents
            _ => serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid YAML config {}", path.display()))?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        use crate::PipelineError::Config as Invalid;

        if self.input.source.is_none() {
            return Err(Invalid("input.source is required".to_string()));
        }
        if let Some(tol) = self.input.simplify_tolerance {
            if !(tol >= 0.0 && tol.is_finite()) {
                return Err(Invalid(format!(
                    "input.simplify_tolerance must be a non-negative number, got {}",
                    tol
                )));
            }
        }

        let layer = &self.output.layer_name;
        if layer.is_empty()
            || !layer
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Invalid(format!(
                "output.layer_name must be non-empty and use only [A-Za-z0-9_-], got '{}'",
                layer
            )));
        }
        if self.output.min_zoom > self.output.max_zoom {
            return Err(Invalid(format!(
                "min_zoom ({}) must be <= max_zoom ({})",
                self.output.min_zoom, self.output.max_zoom
            )));
        }
        if self.output.max_zoom > MAX_SUPPORTED_ZOOM {
            return Err(Invalid(format!(
                "max_zoom must be <= {}, got {}",
                MAX_SUPPORTED_ZOOM, self.output.max_zoom
            )));
        }

        if self.builder.timeout_secs == 0 || self.extract.timeout_secs == 0 {
            return Err(Invalid("tool timeouts must be > 0".to_string()));
        }

        if self.publish.concurrency == 0 || self.publish.concurrency > 64 {
            return Err(Invalid(format!(
                "publish.concurrency must be 1-64, got {}",
                self.publish.concurrency
            )));
        }
        if self.publish.bucket.is_none()
            && (self.publish.prefix.is_some() || self.publish.cdn_domain.is_some())
        {
            return Err(Invalid(
                "publish.prefix and publish.cdn_domain require publish.bucket".to_string(),
            ));
        }
        if matches!(&self.publish.bucket, Some(b) if b.trim().is_empty()) {
            return Err(Invalid("publish.bucket must not be empty".to_string()));
        }
        if self.publish.retry.initial_backoff_ms > self.publish.retry.max_backoff_ms {
            return Err(Invalid(
                "retry.initial_backoff_ms must be <= retry.max_backoff_ms".to_string(),
            ));
        }
        if self.publish.metrics_interval_secs == 0 {
            return Err(Invalid("publish.metrics_interval_secs must be > 0".to_string()));
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_output_dir() -> PathBuf { PathBuf::from("out_tiles") }
fn default_layer_name() -> String { "fim_extents".to_string() }
fn default_min_zoom() -> u8 { 3 }
fn default_max_zoom() -> u8 { 14 }
fn default_tippecanoe() -> PathBuf { PathBuf::from("tippecanoe") }
fn default_builder_timeout() -> u64 { 3600 }
fn default_mbutil() -> PathBuf { PathBuf::from("mb-util") }
fn default_extract_timeout() -> u64 { 1800 }
fn default_concurrency() -> usize { 8 }
fn default_metrics_interval() -> u64 { 10 }
fn default_max_retries() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10000 }
fn default_true() -> bool { true }

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.input.source = Some(PathBuf::from("extents.parquet"));
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.output.layer_name, "fim_extents");
        assert_eq!(config.output.min_zoom, 3);
        assert_eq!(config.output.max_zoom, 14);
        assert_eq!(config.extract.method, ExtractMethod::Native);
        assert_eq!(config.publish.concurrency, 8);
        assert!(config.manifest.snippet);
    }

    #[test]
    fn test_output_paths() {
        let mut output = OutputConfig::default();
        output.dir = PathBuf::from("/tmp/out");
        assert_eq!(output.geojson_path(), PathBuf::from("/tmp/out/fimextent.geojson"));
        assert_eq!(output.archive_path(), PathBuf::from("/tmp/out/fim_extents.mbtiles"));
        assert_eq!(output.tiles_dir(), PathBuf::from("/tmp/out/tiles"));
    }

    #[test]
    fn test_config_validation_ok() {
        assert!(valid_config().validate().is_ok());

        let mut config = valid_config();
        config.publish.bucket = Some("sdmlab".to_string());
        config.publish.prefix = Some("FIM_Database/FIM_Viz".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zoom() {
        let mut config = valid_config();
        config.output.min_zoom = 10;
        config.output.max_zoom = 5;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.output.max_zoom = 23;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.output.min_zoom = 0;
        config.output.max_zoom = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid() {
        assert!(Config::default().validate().is_err());

        let mut config = valid_config();
        config.publish.prefix = Some("tiles".to_string());
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.output.layer_name = "fim extents".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.publish.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.input.simplify_tolerance = Some(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_prefix_normalized() {
        let mut publish = PublishConfig::default();
        assert_eq!(publish.key_prefix(), "");
        publish.prefix = Some("/FIM_Database/FIM_Viz/".to_string());
        assert_eq!(publish.key_prefix(), "FIM_Database/FIM_Viz");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(retry.backoff_for(1), 100);
        assert_eq!(retry.backoff_for(2), 200);
        assert_eq!(retry.backoff_for(3), 350);
        assert_eq!(retry.backoff_for(60), 350);
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
input:
  source: extents.parquet
  include: [tif_url, json_url]
output:
  max_zoom: 12
extract:
  method: mb-util
publish:
  bucket: sdmlab
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.input.include, vec!["tif_url", "json_url"]);
        assert_eq!(config.output.min_zoom, 3);
        assert_eq!(config.output.max_zoom, 12);
        assert_eq!(config.extract.method, ExtractMethod::MbUtil);
        assert_eq!(config.publish.retry.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = valid_config();
        let yaml = config.to_yaml().unwrap();
        let back = Config::from_yaml(&yaml).unwrap();
        assert_eq!(back.output.layer_name, config.output.layer_name);
        assert_eq!(back.input.source, config.input.source);
    }

    #[test]
    fn test_from_json() {
        let json = r#"{"input": {"source": "extents.geojson"}, "output": {"skip_extract": true}}"#;
        let config = Config::from_json(json).unwrap();
        assert!(config.output.skip_extract);
        assert!(config.validate().is_ok());
    }
}
