//! FIM Tiles CLI
//!
//! Turn FIM extent polygons into published vector tiles.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fim_tiles::config::ExtractMethod;
use fim_tiles::{build_runtime, io, run_pipeline, serve, Config, PipelineError, PublishOutcome};

#[derive(Parser)]
#[command(name = "fim-tiles")]
#[command(about = "Convert FIM extents into vector tiles and publish them", long_about = None)]
struct Cli {
    /// Path to a YAML or JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, explode and publish tiles (default if no command specified)
    Convert(ConvertArgs),

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "fim-tiles.yaml")]
        output: PathBuf,
    },

    /// Serve an exploded tile directory over HTTP for local preview
    Serve {
        /// Tile directory (defaults to `<output.dir>/tiles`)
        #[arg(long)]
        dir: Option<PathBuf>,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value_t = 8000)]
        port: u16,
    },
}

/// Flags that override the configuration file.
#[derive(Args, Default)]
struct ConvertArgs {
    /// Extents as GeoParquet or GeoJSON
    #[arg(long, aliases = ["parquet", "geojson-in"])]
    source: Option<PathBuf>,

    /// Catalog JSON keyed by id
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Extra fields to keep (e.g. tif_url json_url)
    #[arg(long, num_args = 1..)]
    include: Vec<String>,

    #[arg(long)]
    out_dir: Option<PathBuf>,

    #[arg(long)]
    min_zoom: Option<u8>,

    #[arg(long)]
    max_zoom: Option<u8>,

    #[arg(long)]
    layer_name: Option<String>,

    /// Keep the MBTiles archive unexploded
    #[arg(long)]
    skip_extract: bool,

    /// Extract with an external mb-util binary
    #[arg(long)]
    mb_util: bool,

    /// Target bucket, or `s3://bucket/prefix`
    #[arg(long, alias = "s3-bucket")]
    bucket: Option<String>,

    #[arg(long, alias = "s3-prefix")]
    prefix: Option<String>,

    #[arg(long)]
    cdn_domain: Option<String>,

    /// Concurrent uploads
    #[arg(long)]
    concurrency: Option<usize>,

    /// Topology-preserving simplification tolerance (degrees)
    #[arg(long)]
    simplify: Option<f64>,
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        None => convert_command(cli.config, ConvertArgs::default()),
        Some(Commands::Convert(args)) => convert_command(cli.config, args),
        Some(Commands::Validate) => validate_command(cli.config),
        Some(Commands::GenerateConfig { output }) => generate_config_command(output),
        Some(Commands::Serve { dir, host, port }) => serve_command(cli.config, dir, &host, port),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report_error(&e),
    }
}

/// Print `err` and map it to the process exit status.
fn report_error(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::Upload { failed }) => {
            eprintln!("error: {} object(s) failed to upload:", failed.len());
            for key in failed {
                eprintln!("  {}", key);
            }
        }
        Some(pipeline_err) => eprintln!("error: {}", pipeline_err),
        None => eprintln!("error: {:#}", err),
    }
    ExitCode::from(exit_status(err))
}

fn exit_status(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<PipelineError>()
        .map_or(1, PipelineError::exit_code)
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .map_err(|e| PipelineError::Config(format!("{:#}", e)).into()),
        None => Ok(Config::default()),
    }
}

fn apply_overrides(config: &mut Config, args: ConvertArgs) -> Result<()> {
    if let Some(source) = args.source {
        config.input.source = Some(source);
    }
    if let Some(catalog) = args.catalog {
        config.input.catalog = Some(catalog);
    }
    if !args.include.is_empty() {
        config.input.include = args.include;
    }
    if let Some(tol) = args.simplify {
        config.input.simplify_tolerance = Some(tol);
    }
    if let Some(dir) = args.out_dir {
        config.output.dir = dir;
    }
    if let Some(z) = args.min_zoom {
        config.output.min_zoom = z;
    }
    if let Some(z) = args.max_zoom {
        config.output.max_zoom = z;
    }
    if let Some(name) = args.layer_name {
        config.output.layer_name = name;
    }
    if args.skip_extract {
        config.output.skip_extract = true;
    }
    if args.mb_util {
        config.extract.method = ExtractMethod::MbUtil;
    }
    if let Some(bucket) = args.bucket {
        if bucket.starts_with("s3://") {
            let (name, prefix) = io::parse_s3_uri(&bucket)?;
            config.publish.bucket = Some(name.to_string());
            if !prefix.is_empty() {
                config.publish.prefix = Some(prefix.to_string());
            }
        } else {
            config.publish.bucket = Some(bucket);
        }
    }
    if let Some(prefix) = args.prefix {
        config.publish.prefix = Some(prefix);
    }
    if let Some(domain) = args.cdn_domain {
        config.publish.cdn_domain = Some(domain);
    }
    if let Some(c) = args.concurrency {
        config.publish.concurrency = c;
    }
    Ok(())
}

fn convert_command(config_path: Option<PathBuf>, args: ConvertArgs) -> Result<()> {
    let mut config = load_config(config_path.as_ref())?;
    apply_overrides(&mut config, args)?;
    config.validate()?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.runtime.worker_threads)?;
    let summary = runtime.block_on(async { run_pipeline(config).await })?;

    println!("\n=== Pipeline Summary ===");
    println!("Features: {} ({})", summary.features, summary.fields.join(", "));
    println!("Feature file: {}", summary.feature_file.display());
    println!(
        "Archive: {} (layer '{}', z{}-z{})",
        summary.archive.path.display(),
        summary.archive.layer_name,
        summary.archive.min_zoom,
        summary.archive.max_zoom
    );
    match &summary.explode {
        Some(stats) => println!("Tiles: {} ({} compressed)", stats.tiles, stats.compressed),
        None => println!("Tiles: extraction skipped"),
    }
    match &summary.publish {
        PublishOutcome::Completed(report) => println!(
            "Published: {} objects, {:.2} MB, {} retries",
            report.uploaded.len(),
            report.bytes as f64 / (1024.0 * 1024.0),
            report.retries
        ),
        PublishOutcome::Skipped => println!("Published: skipped (no bucket)"),
    }
    println!("Manifest: {}", summary.emitted.manifest.display());
    println!("URL template: {}", summary.manifest.url_template);
    println!("========================\n");

    Ok(())
}

fn validate_command(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.as_ref())?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn serve_command(config_path: Option<PathBuf>, dir: Option<PathBuf>, host: &str, port: u16) -> Result<()> {
    let root = match dir {
        Some(dir) => dir,
        None => load_config(config_path.as_ref())?.output.tiles_dir(),
    };
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| PipelineError::Config(format!("invalid listen address {}:{}: {}", host, port, e)))?;

    let runtime = build_runtime(None)?;
    runtime.block_on(serve::serve(root, addr))?;
    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# FIM Tiles Configuration

# === INPUT: Extents to tile ===
input:
  # GeoParquet (.parquet) or GeoJSON (.geojson) with id, tier, site, geometry
  source: "FIM_extents.parquet"

  # Optional catalog keyed by id, merged with a left join
  # catalog: "catalog_core.json"

  # Extra fields to keep after id, tier, site
  include: []
  # include: [tif_url, json_url]

  # Topology-preserving simplification in degrees (omit to keep geometry as-is)
  # simplify_tolerance: 0.0001

# === OUTPUT: Local files ===
output:
  dir: "out_tiles"

  # Vector tile layer name, also written to the manifest
  layer_name: "fim_extents"

  min_zoom: 3
  max_zoom: 14

  # Keep the .mbtiles archive instead of exploding it into {z}/{x}/{y}.pbf
  skip_extract: false

# === BUILDER: tippecanoe ===
builder:
  program: "tippecanoe"
  timeout_secs: 3600
  extra_args: []

# === EXTRACT: MBTiles to directory tree ===
extract:
  # native reads the archive directly; mb-util shells out
  method: native
  program: "mb-util"
  timeout_secs: 1800

# === PUBLISH: Object storage (omit bucket to skip uploading) ===
publish:
  # bucket: "my-fim-bucket"
  # prefix: "fim/tiles/v1"
  # cdn_domain: "d111111abcdef8.cloudfront.net"
  # region: "us-east-1"
  # endpoint_url: "http://localhost:9000"

  # Concurrent uploads (1-64)
  concurrency: 8

  # Progress log interval
  metrics_interval_secs: 10

  # Per-object retries with exponential backoff
  retry:
    max_retries: 3
    initial_backoff_ms: 100
    max_backoff_ms: 10000

# === MANIFEST ===
manifest:
  # attribution: "NOAA OWP"
  snippet: true

# === RUNTIME ===
runtime:
  # Tokio worker threads (null = num CPUs)
  # worker_threads: 8
"#;

fn generate_config_command(output: PathBuf) -> Result<()> {
    io::write_atomic(&output, SAMPLE_CONFIG.as_bytes())?;
    println!("Generated sample configuration at: {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        let cli = Cli::try_parse_from(["fim-tiles"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_parse_convert() {
        let cli = Cli::try_parse_from([
            "fim-tiles",
            "convert",
            "--source",
            "FIM_extents.parquet",
            "--include",
            "tif_url",
            "json_url",
            "--bucket",
            "s3://fim-data/fim/v1",
            "--max-zoom",
            "12",
        ])
        .unwrap();

        let Some(Commands::Convert(args)) = cli.command else {
            panic!("expected convert");
        };
        let mut config = Config::default();
        apply_overrides(&mut config, args).unwrap();

        assert_eq!(config.input.source, Some(PathBuf::from("FIM_extents.parquet")));
        assert_eq!(config.input.include, vec!["tif_url", "json_url"]);
        assert_eq!(config.publish.bucket.as_deref(), Some("fim-data"));
        assert_eq!(config.publish.prefix.as_deref(), Some("fim/v1"));
        assert_eq!(config.output.max_zoom, 12);
        assert_eq!(config.output.min_zoom, 3);
    }

    #[test]
    fn test_cli_legacy_aliases() {
        let cli = Cli::try_parse_from([
            "fim-tiles",
            "convert",
            "--geojson-in",
            "FIM_extents.geojson",
            "--s3-bucket",
            "fim-data",
            "--s3-prefix",
            "tiles",
        ])
        .unwrap();
        let Some(Commands::Convert(args)) = cli.command else {
            panic!("expected convert");
        };
        let mut config = Config::default();
        apply_overrides(&mut config, args).unwrap();
        assert_eq!(config.input.source, Some(PathBuf::from("FIM_extents.geojson")));
        assert_eq!(config.publish.prefix.as_deref(), Some("tiles"));
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["fim-tiles", "validate", "-c", "test.json"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_serve() {
        let cli = Cli::try_parse_from(["fim-tiles", "serve", "--dir", "out_tiles/tiles", "-p", "9000"]).unwrap();
        match cli.command {
            Some(Commands::Serve { dir, port, host }) => {
                assert_eq!(dir, Some(PathBuf::from("out_tiles/tiles")));
                assert_eq!(port, 9000);
                assert_eq!(host, "127.0.0.1");
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.output.layer_name, "fim_extents");
        assert_eq!(config.publish.retry.max_retries, 3);
    }

    #[test]
    fn test_exit_codes() {
        let upload: anyhow::Error = PipelineError::Upload {
            failed: vec!["fim/tiles/3/1/2.pbf".to_string()],
        }
        .into();
        assert_eq!(exit_status(&upload), 5);

        let not_found: anyhow::Error = PipelineError::NotFound {
            fields: vec!["bogus".to_string()],
        }
        .into();
        assert_eq!(exit_status(&not_found), 2);

        let config = load_config(Some(&PathBuf::from("/nonexistent/fim-tiles.yaml"))).unwrap_err();
        assert_eq!(exit_status(&config), 2);

        assert_eq!(exit_status(&anyhow::anyhow!("boom")), 1);
    }
}
