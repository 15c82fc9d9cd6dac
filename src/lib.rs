//! FIM Tiles
//!
//! Converts flood inundation map (FIM) extent polygons into a vector tile
//! layer and publishes it, together with a manifest, for a web map front-end.
//!
//! # Architecture
//!
//! Five stages run strictly one after another:
//!
//! - **Features**: read GeoParquet/GeoJSON extents, join the catalog, keep
//!   only the requested attributes and validate geometries
//! - **Builder**: run tippecanoe over the minimized GeoJSON into MBTiles
//! - **Exploder**: unpack the MBTiles archive into `{z}/{x}/{y}.pbf`
//! - **Publish**: upload the tree with tile headers through `object_store`
//! - **Manifest**: write `tile_manifest.json` and a VectorGrid snippet
//!
//! # Usage
//!
//! ```no_run
//! use fim_tiles::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.yaml".as_ref())?;
//!     run_pipeline(config).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod features;
pub mod io;
pub mod manifest;
pub mod publish;
pub mod serve;
pub mod tiles;


pub use config::Config;
pub use error::{PipelineError, Result};
pub use features::{load_features, LoadOptions, MinimizedFeatureSet};
pub use manifest::{emit_manifest, EmittedFiles, Manifest, SnippetOptions, TileLocation};
pub use publish::{plan_uploads, PublishOutcome, PublishReport, Publisher};
pub use tiles::{BuildRequest, ExplodeStats, TileArchive, TileBuilder, TileExploder};

use object_store::ObjectStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub features: usize,
    pub fields: Vec<String>,
    pub feature_file: PathBuf,
    pub archive: TileArchive,
    /// `None` when extraction was skipped
    pub explode: Option<ExplodeStats>,
    pub publish: PublishOutcome,
    pub manifest: Manifest,
    pub emitted: EmittedFiles,
}

/// A configured pipeline run.
pub struct Pipeline {
    config: Config,
    store: Option<Arc<dyn ObjectStore>>,
}

impl Pipeline {
    /// Validate `config` and connect to the publish bucket if one is set.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let store = match &config.publish.bucket {
            Some(_) => Some(io::create_publish_store(&config.publish)?),
            None => None,
        };
        Ok(Self { config, store })
    }

    /// Publish to `store` instead of the configured bucket's S3 client.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run every stage in order; the first failing stage ends the run.
    pub async fn run(self) -> Result<PipelineSummary> {
        let config = &self.config;
        let out = &config.output;
        let source = config
            .input
            .source
            .clone()
            .ok_or_else(|| PipelineError::Config("input.source is required".to_string()))?;

        tracing::info!("Starting FIM tile pipeline");
        std::fs::create_dir_all(&out.dir).map_err(|e| PipelineError::io(&out.dir, e))?;

        // Stage 1: features
        let feature_file = out.geojson_path();
        let features = {
            let catalog = config.input.catalog.clone();
            let options = LoadOptions {
                include: config.input.include.clone(),
                simplify_tolerance: config.input.simplify_tolerance,
            };
            let feature_file = feature_file.clone();
            let source_for_err = source.clone();
            tokio::task::spawn_blocking(move || -> Result<MinimizedFeatureSet> {
                let set = load_features(&source, catalog.as_deref(), &options)?;
                set.write_geojson(&feature_file)?;
                Ok(set)
            })
            .await
            .map_err(|e| PipelineError::Source {
                path: source_for_err,
                message: format!("feature loading task failed: {}", e),
            })??
        };
        tracing::info!(
            "Loaded {} features with fields [{}]",
            features.len(),
            features.fields().join(", ")
        );

        // Stage 2: build
        let request = BuildRequest {
            input: feature_file.clone(),
            output: out.archive_path(),
            layer_name: out.layer_name.clone(),
            min_zoom: out.min_zoom,
            max_zoom: out.max_zoom,
            fields: features.fields().to_vec(),
        };
        let archive = TileBuilder::from_config(&config.builder).build(&request).await?;

        // Stage 3: explode
        let tiles_dir = out.tiles_dir();
        let explode = if out.skip_extract {
            tracing::warn!(
                "Extraction skipped; serve {} with a tile server",
                archive.path.display()
            );
            None
        } else {
            Some(
                TileExploder::from_config(&config.extract)
                    .explode(&archive.path, &tiles_dir)
                    .await?,
            )
        };

        // Stage 4: publish
        let prefix = config.publish.key_prefix();
        let publisher = self
            .store
            .clone()
            .map(|store| Publisher::from_config(store, &config.publish));
        let mut publish = match &publisher {
            Some(publisher) => {
                let mut files = vec![feature_file.clone()];
                if explode.is_none() {
                    files.push(archive.path.clone());
                }
                let tree = explode.as_ref().map(|_| tiles_dir.as_path());
                let tasks = plan_uploads(tree, &prefix, &files)?;
                PublishOutcome::Completed(publisher.publish(tasks).await.into_result()?)
            }
            None => {
                tracing::warn!("No publish bucket configured; skipping upload");
                PublishOutcome::Skipped
            }
        };

        // Stage 5: manifest
        let location = tile_location(config, &archive.path, &tiles_dir);
        let manifest = Manifest {
            url_template: location.url_template()?,
            layer_name: archive.layer_name.clone(),
            min_zoom: archive.min_zoom,
            max_zoom: archive.max_zoom,
            attribution: config.manifest.attribution.clone(),
        };
        let emitted = emit_manifest(
            &out.dir,
            &manifest,
            &SnippetOptions {
                enabled: config.manifest.snippet,
            },
        )?;

        if let (Some(publisher), PublishOutcome::Completed(report)) = (&publisher, &mut publish) {
            let mut files = vec![emitted.manifest.clone()];
            files.extend(emitted.snippet.clone());
            let tasks = plan_uploads(None, &prefix, &files)?;
            let manifest_report = publisher.publish(tasks).await.into_result()?;
            report.uploaded.extend(manifest_report.uploaded);
            report.uploaded.sort();
            report.bytes += manifest_report.bytes;
            report.retries += manifest_report.retries;
        }

        tracing::info!("Pipeline complete: tiles at {}", manifest.url_template);

        Ok(PipelineSummary {
            features: features.len(),
            fields: features.fields().to_vec(),
            feature_file,
            archive,
            explode,
            publish,
            manifest,
            emitted,
        })
    }
}

/// Run the full pipeline with the given configuration.
pub async fn run_pipeline(config: Config) -> Result<PipelineSummary> {
    Pipeline::new(config)?.run().await
}

/// Where the manifest should point clients.
///
/// A configured CDN or bucket always wins, so a published manifest never
/// names a path on the build machine.
fn tile_location(config: &Config, archive: &Path, tiles_dir: &Path) -> TileLocation {
    let prefix = config.publish.key_prefix();
    let key = if config.output.skip_extract {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.mbtiles", config.output.layer_name));
        publish::object_key(&prefix, &name)
    } else {
        manifest::tile_tree_key(&prefix)
    };
    match (&config.publish.cdn_domain, &config.publish.bucket) {
        (Some(domain), _) => TileLocation::Cdn {
            domain: domain.clone(),
            key,
        },
        (None, Some(bucket)) => TileLocation::Bucket {
            bucket: bucket.clone(),
            key,
        },
        (None, None) if config.output.skip_extract => TileLocation::Archive {
            path: archive.to_path_buf(),
        },
        (None, None) => TileLocation::Local {
            tiles_dir: tiles_dir.to_path_buf(),
        },
    }
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
