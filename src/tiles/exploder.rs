//! Explode an MBTiles archive into a `{z}/{x}/{y}.pbf` directory tree.

use crate::config::{ExtractConfig, ExtractMethod};
use crate::error::{PipelineError, Result};
use crate::io::{remove_dir_if_exists, replace_file, write_atomic};
use crate::tiles::coord::{TileCoord, TILE_EXTENSION};
use crate::tiles::process::run_tool;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// Archive metadata file written next to the tiles.
pub const METADATA_FILE: &str = "metadata.json";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Tiles between progress log lines.
const PROGRESS_EVERY: u64 = 10_000;

/// Result of exploding an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExplodeStats {
    /// Tiles written
    pub tiles: u64,

    /// Bytes written (after compression)
    pub bytes: u64,

    /// Tiles that were not gzip and had to be compressed
    pub compressed: u64,

    /// Tile count per zoom level
    pub per_zoom: BTreeMap<u8, u64>,
}

impl ExplodeStats {
    fn record(&mut self, z: u8, bytes: usize, compressed: bool) {
        self.tiles += 1;
        self.bytes += bytes as u64;
        if compressed {
            self.compressed += 1;
        }
        *self.per_zoom.entry(z).or_default() += 1;
    }
}

/// Extracts tile archives with the configured method.
#[derive(Debug, Clone)]
pub struct TileExploder {
    method: ExtractMethod,
    program: PathBuf,
    timeout: Duration,
}

impl TileExploder {
    /// Read the archive directly.
    pub fn native() -> Self {
        Self {
            method: ExtractMethod::Native,
            program: PathBuf::from("mb-util"),
            timeout: Duration::from_secs(1800),
        }
    }

    /// Delegate extraction to an external `mb-util` binary.
    pub fn mb_util(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            method: ExtractMethod::MbUtil,
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ExtractConfig) -> Self {
        Self {
            method: config.method,
            program: config.program.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Explode `archive` into `out_dir`.
    ///
    /// Tiles are first written into a staging directory. Only once
    /// extraction succeeds is each staged file renamed over its counterpart
    /// in `out_dir`; files in `out_dir` that the archive does not produce are
    /// left alone.
    pub async fn explode(&self, archive: &Path, out_dir: &Path) -> Result<ExplodeStats> {
        if !archive.is_file() {
            return Err(extraction_err(archive, "archive not found"));
        }

        let staging = staging_dir(out_dir);
        remove_dir_if_exists(&staging)?;

        let start = Instant::now();
        let result = match self.method {
            ExtractMethod::Native => {
                let archive_owned = archive.to_path_buf();
                let staging_owned = staging.clone();
                tokio::task::spawn_blocking(move || explode_native(&archive_owned, &staging_owned))
                    .await
                    .map_err(|e| extraction_err(archive, format!("extraction task failed: {}", e)))
                    .and_then(|r| r)
            }
            ExtractMethod::MbUtil => self.explode_mb_util(archive, &staging).await,
        };

        let stats = match result {
            Ok(stats) => stats,
            Err(e) => {
                discard_staging(&staging);
                return Err(e);
            }
        };

        let staging_owned = staging.clone();
        let out_owned = out_dir.to_path_buf();
        let merged = tokio::task::spawn_blocking(move || merge_tree(&staging_owned, &out_owned))
            .await
            .map_err(|e| extraction_err(archive, format!("merge task failed: {}", e)))
            .and_then(|r| r);
        discard_staging(&staging);
        merged?;

        tracing::info!(
            "Exploded {} tiles ({} gzip-compressed, {:.1} MB) into {} in {:.1}s",
            stats.tiles,
            stats.compressed,
            stats.bytes as f64 / (1024.0 * 1024.0),
            out_dir.display(),
            start.elapsed().as_secs_f64()
        );
        Ok(stats)
    }

    async fn explode_mb_util(&self, archive: &Path, staging: &Path) -> Result<ExplodeStats> {
        // mb-util refuses to write into an existing directory
        let args: Vec<OsString> = vec![
            "--image_format=pbf".into(),
            archive.as_os_str().to_os_string(),
            staging.as_os_str().to_os_string(),
        ];
        run_tool(&self.program, &args, self.timeout)
            .await
            .map_err(|e| extraction_err(archive, format!("{}: {}", e, e.diagnostics())))?;

        let archive_owned = archive.to_path_buf();
        let staging_owned = staging.to_path_buf();
        tokio::task::spawn_blocking(move || normalize_tree(&archive_owned, &staging_owned))
            .await
            .map_err(|e| extraction_err(archive, format!("extraction task failed: {}", e)))?
    }
}

/// Read every tile from the archive and write it under `out_dir`.
fn explode_native(archive: &Path, out_dir: &Path) -> Result<ExplodeStats> {
    let conn = open_archive(archive)?;
    let metadata = read_metadata(&conn, archive)?;
    if let Some(format) = metadata.get("format").filter(|f| f.as_str() != TILE_EXTENSION) {
        tracing::warn!("Archive format is '{}', expected '{}'", format, TILE_EXTENSION);
    }

    let sql_err = |e: rusqlite::Error| extraction_err(archive, e.to_string());

    let mut stmt = conn
        .prepare("SELECT zoom_level, tile_column, tile_row, tile_data FROM tiles")
        .map_err(sql_err)?;
    let mut rows = stmt.query([]).map_err(sql_err)?;

    let mut stats = ExplodeStats::default();
    let mut created: HashSet<PathBuf> = HashSet::new();

    while let Some(row) = rows.next().map_err(sql_err)? {
        let z: i64 = row.get(0).map_err(sql_err)?;
        let x: i64 = row.get(1).map_err(sql_err)?;
        let tms_row: i64 = row.get(2).map_err(sql_err)?;
        let data: Vec<u8> = row.get(3).map_err(sql_err)?;

        let tile = TileCoord::from_tms(z, x, tms_row).ok_or_else(|| {
            extraction_err(archive, format!("tile z={} x={} row={} is out of range", z, x, tms_row))
        })?;

        let (payload, compressed) = ensure_gzip(data).map_err(|e| extraction_err(archive, e.to_string()))?;
        let path = out_dir.join(tile.relative_path());
        if let Some(parent) = path.parent() {
            if created.insert(parent.to_path_buf()) {
                std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
            }
        }
        std::fs::write(&path, &payload).map_err(|e| PipelineError::io(&path, e))?;

        stats.record(tile.z, payload.len(), compressed);
        if stats.tiles % PROGRESS_EVERY == 0 {
            tracing::debug!("Exploded {} tiles", stats.tiles);
        }
    }

    write_metadata(out_dir, &metadata)?;
    Ok(stats)
}

/// Gzip loose tiles left by mb-util and rewrite metadata deterministically.
fn normalize_tree(archive: &Path, out_dir: &Path) -> Result<ExplodeStats> {
    let mut stats = ExplodeStats::default();

    for entry in WalkDir::new(out_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| extraction_err(archive, e.to_string()))?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|e| e.to_str()) != Some(TILE_EXTENSION)
        {
            continue;
        }

        let z = path
            .strip_prefix(out_dir)
            .ok()
            .and_then(|rel| rel.components().next())
            .and_then(|c| c.as_os_str().to_str())
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or_else(|| extraction_err(archive, format!("unexpected tile path {}", path.display())))?;

        let data = std::fs::read(path).map_err(|e| PipelineError::io(path, e))?;
        let (payload, compressed) = ensure_gzip(data).map_err(|e| extraction_err(archive, e.to_string()))?;
        if compressed {
            std::fs::write(path, &payload).map_err(|e| PipelineError::io(path, e))?;
        }
        stats.record(z, payload.len(), compressed);
    }

    let conn = open_archive(archive)?;
    let metadata = read_metadata(&conn, archive)?;
    write_metadata(out_dir, &metadata)?;
    Ok(stats)
}

/// Rename every file under `staging` to the same relative path under `out_dir`.
fn merge_tree(staging: &Path, out_dir: &Path) -> Result<()> {
    let mut created: HashSet<PathBuf> = HashSet::new();
    for entry in WalkDir::new(staging).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(staging).to_path_buf();
            PipelineError::io(&path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(staging) else {
            continue;
        };
        let target = out_dir.join(rel);
        if let Some(parent) = target.parent() {
            if created.insert(parent.to_path_buf()) {
                std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
            }
        }
        replace_file(entry.path(), &target)?;
    }
    Ok(())
}

fn open_archive(archive: &Path) -> Result<Connection> {
    Connection::open_with_flags(archive, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| extraction_err(archive, format!("cannot open MBTiles archive: {}", e)))
}

/// `name`/`value` pairs from the archive's `metadata` table, sorted by name.
pub fn read_metadata(conn: &Connection, archive: &Path) -> Result<BTreeMap<String, String>> {
    let sql_err = |e: rusqlite::Error| extraction_err(archive, format!("invalid MBTiles metadata: {}", e));

    let mut stmt = conn.prepare("SELECT name, value FROM metadata").map_err(sql_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })
        .map_err(sql_err)?;

    let mut metadata = BTreeMap::new();
    for row in rows {
        let (name, value) = row.map_err(sql_err)?;
        metadata.insert(name, value.unwrap_or_default());
    }
    Ok(metadata)
}

fn write_metadata(out_dir: &Path, metadata: &BTreeMap<String, String>) -> Result<()> {
    let path = out_dir.join(METADATA_FILE);
    let json = serde_json::to_vec_pretty(metadata).map_err(|e| PipelineError::Source {
        path: path.clone(),
        message: e.to_string(),
    })?;
    write_atomic(&path, &json)
}

/// Return `data` gzip-compressed, and whether compression was applied.
///
/// Payloads already carrying the gzip magic bytes are passed through. The
/// gzip header carries no timestamp so output is byte-for-byte repeatable.
pub fn ensure_gzip(data: Vec<u8>) -> std::io::Result<(Vec<u8>, bool)> {
    if data.starts_with(&GZIP_MAGIC) {
        return Ok((data, false));
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::default());
    encoder.write_all(&data)?;
    Ok((encoder.finish()?, true))
}

/// Whether `data` starts with the gzip magic bytes.
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

fn discard_staging(staging: &Path) {
    if let Err(e) = remove_dir_if_exists(staging) {
        tracing::debug!("Could not remove staging directory: {}", e);
    }
}

fn staging_dir(out_dir: &Path) -> PathBuf {
    let name = out_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tiles".to_string());
    out_dir.with_file_name(format!(".{}.staging", name))
}

fn extraction_err(archive: &Path, message: impl Into<String>) -> PipelineError {
    PipelineError::Extraction {
        archive: archive.to_path_buf(),
        message: message.into(),
    }
}
