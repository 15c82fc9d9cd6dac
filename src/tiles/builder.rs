//! Adapter around the external vector tile builder (tippecanoe).

use crate::config::{BuilderConfig, MAX_SUPPORTED_ZOOM};
use crate::error::{PipelineError, Result};
use crate::io::{ensure_parent_dir, replace_file};
use crate::tiles::process::run_tool;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Flags passed on every build.
///
/// Keep every feature at every zoom where possible, drop only when a tile
/// would otherwise overflow, and let the builder assign feature ids.
const BUILD_FLAGS: &[&str] = &[
    "--force",
    "--read-parallel",
    "--no-feature-limit",
    "--no-tile-size-limit",
    "--drop-densest-as-needed",
    "--drop-smallest-as-needed",
    "--coalesce",
    "--coalesce-densest-as-needed",
    "--detect-shared-borders",
    "--extend-zooms-if-still-dropping",
    "--generate-ids",
];

/// Inputs for one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Minimized GeoJSON feature file
    pub input: PathBuf,

    /// Final archive location
    pub output: PathBuf,

    pub layer_name: String,
    pub min_zoom: u8,
    pub max_zoom: u8,

    /// Attribute whitelist, in order
    pub fields: Vec<String>,
}

/// A completed MBTiles archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileArchive {
    pub path: PathBuf,
    pub layer_name: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

/// Invokes the tile builder and publishes its archive atomically.
#[derive(Debug, Clone)]
pub struct TileBuilder {
    program: PathBuf,
    timeout: Duration,
    extra_args: Vec<String>,
}

impl TileBuilder {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(config: &BuilderConfig) -> Self {
        Self {
            program: config.program.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            extra_args: config.extra_args.clone(),
        }
    }

    /// Append extra arguments after the standard flags.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Full argument list for a build writing to `output`.
    pub fn command_args(&self, request: &BuildRequest, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-o".into(),
            output.as_os_str().to_os_string(),
            "-l".into(),
            request.layer_name.clone().into(),
            "-Z".into(),
            request.min_zoom.to_string().into(),
            "-z".into(),
            request.max_zoom.to_string().into(),
        ];
        args.push(BUILD_FLAGS[0].into());
        args.push(BUILD_FLAGS[1].into());
        args.push("--exclude-all".into());
        for field in &request.fields {
            args.push("--include".into());
            args.push(field.clone().into());
        }
        args.extend(BUILD_FLAGS[2..].iter().map(OsString::from));
        args.push(request.input.as_os_str().to_os_string());
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    /// Run the builder and move its archive to `request.output`.
    ///
    /// The builder writes to a hidden sibling file, so a failed or
    /// interrupted build never leaves a partial archive at the final path.
    pub async fn build(&self, request: &BuildRequest) -> Result<TileArchive> {
        if request.min_zoom > request.max_zoom || request.max_zoom > MAX_SUPPORTED_ZOOM {
            return Err(PipelineError::Config(format!(
                "invalid zoom range {}..={} (max supported {})",
                request.min_zoom, request.max_zoom, MAX_SUPPORTED_ZOOM
            )));
        }
        if !request.input.is_file() {
            return Err(PipelineError::io(
                &request.input,
                std::io::Error::new(std::io::ErrorKind::NotFound, "feature file not found"),
            ));
        }

        ensure_parent_dir(&request.output)?;
        let partial = partial_path(&request.output);
        remove_file_if_exists(&partial)?;

        let args = self.command_args(request, &partial);
        tracing::info!(
            "Building tiles for layer '{}' (z{}-z{}) from {}",
            request.layer_name,
            request.min_zoom,
            request.max_zoom,
            request.input.display()
        );

        let start = Instant::now();
        if let Err(e) = run_tool(&self.program, &args, self.timeout).await {
            discard_partial(&partial);
            return Err(PipelineError::Build {
                status: e.status(),
                diagnostics: e.diagnostics(),
            });
        }

        if !partial.is_file() {
            return Err(PipelineError::Build {
                status: "exit status 0".to_string(),
                diagnostics: format!("builder produced no archive at {}", partial.display()),
            });
        }
        replace_file(&partial, &request.output)?;

        tracing::info!(
            "Built {} in {:.1}s",
            request.output.display(),
            start.elapsed().as_secs_f64()
        );

        Ok(TileArchive {
            path: request.output.clone(),
            layer_name: request.layer_name.clone(),
            min_zoom: request.min_zoom,
            max_zoom: request.max_zoom,
        })
    }
}

/// `out/fim_extents.mbtiles` → `out/.fim_extents.partial.mbtiles`
fn partial_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tiles".to_string());
    output.with_file_name(format!(".{}.partial.mbtiles", stem))
}

/// Best-effort removal of a failed build's partial archive.
fn discard_partial(partial: &Path) {
    if let Err(e) = remove_file_if_exists(partial) {
        tracing::debug!("Could not remove partial archive: {}", e);
    }
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(dir: &Path) -> BuildRequest {
        BuildRequest {
            input: dir.join("fimextent.geojson"),
            output: dir.join("fim_extents.mbtiles"),
            layer_name: "fim_extents".to_string(),
            min_zoom: 3,
            max_zoom: 14,
            fields: vec!["id".to_string(), "tier".to_string(), "site".to_string()],
        }
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_command_args() {
        let builder = TileBuilder::new("tippecanoe", Duration::from_secs(60))
            .with_extra_args(vec!["--quiet".to_string()]);
        let req = request(Path::new("/out"));
        let args = strings(&builder.command_args(&req, Path::new("/out/.fim_extents.partial.mbtiles")));

        assert_eq!(
            &args[..8],
            &["-o", "/out/.fim_extents.partial.mbtiles", "-l", "fim_extents", "-Z", "3", "-z", "14"]
        );
        let include_pos = args.iter().position(|a| a == "--exclude-all").unwrap();
        assert_eq!(
            &args[include_pos + 1..include_pos + 7],
            &["--include", "id", "--include", "tier", "--include", "site"]
        );
        assert!(args.contains(&"--generate-ids".to_string()));
        assert!(args.contains(&"--no-tile-size-limit".to_string()));
        assert_eq!(args[args.len() - 2], "/out/fimextent.geojson");
        assert_eq!(args[args.len() - 1], "--quiet");
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/out/fim_extents.mbtiles")),
            PathBuf::from("/out/.fim_extents.partial.mbtiles")
        );
    }

    #[test]
    fn test_discard_partial_tolerates_missing_and_unremovable() {
        let dir = TempDir::new().unwrap();
        discard_partial(&dir.path().join(".missing.partial.mbtiles"));

        let partial = dir.path().join(".fim_extents.partial.mbtiles");
        std::fs::write(&partial, "partial").unwrap();
        discard_partial(&partial);
        assert!(!partial.exists());

        // A directory cannot be removed as a file; the error is only logged
        let stuck = dir.path().join(".stuck.partial.mbtiles");
        std::fs::create_dir(&stuck).unwrap();
        discard_partial(&stuck);
        assert!(stuck.is_dir());
    }

    #[tokio::test]
    async fn test_invalid_zoom_range() {
        let dir = TempDir::new().unwrap();
        let mut req = request(dir.path());
        req.min_zoom = 10;
        req.max_zoom = 4;
        let builder = TileBuilder::new("tippecanoe", Duration::from_secs(60));
        assert!(matches!(builder.build(&req).await, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_builder_is_build_error() {
        let dir = TempDir::new().unwrap();
        let req = request(dir.path());
        std::fs::write(&req.input, "{}").unwrap();

        let builder = TileBuilder::new(dir.path().join("no-such-tippecanoe"), Duration::from_secs(5));
        match builder.build(&req).await {
            Err(PipelineError::Build { status, .. }) => assert_eq!(status, "not found"),
            other => panic!("expected build error, got {:?}", other),
        }
        assert!(!req.output.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_build_leaves_no_archive() {
        use crate::tiles::test_fixtures::write_script;

        let dir = TempDir::new().unwrap();
        let req = request(dir.path());
        std::fs::write(&req.input, "{}").unwrap();
        let program = write_script(
            dir.path(),
            "tippecanoe",
            r#"while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then printf 'partial' > "$2"; fi
  shift
done
echo "fimextent.geojson:1: Reached EOF without all containers being closed" >&2
exit 106"#,
        );

        let builder = TileBuilder::new(program, Duration::from_secs(10));
        match builder.build(&req).await {
            Err(PipelineError::Build { status, diagnostics }) => {
                assert_eq!(status, "exit status 106");
                assert!(diagnostics.contains("Reached EOF"));
            }
            other => panic!("expected build error, got {:?}", other),
        }
        assert!(!req.output.exists());
        assert!(!partial_path(&req.output).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_build_renames_archive() {
        use crate::tiles::test_fixtures::{fake_tippecanoe, fixture_metadata, fixture_tiles, write_mbtiles};

        let dir = TempDir::new().unwrap();
        let req = request(dir.path());
        std::fs::write(&req.input, "{}").unwrap();
        let fixture = dir.path().join("fixture.mbtiles");
        write_mbtiles(&fixture, &fixture_tiles(), &fixture_metadata());

        let builder = TileBuilder::new(fake_tippecanoe(dir.path(), &fixture), Duration::from_secs(10));
        let archive = builder.build(&req).await.unwrap();

        assert_eq!(archive.path, req.output);
        assert_eq!((archive.min_zoom, archive.max_zoom), (3, 14));
        assert!(req.output.is_file());
        assert!(!partial_path(&req.output).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_timeout() {
        use crate::tiles::test_fixtures::write_script;

        let dir = TempDir::new().unwrap();
        let req = request(dir.path());
        std::fs::write(&req.input, "{}").unwrap();
        let program = write_script(dir.path(), "tippecanoe", "exec sleep 5");

        let builder = TileBuilder::new(program, Duration::from_millis(200));
        match builder.build(&req).await {
            Err(PipelineError::Build { status, .. }) => assert!(status.starts_with("timed out")),
            other => panic!("expected build error, got {:?}", other),
        }
    }
}
