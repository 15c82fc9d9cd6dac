//! Local filesystem helpers.

use crate::error::{PipelineError, Result};
use std::path::{Path, PathBuf};

/// Sibling temp path used while `path` is being written.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

/// Write `bytes` to `path` through a temp file and rename.
///
/// Readers never observe a partially written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp = temp_path_for(path);
    if let Err(e) = std::fs::write(&tmp, bytes) {
        discard_temp(&tmp);
        return Err(PipelineError::io(&tmp, e));
    }
    replace_file(&tmp, path)
}

/// Move `from` over `to`, removing `from` if the rename fails.
pub fn replace_file(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to).map_err(|e| {
        discard_temp(from);
        PipelineError::io(to, e)
    })
}

fn discard_temp(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!("Could not remove {}: {}", path.display(), e);
        }
    }
}

/// Create the parent directory of `path` if needed.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))
        }
        _ => Ok(()),
    }
}

/// Remove a directory tree if it exists.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}
