use std::io;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

/// Resolves a submitted input to its canonical path.
///
/// The pipeline deletes its inputs once a job is done with them, so only
/// regular files that resolve (symlinks included) below `upload_dir` are
/// accepted.
pub async fn resolve_staged_input(
    upload_dir: &Path,
    path: &Path,
    what: &str,
) -> Result<PathBuf> {
    let root = tokio::fs::canonicalize(upload_dir).await.map_err(|e| {
        PipelineError::Config(format!(
            "upload directory {} is unavailable: {e}",
            upload_dir.display()
        ))
    })?;

    let resolved = match tokio::fs::canonicalize(path).await {
        Ok(resolved) => resolved,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PipelineError::InvalidMedia(format!(
                "{what} {} is missing",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };

    if !resolved.starts_with(&root) {
        return Err(PipelineError::InvalidMedia(format!(
            "{what} {} is outside the upload directory",
            path.display()
        )));
    }

    if !tokio::fs::metadata(&resolved).await?.is_file() {
        return Err(PipelineError::InvalidMedia(format!(
            "{what} {} is not a file",
            path.display()
        )));
    }
    Ok(resolved)
}
