use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::error::{PipelineError, Result};

use super::ArtifactStore;

/// [`ArtifactStore`] writing objects below a local directory that a web
/// server publishes at `public_base_url`.
#[derive(Clone, Debug)]
pub struct FilesystemArtifactStore {
    root: PathBuf,
    public_base_url: Url,
}

impl FilesystemArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Url) -> Self {
        let mut public_base_url = public_base_url;
        if !public_base_url.path().ends_with('/') {
            let path = format!("{}/", public_base_url.path());
            public_base_url.set_path(&path);
        }
        Self {
            root: root.into(),
            public_base_url,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(PipelineError::Storage(format!(
                "refusing artifact key {key:?}"
            )));
        }
        Ok(self.root.join(relative))
    }

    /// Files below the deepest folder named by `prefix` whose key starts with
    /// `prefix`.
    async fn walk(&self, prefix: &str, include_staging: bool) -> Result<Vec<PathBuf>> {
        let start = match prefix.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => self.resolve(dir)?,
            _ => self.root.clone(),
        };
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            collect_files(&start, include_staging, &mut files)?;
            files.retain(|path| {
                staged_key_for(&root, path).is_some_and(|key| key.starts_with(&prefix))
            });
            Ok::<_, io::Error>(files)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("list task failed: {e}")))?
        .map_err(|e| PipelineError::Storage(format!("list failed: {e}")))
    }

    async fn delete_tree(&self, dir: &str) -> Result<usize> {
        let path = self.resolve(dir)?;
        let counted = path.clone();
        let files = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            collect_files(&counted, true, &mut files).map(|()| files.len())
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("count task failed: {e}")))?
        .map_err(|e| PipelineError::Storage(format!("scan {dir} failed: {e}")))?;

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!(dir, files, "removed artifact folder");
                Ok(files)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(PipelineError::Storage(format!(
                "delete {dir} failed: {e}"
            ))),
        }
    }
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::Storage(format!(
                    "create {} failed: {e}",
                    parent.display()
                ))
            })?;
        }

        // Write-then-rename: readers never see a torn object.
        let staging = staging_path(&path);
        tokio::fs::write(&staging, &bytes).await.map_err(|e| {
            PipelineError::Storage(format!("write {key} failed: {e}"))
        })?;
        tokio::fs::rename(&staging, &path).await.map_err(|e| {
            PipelineError::Storage(format!("publish {key} failed: {e}"))
        })?;

        debug!(key, content_type, size = bytes.len(), "stored artifact");
        Ok(self.public_url_for(key))
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize> {
        // A folder prefix goes in one subtree removal, staged writes included.
        if let Some(dir) = prefix.strip_suffix('/')
            && !dir.is_empty()
        {
            return self.delete_tree(dir).await;
        }

        let mut removed = 0;
        for path in self.walk(prefix, true).await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(PipelineError::Storage(format!(
                        "delete {} failed: {e}",
                        path.display()
                    )));
                }
            }
        }
        Ok(removed)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .walk(prefix, false)
            .await?
            .iter()
            .filter_map(|path| key_for(&self.root, path))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn public_url_for(&self, key: &str) -> String {
        match self.public_base_url.join(key) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}{}", self.public_base_url, key),
        }
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

fn is_staging(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "partial")
}

/// Slash-joined key of `path` relative to `root`, staging suffix kept.
fn staged_key_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    Some(
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

fn key_for(root: &Path, path: &Path) -> Option<String> {
    if is_staging(path) {
        return None;
    }
    staged_key_for(root, path)
}

fn collect_files(
    dir: &Path,
    include_staging: bool,
    out: &mut Vec<PathBuf>,
) -> io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, include_staging, out)?;
        } else if include_staging || !is_staging(&path) {
            out.push(path);
        }
    }
    Ok(())
}
