use std::path::{Path, PathBuf};

use rand::{Rng, distr::Alphanumeric};
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::JobId;

const SUFFIX_LEN: usize = 8;

/// Local intermediates of one job attempt.
///
/// Files are named `{stage}-{jobId}-{random}.{ext}` inside the work dir so
/// attempts of different jobs (and retries of the same one) never collide.
#[derive(Debug)]
pub struct JobScratch {
    dir: PathBuf,
    job_id: JobId,
    suffix: String,
    files: Vec<PathBuf>,
}

impl JobScratch {
    pub async fn create(work_dir: &Path, job_id: JobId) -> Result<Self> {
        tokio::fs::create_dir_all(work_dir).await?;
        let suffix = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SUFFIX_LEN)
            .map(char::from)
            .collect::<String>()
            .to_ascii_lowercase();
        Ok(Self {
            dir: work_dir.to_path_buf(),
            job_id,
            suffix,
            files: Vec::new(),
        })
    }

    /// Reserves a path for `stage`. Nothing is created on disk.
    pub fn path(&mut self, stage: &str, extension: &str) -> PathBuf {
        let path = self
            .dir
            .join(format!("{stage}-{}-{}.{extension}", self.job_id, self.suffix));
        self.files.push(path.clone());
        path
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.files
    }

    /// Deletes one intermediate as soon as its consumer has finished.
    pub async fn discard(&mut self, path: &Path) {
        remove_quietly(path).await;
        self.files.retain(|tracked| tracked != path);
    }

    /// Best-effort removal of everything still tracked.
    pub async fn cleanup(&mut self) -> usize {
        let mut removed = 0;
        for path in self.files.drain(..) {
            if remove_quietly(&path).await {
                removed += 1;
            }
        }
        removed
    }

    /// Removes intermediates any attempt of `job_id` left in `work_dir`.
    /// Used when the worker that owned them is gone.
    pub async fn sweep(work_dir: &Path, job_id: JobId) -> usize {
        let marker = format!("-{job_id}-");
        let mut entries = match tokio::fs::read_dir(work_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(err) => {
                warn!(dir = %work_dir.display(), error = %err, "cannot sweep work dir");
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(dir = %work_dir.display(), error = %err, "work dir sweep interrupted");
                    break;
                }
            };
            let name = entry.file_name();
            if name.to_string_lossy().contains(&marker)
                && remove_quietly(&entry.path()).await
            {
                removed += 1;
            }
        }
        removed
    }
}

/// Deletes a file, treating "already gone" as success. Returns whether a
/// file was actually removed.
pub async fn remove_quietly(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed local file");
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to remove local file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paths_carry_stage_job_and_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = JobId::new();
        let mut scratch = JobScratch::create(dir.path(), job_id).await.unwrap();

        let truncated = scratch.path("truncated", "mp3");
        let name = truncated.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("truncated-{job_id}-")));
        assert!(name.ends_with(".mp3"));
        assert_eq!(scratch.tracked().len(), 1);
    }

    #[tokio::test]
    async fn attempts_of_the_same_job_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = JobId::new();
        let mut first = JobScratch::create(dir.path(), job_id).await.unwrap();
        let mut second = JobScratch::create(dir.path(), job_id).await.unwrap();
        assert_ne!(first.path("compressed", "mp3"), second.path("compressed", "mp3"));
    }

    #[tokio::test]
    async fn cleanup_removes_existing_and_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut scratch = JobScratch::create(dir.path(), JobId::new()).await.unwrap();
        let written = scratch.path("waveform", "json");
        let _never_written = scratch.path("timestamps", "json");
        tokio::fs::write(&written, b"[]").await.unwrap();

        assert_eq!(scratch.cleanup().await, 1);
        assert!(!written.exists());
        assert!(scratch.tracked().is_empty());
    }

    #[tokio::test]
    async fn discard_forgets_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut scratch = JobScratch::create(dir.path(), JobId::new()).await.unwrap();
        let truncated = scratch.path("truncated", "mp3");
        tokio::fs::write(&truncated, b"x").await.unwrap();

        scratch.discard(&truncated).await;
        assert!(!truncated.exists());
        assert!(scratch.tracked().is_empty());
    }

    #[tokio::test]
    async fn sweep_only_touches_the_given_job() {
        let dir = tempfile::tempdir().unwrap();
        let stalled = JobId::new();
        let other = JobId::new();
        let mut a = JobScratch::create(dir.path(), stalled).await.unwrap();
        let mut b = JobScratch::create(dir.path(), other).await.unwrap();
        let left_behind = a.path("compressed", "mp3");
        let unrelated = b.path("compressed", "mp3");
        tokio::fs::write(&left_behind, b"x").await.unwrap();
        tokio::fs::write(&unrelated, b"x").await.unwrap();

        assert_eq!(JobScratch::sweep(dir.path(), stalled).await, 1);
        assert!(!left_behind.exists());
        assert!(unrelated.exists());
    }
}
