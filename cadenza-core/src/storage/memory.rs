use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

use super::ArtifactStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredArtifact {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Process-local [`ArtifactStore`].
#[derive(Clone)]
pub struct MemoryArtifactStore {
    base_url: String,
    objects: Arc<Mutex<BTreeMap<String, StoredArtifact>>>,
}

impl fmt::Debug for MemoryArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MemoryArtifactStore");
        debug.field("base_url", &self.base_url);
        match self.objects.try_lock() {
            Ok(objects) => debug.field("objects", &objects.len()),
            Err(_) => debug.field("objects", &"<locked>"),
        };
        debug.finish()
    }
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::new("memory://artifacts/")
    }
}

impl MemoryArtifactStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            base_url,
            objects: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub async fn get(&self, key: &str) -> Option<StoredArtifact> {
        self.objects.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        self.objects.lock().await.insert(
            key.to_string(),
            StoredArtifact {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(self.public_url_for(key))
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize> {
        let mut objects = self.objects.lock().await;
        let before = objects.len();
        objects.retain(|key, _| !key.starts_with(prefix));
        Ok(before - objects.len())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.lock().await;
        Ok(objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn public_url_for(&self, key: &str) -> String {
        format!("{}{}", self.base_url, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_delete_removes_only_that_folder() {
        let store = MemoryArtifactStore::default();
        for key in [
            "artists/1/tracks/a/audio.mp3",
            "artists/1/tracks/a/waveform.json",
            "artists/1/tracks/ab/audio.mp3",
            "artists/2/tracks/a/audio.mp3",
        ] {
            store.put(key, vec![1], "audio/mpeg").await.unwrap();
        }

        let removed = store.delete_by_prefix("artists/1/tracks/a/").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            store.list("artists/").await.unwrap(),
            vec![
                "artists/1/tracks/ab/audio.mp3".to_string(),
                "artists/2/tracks/a/audio.mp3".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn put_returns_public_url() {
        let store = MemoryArtifactStore::new("https://cdn.example.com");
        let url = store
            .put("artists/1/tracks/a/audio.mp3", vec![], "audio/mpeg")
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example.com/artists/1/tracks/a/audio.mp3");
    }
}
