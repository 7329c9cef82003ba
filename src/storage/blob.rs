//! Blob store contract and object-key layout.
//!
//! Audio artifacts land under `audio/{yyyy}/{mm}/{base}_{bucket}_v{NN}.mp3`
//! where `bucket` is the submission's character count floored to the
//! nearest hundred and `NN` is the zero-padded version (01–99). The HTTP
//! implementation talks to a supabase-style storage API; the filesystem
//! implementation backs local deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use std::path::PathBuf;

use crate::config::StorageConfig;
use crate::error::SynthError;

/// Versions are two digits; the hundredth upload of the same text is an
/// error rather than a silently colliding key.
pub const MAX_AUDIO_VERSIONS: u32 = 99;

/// Write-once blob publishing.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return a URL for it.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        public_read: bool,
    ) -> Result<String, SynthError>;
}

/// Object key for an audio artifact.
pub fn audio_object_key(
    text_id: &str,
    char_count: usize,
    version: u32,
    at: DateTime<Utc>,
) -> String {
    let bucket = (char_count / 100) * 100;
    format!(
        "audio/{:04}/{:02}/{}_{}_v{:02}.mp3",
        at.year(),
        at.month(),
        text_id,
        bucket,
        version
    )
}

/// Download filename recorded alongside the object key.
pub fn audio_filename(text_id: &str, version: u32) -> String {
    format!("{text_id}_v{version:02}.mp3")
}

// ── HTTP implementation ────────────────────────────────────────────

/// Bearer-token HTTP object store (supabase-storage wire shape).
pub struct HttpObjectStore {
    base_url: String,
    bucket: String,
    token: String,
    http: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(config: &StorageConfig) -> Result<Self, SynthError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
            http,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, key)
    }

    fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, key
        )
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        public_read: bool,
    ) -> Result<String, SynthError> {
        let size = bytes.len();
        let resp = self
            .http
            .post(self.object_url(key))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SynthError::Storage(format!(
                "blob put {key} failed ({status}): {body}"
            )));
        }

        tracing::info!(key = %key, size, "blob stored");
        Ok(if public_read {
            self.public_url(key)
        } else {
            self.object_url(key)
        })
    }
}

// ── Filesystem implementation ──────────────────────────────────────

/// Local-directory object store for single-node runs and tests.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
        _public_read: bool,
    ) -> Result<String, SynthError> {
        // Object keys are slash-separated and come from our own layout
        // helpers; reject anything that could escape the root.
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(SynthError::Storage(format!("invalid object key {key}")));
        }
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SynthError::Storage(format!("mkdir {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| SynthError::Storage(format!("write {}: {e}", path.display())))?;
        tracing::info!(key = %key, size = bytes.len(), "blob stored locally");
        Ok(format!("file://{}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn audio_key_layout() {
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        assert_eq!(
            audio_object_key("episode-7", 1547, 1, at),
            "audio/2026/08/episode-7_1500_v01.mp3"
        );
        assert_eq!(
            audio_object_key("episode-7", 99, 12, at),
            "audio/2026/08/episode-7_0_v12.mp3"
        );
    }

    #[test]
    fn filename_is_versioned() {
        assert_eq!(audio_filename("episode-7", 3), "episode-7_v03.mp3");
    }

    #[tokio::test]
    async fn fs_store_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let url = store
            .put("audio/2026/08/t1_100_v01.mp3", vec![1, 2, 3], "audio/mpeg", true)
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        let written = std::fs::read(dir.path().join("audio/2026/08/t1_100_v01.mp3")).unwrap();
        assert_eq!(written, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fs_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let err = store
            .put("audio/../../etc/passwd", vec![0], "audio/mpeg", true)
            .await
            .unwrap_err();
        assert!(matches!(err, SynthError::Storage(_)));
    }

    #[test]
    fn http_store_url_layout() {
        let config = StorageConfig {
            base_url: "https://blob.example.com/".into(),
            bucket: "voxweave".into(),
            token: "secret".into(),
            ..Default::default()
        };
        let store = HttpObjectStore::new(&config).unwrap();
        assert_eq!(
            store.object_url("audio/2026/08/a_0_v01.mp3"),
            "https://blob.example.com/storage/v1/object/voxweave/audio/2026/08/a_0_v01.mp3"
        );
        assert!(store
            .public_url("k")
            .contains("/storage/v1/object/public/voxweave/k"));
    }
}
