//! Blob uploaders: a content-addressed local store and an HTTP client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use url::Url;
use worldforge_shared::{Result, WorldforgeError};

use crate::{USER_AGENT, Uploader, status_error};

/// Where an uploaded document can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadReceipt {
    #[serde(alias = "file_url")]
    pub url: Url,
}

// ---------------------------------------------------------------------------
// LocalBlobStore
// ---------------------------------------------------------------------------

/// Stores uploads under `root` named by the SHA-256 of their bytes.
///
/// Identical bytes always map to the same `file://` URL, so re-uploading on
/// retry is free.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Create a store rooted at `root` (made absolute; created lazily).
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = std::path::absolute(root).map_err(|e| WorldforgeError::io(root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, file_name: &str, bytes: &[u8]) -> PathBuf {
        let hash = format!("{:x}", Sha256::digest(bytes));
        match Path::new(file_name).extension().and_then(|e| e.to_str()) {
            Some(ext) if !ext.is_empty() => self.root.join(format!("{hash}.{}", ext.to_lowercase())),
            _ => self.root.join(hash),
        }
    }
}

#[async_trait]
impl Uploader for LocalBlobStore {
    fn name(&self) -> &str {
        "local"
    }

    #[instrument(skip_all, fields(file_name = %file_name, bytes = bytes.len()))]
    async fn upload(&self, file_name: &str, bytes: &[u8]) -> Result<UploadReceipt> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| WorldforgeError::io(&self.root, e))?;

        let path = self.blob_path(file_name, bytes);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|e| WorldforgeError::io(&path, e))?;
        }

        let url = Url::from_file_path(&path).map_err(|()| {
            WorldforgeError::config(format!("blob path is not absolute: {}", path.display()))
        })?;
        debug!(%url, "blob stored");
        Ok(UploadReceipt { url })
    }
}

// ---------------------------------------------------------------------------
// HttpUploader
// ---------------------------------------------------------------------------

/// POSTs raw bytes to an upload endpoint that answers `{"url": "..."}`.
pub struct HttpUploader {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpUploader {
    pub fn new(endpoint: Url, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| WorldforgeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip_all, fields(endpoint = %self.endpoint, file_name = %file_name, bytes = bytes.len()))]
    async fn upload(&self, file_name: &str, bytes: &[u8]) -> Result<UploadReceipt> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header("x-file-name", file_name)
            .body(bytes.to_vec());
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WorldforgeError::Network(format!("upload {file_name}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&format!("upload {file_name}"), status, &body));
        }

        response
            .json::<UploadReceipt>()
            .await
            .map_err(|e| WorldforgeError::parse(format!("upload response for {file_name}: {e}")))
    }
}
