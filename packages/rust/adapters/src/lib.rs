//! External collaborators of the ingestion pipeline.
//!
//! This crate provides:
//! - [`Uploader`]: turns raw bytes into a stable content URL
//!   ([`LocalBlobStore`], [`HttpUploader`])
//! - [`Extractor`]: turns a document URL into [`ExtractedContent`]
//!   ([`OpenRouterExtractor`])
//! - [`rulebook_schema`]: the fixed target schema handed to every extractor
//!
//! Implementations report transient failures as retryable
//! [`WorldforgeError`]s; retrying is the caller's job.

pub mod extract;
pub mod schema;
pub mod upload;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use url::Url;
use worldforge_shared::{ExtractedContent, Result, WorldforgeError};

pub use extract::{OpenRouterExtractor, OpenRouterOptions};
pub use schema::rulebook_schema;
pub use upload::{HttpUploader, LocalBlobStore, UploadReceipt};

/// User-Agent string for outbound requests.
pub(crate) const USER_AGENT: &str = concat!("Worldforge/", env!("CARGO_PKG_VERSION"));

/// Accepts raw document bytes and returns where they can be fetched from.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Store `bytes` and return a stable URL for them.
    async fn upload(&self, file_name: &str, bytes: &[u8]) -> Result<UploadReceipt>;
}

/// Produces structured game content from a rulebook document.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Extract content from the document at `document_url` following `schema`.
    ///
    /// The result is best effort: sections the document does not cover come
    /// back empty.
    async fn extract(&self, document_url: &Url, schema: &Value) -> Result<ExtractedContent>;
}

/// Map a non-success HTTP status to an error with the right retry class.
pub(crate) fn status_error(context: &str, status: StatusCode, body: &str) -> WorldforgeError {
    let snippet: String = body.chars().take(200).collect();
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        WorldforgeError::Network(format!("{context}: HTTP {status}: {snippet}"))
    } else {
        WorldforgeError::Rejected {
            status: status.as_u16(),
            message: format!("{context}: {snippet}"),
        }
    }
}
