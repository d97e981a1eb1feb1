//! The per-item pipeline: dedup, upload or link, record, extract, persist.
//!
//! A run of [`run_item`] moves one item from `pending` to its terminal state.
//! Status changes are reported through [`StageSink`] as each stage starts; the
//! caller records the terminal state from the returned result.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;
use worldforge_adapters::{Extractor, Uploader, rulebook_schema};
use worldforge_shared::{
    ExtractedContent, ExtractionState, NewRulebook, Result, Rulebook, RulebookId, RulebookUpdate,
    WorldforgeError,
};

use crate::batch::{BatchMeta, SourceRef};
use crate::dedup::DedupGuard;
use crate::queue::ItemStatus;
use crate::repository::{RulebookRepository, WorldRepository};
use crate::retry::{RetryPolicy, with_retry};

/// The collaborators every item run needs.
#[derive(Clone)]
pub struct PipelineServices {
    pub rulebooks: Arc<dyn RulebookRepository>,
    pub worlds: Arc<dyn WorldRepository>,
    pub uploader: Arc<dyn Uploader>,
    pub extractor: Arc<dyn Extractor>,
    /// Target schema handed to the extractor.
    pub schema: Value,
}

impl PipelineServices {
    pub fn new(
        rulebooks: Arc<dyn RulebookRepository>,
        worlds: Arc<dyn WorldRepository>,
        uploader: Arc<dyn Uploader>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        Self {
            rulebooks,
            worlds,
            uploader,
            extractor,
            schema: rulebook_schema(),
        }
    }
}

/// Everything the pipeline needs to know about one item.
#[derive(Debug, Clone)]
pub(crate) struct ItemJob {
    pub source: SourceRef,
    pub title: String,
    pub game_system: String,
    pub category: String,
    /// Record created by an earlier run of this item, reused on retry.
    pub record_id: Option<RulebookId>,
}

impl ItemJob {
    pub fn new(source: SourceRef, title: String, meta: &BatchMeta, record_id: Option<RulebookId>) -> Self {
        Self {
            source,
            title,
            game_system: meta.game_system.clone(),
            category: meta.category.clone(),
            record_id,
        }
    }
}

/// Receives stage changes of a running item.
#[async_trait]
pub(crate) trait StageSink: Send + Sync {
    async fn enter(&self, status: ItemStatus);

    /// The item now owns a persisted record, even if a later stage fails.
    async fn record_created(&self, id: &RulebookId);
}

/// Drive one item through every stage. Returns the id of the extracted record.
#[instrument(skip_all, fields(title = %job.title, source = %job.source))]
pub(crate) async fn run_item(
    services: &PipelineServices,
    policy: &RetryPolicy,
    job: &ItemJob,
    sink: &dyn StageSink,
) -> Result<RulebookId> {
    DedupGuard::new(services.rulebooks.clone())
        .check_title(&job.title, job.record_id.as_ref())
        .await?;

    let source_url = match &job.source {
        SourceRef::File { path } => {
            sink.enter(ItemStatus::Uploading).await;
            upload_file(services, policy, path).await?
        }
        SourceRef::Url { url } => {
            sink.enter(ItemStatus::Linking).await;
            url.clone()
        }
    };

    let record_id = persist_uploaded(services, job, source_url.clone()).await?;
    sink.record_created(&record_id).await;

    sink.enter(ItemStatus::Extracting).await;
    let content = extract(services, policy, &source_url).await?;

    services
        .rulebooks
        .update(&record_id, &RulebookUpdate::extracted(content))
        .await?;
    debug!(id = %record_id, "rulebook extracted");
    Ok(record_id)
}

async fn upload_file(
    services: &PipelineServices,
    policy: &RetryPolicy,
    path: &std::path::Path,
) -> Result<Url> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let label = format!("upload {file_name}");
    let file_name = file_name.as_str();

    let receipt = with_retry(policy, &label, move || async move {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| WorldforgeError::io(path, e))?;
        services.uploader.upload(file_name, &bytes).await
    })
    .await
    .map_err(|exhausted| exhausted.into_upload_error())?;

    Ok(receipt.url)
}

async fn extract(
    services: &PipelineServices,
    policy: &RetryPolicy,
    source_url: &Url,
) -> Result<ExtractedContent> {
    let label = format!("extract {source_url}");
    with_retry(policy, &label, move || {
        services.extractor.extract(source_url, &services.schema)
    })
    .await
    .map_err(|exhausted| exhausted.into_extraction_error())
}

/// Create the `uploaded` record, or point the item's existing record at the
/// freshly uploaded document.
async fn persist_uploaded(
    services: &PipelineServices,
    job: &ItemJob,
    source_url: Url,
) -> Result<RulebookId> {
    if let Some(id) = &job.record_id {
        let update = RulebookUpdate {
            source_url: Some(source_url.clone()),
            extraction_state: Some(ExtractionState::Uploaded),
            extracted_content: None,
        };
        match services.rulebooks.update(id, &update).await {
            Ok(()) => return Ok(id.clone()),
            Err(WorldforgeError::NotFound(_)) => {
                warn!(id = %id, "previous record is gone, creating a new one");
            }
            Err(e) => return Err(e),
        }
    }

    services
        .rulebooks
        .create(&NewRulebook {
            title: job.title.clone(),
            game_system: job.game_system.clone(),
            category: job.category.clone(),
            source_url,
        })
        .await
}

/// Re-run extraction for a record left in the `uploaded` state.
#[instrument(skip(services, policy))]
pub async fn reextract_rulebook(
    services: &PipelineServices,
    policy: &RetryPolicy,
    id: &RulebookId,
) -> Result<Rulebook> {
    let rulebook = services
        .rulebooks
        .get(id)
        .await?
        .ok_or_else(|| WorldforgeError::NotFound(format!("rulebook {id}")))?;

    if rulebook.content_extracted() {
        return Err(WorldforgeError::validation(format!(
            "rulebook '{}' is already extracted",
            rulebook.title
        )));
    }

    let content = extract(services, policy, &rulebook.source_url).await?;
    services
        .rulebooks
        .update(id, &RulebookUpdate::extracted(content))
        .await?;

    services
        .rulebooks
        .get(id)
        .await?
        .ok_or_else(|| WorldforgeError::NotFound(format!("rulebook {id}")))
}
