//! The Queue Controller.
//!
//! Owns every queued item, drives each one through the per-item pipeline and
//! publishes status as it changes. Each batch run (the initial submission or a
//! manual retry) feeds its item ids through a channel to a small worker pool;
//! with the default single worker, items are processed strictly in order.
//!
//! Observers can either poll [`QueueController::snapshot`], watch the full list
//! through [`QueueController::subscribe`], or register a [`QueueObserver`] that
//! is called on every single transition.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};
use worldforge_shared::{PipelineConfig, Result, RulebookId, World, WorldId, WorldforgeError};

use crate::assembler::WorldAssembler;
use crate::batch::{BatchMeta, SourceKind, SourceRef, processing_order, validate_batch};
use crate::pipeline::{ItemJob, PipelineServices, StageSink, run_item};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// Process-local identifier of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-local identifier of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    Pending,
    /// File items: the document is being uploaded.
    Uploading,
    /// URL items: the link is being recorded.
    Linking,
    Extracting,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Linking => "linking",
            Self::Extracting => "extracting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether bulk operations may pick an item in this status.
    pub fn is_selectable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One file or URL of a batch.
///
/// `error` is set exactly when the status is `failed`, and the result id
/// exactly when it is `completed`.
#[derive(Debug, Clone)]
pub struct QueueItem {
    id: ItemId,
    batch_id: BatchId,
    source: SourceRef,
    derived_title: String,
    status: ItemStatus,
    error: Option<String>,
    result_rulebook_id: Option<RulebookId>,
    record_id: Option<RulebookId>,
}

impl QueueItem {
    fn new(id: ItemId, batch_id: BatchId, source: SourceRef) -> Self {
        let derived_title = source.derive_title();
        Self {
            id,
            batch_id,
            source,
            derived_title,
            status: ItemStatus::Pending,
            error: None,
            result_rulebook_id: None,
            record_id: None,
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn source(&self) -> &SourceRef {
        &self.source
    }

    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn derived_title(&self) -> &str {
        &self.derived_title
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn result_rulebook_id(&self) -> Option<&RulebookId> {
        self.result_rulebook_id.as_ref()
    }

    /// Rulebook record this item has persisted so far, extracted or not.
    pub fn record_id(&self) -> Option<&RulebookId> {
        self.record_id.as_ref()
    }

    fn advance(&mut self, status: ItemStatus) {
        debug_assert!(!status.is_terminal());
        self.status = status;
    }

    fn complete(&mut self, rulebook_id: RulebookId) {
        self.status = ItemStatus::Completed;
        self.error = None;
        self.record_id = Some(rulebook_id.clone());
        self.result_rulebook_id = Some(rulebook_id);
    }

    fn fail(&mut self, message: String) {
        self.status = ItemStatus::Failed;
        self.error = Some(if message.is_empty() {
            "unknown error".to_string()
        } else {
            message
        });
        self.result_rulebook_id = None;
    }

    fn reset(&mut self) {
        self.status = ItemStatus::Pending;
        self.error = None;
        self.result_rulebook_id = None;
    }
}

// ---------------------------------------------------------------------------
// Observers, options, outcomes
// ---------------------------------------------------------------------------

/// Callback notified on every item transition, in order.
pub trait QueueObserver: Send + Sync {
    fn item_changed(&self, item: &QueueItem);

    /// Called once a batch run has finished, world assembly included.
    fn batch_finished(&self, _outcome: &BatchOutcome) {}
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl QueueObserver for SilentObserver {
    fn item_changed(&self, _item: &QueueItem) {}
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Applied separately to every upload and every extraction.
    pub retry: RetryPolicy,
    /// Workers per batch run. One keeps submission order.
    pub workers: usize,
    /// Create a world even when no item of the batch succeeded.
    pub assemble_empty_world: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            workers: 1,
            assemble_empty_world: true,
        }
    }
}

impl QueueOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            workers: config.workers,
            assemble_empty_world: config.assemble_empty_world,
        }
    }
}

/// What a finished batch run produced.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: BatchId,
    /// Every item of the batch still in the queue, in processing order.
    pub items: Vec<QueueItem>,
    /// Rulebooks completed by this run.
    pub succeeded: Vec<RulebookId>,
    /// The batch's world after this run, if it has one.
    pub world: Option<World>,
    /// Non-fatal world assembly failure.
    pub warning: Option<String>,
}

impl BatchOutcome {
    pub fn failed(&self) -> impl Iterator<Item = &QueueItem> {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Failed)
    }
}

/// A running batch. Await [`BatchHandle::wait`] for its outcome.
#[derive(Debug)]
pub struct BatchHandle {
    batch_id: BatchId,
    item_ids: Vec<ItemId>,
    task: JoinHandle<Result<BatchOutcome>>,
}

impl BatchHandle {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Items processed by this run, in processing order.
    pub fn item_ids(&self) -> &[ItemId] {
        &self.item_ids
    }

    pub async fn wait(self) -> Result<BatchOutcome> {
        self.task
            .await
            .map_err(|e| WorldforgeError::Worker(format!("batch {} run: {e}", self.batch_id)))?
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct QueueController {
    inner: Arc<Inner>,
}

struct Inner {
    services: PipelineServices,
    options: QueueOptions,
    assembler: WorldAssembler,
    state: Mutex<QueueState>,
    updates: watch::Sender<Vec<QueueItem>>,
    observer: Arc<dyn QueueObserver>,
}

#[derive(Default)]
struct QueueState {
    items: Vec<QueueItem>,
    /// Items scheduled in a run that has not settled them yet.
    in_flight: HashSet<ItemId>,
    batches: HashMap<BatchId, BatchEntry>,
    next_item: u64,
    next_batch: u64,
}

struct BatchEntry {
    meta: BatchMeta,
    /// Held for the whole assembly step so a batch never gets two worlds.
    world: Arc<Mutex<WorldSlot>>,
    /// Set once the submission run has settled every item it was given.
    /// Until then no run may assemble or extend the world.
    submission_settled: bool,
    /// Every rulebook completed in this batch, whether or not its item is
    /// still in the queue.
    completed: Vec<(ItemId, RulebookId)>,
}

#[derive(Default)]
struct WorldSlot {
    id: Option<WorldId>,
    /// Rulebooks the world already references.
    attached: HashSet<RulebookId>,
}

impl QueueState {
    fn item_mut(&mut self, id: ItemId) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    fn job_for(&self, id: ItemId) -> Option<(BatchId, ItemJob)> {
        let item = self.items.iter().find(|item| item.id == id)?;
        let batch = self.batches.get(&item.batch_id)?;
        let job = ItemJob::new(
            item.source.clone(),
            item.derived_title.clone(),
            &batch.meta,
            item.record_id.clone(),
        );
        Some((item.batch_id, job))
    }

    fn batch_items(&self, batch_id: BatchId) -> Vec<QueueItem> {
        self.items
            .iter()
            .filter(|item| item.batch_id == batch_id)
            .cloned()
            .collect()
    }
}

impl QueueController {
    pub fn new(
        services: PipelineServices,
        options: QueueOptions,
        observer: Arc<dyn QueueObserver>,
    ) -> Self {
        let (updates, _) = watch::channel(Vec::new());
        let assembler = WorldAssembler::new(services.worlds.clone());
        Self {
            inner: Arc::new(Inner {
                services,
                options,
                assembler,
                state: Mutex::new(QueueState::default()),
                updates,
                observer,
            }),
        }
    }

    /// Validate and enqueue a batch, then start processing it in the background.
    ///
    /// A validation failure leaves the queue and the repositories untouched.
    #[instrument(skip_all, fields(world = %meta.world_name, items = sources.len()))]
    pub async fn submit_batch(&self, sources: Vec<SourceRef>, meta: BatchMeta) -> Result<BatchHandle> {
        validate_batch(&sources, &meta)?;

        let (batch_id, item_ids) = {
            let mut state = self.inner.state.lock().await;
            state.next_batch += 1;
            let batch_id = BatchId(state.next_batch);
            state.batches.insert(
                batch_id,
                BatchEntry {
                    meta,
                    world: Arc::new(Mutex::new(WorldSlot::default())),
                    submission_settled: false,
                    completed: Vec::new(),
                },
            );

            let mut item_ids = Vec::with_capacity(sources.len());
            for source in processing_order(sources) {
                state.next_item += 1;
                let item = QueueItem::new(ItemId(state.next_item), batch_id, source);
                item_ids.push(item.id);
                state.in_flight.insert(item.id);
                state.items.push(item);
            }

            self.inner.publish(&state);
            for item in state.items.iter().filter(|item| item.batch_id == batch_id) {
                self.inner.observer.item_changed(item);
            }
            (batch_id, item_ids)
        };

        info!(batch = %batch_id, items = item_ids.len(), "batch queued");
        Ok(self.spawn_run(batch_id, item_ids, true))
    }

    /// Current items, in queue order.
    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.inner.updates.borrow().clone()
    }

    /// A receiver that always holds the latest full item list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<QueueItem>> {
        self.inner.updates.subscribe()
    }

    /// The subset of `ids` that bulk operations may act on: items that are
    /// `pending` or `failed`.
    pub async fn select(&self, ids: &[ItemId]) -> Vec<ItemId> {
        let wanted: HashSet<ItemId> = ids.iter().copied().collect();
        let state = self.inner.state.lock().await;
        state
            .items
            .iter()
            .filter(|item| wanted.contains(&item.id) && item.status.is_selectable())
            .map(|item| item.id)
            .collect()
    }

    /// Reset selected items to `pending` and run them through the whole
    /// pipeline again, one run per batch.
    ///
    /// Items that are not selectable, or pending items already scheduled in
    /// a run, are skipped. A retry run that ends while its batch's submission
    /// run is still going leaves the world to that run.
    pub async fn retry_selected(&self, ids: &[ItemId]) -> Vec<BatchHandle> {
        let wanted: HashSet<ItemId> = ids.iter().copied().collect();

        let runs = {
            let mut state = self.inner.state.lock().await;
            let chosen: Vec<ItemId> = state
                .items
                .iter()
                .filter(|item| {
                    wanted.contains(&item.id)
                        && item.status.is_selectable()
                        && !state.in_flight.contains(&item.id)
                })
                .map(|item| item.id)
                .collect();

            let mut runs: Vec<(BatchId, Vec<ItemId>)> = Vec::new();
            for id in chosen {
                state.in_flight.insert(id);
                let Some(item) = state.item_mut(id) else {
                    continue;
                };
                item.reset();
                let batch_id = item.batch_id;
                let item = item.clone();
                self.inner.observer.item_changed(&item);
                debug!(item = %id, title = %item.derived_title, "item reset for retry");

                match runs.iter_mut().find(|(b, _)| *b == batch_id) {
                    Some((_, ids)) => ids.push(id),
                    None => runs.push((batch_id, vec![id])),
                }
            }

            if !runs.is_empty() {
                self.inner.publish(&state);
            }
            runs
        };

        runs.into_iter()
            .map(|(batch_id, item_ids)| {
                info!(batch = %batch_id, items = item_ids.len(), "retrying items");
                self.spawn_run(batch_id, item_ids, false)
            })
            .collect()
    }

    /// Remove selectable items from the queue. Persisted records are not touched.
    pub async fn delete_selected(&self, ids: &[ItemId]) -> Vec<ItemId> {
        let wanted: HashSet<ItemId> = ids.iter().copied().collect();
        let mut state = self.inner.state.lock().await;

        let mut removed = Vec::new();
        state.items.retain(|item| {
            let delete = wanted.contains(&item.id) && item.status.is_selectable();
            if delete {
                removed.push(item.id);
            }
            !delete
        });

        if !removed.is_empty() {
            self.inner.publish(&state);
            debug!(count = removed.len(), "items deleted");
        }
        removed
    }

    /// Empty the queue, whatever the items' status.
    ///
    /// Runs in progress keep going and stop reporting removed items. A removed
    /// item that still completes is persisted and joins its batch's world.
    pub async fn clear_all(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let count = state.items.len();
        state.items.clear();
        self.inner.publish(&state);
        debug!(count, "queue cleared");
        count
    }

    fn spawn_run(&self, batch_id: BatchId, item_ids: Vec<ItemId>, submission: bool) -> BatchHandle {
        let inner = self.inner.clone();
        let run_ids = item_ids.clone();
        let task = tokio::spawn(async move { inner.run(batch_id, run_ids, submission).await });
        BatchHandle {
            batch_id,
            item_ids,
            task,
        }
    }
}

impl Inner {
    fn publish(&self, state: &QueueState) {
        self.updates.send_replace(state.items.clone());
    }

    #[instrument(skip(self, item_ids), fields(batch = %batch_id, items = item_ids.len()))]
    async fn run(
        self: Arc<Self>,
        batch_id: BatchId,
        item_ids: Vec<ItemId>,
        submission: bool,
    ) -> Result<BatchOutcome> {
        let (tx, rx) = mpsc::channel(item_ids.len().max(1));
        for id in &item_ids {
            tx.send(*id)
                .await
                .map_err(|_| WorldforgeError::Worker("item channel closed".into()))?;
        }
        drop(tx);

        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();
        for _ in 0..self.options.workers.max(1) {
            let inner = self.clone();
            let rx = rx.clone();
            workers.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(item_id) = next else { break };
                    inner.process_item(item_id).await;
                }
            });
        }
        while let Some(joined) = workers.join_next().await {
            joined.map_err(|e| WorldforgeError::Worker(format!("batch {batch_id} worker: {e}")))?;
        }

        self.finish_run(batch_id, &item_ids, submission).await
    }

    async fn process_item(&self, item_id: ItemId) {
        let (batch_id, job) = {
            let mut state = self.state.lock().await;
            match state.job_for(item_id) {
                Some(found) => found,
                None => {
                    state.in_flight.remove(&item_id);
                    debug!(item = %item_id, "item left the queue before processing");
                    return;
                }
            }
        };

        let sink = ItemSink {
            inner: self,
            item_id,
        };
        let result = run_item(&self.services, &self.options.retry, &job, &sink).await;

        let mut state = self.state.lock().await;
        state.in_flight.remove(&item_id);
        if let (Ok(rulebook_id), Some(batch)) = (&result, state.batches.get_mut(&batch_id)) {
            batch.completed.push((item_id, rulebook_id.clone()));
        }
        let Some(item) = state.item_mut(item_id) else {
            debug!(item = %item_id, "item left the queue while processing");
            return;
        };
        match result {
            Ok(rulebook_id) => item.complete(rulebook_id),
            Err(err) => {
                warn!(item = %item_id, title = %job.title, error = %err, "item failed");
                item.fail(err.to_string());
            }
        }
        let item = item.clone();
        self.publish(&state);
        debug!(item = %item_id, status = %item.status, "item settled");
        self.observer.item_changed(&item);
    }

    async fn advance(&self, item_id: ItemId, status: ItemStatus) {
        let mut state = self.state.lock().await;
        let Some(item) = state.item_mut(item_id) else {
            return;
        };
        item.advance(status);
        let item = item.clone();
        self.publish(&state);
        debug!(item = %item_id, status = %status, "item status changed");
        self.observer.item_changed(&item);
    }

    async fn remember_record(&self, item_id: ItemId, rulebook_id: &RulebookId) {
        let mut state = self.state.lock().await;
        if let Some(item) = state.item_mut(item_id) {
            item.record_id = Some(rulebook_id.clone());
        }
    }

    /// Assemble or extend the batch's world with every rulebook the batch has
    /// completed that the world does not reference yet.
    async fn finish_run(
        &self,
        batch_id: BatchId,
        run_ids: &[ItemId],
        submission: bool,
    ) -> Result<BatchOutcome> {
        let world_slot = {
            let state = self.state.lock().await;
            state
                .batches
                .get(&batch_id)
                .map(|batch| batch.world.clone())
                .ok_or_else(|| WorldforgeError::Worker(format!("unknown batch {batch_id}")))?
        };

        let mut slot = world_slot.lock().await;
        let (meta, settled, completed, items) = {
            let mut state = self.state.lock().await;
            let items = state.batch_items(batch_id);
            let batch = state
                .batches
                .get_mut(&batch_id)
                .ok_or_else(|| WorldforgeError::Worker(format!("unknown batch {batch_id}")))?;
            if submission {
                batch.submission_settled = true;
            }
            (
                batch.meta.clone(),
                batch.submission_settled,
                batch.completed.clone(),
                items,
            )
        };

        let succeeded: Vec<RulebookId> = completed
            .iter()
            .filter(|(item, _)| run_ids.contains(item))
            .map(|(_, id)| id.clone())
            .collect();
        let fresh: Vec<RulebookId> = completed
            .into_iter()
            .map(|(_, id)| id)
            .filter(|id| !slot.attached.contains(id))
            .collect();

        let assembled = if !settled {
            debug!(batch = %batch_id, "submission run still going, world deferred");
            Ok(None)
        } else {
            match slot.id.clone() {
                Some(existing) if fresh.is_empty() => self.assembler.current(&existing).await.map(Some),
                Some(existing) => self.assembler.extend(&existing, &fresh).await.map(Some),
                None if fresh.is_empty() && !self.options.assemble_empty_world => {
                    info!(batch = %batch_id, "no rulebook succeeded, world not created");
                    Ok(None)
                }
                None => self.assembler.assemble(&meta, &fresh).await.map(Some),
            }
        };
        if let Ok(Some(world)) = &assembled {
            slot.id = Some(world.id.clone());
            slot.attached.extend(fresh);
        }
        drop(slot);

        let (world, warning) = match assembled {
            Ok(world) => (world, None),
            Err(err) => {
                warn!(batch = %batch_id, error = %err, "world assembly failed");
                (None, Some(err.to_string()))
            }
        };

        let outcome = BatchOutcome {
            batch_id,
            items,
            succeeded,
            world,
            warning,
        };
        info!(
            batch = %batch_id,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed().filter(|item| run_ids.contains(&item.id)).count(),
            world = ?outcome.world.as_ref().map(|w| w.id.to_string()),
            "batch run finished"
        );
        self.observer.batch_finished(&outcome);
        Ok(outcome)
    }
}

struct ItemSink<'a> {
    inner: &'a Inner,
    item_id: ItemId,
}

#[async_trait]
impl StageSink for ItemSink<'_> {
    async fn enter(&self, status: ItemStatus) {
        self.inner.advance(self.item_id, status).await;
    }

    async fn record_created(&self, id: &RulebookId) {
        self.inner.remember_record(self.item_id, id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BreakableWorlds, FailingWorlds, TestHarness, test_meta, write_file};
    use url::Url;
    use worldforge_shared::{ExtractionState, RulebookFilter};

    use super::ItemStatus::*;

    fn url_source(s: &str) -> SourceRef {
        SourceRef::url(Url::parse(s).unwrap())
    }

    fn ids_of(outcome: &BatchOutcome, status: ItemStatus) -> Vec<ItemId> {
        outcome
            .items
            .iter()
            .filter(|item| item.status() == status)
            .map(QueueItem::id)
            .collect()
    }

    #[tokio::test]
    async fn two_files_end_to_end() {
        let h = TestHarness::new().await;
        let queue = h.controller();
        let sources = vec![
            SourceRef::file(write_file(&h.dir, "a.pdf")),
            SourceRef::file(write_file(&h.dir, "b.pdf")),
        ];

        let outcome = queue
            .submit_batch(sources, test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let world = outcome.world.expect("world assembled");
        assert_eq!(world.name, "Test Realm");
        assert_eq!(world.rulebook_ids.len(), 2);
        for id in &world.rulebook_ids {
            let rulebook = h.storage.get_rulebook(id).await.unwrap().unwrap();
            assert!(rulebook.content_extracted());
            assert_eq!(rulebook.game_system, "dnd5e");
        }
        assert!(outcome.warning.is_none());
        assert_eq!(h.observer.finished_runs(), 1);
    }

    #[tokio::test]
    async fn statuses_advance_in_order() {
        let h = TestHarness::new().await;
        h.extractor.fail_matching("broken");
        let queue = h.controller();
        let sources = vec![
            url_source("https://cdn.example.com/srd.pdf"),
            SourceRef::file(write_file(&h.dir, "guide.pdf")),
            url_source("https://cdn.example.com/broken.pdf"),
        ];

        let handle = queue.submit_batch(sources, test_meta()).await.unwrap();
        let ids = handle.item_ids().to_vec();
        handle.wait().await.unwrap();

        assert_eq!(
            h.observer.statuses_of(ids[0]),
            [Pending, Uploading, Extracting, Completed]
        );
        assert_eq!(
            h.observer.statuses_of(ids[1]),
            [Pending, Linking, Extracting, Completed]
        );
        assert_eq!(
            h.observer.statuses_of(ids[2]),
            [Pending, Linking, Extracting, Failed]
        );
    }

    #[tokio::test]
    async fn files_are_processed_before_urls() {
        let h = TestHarness::new().await;
        let queue = h.controller();
        let sources = vec![
            url_source("https://cdn.example.com/one.pdf"),
            SourceRef::file(write_file(&h.dir, "x.pdf")),
            url_source("https://cdn.example.com/two.pdf"),
            SourceRef::file(write_file(&h.dir, "y.pdf")),
        ];

        let handle = queue.submit_batch(sources, test_meta()).await.unwrap();
        let ids = handle.item_ids().to_vec();
        handle.wait().await.unwrap();

        let titles: Vec<String> = queue
            .snapshot()
            .iter()
            .map(|item| item.derived_title().to_string())
            .collect();
        assert_eq!(titles, ["x", "y", "one", "two"]);
        assert_eq!(h.observer.settled_order(), ids);
    }

    #[tokio::test]
    async fn second_submission_of_same_file_is_duplicate() {
        let h = TestHarness::new().await;
        let queue = h.controller();
        let path = write_file(&h.dir, "handbook.pdf");

        let first = queue
            .submit_batch(vec![SourceRef::file(&path)], test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(first.succeeded.len(), 1);

        let handle = queue
            .submit_batch(vec![SourceRef::file(&path)], test_meta())
            .await
            .unwrap();
        let second_id = handle.item_ids()[0];
        let second = handle.wait().await.unwrap();

        let item = &second.items[0];
        assert_eq!(item.status(), Failed);
        assert!(item.error().unwrap().contains("duplicate title"));
        assert_eq!(h.observer.statuses_of(second_id), [Pending, Failed]);
        assert_eq!(h.uploader.calls(), 1);

        let all = h.storage.list_rulebooks(&RulebookFilter::default()).await.unwrap();
        assert_eq!(all.iter().filter(|r| r.title == "handbook").count(), 1);
    }

    #[tokio::test]
    async fn same_title_twice_in_one_batch_fails_the_second() {
        let h = TestHarness::new().await;
        let queue = h.controller();
        let sources = vec![
            SourceRef::file(write_file(&h.dir, "one/core.pdf")),
            SourceRef::file(write_file(&h.dir, "two/core.pdf")),
        ];

        let outcome = queue
            .submit_batch(sources, test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(ids_of(&outcome, Completed).len(), 1);
        let failed: Vec<&QueueItem> = outcome.failed().collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error().unwrap().contains("duplicate title"));
        assert!(failed[0].record_id().is_none());
    }

    #[tokio::test]
    async fn parallel_workers_still_keep_titles_unique() {
        let h = TestHarness::new().await;
        let options = QueueOptions {
            workers: 2,
            ..h.options()
        };
        let queue = h.controller_with(h.services(), options);
        let sources = vec![
            SourceRef::file(write_file(&h.dir, "left/core.pdf")),
            SourceRef::file(write_file(&h.dir, "right/core.pdf")),
            SourceRef::file(write_file(&h.dir, "extra.pdf")),
        ];

        let outcome = queue
            .submit_batch(sources, test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.succeeded.len(), 2);
        let failed: Vec<&QueueItem> = outcome.failed().collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error().unwrap().contains("duplicate title"));
        let cores = h
            .storage
            .list_rulebooks(&RulebookFilter::default())
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.title == "core")
            .count();
        assert_eq!(cores, 1);
    }

    #[tokio::test]
    async fn upload_is_attempted_exactly_three_times() {
        let h = TestHarness::new().await;
        h.uploader.fail_all(true);
        let queue = h.controller();

        let outcome = queue
            .submit_batch(vec![SourceRef::file(write_file(&h.dir, "a.pdf"))], test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(h.uploader.calls(), 3);
        assert_eq!(h.extractor.calls(), 0);
        let item = &outcome.items[0];
        assert_eq!(item.status(), Failed);
        assert!(item.error().unwrap().starts_with("upload failed after 3 attempt(s)"));
        assert!(item.result_rulebook_id().is_none());

        let all = h.storage.list_rulebooks(&RulebookFilter::default()).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn extraction_is_attempted_exactly_three_times() {
        let h = TestHarness::new().await;
        h.extractor.fail_all(true);
        let queue = h.controller();

        let outcome = queue
            .submit_batch(vec![url_source("https://cdn.example.com/srd.pdf")], test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(h.extractor.calls(), 3);
        assert_eq!(h.uploader.calls(), 0);
        let item = &outcome.items[0];
        assert!(item.error().unwrap().starts_with("extraction failed after 3 attempt(s)"));

        let stranded = h.storage.find_rulebook_by_title("srd").await.unwrap().unwrap();
        assert_eq!(stranded.extraction_state, ExtractionState::Uploaded);
        assert_eq!(item.record_id(), Some(&stranded.id));
    }

    #[tokio::test]
    async fn partial_batch_world_holds_only_successes() {
        let h = TestHarness::new().await;
        h.extractor.fail_matching("item2");
        let queue = h.controller();
        let sources = vec![
            SourceRef::file(write_file(&h.dir, "item1.pdf")),
            SourceRef::file(write_file(&h.dir, "item2.pdf")),
            SourceRef::file(write_file(&h.dir, "item3.pdf")),
        ];

        let outcome = queue
            .submit_batch(sources, test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let first = outcome.items[0].result_rulebook_id().unwrap().clone();
        let third = outcome.items[2].result_rulebook_id().unwrap().clone();
        let mut expected = vec![first, third];
        expected.sort();
        assert_eq!(outcome.world.unwrap().rulebook_ids, expected);

        let second = h.storage.find_rulebook_by_title("item2").await.unwrap().unwrap();
        assert!(!second.content_extracted());
        let stranded = h
            .storage
            .list_rulebooks(&RulebookFilter {
                extraction_state: Some(ExtractionState::Uploaded),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stranded.len(), 1);
    }

    #[tokio::test]
    async fn missing_sections_are_persisted_empty() {
        let h = TestHarness::new().await;
        let queue = h.controller();

        let outcome = queue
            .submit_batch(vec![SourceRef::file(write_file(&h.dir, "a.pdf"))], test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let id = outcome.succeeded[0].clone();
        let rulebook = h.storage.get_rulebook(&id).await.unwrap().unwrap();
        assert!(rulebook.extracted_content.npcs.is_empty());
        let json = serde_json::to_value(&rulebook.extracted_content).unwrap();
        assert_eq!(json["npcs"], serde_json::json!([]));
        assert_eq!(json["detailedMechanics"]["combat"], serde_json::json!(""));
    }

    #[tokio::test]
    async fn bulk_retry_reprocesses_failed_items() {
        let h = TestHarness::new().await;
        h.extractor.fail_all(true);
        let queue = h.controller();
        let sources = vec![
            SourceRef::file(write_file(&h.dir, "a.pdf")),
            SourceRef::file(write_file(&h.dir, "b.pdf")),
        ];

        let first = queue
            .submit_batch(sources, test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        let ids = ids_of(&first, Failed);
        assert_eq!(ids.len(), 2);
        let empty_world = first.world.expect("empty world created");
        assert!(empty_world.rulebook_ids.is_empty());

        h.extractor.fail_all(false);
        assert_eq!(queue.select(&ids).await, ids);
        let handles = queue.retry_selected(&ids).await;
        assert_eq!(handles.len(), 1);
        let retried = handles.into_iter().next().unwrap().wait().await.unwrap();

        assert_eq!(ids_of(&retried, Completed), ids);
        assert_eq!(h.uploader.calls(), 4);
        for id in &ids {
            assert_eq!(
                h.observer.statuses_of(*id),
                [
                    Pending, Uploading, Extracting, Failed, Pending, Uploading, Extracting,
                    Completed
                ]
            );
        }

        let all = h.storage.list_rulebooks(&RulebookFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.content_extracted()));

        let world = retried.world.unwrap();
        assert_eq!(world.id, empty_world.id);
        assert_eq!(world.rulebook_ids.len(), 2);
        assert_eq!(h.storage.list_worlds().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completed_items_cannot_be_selected() {
        let h = TestHarness::new().await;
        let queue = h.controller();
        let handle = queue
            .submit_batch(vec![SourceRef::file(write_file(&h.dir, "a.pdf"))], test_meta())
            .await
            .unwrap();
        let ids = handle.item_ids().to_vec();
        handle.wait().await.unwrap();

        assert!(queue.select(&ids).await.is_empty());
        assert!(queue.retry_selected(&ids).await.is_empty());
        assert!(queue.delete_selected(&ids).await.is_empty());
        assert_eq!(queue.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn delete_and_clear_leave_records_alone() {
        let h = TestHarness::new().await;
        h.extractor.fail_all(true);
        let queue = h.controller();
        let sources = vec![
            SourceRef::file(write_file(&h.dir, "a.pdf")),
            SourceRef::file(write_file(&h.dir, "b.pdf")),
        ];
        let handle = queue.submit_batch(sources, test_meta()).await.unwrap();
        let ids = handle.item_ids().to_vec();
        handle.wait().await.unwrap();

        let removed = queue.delete_selected(&ids[..1]).await;
        assert_eq!(removed, &ids[..1]);
        let left: Vec<ItemId> = queue.snapshot().iter().map(QueueItem::id).collect();
        assert_eq!(left, &ids[1..]);

        assert_eq!(queue.clear_all().await, 1);
        assert!(queue.snapshot().is_empty());

        let all = h.storage.list_rulebooks(&RulebookFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn invalid_batch_has_no_side_effects() {
        let h = TestHarness::new().await;
        let queue = h.controller();

        let err = queue.submit_batch(Vec::new(), test_meta()).await.unwrap_err();
        assert!(matches!(err, WorldforgeError::Validation { .. }));

        let mut meta = test_meta();
        meta.world_name = "   ".into();
        let err = queue
            .submit_batch(vec![SourceRef::file(write_file(&h.dir, "a.pdf"))], meta)
            .await
            .unwrap_err();
        assert!(matches!(err, WorldforgeError::Validation { .. }));

        assert!(queue.snapshot().is_empty());
        assert_eq!(h.uploader.calls(), 0);
        assert!(h.storage.list_rulebooks(&RulebookFilter::default()).await.unwrap().is_empty());
        assert!(h.storage.list_worlds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_world_is_created_by_default() {
        let h = TestHarness::new().await;
        h.uploader.fail_all(true);
        let queue = h.controller();

        let outcome = queue
            .submit_batch(vec![SourceRef::file(write_file(&h.dir, "a.pdf"))], test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert!(outcome.succeeded.is_empty());
        assert!(outcome.world.unwrap().rulebook_ids.is_empty());
    }

    #[tokio::test]
    async fn empty_world_can_be_suppressed() {
        let h = TestHarness::new().await;
        h.uploader.fail_all(true);
        let options = QueueOptions {
            assemble_empty_world: false,
            ..h.options()
        };
        let queue = h.controller_with(h.services(), options);

        let handle = queue
            .submit_batch(vec![SourceRef::file(write_file(&h.dir, "a.pdf"))], test_meta())
            .await
            .unwrap();
        let ids = handle.item_ids().to_vec();
        let outcome = handle.wait().await.unwrap();
        assert!(outcome.world.is_none());
        assert!(outcome.warning.is_none());
        assert!(h.storage.list_worlds().await.unwrap().is_empty());

        h.uploader.fail_all(false);
        let retried = queue.retry_selected(&ids).await;
        let outcome = retried.into_iter().next().unwrap().wait().await.unwrap();
        assert_eq!(outcome.world.unwrap().rulebook_ids.len(), 1);
    }

    #[tokio::test]
    async fn world_failure_is_a_warning() {
        let h = TestHarness::new().await;
        let mut services = h.services();
        services.worlds = Arc::new(FailingWorlds);
        let queue = h.controller_with(services, h.options());

        let outcome = queue
            .submit_batch(vec![SourceRef::file(write_file(&h.dir, "a.pdf"))], test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert!(outcome.world.is_none());
        assert!(outcome.warning.unwrap().contains("world assembly error"));
        let rulebook = h
            .storage
            .get_rulebook(&outcome.succeeded[0])
            .await
            .unwrap()
            .unwrap();
        assert!(rulebook.content_extracted());
    }

    #[tokio::test]
    async fn world_lookup_failure_is_a_warning() {
        let h = TestHarness::new().await;
        h.extractor.fail_matching("b.pdf");
        let worlds = Arc::new(BreakableWorlds::new(h.storage.clone()));
        let mut services = h.services();
        services.worlds = worlds.clone();
        let queue = h.controller_with(services, h.options());
        let sources = vec![
            SourceRef::file(write_file(&h.dir, "a.pdf")),
            SourceRef::file(write_file(&h.dir, "b.pdf")),
        ];

        let first = queue
            .submit_batch(sources, test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(first.world.as_ref().unwrap().rulebook_ids.len(), 1);

        worlds.break_reads();
        let failed = ids_of(&first, Failed);
        let retried = queue.retry_selected(&failed).await;
        let outcome = retried.into_iter().next().unwrap().wait().await.unwrap();

        assert!(outcome.succeeded.is_empty());
        assert!(outcome.world.is_none());
        assert!(outcome.warning.unwrap().contains("unreadable"));
    }

    #[tokio::test]
    async fn retry_during_submission_run_leaves_the_world_to_it() {
        let h = TestHarness::new().await;
        h.extractor.fail_matching("first");
        let gate = h.extractor.hold_matching("slow");
        let queue = h.controller();
        let mut updates = queue.subscribe();
        let sources = vec![
            SourceRef::file(write_file(&h.dir, "first.pdf")),
            url_source("https://x.test/slow.pdf"),
        ];

        let submission = queue.submit_batch(sources, test_meta()).await.unwrap();
        let ids = submission.item_ids().to_vec();
        updates
            .wait_for(|items| {
                items.len() == 2 && items[0].status() == Failed && items[1].status() == Extracting
            })
            .await
            .unwrap();

        h.extractor.clear_failures();
        let retried = queue.retry_selected(&ids[..1]).await;
        let early = retried.into_iter().next().unwrap().wait().await.unwrap();

        assert_eq!(early.succeeded.len(), 1);
        assert!(early.world.is_none());
        assert!(early.warning.is_none());
        assert!(h.storage.list_worlds().await.unwrap().is_empty());
        assert_eq!(queue.snapshot()[1].status(), Extracting);

        gate.notify_one();
        let outcome = submission.wait().await.unwrap();
        assert_eq!(outcome.world.unwrap().rulebook_ids.len(), 2);
        assert_eq!(h.storage.list_worlds().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn item_cleared_mid_run_still_joins_the_world() {
        let h = TestHarness::new().await;
        let gate = h.extractor.hold_matching("slow");
        let queue = h.controller();
        let mut updates = queue.subscribe();

        let handle = queue
            .submit_batch(vec![url_source("https://x.test/slow.pdf")], test_meta())
            .await
            .unwrap();
        updates
            .wait_for(|items| items.first().is_some_and(|item| item.status() == Extracting))
            .await
            .unwrap();

        assert_eq!(queue.clear_all().await, 1);
        gate.notify_one();
        let outcome = handle.wait().await.unwrap();

        assert!(outcome.items.is_empty());
        assert_eq!(outcome.succeeded.len(), 1);
        let world = outcome.world.unwrap();
        assert_eq!(world.rulebook_ids, outcome.succeeded);
        let rulebook = h.storage.get_rulebook(&outcome.succeeded[0]).await.unwrap().unwrap();
        assert!(rulebook.content_extracted());
        assert!(queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_the_latest_list() {
        let h = TestHarness::new().await;
        let queue = h.controller();
        let mut updates = queue.subscribe();

        queue
            .submit_batch(vec![url_source("https://cdn.example.com/srd.pdf")], test_meta())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert!(updates.has_changed().unwrap());
        let latest = updates.borrow_and_update().clone();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].status(), Completed);
        assert!(latest[0].result_rulebook_id().is_some());
    }

    #[tokio::test]
    async fn concurrent_batches_are_independent() {
        let h = TestHarness::new().await;
        let queue = h.controller();

        let first = queue
            .submit_batch(vec![SourceRef::file(write_file(&h.dir, "a.pdf"))], test_meta())
            .await
            .unwrap();
        let mut other = test_meta();
        other.world_name = "Other Realm".into();
        let second = queue
            .submit_batch(vec![SourceRef::file(write_file(&h.dir, "b.pdf"))], other)
            .await
            .unwrap();

        let (first, second) = tokio::join!(first.wait(), second.wait());
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.batch_id, second.batch_id);
        assert_eq!(first.world.unwrap().rulebook_ids.len(), 1);
        assert_eq!(second.world.unwrap().name, "Other Realm");
        assert_eq!(h.storage.list_worlds().await.unwrap().len(), 2);
    }
}
