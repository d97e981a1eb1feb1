//! In-process stand-ins for the pipeline's collaborators.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use url::Url;
use uuid::Uuid;
use worldforge_adapters::{Extractor, UploadReceipt, Uploader};
use worldforge_shared::{
    ExtractedContent, NewWorld, Result, RulebookId, Visibility, World, WorldId, WorldforgeError,
};
use worldforge_storage::Storage;

use crate::batch::BatchMeta;
use crate::pipeline::PipelineServices;
use crate::queue::{BatchOutcome, ItemId, ItemStatus, QueueController, QueueItem, QueueObserver, QueueOptions};
use crate::repository::WorldRepository;
use crate::retry::RetryPolicy;

pub(crate) async fn test_storage() -> Arc<Storage> {
    let path = std::env::temp_dir().join(format!("wf_core_{}.db", Uuid::now_v7()));
    Arc::new(Storage::open(&path).await.expect("open test db"))
}

pub(crate) fn test_meta() -> BatchMeta {
    BatchMeta {
        game_system: "dnd5e".into(),
        category: "core_rules".into(),
        world_name: "Test Realm".into(),
        world_description: Some("A realm for tests".into()),
        genre: "fantasy".into(),
        visibility: Visibility::Private,
    }
}

pub(crate) fn write_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create test dir");
    }
    std::fs::write(&path, format!("%PDF-1.7 {name}")).expect("write test file");
    path
}

/// Uploader answering `https://blobs.test/<file name>`.
#[derive(Default)]
pub(crate) struct StubUploader {
    calls: AtomicU32,
    failing: AtomicBool,
}

impl StubUploader {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_all(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Uploader for StubUploader {
    fn name(&self) -> &str {
        "stub"
    }

    async fn upload(&self, file_name: &str, _bytes: &[u8]) -> Result<UploadReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(WorldforgeError::Network("blob store unavailable".into()));
        }
        let url = Url::parse(&format!("https://blobs.test/{file_name}"))
            .map_err(|e| WorldforgeError::parse(e.to_string()))?;
        Ok(UploadReceipt { url })
    }
}

/// Extractor whose answer never mentions NPCs, locations or campaigns.
#[derive(Default)]
pub(crate) struct StubExtractor {
    calls: AtomicU32,
    failing: AtomicBool,
    failing_urls: Mutex<Vec<String>>,
    gates: Mutex<Vec<(String, Arc<Notify>)>>,
}

impl StubExtractor {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_all(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Fail every document whose URL contains `fragment`.
    pub fn fail_matching(&self, fragment: &str) {
        self.failing_urls.lock().unwrap().push(fragment.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_urls.lock().unwrap().clear();
    }

    /// Hold every document whose URL contains `fragment` until the returned
    /// gate is notified.
    pub fn hold_matching(&self, fragment: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .push((fragment.to_string(), gate.clone()));
        gate
    }
}

#[async_trait]
impl Extractor for StubExtractor {
    fn name(&self) -> &str {
        "stub"
    }

    async fn extract(&self, document_url: &Url, _schema: &Value) -> Result<ExtractedContent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self
            .gates
            .lock()
            .unwrap()
            .iter()
            .find(|(fragment, _)| document_url.as_str().contains(fragment.as_str()))
            .map(|(_, gate)| gate.clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let matched = self
            .failing_urls
            .lock()
            .unwrap()
            .iter()
            .any(|fragment| document_url.as_str().contains(fragment.as_str()));
        if matched || self.failing.load(Ordering::SeqCst) {
            return Err(WorldforgeError::Network("extractor overloaded".into()));
        }
        let answer = r#"{
            "characterOptions": {"races": [{"name": "Elf"}], "classes": ["Wizard"]},
            "gameMechanics": {"diceSystem": "d20"}
        }"#;
        serde_json::from_str(answer).map_err(|e| WorldforgeError::parse(e.to_string()))
    }
}

/// World repository that refuses every write.
pub(crate) struct FailingWorlds;

#[async_trait]
impl WorldRepository for FailingWorlds {
    async fn create(&self, _new: &NewWorld) -> Result<World> {
        Err(WorldforgeError::Storage("worlds table is locked".into()))
    }

    async fn attach(&self, _id: &WorldId, _rulebook_ids: &[RulebookId]) -> Result<()> {
        Err(WorldforgeError::Storage("worlds table is locked".into()))
    }

    async fn get(&self, _id: &WorldId) -> Result<Option<World>> {
        Ok(None)
    }
}

/// Delegates to storage, except that reads fail once `break_reads` is set.
pub(crate) struct BreakableWorlds {
    storage: Arc<Storage>,
    broken: AtomicBool,
}

impl BreakableWorlds {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            broken: AtomicBool::new(false),
        }
    }

    pub fn break_reads(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorldRepository for BreakableWorlds {
    async fn create(&self, new: &NewWorld) -> Result<World> {
        self.storage.insert_world(new).await
    }

    async fn attach(&self, id: &WorldId, rulebook_ids: &[RulebookId]) -> Result<()> {
        self.storage.attach_rulebooks(id, rulebook_ids).await
    }

    async fn get(&self, id: &WorldId) -> Result<Option<World>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(WorldforgeError::Storage("worlds table is unreadable".into()));
        }
        self.storage.get_world(id).await
    }
}

/// Records every transition it is shown.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<(ItemId, ItemStatus)>>,
    finished: Mutex<Vec<BatchOutcome>>,
}

impl RecordingObserver {
    pub fn statuses_of(&self, id: ItemId) -> Vec<ItemStatus> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(item, _)| *item == id)
            .map(|(_, status)| *status)
            .collect()
    }

    /// Order in which items reached a terminal state.
    pub fn settled_order(&self) -> Vec<ItemId> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, status)| status.is_terminal())
            .map(|(item, _)| *item)
            .collect()
    }

    pub fn finished_runs(&self) -> usize {
        self.finished.lock().unwrap().len()
    }
}

impl QueueObserver for RecordingObserver {
    fn item_changed(&self, item: &QueueItem) {
        self.events.lock().unwrap().push((item.id(), item.status()));
    }

    fn batch_finished(&self, outcome: &BatchOutcome) {
        self.finished.lock().unwrap().push(outcome.clone());
    }
}

/// Storage, stubs and a scratch directory wired together.
pub(crate) struct TestHarness {
    pub storage: Arc<Storage>,
    pub uploader: Arc<StubUploader>,
    pub extractor: Arc<StubExtractor>,
    pub observer: Arc<RecordingObserver>,
    pub policy: RetryPolicy,
    pub dir: PathBuf,
}

impl TestHarness {
    pub async fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("wf_core_files_{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        Self {
            storage: test_storage().await,
            uploader: Arc::new(StubUploader::default()),
            extractor: Arc::new(StubExtractor::default()),
            observer: Arc::new(RecordingObserver::default()),
            policy: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                call_timeout: Some(Duration::from_secs(5)),
            },
            dir,
        }
    }

    pub fn services(&self) -> PipelineServices {
        PipelineServices::new(
            self.storage.clone(),
            self.storage.clone(),
            self.uploader.clone(),
            self.extractor.clone(),
        )
    }

    pub fn options(&self) -> QueueOptions {
        QueueOptions {
            retry: self.policy,
            ..QueueOptions::default()
        }
    }

    pub fn controller(&self) -> QueueController {
        self.controller_with(self.services(), self.options())
    }

    pub fn controller_with(&self, services: PipelineServices, options: QueueOptions) -> QueueController {
        QueueController::new(services, options, self.observer.clone())
    }
}
