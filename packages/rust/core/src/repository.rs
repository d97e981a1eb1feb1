//! Persistence seams used by the pipeline.
//!
//! The pipeline only talks to these traits. [`Storage`] implements both, and
//! tests substitute their own implementations where a failure has to be forced.

use async_trait::async_trait;
use worldforge_shared::{
    NewRulebook, NewWorld, Result, Rulebook, RulebookFilter, RulebookId, RulebookUpdate, World,
    WorldId,
};
use worldforge_storage::Storage;

/// Rulebook records: create, partial update by id, lookups.
#[async_trait]
pub trait RulebookRepository: Send + Sync {
    /// Create a record in the `uploaded` state. A taken title fails with
    /// [`worldforge_shared::WorldforgeError::DuplicateTitle`].
    async fn create(&self, new: &NewRulebook) -> Result<RulebookId>;

    async fn update(&self, id: &RulebookId, update: &RulebookUpdate) -> Result<()>;

    async fn find_by_title(&self, title: &str) -> Result<Option<Rulebook>>;

    async fn list(&self, filter: &RulebookFilter) -> Result<Vec<Rulebook>>;

    async fn get(&self, id: &RulebookId) -> Result<Option<Rulebook>>;
}

/// World records.
#[async_trait]
pub trait WorldRepository: Send + Sync {
    async fn create(&self, new: &NewWorld) -> Result<World>;

    /// Add members to an existing world; ids already present are ignored.
    async fn attach(&self, id: &WorldId, rulebook_ids: &[RulebookId]) -> Result<()>;

    async fn get(&self, id: &WorldId) -> Result<Option<World>>;
}

#[async_trait]
impl RulebookRepository for Storage {
    async fn create(&self, new: &NewRulebook) -> Result<RulebookId> {
        Ok(self.insert_rulebook(new).await?.id)
    }

    async fn update(&self, id: &RulebookId, update: &RulebookUpdate) -> Result<()> {
        self.update_rulebook(id, update).await
    }

    async fn find_by_title(&self, title: &str) -> Result<Option<Rulebook>> {
        self.find_rulebook_by_title(title).await
    }

    async fn list(&self, filter: &RulebookFilter) -> Result<Vec<Rulebook>> {
        self.list_rulebooks(filter).await
    }

    async fn get(&self, id: &RulebookId) -> Result<Option<Rulebook>> {
        self.get_rulebook(id).await
    }
}

#[async_trait]
impl WorldRepository for Storage {
    async fn create(&self, new: &NewWorld) -> Result<World> {
        self.insert_world(new).await
    }

    async fn attach(&self, id: &WorldId, rulebook_ids: &[RulebookId]) -> Result<()> {
        self.attach_rulebooks(id, rulebook_ids).await
    }

    async fn get(&self, id: &WorldId) -> Result<Option<World>> {
        self.get_world(id).await
    }
}
