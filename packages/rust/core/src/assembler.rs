//! World assembly once a batch run has finished.

use std::sync::Arc;

use tracing::{info, instrument};
use worldforge_shared::{NewWorld, Result, RulebookId, World, WorldId, WorldforgeError};

use crate::batch::BatchMeta;
use crate::repository::WorldRepository;

/// Creates the aggregate world record for a batch.
///
/// Failures come back as [`WorldforgeError::WorldAssembly`]; callers treat them
/// as warnings, since the rulebook records they reference stay valid on their own.
pub struct WorldAssembler {
    worlds: Arc<dyn WorldRepository>,
}

impl WorldAssembler {
    pub fn new(worlds: Arc<dyn WorldRepository>) -> Self {
        Self { worlds }
    }

    /// Create one world referencing exactly `rulebook_ids`, which may be empty.
    #[instrument(skip_all, fields(world = %meta.world_name, rulebooks = rulebook_ids.len()))]
    pub async fn assemble(&self, meta: &BatchMeta, rulebook_ids: &[RulebookId]) -> Result<World> {
        let new = NewWorld {
            name: meta.world_name.trim().to_string(),
            description: meta
                .world_description
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            game_system: meta.game_system.clone(),
            genre: meta.genre.clone(),
            rulebook_ids: rulebook_ids.to_vec(),
            visibility: meta.visibility,
        };

        let world = self
            .worlds
            .create(&new)
            .await
            .map_err(|e| WorldforgeError::WorldAssembly(format!("create '{}': {e}", new.name)))?;

        info!(id = %world.id, rulebooks = world.rulebook_ids.len(), "world assembled");
        Ok(world)
    }

    /// Add rulebooks completed by a later retry to an existing world.
    #[instrument(skip_all, fields(world = %world_id, rulebooks = rulebook_ids.len()))]
    pub async fn extend(&self, world_id: &WorldId, rulebook_ids: &[RulebookId]) -> Result<World> {
        let assembly_err = |e: WorldforgeError| WorldforgeError::WorldAssembly(format!("extend {world_id}: {e}"));

        self.worlds
            .attach(world_id, rulebook_ids)
            .await
            .map_err(assembly_err)?;
        let world = self.current(world_id).await?;

        info!(rulebooks = world.rulebook_ids.len(), "world extended");
        Ok(world)
    }

    /// Reload a world this assembler created.
    pub async fn current(&self, world_id: &WorldId) -> Result<World> {
        self.worlds
            .get(world_id)
            .await
            .map_err(|e| WorldforgeError::WorldAssembly(format!("load {world_id}: {e}")))?
            .ok_or_else(|| WorldforgeError::WorldAssembly(format!("world {world_id} vanished")))
    }
}
