//! Title pre-check run before an item is uploaded.
//!
//! The check is advisory. Two items racing for the same title can both pass
//! it; the repository's unique title constraint decides which one wins.

use std::sync::Arc;

use tracing::debug;
use worldforge_shared::{Result, RulebookId, WorldforgeError};

use crate::repository::RulebookRepository;

pub struct DedupGuard {
    rulebooks: Arc<dyn RulebookRepository>,
}

impl DedupGuard {
    pub fn new(rulebooks: Arc<dyn RulebookRepository>) -> Self {
        Self { rulebooks }
    }

    /// Fail with [`WorldforgeError::DuplicateTitle`] if `title` is taken by a
    /// record other than `own_record`.
    pub async fn check_title(&self, title: &str, own_record: Option<&RulebookId>) -> Result<()> {
        match self.rulebooks.find_by_title(title).await? {
            Some(existing) if Some(&existing.id) != own_record => {
                debug!(title, existing = %existing.id, "title already taken");
                Err(WorldforgeError::DuplicateTitle {
                    title: title.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}
