//! Ingestion pipeline for Worldforge.
//!
//! Turns batches of rulebook files and URLs into extracted rulebook records
//! and groups each batch's successes into one world:
//!
//! - [`queue`]: the Queue Controller, item status and bulk operations
//! - [`pipeline`]: the per-item stages and stranded-record re-extraction
//! - [`retry`], [`dedup`]: bounded retry and the title pre-check
//! - [`assembler`]: world creation after a batch run
//! - [`repository`]: persistence seams, implemented by the storage crate

pub mod assembler;
pub mod batch;
pub mod dedup;
pub mod pipeline;
pub mod queue;
pub mod repository;
pub mod retry;

#[cfg(test)]
mod testing;

pub use assembler::WorldAssembler;
pub use batch::{BatchMeta, SourceKind, SourceRef, parse_url_list, processing_order, validate_batch};
pub use dedup::DedupGuard;
pub use pipeline::{PipelineServices, reextract_rulebook};
pub use queue::{
    BatchHandle, BatchId, BatchOutcome, ItemId, ItemStatus, QueueController, QueueItem,
    QueueObserver, QueueOptions, SilentObserver,
};
pub use repository::{RulebookRepository, WorldRepository};
pub use retry::{RetryExhausted, RetryPolicy, with_retry};
