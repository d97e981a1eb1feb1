//! Shared types, error model, and configuration for Worldforge.
//!
//! This crate is the foundation depended on by all other Worldforge crates.
//! It provides:
//! - [`WorldforgeError`]: the unified error type
//! - Domain records ([`Rulebook`], [`World`], [`ExtractedContent`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, ExtractorConfig, PipelineConfig, UploaderConfig, UploaderMode,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    validate_api_key, validate_config,
};
pub use error::{Result, WorldforgeError};
pub use types::{
    CharacterOptions, ContentEntry, DetailedMechanics, ExtractedContent, ExtractionState,
    GameMechanics, NewRulebook, NewWorld, Rulebook, RulebookFilter, RulebookId, RulebookUpdate,
    Visibility, World, WorldId,
};
