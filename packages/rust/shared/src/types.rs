//! Core domain types for Worldforge rulebooks and worlds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

record_id!(
    /// A UUID v7 identifier for persisted rulebook records.
    RulebookId
);

record_id!(
    /// A UUID v7 identifier for persisted world records.
    WorldId
);

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Two-phase persisted state of a rulebook record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionState {
    /// The document is stored and referenced, structured content is not.
    Uploaded,
    /// Structured content has been extracted and saved.
    Extracted,
}

impl ExtractionState {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Extracted => "extracted",
        }
    }
}

impl std::fmt::Display for ExtractionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExtractionState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(Self::Uploaded),
            "extracted" => Ok(Self::Extracted),
            other => Err(format!("unknown extraction state '{other}'")),
        }
    }
}

/// Who can see a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

impl Visibility {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }

    /// Map the submission surface's `is_public` flag.
    pub fn from_public_flag(is_public: bool) -> Self {
        if is_public { Self::Public } else { Self::Private }
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            other => Err(format!("unknown visibility '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// ExtractedContent
// ---------------------------------------------------------------------------

/// Structured game content pulled out of a rulebook.
///
/// This JSON shape is consumed by character builders and world browsers,
/// which index into the named sections directly. Every section and field is
/// always present after deserialization: missing, `null` or wrongly shaped
/// values from the extractor collapse to empty defaults, unknown fields are
/// dropped. Keys are camelCase; snake_case spellings are accepted on input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedContent {
    #[serde(default, alias = "character_options", deserialize_with = "lenient")]
    pub character_options: CharacterOptions,
    #[serde(default, alias = "game_mechanics", deserialize_with = "lenient")]
    pub game_mechanics: GameMechanics,
    #[serde(default, alias = "detailed_mechanics", deserialize_with = "lenient")]
    pub detailed_mechanics: DetailedMechanics,
    #[serde(default, deserialize_with = "lenient_entries")]
    pub npcs: Vec<ContentEntry>,
    #[serde(default, deserialize_with = "lenient_entries")]
    pub locations: Vec<ContentEntry>,
    #[serde(default, deserialize_with = "lenient_entries")]
    pub campaigns: Vec<ContentEntry>,
}

impl ExtractedContent {
    /// Total number of list entries across all sections.
    pub fn entry_count(&self) -> usize {
        let c = &self.character_options;
        c.races.len()
            + c.classes.len()
            + c.abilities.len()
            + c.attributes.len()
            + self.npcs.len()
            + self.locations.len()
            + self.campaigns.len()
    }
}

/// Playable options: races, classes, abilities, attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterOptions {
    #[serde(default, deserialize_with = "lenient_entries")]
    pub races: Vec<ContentEntry>,
    #[serde(default, deserialize_with = "lenient_entries")]
    pub classes: Vec<ContentEntry>,
    #[serde(default, deserialize_with = "lenient_entries")]
    pub abilities: Vec<ContentEntry>,
    #[serde(default, deserialize_with = "lenient_entries")]
    pub attributes: Vec<ContentEntry>,
}

/// High-level rules summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameMechanics {
    #[serde(default, alias = "core_rules", deserialize_with = "lenient_text")]
    pub core_rules: String,
    #[serde(default, alias = "dice_system", deserialize_with = "lenient_text")]
    pub dice_system: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub progression: String,
}

/// Rules detail for the three subsystems players hit most.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedMechanics {
    #[serde(default, deserialize_with = "lenient_text")]
    pub combat: String,
    #[serde(default, alias = "skill_checks", deserialize_with = "lenient_text")]
    pub skill_checks: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub magic: String,
}

/// A named item in any list section (race, class, NPC, location, ...).
///
/// Fields other than `name` and `description` are kept verbatim in `details`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentEntry {
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub description: String,
    #[serde(flatten)]
    pub details: BTreeMap<String, Value>,
}

impl ContentEntry {
    /// Build an entry from a bare name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(name) if !name.trim().is_empty() => Some(Self::named(name)),
            Value::Object(_) => serde_json::from_value(value).ok(),
            _ => None,
        }
    }
}

/// Deserialize any value, falling back to `T::default()` when it does not fit.
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Strings pass through, `null` becomes empty, anything else is kept as compact JSON.
fn lenient_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Lists keep every element that can be read as an entry; non-lists become empty.
fn lenient_entries<'de, D>(deserializer: D) -> std::result::Result<Vec<ContentEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items.into_iter().filter_map(ContentEntry::from_value).collect(),
        _ => Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Rulebook
// ---------------------------------------------------------------------------

/// A persisted rulebook record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rulebook {
    pub id: RulebookId,
    /// Unique across the repository.
    pub title: String,
    pub game_system: String,
    pub category: String,
    pub source_url: Url,
    pub extraction_state: ExtractionState,
    pub extracted_content: ExtractedContent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rulebook {
    /// Whether structured content has been saved for this record.
    pub fn content_extracted(&self) -> bool {
        self.extraction_state == ExtractionState::Extracted
    }
}

/// Fields needed to create a rulebook in the `uploaded` state.
#[derive(Debug, Clone)]
pub struct NewRulebook {
    pub title: String,
    pub game_system: String,
    pub category: String,
    pub source_url: Url,
}

/// Partial update applied by id. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RulebookUpdate {
    pub source_url: Option<Url>,
    pub extraction_state: Option<ExtractionState>,
    pub extracted_content: Option<ExtractedContent>,
}

impl RulebookUpdate {
    /// The update that completes the second phase of a record.
    pub fn extracted(content: ExtractedContent) -> Self {
        Self {
            extraction_state: Some(ExtractionState::Extracted),
            extracted_content: Some(content),
            ..Default::default()
        }
    }
}

/// Filter for listing rulebooks. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RulebookFilter {
    pub game_system: Option<String>,
    pub category: Option<String>,
    pub extraction_state: Option<ExtractionState>,
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// A persisted world: the aggregate grouping rulebooks under a named setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct World {
    pub id: WorldId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub game_system: String,
    pub genre: String,
    /// Set semantics: sorted, no duplicates.
    pub rulebook_ids: Vec<RulebookId>,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to create a world.
#[derive(Debug, Clone)]
pub struct NewWorld {
    pub name: String,
    pub description: Option<String>,
    pub game_system: String,
    pub genre: String,
    pub rulebook_ids: Vec<RulebookId>,
    pub visibility: Visibility,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rulebook_id_roundtrip() {
        let id = RulebookId::new();
        let parsed: RulebookId = id.to_string().parse().expect("parse RulebookId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let json = r#"{"character_options": {"races": [{"name": "Elf"}]}}"#;
        let content: ExtractedContent = serde_json::from_str(json).expect("deserialize");
        assert_eq!(content.character_options.races.len(), 1);
        assert!(content.character_options.classes.is_empty());
        assert!(content.npcs.is_empty());
        assert!(content.locations.is_empty());
        assert!(content.campaigns.is_empty());
        assert_eq!(content.game_mechanics.dice_system, "");

        let out = serde_json::to_value(&content).expect("serialize");
        assert_eq!(out["npcs"], serde_json::json!([]));
        assert_eq!(out["detailedMechanics"]["magic"], serde_json::json!(""));
    }

    #[test]
    fn camel_case_sections_are_read_and_written() {
        let json = r#"{
            "characterOptions": {"races": [{"name": "Elf"}]},
            "gameMechanics": {"diceSystem": "d20", "coreRules": "roll high"},
            "detailedMechanics": {"skillChecks": "d20 + modifier"}
        }"#;
        let content: ExtractedContent = serde_json::from_str(json).expect("deserialize");
        assert_eq!(content.character_options.races[0].name, "Elf");
        assert_eq!(content.game_mechanics.dice_system, "d20");
        assert_eq!(content.game_mechanics.core_rules, "roll high");
        assert_eq!(content.detailed_mechanics.skill_checks, "d20 + modifier");

        let out = serde_json::to_value(&content).expect("serialize");
        assert_eq!(out["characterOptions"]["races"][0]["name"], "Elf");
        assert_eq!(out["gameMechanics"]["diceSystem"], "d20");
        assert_eq!(out["detailedMechanics"]["skillChecks"], "d20 + modifier");
        assert!(out.get("character_options").is_none());
        assert!(out["gameMechanics"].get("dice_system").is_none());
    }

    #[test]
    fn null_and_misshaped_values_are_absent() {
        let json = r#"{
            "npcs": null,
            "locations": "none",
            "gameMechanics": null,
            "detailedMechanics": {"combat": {"initiative": "d20"}, "magic": null},
            "campaigns": [{"name": "Curse of the Moon", "chapters": 4}, 17, "Side Quest"]
        }"#;
        let content: ExtractedContent = serde_json::from_str(json).expect("deserialize");
        assert!(content.npcs.is_empty());
        assert!(content.locations.is_empty());
        assert_eq!(content.game_mechanics, GameMechanics::default());
        assert_eq!(content.detailed_mechanics.combat, r#"{"initiative":"d20"}"#);
        assert_eq!(content.detailed_mechanics.magic, "");
        assert_eq!(content.campaigns.len(), 2);
        assert_eq!(content.campaigns[0].details["chapters"], serde_json::json!(4));
        assert_eq!(content.campaigns[1].name, "Side Quest");
    }

    #[test]
    fn unknown_top_level_fields_are_ignored() {
        let json = r#"{"spells": [1, 2, 3], "npcs": [{"name": "Mira", "role": "innkeeper"}]}"#;
        let content: ExtractedContent = serde_json::from_str(json).expect("deserialize");
        assert_eq!(content.npcs[0].name, "Mira");
        assert_eq!(content.entry_count(), 1);
    }

    #[test]
    fn extraction_state_parses() {
        assert_eq!("uploaded".parse::<ExtractionState>(), Ok(ExtractionState::Uploaded));
        assert!("done".parse::<ExtractionState>().is_err());
    }

    #[test]
    fn visibility_from_flag() {
        assert_eq!(Visibility::from_public_flag(true), Visibility::Public);
        assert_eq!(Visibility::from_public_flag(false), Visibility::Private);
    }
}
