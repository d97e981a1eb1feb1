//! The fixed target schema every extraction is run against.

use serde_json::{Value, json};

fn entry_list(description: &str) -> Value {
    json!({
        "type": "array",
        "description": description,
        "items": {
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "description": { "type": "string" }
            },
            "required": ["name"]
        }
    })
}

fn text(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

/// JSON Schema for [`worldforge_shared::ExtractedContent`].
///
/// Property names match the serialized field names, so a conforming answer
/// deserializes without renaming.
pub fn rulebook_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "characterOptions": {
                "type": "object",
                "properties": {
                    "races": entry_list("Playable races, species or ancestries"),
                    "classes": entry_list("Character classes or archetypes"),
                    "abilities": entry_list("Feats, talents, spells or special abilities"),
                    "attributes": entry_list("Core character attributes or stats")
                }
            },
            "gameMechanics": {
                "type": "object",
                "properties": {
                    "coreRules": text("Summary of the core resolution rules"),
                    "diceSystem": text("Dice used and how rolls are read"),
                    "progression": text("How characters advance")
                }
            },
            "detailedMechanics": {
                "type": "object",
                "properties": {
                    "combat": text("Combat procedure"),
                    "skillChecks": text("Skill and ability checks"),
                    "magic": text("Magic or supernatural powers")
                }
            },
            "npcs": entry_list("Named non-player characters"),
            "locations": entry_list("Named places"),
            "campaigns": entry_list("Adventures, campaigns or scenario hooks")
        }
    })
}
