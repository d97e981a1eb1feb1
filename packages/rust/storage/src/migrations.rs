//! SQL migration definitions for the Worldforge database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: rulebooks, worlds, world_rulebooks",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Ingested rulebooks. Title uniqueness is enforced here, not only by the
-- pipeline's pre-check.
CREATE TABLE IF NOT EXISTS rulebooks (
    id                TEXT PRIMARY KEY,
    title             TEXT NOT NULL UNIQUE,
    game_system       TEXT NOT NULL,
    category          TEXT NOT NULL,
    source_url        TEXT NOT NULL,
    extraction_state  TEXT NOT NULL CHECK (extraction_state IN ('uploaded', 'extracted')),
    extracted_json    TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rulebooks_game_system ON rulebooks(game_system);
CREATE INDEX IF NOT EXISTS idx_rulebooks_state ON rulebooks(extraction_state);

-- Aggregate worlds
CREATE TABLE IF NOT EXISTS worlds (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    description TEXT,
    game_system TEXT NOT NULL,
    genre       TEXT NOT NULL,
    visibility  TEXT NOT NULL CHECK (visibility IN ('public', 'private')),
    created_at  TEXT NOT NULL
);

-- World membership (set semantics)
CREATE TABLE IF NOT EXISTS world_rulebooks (
    world_id    TEXT NOT NULL REFERENCES worlds(id) ON DELETE CASCADE,
    rulebook_id TEXT NOT NULL,
    PRIMARY KEY (world_id, rulebook_id)
);

CREATE INDEX IF NOT EXISTS idx_world_rulebooks_rulebook ON world_rulebooks(rulebook_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
