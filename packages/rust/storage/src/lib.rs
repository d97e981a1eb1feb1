//! libSQL storage layer for rulebooks and worlds.
//!
//! The [`Storage`] struct wraps a local libSQL database and is the
//! persistent home of [`Rulebook`] and [`World`] records. Rulebook titles are
//! unique at the table level; an insert that loses a title race fails with
//! [`WorldforgeError::DuplicateTitle`].
//!
//! **Access rules:**
//! - Ingestion: read-write via [`Storage::open`]
//! - Browsing commands: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use url::Url;
use worldforge_shared::{
    ExtractedContent, ExtractionState, NewRulebook, NewWorld, Result, Rulebook, RulebookFilter,
    RulebookId, RulebookUpdate, Visibility, World, WorldId, WorldforgeError,
};

const RULEBOOK_COLUMNS: &str = "id, title, game_system, category, source_url, extraction_state, \
                                extracted_json, created_at, updated_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Serializes writes on the shared connection so a multi-statement
    /// write never interleaves with another task's statements.
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorldforgeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(WorldforgeError::NotFound(format!(
                "database {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        WorldforgeError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(WorldforgeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rulebook operations
    // -----------------------------------------------------------------------

    /// Insert a rulebook in the `uploaded` state with empty content.
    pub async fn insert_rulebook(&self, new: &NewRulebook) -> Result<Rulebook> {
        self.check_writable()?;
        let now = Utc::now();
        let rulebook = Rulebook {
            id: RulebookId::new(),
            title: new.title.clone(),
            game_system: new.game_system.clone(),
            category: new.category.clone(),
            source_url: new.source_url.clone(),
            extraction_state: ExtractionState::Uploaded,
            extracted_content: ExtractedContent::default(),
            created_at: now,
            updated_at: now,
        };
        let content_json = to_json(&rulebook.extracted_content)?;
        let ts = now.to_rfc3339();

        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO rulebooks (id, title, game_system, category, source_url,
                                        extraction_state, extracted_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    rulebook.id.to_string(),
                    rulebook.title.as_str(),
                    rulebook.game_system.as_str(),
                    rulebook.category.as_str(),
                    rulebook.source_url.as_str(),
                    rulebook.extraction_state.as_str(),
                    content_json,
                    ts.as_str(),
                    ts.as_str(),
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    WorldforgeError::DuplicateTitle {
                        title: new.title.clone(),
                    }
                } else {
                    db_err(e)
                }
            })?;

        debug!(id = %rulebook.id, title = %rulebook.title, "rulebook inserted");
        Ok(rulebook)
    }

    /// Apply a partial update to a rulebook. Fails with `NotFound` for unknown ids.
    pub async fn update_rulebook(&self, id: &RulebookId, update: &RulebookUpdate) -> Result<()> {
        self.check_writable()?;
        let content_json = update
            .extracted_content
            .as_ref()
            .map(to_json)
            .transpose()?;
        let now = Utc::now().to_rfc3339();

        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE rulebooks SET
                   source_url       = COALESCE(?1, source_url),
                   extraction_state = COALESCE(?2, extraction_state),
                   extracted_json   = COALESCE(?3, extracted_json),
                   updated_at       = ?4
                 WHERE id = ?5",
                params![
                    update.source_url.as_ref().map(|u| u.to_string()),
                    update.extraction_state.map(|s| s.as_str()),
                    content_json,
                    now.as_str(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(db_err)?;

        if changed == 0 {
            return Err(WorldforgeError::NotFound(format!("rulebook {id}")));
        }
        Ok(())
    }

    /// Get a rulebook by id.
    pub async fn get_rulebook(&self, id: &RulebookId) -> Result<Option<Rulebook>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RULEBOOK_COLUMNS} FROM rulebooks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_rulebook(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Look up a rulebook by exact title.
    pub async fn find_rulebook_by_title(&self, title: &str) -> Result<Option<Rulebook>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RULEBOOK_COLUMNS} FROM rulebooks WHERE title = ?1"),
                params![title],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_rulebook(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List rulebooks matching `filter`, oldest first.
    pub async fn list_rulebooks(&self, filter: &RulebookFilter) -> Result<Vec<Rulebook>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RULEBOOK_COLUMNS} FROM rulebooks
                     WHERE (?1 IS NULL OR game_system = ?1)
                       AND (?2 IS NULL OR category = ?2)
                       AND (?3 IS NULL OR extraction_state = ?3)
                     ORDER BY created_at, id"
                ),
                params![
                    filter.game_system.as_deref(),
                    filter.category.as_deref(),
                    filter.extraction_state.map(|s| s.as_str()),
                ],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_rulebook(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // World operations
    // -----------------------------------------------------------------------

    /// Insert a world and its rulebook memberships in one transaction.
    pub async fn insert_world(&self, new: &NewWorld) -> Result<World> {
        self.check_writable()?;
        let now = Utc::now();
        let mut rulebook_ids = new.rulebook_ids.clone();
        rulebook_ids.sort();
        rulebook_ids.dedup();

        let world = World {
            id: WorldId::new(),
            name: new.name.clone(),
            description: new.description.clone(),
            game_system: new.game_system.clone(),
            genre: new.genre.clone(),
            rulebook_ids,
            visibility: new.visibility,
            created_at: now,
        };

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        tx.execute(
            "INSERT INTO worlds (id, name, description, game_system, genre, visibility, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                world.id.to_string(),
                world.name.as_str(),
                world.description.as_deref(),
                world.game_system.as_str(),
                world.genre.as_str(),
                world.visibility.as_str(),
                now.to_rfc3339(),
            ],
        )
        .await
        .map_err(db_err)?;

        for rulebook_id in &world.rulebook_ids {
            tx.execute(
                "INSERT OR IGNORE INTO world_rulebooks (world_id, rulebook_id) VALUES (?1, ?2)",
                params![world.id.to_string(), rulebook_id.to_string()],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        debug!(id = %world.id, rulebooks = world.rulebook_ids.len(), "world inserted");
        Ok(world)
    }

    /// Add rulebooks to an existing world. Ids already present are ignored.
    pub async fn attach_rulebooks(&self, world_id: &WorldId, ids: &[RulebookId]) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM worlds WHERE id = ?1",
                params![world_id.to_string()],
            )
            .await
            .map_err(db_err)?;
        if rows.next().await.map_err(db_err)?.is_none() {
            return Err(WorldforgeError::NotFound(format!("world {world_id}")));
        }

        let tx = self.conn.transaction().await.map_err(db_err)?;
        for rulebook_id in ids {
            tx.execute(
                "INSERT OR IGNORE INTO world_rulebooks (world_id, rulebook_id) VALUES (?1, ?2)",
                params![world_id.to_string(), rulebook_id.to_string()],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Get a world by id, with its member rulebook ids.
    pub async fn get_world(&self, id: &WorldId) -> Result<Option<World>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, description, game_system, genre, visibility, created_at
                 FROM worlds WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let row = match rows.next().await.map_err(db_err)? {
            Some(row) => row,
            None => return Ok(None),
        };
        let mut world = row_to_world(&row)?;
        world.rulebook_ids = self.world_members(&world.id).await?;
        Ok(Some(world))
    }

    /// List all worlds, newest first.
    pub async fn list_worlds(&self) -> Result<Vec<World>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, description, game_system, genre, visibility, created_at
                 FROM worlds ORDER BY created_at DESC, id DESC",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut worlds = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            worlds.push(row_to_world(&row)?);
        }
        for world in &mut worlds {
            world.rulebook_ids = self.world_members(&world.id).await?;
        }
        Ok(worlds)
    }

    async fn world_members(&self, world_id: &WorldId) -> Result<Vec<RulebookId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT rulebook_id FROM world_rulebooks WHERE world_id = ?1 ORDER BY rulebook_id",
                params![world_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let raw: String = row.get(0).map_err(db_err)?;
            ids.push(parse_id(&raw)?);
        }
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> WorldforgeError {
    WorldforgeError::Storage(e.to_string())
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

fn to_json(content: &ExtractedContent) -> Result<String> {
    serde_json::to_string(content)
        .map_err(|e| WorldforgeError::Storage(format!("encode extracted content: {e}")))
}

fn parse_id<T: std::str::FromStr<Err = uuid::Error>>(raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|e| WorldforgeError::Storage(format!("invalid id '{raw}': {e}")))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WorldforgeError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`Rulebook`].
fn row_to_rulebook(row: &libsql::Row) -> Result<Rulebook> {
    let id: String = row.get(0).map_err(db_err)?;
    let source_url: String = row.get(4).map_err(db_err)?;
    let state: String = row.get(5).map_err(db_err)?;
    let content: String = row.get(6).map_err(db_err)?;
    let created_at: String = row.get(7).map_err(db_err)?;
    let updated_at: String = row.get(8).map_err(db_err)?;

    Ok(Rulebook {
        id: parse_id(&id)?,
        title: row.get(1).map_err(db_err)?,
        game_system: row.get(2).map_err(db_err)?,
        category: row.get(3).map_err(db_err)?,
        source_url: Url::parse(&source_url)
            .map_err(|e| WorldforgeError::Storage(format!("invalid source_url: {e}")))?,
        extraction_state: state.parse().map_err(WorldforgeError::Storage)?,
        extracted_content: serde_json::from_str(&content)
            .map_err(|e| WorldforgeError::Storage(format!("decode extracted content: {e}")))?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

/// Convert a database row to a [`World`] without its members.
fn row_to_world(row: &libsql::Row) -> Result<World> {
    let id: String = row.get(0).map_err(db_err)?;
    let visibility: String = row.get(5).map_err(db_err)?;
    let created_at: String = row.get(6).map_err(db_err)?;

    Ok(World {
        id: parse_id(&id)?,
        name: row.get(1).map_err(db_err)?,
        description: row.get::<String>(2).ok(),
        game_system: row.get(3).map_err(db_err)?,
        genre: row.get(4).map_err(db_err)?,
        rulebook_ids: Vec::new(),
        visibility: visibility
            .parse::<Visibility>()
            .map_err(WorldforgeError::Storage)?,
        created_at: parse_ts(&created_at)?,
    })
}
