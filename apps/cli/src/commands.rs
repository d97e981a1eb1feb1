//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use url::Url;
use worldforge_adapters::{
    HttpUploader, LocalBlobStore, OpenRouterExtractor, OpenRouterOptions, Uploader,
};
use worldforge_core::{
    BatchMeta, BatchOutcome, ItemId, ItemStatus, PipelineServices, QueueController, QueueItem,
    QueueObserver, QueueOptions, RetryPolicy, SourceRef, parse_url_list, reextract_rulebook,
};
use worldforge_shared::{
    AppConfig, ExtractionState, Rulebook, RulebookFilter, RulebookId, UploaderMode, Visibility,
    World, WorldId, WorldforgeError, expand_home, init_config, load_config, validate_api_key,
};
use worldforge_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Worldforge: turn rulebooks into structured game content.
#[derive(Parser)]
#[command(
    name = "worldforge",
    version,
    about = "Ingest tabletop rulebooks into structured records and assemble them into worlds.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database path (overrides `defaults.database_path`).
    #[arg(long, global = true, env = "WORLDFORGE_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Ingest a batch of rulebook files and URLs, then assemble a world from them.
    Ingest(IngestArgs),

    /// Inspect persisted rulebooks.
    Rulebooks {
        #[command(subcommand)]
        action: RulebooksAction,
    },

    /// Inspect assembled worlds.
    Worlds {
        #[command(subcommand)]
        action: WorldsAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
pub(crate) struct IngestArgs {
    /// Game system shared by every rulebook in the batch (e.g. dnd5e).
    #[arg(long)]
    pub game_system: String,

    /// Name of the world assembled from this batch.
    #[arg(long = "world")]
    pub world_name: String,

    /// Rulebook category (defaults to `defaults.category`).
    #[arg(long)]
    pub category: Option<String>,

    /// World genre (defaults to `defaults.genre`).
    #[arg(long)]
    pub genre: Option<String>,

    /// World description.
    #[arg(long)]
    pub description: Option<String>,

    /// Make the world public.
    #[arg(long)]
    pub public: bool,

    /// Rulebook URL; may be repeated, and may hold several newline-separated URLs.
    #[arg(long = "url")]
    pub urls: Vec<String>,

    /// File with one URL per line.
    #[arg(long)]
    pub urls_file: Option<PathBuf>,

    /// Retry failed items up to this many rounds after the batch finishes.
    #[arg(long, default_value_t = 0)]
    pub retry_failed: u32,

    /// Rulebook files to upload.
    pub files: Vec<PathBuf>,
}

#[derive(Subcommand)]
pub(crate) enum RulebooksAction {
    /// List rulebooks, oldest first.
    List {
        #[arg(long)]
        game_system: Option<String>,

        #[arg(long)]
        category: Option<String>,

        /// `uploaded` or `extracted`.
        #[arg(long)]
        state: Option<String>,
    },
    /// Show one rulebook with its extracted content.
    Show {
        /// Rulebook id or exact title.
        rulebook: String,
    },
    /// Run extraction again for a rulebook stuck in `uploaded`.
    Reextract {
        /// Rulebook id.
        id: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum WorldsAction {
    /// List worlds, newest first.
    List,
    /// Show one world and its rulebooks.
    Show {
        /// World id.
        id: String,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Create default config file at ~/.worldforge/worldforge.toml.
    Init,
    /// Print the resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "worldforge=info",
        1 => "worldforge=debug",
        _ => "worldforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let db = cli.db.as_deref();
    match cli.command {
        Command::Ingest(args) => cmd_ingest(args, db).await,
        Command::Rulebooks { action } => match action {
            RulebooksAction::List {
                game_system,
                category,
                state,
            } => cmd_rulebooks_list(db, game_system, category, state.as_deref()).await,
            RulebooksAction::Show { rulebook } => cmd_rulebooks_show(db, &rulebook).await,
            RulebooksAction::Reextract { id } => cmd_rulebooks_reextract(db, &id).await,
        },
        Command::Worlds { action } => match action {
            WorldsAction::List => cmd_worlds_list(db).await,
            WorldsAction::Show { id } => cmd_worlds_show(db, &id).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

fn database_path(config: &AppConfig, db: Option<&Path>) -> Result<PathBuf> {
    match db {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(expand_home(&config.defaults.database_path)?),
    }
}

/// Wire the configured uploader and extractor to the database.
fn build_services(config: &AppConfig, storage: Arc<Storage>) -> Result<PipelineServices> {
    let api_key = validate_api_key(config)?;
    let extractor = OpenRouterExtractor::new(OpenRouterOptions {
        base_url: config.extractor.base_url.clone(),
        api_key,
        model: config.extractor.model.clone(),
        timeout: Duration::from_secs(config.extractor.timeout_secs),
    })?;

    let uploader: Arc<dyn Uploader> = match config.uploader.mode {
        UploaderMode::Local => Arc::new(LocalBlobStore::new(expand_home(
            &config.uploader.blob_dir,
        )?)?),
        UploaderMode::Http => {
            let endpoint = config
                .uploader
                .endpoint
                .as_deref()
                .ok_or_else(|| eyre!("uploader.endpoint is required when uploader.mode = \"http\""))?;
            let endpoint = Url::parse(endpoint)
                .map_err(|e| eyre!("invalid uploader.endpoint '{endpoint}': {e}"))?;
            let token = config
                .uploader
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|token| !token.is_empty());
            Arc::new(HttpUploader::new(
                endpoint,
                token,
                config.pipeline.call_timeout(),
            )?)
        }
    };

    Ok(PipelineServices::new(
        storage.clone(),
        storage,
        uploader,
        Arc::new(extractor),
    ))
}

/// Collect files first, then every URL from flags and the URL file.
fn collect_sources(args: &IngestArgs) -> Result<Vec<SourceRef>> {
    let mut sources: Vec<SourceRef> = args.files.iter().cloned().map(SourceRef::file).collect();

    for text in &args.urls {
        sources.extend(parse_url_list(text)?.into_iter().map(SourceRef::url));
    }
    if let Some(path) = &args.urls_file {
        let text = std::fs::read_to_string(path).map_err(|e| WorldforgeError::io(path, e))?;
        sources.extend(parse_url_list(&text)?.into_iter().map(SourceRef::url));
    }
    Ok(sources)
}

fn batch_meta(args: &IngestArgs, config: &AppConfig) -> Result<BatchMeta> {
    let visibility = if args.public {
        Visibility::Public
    } else {
        config
            .defaults
            .visibility
            .parse::<Visibility>()
            .map_err(|e| eyre!(e))?
    };

    Ok(BatchMeta {
        game_system: args.game_system.clone(),
        category: args
            .category
            .clone()
            .unwrap_or_else(|| config.defaults.category.clone()),
        world_name: args.world_name.clone(),
        world_description: args.description.clone(),
        genre: args
            .genre
            .clone()
            .unwrap_or_else(|| config.defaults.genre.clone()),
        visibility,
    })
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

async fn cmd_ingest(args: IngestArgs, db: Option<&Path>) -> Result<()> {
    let config = load_config()?;
    let sources = collect_sources(&args)?;
    let meta = batch_meta(&args, &config)?;

    let storage = Arc::new(Storage::open(&database_path(&config, db)?).await?);
    let services = build_services(&config, storage)?;
    let progress = Arc::new(CliProgress::new());
    let queue = QueueController::new(
        services,
        QueueOptions::from_config(&config.pipeline),
        progress.clone(),
    );

    info!(
        world = %meta.world_name,
        game_system = %meta.game_system,
        items = sources.len(),
        "submitting batch"
    );
    let mut outcome = queue.submit_batch(sources, meta).await?.wait().await?;

    for round in 1..=args.retry_failed {
        let failed: Vec<ItemId> = outcome.failed().map(QueueItem::id).collect();
        if failed.is_empty() {
            break;
        }
        info!(round, items = failed.len(), "retrying failed items");
        for handle in queue.retry_selected(&failed).await {
            outcome = handle.wait().await?;
        }
    }

    progress.finish();
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &BatchOutcome) {
    println!();
    println!("  {:<10} {:<38} TITLE", "STATUS", "RULEBOOK");
    for item in &outcome.items {
        let rulebook = item
            .result_rulebook_id()
            .or(item.record_id())
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<10} {:<38} {}",
            item.status().as_str(),
            rulebook,
            item.derived_title()
        );
        if let Some(error) = item.error() {
            println!("  {:<10} {}", "", error);
        }
    }

    let completed = outcome
        .items
        .iter()
        .filter(|item| item.status() == ItemStatus::Completed)
        .count();
    println!();
    println!("  Completed: {completed}/{}", outcome.items.len());
    match &outcome.world {
        Some(world) => println!(
            "  World:     {} ({} rulebooks) {}",
            world.name,
            world.rulebook_ids.len(),
            world.id
        ),
        None => println!("  World:     not created"),
    }
    if let Some(warning) = &outcome.warning {
        println!("  Warning:   {warning}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Spinner showing the item currently in flight; settled items are printed above it.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl QueueObserver for CliProgress {
    fn item_changed(&self, item: &QueueItem) {
        let title = item.derived_title();
        match item.status() {
            ItemStatus::Completed => self.spinner.println(format!("  done    {title}")),
            ItemStatus::Failed => self.spinner.println(format!(
                "  failed  {title}: {}",
                item.error().unwrap_or_default()
            )),
            status => self.spinner.set_message(format!("{status:<10} {title}")),
        }
    }

    fn batch_finished(&self, outcome: &BatchOutcome) {
        self.spinner
            .set_message(format!("batch {} finished", outcome.batch_id));
    }
}

// ---------------------------------------------------------------------------
// Rulebooks
// ---------------------------------------------------------------------------

async fn cmd_rulebooks_list(
    db: Option<&Path>,
    game_system: Option<String>,
    category: Option<String>,
    state: Option<&str>,
) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&database_path(&config, db)?).await?;

    let extraction_state = state
        .map(|s| s.parse::<ExtractionState>().map_err(|e| eyre!(e)))
        .transpose()?;
    let rulebooks = storage
        .list_rulebooks(&RulebookFilter {
            game_system,
            category,
            extraction_state,
        })
        .await?;

    if rulebooks.is_empty() {
        println!("No rulebooks found.");
        return Ok(());
    }
    println!(
        "{:<38} {:<10} {:<12} {:<14} TITLE",
        "ID", "STATE", "SYSTEM", "CATEGORY"
    );
    for rulebook in &rulebooks {
        println!(
            "{:<38} {:<10} {:<12} {:<14} {}",
            rulebook.id.to_string(),
            rulebook.extraction_state.as_str(),
            rulebook.game_system,
            rulebook.category,
            rulebook.title
        );
    }
    Ok(())
}

async fn find_rulebook(storage: &Storage, key: &str) -> Result<Rulebook> {
    let found = match key.parse::<RulebookId>() {
        Ok(id) => storage.get_rulebook(&id).await?,
        Err(_) => storage.find_rulebook_by_title(key).await?,
    };
    found.ok_or_else(|| eyre!("no rulebook with id or title '{key}'"))
}

async fn cmd_rulebooks_show(db: Option<&Path>, key: &str) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&database_path(&config, db)?).await?;
    let rulebook = find_rulebook(&storage, key).await?;
    print_rulebook(&rulebook)
}

fn print_rulebook(rulebook: &Rulebook) -> Result<()> {
    println!("  ID:       {}", rulebook.id);
    println!("  Title:    {}", rulebook.title);
    println!("  System:   {}", rulebook.game_system);
    println!("  Category: {}", rulebook.category);
    println!("  Source:   {}", rulebook.source_url);
    println!("  State:    {}", rulebook.extraction_state);
    println!("  Updated:  {}", rulebook.updated_at.to_rfc3339());
    if rulebook.content_extracted() {
        println!(
            "  Entries:  {}",
            rulebook.extracted_content.entry_count()
        );
        println!();
        println!(
            "{}",
            serde_json::to_string_pretty(&rulebook.extracted_content)?
        );
    }
    Ok(())
}

async fn cmd_rulebooks_reextract(db: Option<&Path>, id: &str) -> Result<()> {
    let id: RulebookId = id
        .parse()
        .map_err(|e| eyre!("invalid rulebook id '{id}': {e}"))?;
    let config = load_config()?;
    let storage = Arc::new(Storage::open(&database_path(&config, db)?).await?);
    let services = build_services(&config, storage)?;
    let policy = RetryPolicy::from_config(&config.pipeline);

    info!(%id, "re-extracting rulebook");
    let rulebook = reextract_rulebook(&services, &policy, &id).await?;
    print_rulebook(&rulebook)
}

// ---------------------------------------------------------------------------
// Worlds
// ---------------------------------------------------------------------------

async fn cmd_worlds_list(db: Option<&Path>) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&database_path(&config, db)?).await?;
    let worlds = storage.list_worlds().await?;

    if worlds.is_empty() {
        println!("No worlds found.");
        return Ok(());
    }
    println!(
        "{:<38} {:<8} {:<10} {:<12} {:>9}  NAME",
        "ID", "VISIBLE", "GENRE", "SYSTEM", "RULEBOOKS"
    );
    for world in &worlds {
        println!(
            "{:<38} {:<8} {:<10} {:<12} {:>9}  {}",
            world.id.to_string(),
            world.visibility.as_str(),
            world.genre,
            world.game_system,
            world.rulebook_ids.len(),
            world.name
        );
    }
    Ok(())
}

async fn cmd_worlds_show(db: Option<&Path>, id: &str) -> Result<()> {
    let id: WorldId = id
        .parse()
        .map_err(|e| eyre!("invalid world id '{id}': {e}"))?;
    let config = load_config()?;
    let storage = Storage::open_readonly(&database_path(&config, db)?).await?;
    let world = storage
        .get_world(&id)
        .await?
        .ok_or_else(|| eyre!("no world with id {id}"))?;

    print_world(&world);
    for rulebook_id in &world.rulebook_ids {
        match storage.get_rulebook(rulebook_id).await? {
            Some(rulebook) => println!(
                "    {} {:<10} {}",
                rulebook.id,
                rulebook.extraction_state.as_str(),
                rulebook.title
            ),
            None => println!("    {rulebook_id} (missing)"),
        }
    }
    Ok(())
}

fn print_world(world: &World) {
    println!("  ID:          {}", world.id);
    println!("  Name:        {}", world.name);
    if let Some(description) = &world.description {
        println!("  Description: {description}");
    }
    println!("  System:      {}", world.game_system);
    println!("  Genre:       {}", world.genre);
    println!("  Visibility:  {}", world.visibility.as_str());
    println!("  Created:     {}", world.created_at.to_rfc3339());
    println!("  Rulebooks:   {}", world.rulebook_ids.len());
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest(argv: &[&str]) -> IngestArgs {
        let mut full = vec!["worldforge", "ingest"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).expect("parse").command {
            Command::Ingest(args) => args,
            _ => panic!("expected ingest"),
        }
    }

    #[test]
    fn ingest_collects_files_then_urls() {
        let args = ingest(&[
            "--game-system",
            "dnd5e",
            "--world",
            "Test Realm",
            "--url",
            "https://cdn.example.com/srd.pdf\nhttps://cdn.example.com/extra.pdf",
            "core.pdf",
            "monsters.pdf",
        ]);
        let sources = collect_sources(&args).unwrap();
        let titles: Vec<String> = sources.iter().map(SourceRef::derive_title).collect();
        assert_eq!(titles, ["core", "monsters", "srd", "extra"]);
    }

    #[test]
    fn ingest_rejects_bad_url() {
        let args = ingest(&["--game-system", "dnd5e", "--world", "W", "--url", "nope"]);
        assert!(collect_sources(&args).is_err());
    }

    #[test]
    fn meta_falls_back_to_config_defaults() {
        let args = ingest(&["--game-system", "dnd5e", "--world", "W", "a.pdf"]);
        let meta = batch_meta(&args, &AppConfig::default()).unwrap();
        assert_eq!(meta.category, "core_rules");
        assert_eq!(meta.genre, "fantasy");
        assert_eq!(meta.visibility, Visibility::Private);

        let args = ingest(&[
            "--game-system",
            "dnd5e",
            "--world",
            "W",
            "--genre",
            "horror",
            "--public",
            "a.pdf",
        ]);
        let meta = batch_meta(&args, &AppConfig::default()).unwrap();
        assert_eq!(meta.genre, "horror");
        assert_eq!(meta.visibility, Visibility::Public);
    }

    #[test]
    fn ingest_requires_world_and_system() {
        assert!(Cli::try_parse_from(["worldforge", "ingest", "a.pdf"]).is_err());
    }

    #[test]
    fn explicit_db_wins() {
        let config = AppConfig::default();
        let path = database_path(&config, Some(Path::new("/tmp/wf.db"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/wf.db"));
    }
}
