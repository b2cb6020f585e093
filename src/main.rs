//! Notion Cache Daemon - keeps a Notion database warm for protocol consumers
//!
//! Caches the database's "resource" and "prompt" items in a memory tier
//! backed by files on disk, and refreshes them in the background.

mod cache;
mod catalog;
mod config;
mod notion;
mod refresh;

use std::env;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cache::{Cache, DurableCache, LayeredCache, MemoryCache};
use catalog::{Catalog, ItemKind};
use config::Config;
use notion::NotionClient;
use refresh::{RefreshManager, RefreshOutcome, SnapshotSource};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Warm up, refresh periodically, wait for Ctrl+C (default)
    Serve,
    /// Populate the cache once and exit
    Warm,
    /// Run one change-detecting refresh cycle per key and exit
    Refresh,
    /// Print the cached items of one kind
    List { kind: ItemKind },
    /// Print one item with its content
    Show { id: String },
    /// Empty both cache tiers
    Clear,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"Notion Cache Daemon - keep a Notion database warm for protocol consumers

USAGE:
    notion-cache-daemon                       # Serve (default)
    notion-cache-daemon warm
    notion-cache-daemon refresh
    notion-cache-daemon list <resources|prompts>
    notion-cache-daemon show <item-id>
    notion-cache-daemon clear
    notion-cache-daemon help

COMMANDS:
    (none)  Warm the cache, refresh it periodically, run until Ctrl+C
    warm    Populate the cache once and exit
    refresh Re-fetch both collections, writing only what changed
    list    Print cached resources or prompts (fetches live on a miss)
    show    Print one item with its content blocks
    clear   Remove every cached entry, in memory and on disk
    help    Show this help message

ENVIRONMENT (also read from .env):
    NOTION_API_KEY           Notion integration token (required)
    NOTION_DATABASE_ID       Database holding the items (required)
    NOTION_TYPE_FIELD        Select property holding resource/prompt (default: Type)
    CACHE_TTL                Memory tier TTL (default: 5m)
    CACHE_DURABLE_TTL        TTL of warm-up and refresh writes (default: 1h)
    CACHE_DIR                Durable tier directory (default: user cache dir)
    CACHE_REFRESH_INTERVAL   Background refresh interval (default: 5m)
    REFRESH_ON_START         Warm the cache at startup (default: true)
    WARM_TIMEOUT             Give up on startup warm-up after (default: 60s)
    REQUEST_TIMEOUT          Per-request timeout (default: 30s)
    LOG_LEVEL                Log filter (falls back to RUST_LOG, then info)

Logs go to stderr.
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Serve);
    }

    match args[1].as_str() {
        "serve" => Ok(Command::Serve),
        "warm" => Ok(Command::Warm),
        "refresh" => Ok(Command::Refresh),
        "list" => {
            let kind = args
                .get(2)
                .ok_or_else(|| anyhow!("Usage: notion-cache-daemon list <resources|prompts>"))?;
            Ok(Command::List { kind: kind.parse()? })
        }
        "show" => {
            let id = args
                .get(2)
                .ok_or_else(|| anyhow!("Usage: notion-cache-daemon show <item-id>"))?;
            Ok(Command::Show { id: id.clone() })
        }
        "clear" => Ok(Command::Clear),
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

fn init_tracing(directives: &str) -> Result<()> {
    let filter = EnvFilter::try_new(directives)
        .unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG_LEVEL));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Everything a command needs, wired from configuration
struct Daemon {
    config: Config,
    memory: Arc<MemoryCache>,
    cache: Arc<dyn Cache>,
    catalog: Catalog,
    manager: RefreshManager,
    shutdown: CancellationToken,
}

impl Daemon {
    fn build(config: Config) -> Result<Self> {
        let client =
            NotionClient::new(&config.api_key, &config.database_id, config.request_timeout)?
                .with_base_url(&config.base_url);

        let memory = Arc::new(MemoryCache::new());
        let cache: Arc<dyn Cache> = match DurableCache::new(&config.cache_dir) {
            Ok(durable) => Arc::new(LayeredCache::new(
                memory.clone(),
                Arc::new(durable),
                config.cache_ttl,
            )),
            Err(e) => {
                error!(error = %e, "Durable cache unavailable, running memory-only");
                memory.clone()
            }
        };

        let source = Arc::new(SnapshotSource::new(client, config.snapshot_max_age()));
        let catalog = Catalog::new(
            cache.clone(),
            source,
            &config.type_field,
            config.durable_ttl,
            config.cache_ttl,
        );

        let shutdown = CancellationToken::new();
        let manager = RefreshManager::new(cache.clone(), config.durable_ttl, shutdown.clone());

        Ok(Self {
            config,
            memory,
            cache,
            catalog,
            manager,
            shutdown,
        })
    }

    async fn serve(&self) -> Result<()> {
        info!(
            database = %self.config.database_id,
            interval_secs = self.config.refresh_interval.as_secs(),
            "Starting Notion cache daemon"
        );

        let jobs = self.catalog.fetchers();

        if self.config.refresh_on_start {
            let warmed = self.manager.warm_all(&jobs, self.config.warm_timeout).await;
            if warmed < jobs.len() {
                warn!(
                warmed = warmed,
                total = jobs.len(),
                "Warm-up incomplete, reads will fetch live"
            );
            } else {
                info!(warmed = warmed, "Warm-up complete");
            }
        }

        for (key, fetch) in jobs {
            self.manager
                .start_periodic_refresh(key, self.config.refresh_interval, fetch)
                .await;
        }

        info!("Daemon ready. Press Ctrl+C to stop.");
        tokio::signal::ctrl_c().await?;

        let active: Vec<String> = self
            .manager
            .active_keys()
            .await
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        info!(keys = ?active, "Received shutdown signal, stopping refresh tasks...");
        self.shutdown.cancel();
        self.manager.stop_all().await;
        Ok(())
    }

    async fn warm(&self) -> Result<()> {
        let jobs = self.catalog.fetchers();
        let warmed = self.manager.warm_all(&jobs, self.config.warm_timeout).await;
        println!("Warmed {warmed} of {} cache keys.", jobs.len());
        if warmed < jobs.len() {
            bail!("Warm-up incomplete");
        }
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        let mut failed = 0;
        for (key, fetch) in self.catalog.fetchers() {
            let outcome = self.manager.refresh_once(key, &fetch).await;
            println!("{key}: {outcome:?}");
            if matches!(outcome, RefreshOutcome::FetchFailed | RefreshOutcome::WriteFailed) {
                failed += 1;
            }
        }
        if failed > 0 {
            bail!("{failed} refresh cycle(s) failed");
        }
        Ok(())
    }

    async fn list(&self, kind: ItemKind) -> Result<()> {
        let items = match kind {
            ItemKind::Resource => self.catalog.resources(&self.shutdown).await?,
            ItemKind::Prompt => self.catalog.prompts(&self.shutdown).await?,
        };
        if items.is_empty() {
            println!("No {kind} items.");
            return Ok(());
        }
        for item in items {
            let description = item.description();
            if description.is_empty() {
                println!("{}  {}", item.id, item.title());
            } else {
                println!("{}  {} - {}", item.id, item.title(), description);
            }
        }
        Ok(())
    }

    async fn show(&self, id: &str) -> Result<()> {
        let item = self.catalog.item(id, &self.shutdown).await?;
        println!("{}", item.title());
        println!("id: {}", item.id);
        println!("last edited: {}", item.last_modified_at.to_rfc3339());
        for (name, value) in &item.attributes {
            let json = serde_json::to_string(value).context("Failed to format property")?;
            println!("  {name}: {json}");
        }
        if !item.content_blocks.is_empty() {
            println!();
        }
        for block in &item.content_blocks {
            match &block.language {
                Some(language) => println!("[{} {}]\n{}", block.kind, language, block.text),
                None => println!("[{}] {}", block.kind, block.text),
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.catalog.clear().await?;
        println!("Cache cleared ({}).", self.config.cache_dir.display());
        Ok(())
    }

    /// Log final metrics and release the cache
    async fn close(&self) {
        self.memory.log_metrics();
        self.catalog.detail_cache().log_metrics();
        if let Err(e) = self.cache.close().await {
            warn!(error = %e, "Failed to close cache");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    if let Err(e) = dotenvy::dotenv() {
        let missing = matches!(
            e,
            dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound
        );
        if !missing {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {e:#}");
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = Config::from_env();

    // Initialize logging
    init_tracing(
        config
            .as_ref()
            .map_or(config::DEFAULT_LOG_LEVEL, |c| c.log_level.as_str()),
    )?;

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    let daemon = Daemon::build(config)?;

    let result = match command {
        Command::Serve => daemon.serve().await,
        Command::Warm => daemon.warm().await,
        Command::Refresh => daemon.refresh().await,
        Command::List { kind } => daemon.list(kind).await,
        Command::Show { id } => daemon.show(&id).await,
        Command::Clear => daemon.clear().await,
        Command::Help => Ok(()),
    };

    daemon.close().await;

    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "Command failed");
    }
    info!("Shutdown complete.");
    result
}
