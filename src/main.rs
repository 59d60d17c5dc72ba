use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::FutureExt;

use quill::config::Config;
use quill::feed::opml;
use quill::sched::BackgroundScheduler;
use quill::storage::{Database, SearchQuery, StoreError};
use quill::sync::{
    AccountKind, FeverClient, FeverStrategy, LocalStrategy, ReaderStrategy, RefreshCoordinator,
    RefreshReason, StrategyCache, SyncEngine,
};
use quill::util::derive_id;

/// Get the config directory path (~/.config/quill/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("quill"))
}

#[derive(Parser, Debug)]
#[command(
    name = "quill",
    about = "Feed synchronization engine with local and Fever-compatible backends"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch new articles for all feeds, or one
    Refresh {
        /// Feed URL or id to refresh
        #[arg(long)]
        feed: Option<String>,
        /// Bypass freshness windows and the failure breaker
        #[arg(long)]
        manual: bool,
    },
    /// Import subscriptions from an OPML file
    Import { file: PathBuf },
    /// Export subscriptions as OPML
    Export {
        /// Destination directory (defaults to the current directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Manage feeds
    Feeds {
        #[command(subcommand)]
        action: Option<FeedsAction>,
    },
    /// Manage folders
    Folders {
        #[command(subcommand)]
        action: Option<FoldersAction>,
    },
    /// Change article status
    Mark {
        #[command(subcommand)]
        action: MarkAction,
    },
    /// Full-text search over stored articles
    Search {
        query: String,
        /// Restrict to one feed (URL or id)
        #[arg(long)]
        feed: Option<String>,
    },
    /// Run the background refresh loop until interrupted
    Watch,
}

#[derive(Subcommand, Debug)]
enum FeedsAction {
    /// List feeds with unread counts (default)
    List,
    /// Subscribe to a feed URL
    Add { url: String },
    /// Unsubscribe (URL or id)
    Remove { feed: String },
}

#[derive(Subcommand, Debug)]
enum FoldersAction {
    /// List folders (default)
    List,
    Create {
        title: String,
    },
    Rename {
        id: i64,
        title: String,
    },
    Delete {
        id: i64,
    },
    /// Move a feed into a folder, or out of all folders
    Assign {
        feed: String,
        #[arg(long)]
        folder: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum MarkAction {
    Read { article_id: String },
    Unread { article_id: String },
    Save { article_id: String },
    Unsave { article_id: String },
    /// Mark everything read, optionally within one feed
    AllRead {
        #[arg(long)]
        feed: Option<String>,
    },
}

/// Accepts either a feed URL or an already-derived id.
fn feed_id_of(raw: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        derive_id(raw)
    } else {
        raw.to_string()
    }
}

fn build_strategy(
    config: &Config,
    db: &Database,
    client: &reqwest::Client,
) -> Result<(AccountKind, Arc<dyn ReaderStrategy>)> {
    match config.account.as_str() {
        "fever" => {
            let endpoint = config
                .fever_endpoint
                .clone()
                .context("account = \"fever\" requires fever_endpoint in the config")?;
            let api_key = config.fever_api_key().context(
                "account = \"fever\" requires fever_api_key (or QUILL_FEVER_API_KEY)",
            )?;
            let fever = FeverClient::new(client.clone(), endpoint, api_key);
            Ok((
                AccountKind::Fever,
                Arc::new(FeverStrategy::new(fever, db.clone())),
            ))
        }
        "local" => {
            let engine = SyncEngine::new(db.clone(), client.clone(), config.seed_default_feeds);
            Ok((AccountKind::Local, Arc::new(LocalStrategy::new(engine))))
        }
        other => anyhow::bail!("Unknown account kind '{}' (expected local or fever)", other),
    }
}

async fn run_refresh(
    coordinator: &RefreshCoordinator,
    strategy: &Arc<dyn ReaderStrategy>,
    selected: Option<String>,
    reason: RefreshReason,
) -> Result<()> {
    let strategy = Arc::clone(strategy);
    let outcome = coordinator
        .refresh(reason, move || {
            async move { strategy.refresh(selected.as_deref(), reason).await }.boxed()
        })
        .await;
    match outcome {
        Ok(Some(summary)) => println!(
            "Refreshed {} feeds, {} new articles",
            summary.feeds_used, summary.new_articles
        ),
        Ok(None) => println!("Data is fresh, nothing to do"),
        Err(e) => anyhow::bail!("Refresh failed: {}", e),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // Credentials may live in the config file; keep it user-only on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(&config_dir) {
            let mut perms = metadata.permissions();
            perms.set_mode(0o700);
            if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to set config directory permissions to 0700"
                );
            }
        }
    }

    let config = Config::load(&config_dir.join("config.toml"))?;
    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| config_dir.join("quill.db").display().to_string());

    let db = match Database::open(&db_path).await {
        Ok(db) => db,
        Err(StoreError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of quill appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let client = reqwest::Client::builder()
        .user_agent(concat!("quill/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let cache = StrategyCache::new();
    let (kind, built) = build_strategy(&config, &db, &client)?;
    let strategy = cache.get_or_build("default", kind, || built).await;

    let stale_after = if config.refresh_stale_minutes > 0 {
        Duration::from_secs(config.refresh_stale_minutes * 60)
    } else {
        Duration::from_secs(5 * 60)
    };
    let coordinator = Arc::new(RefreshCoordinator::with_staleness(stale_after));

    match args.command {
        Command::Refresh { feed, manual } => {
            let selected = feed.map(|f| feed_id_of(&f));
            let reason = if manual {
                RefreshReason::Manual
            } else {
                RefreshReason::Foreground
            };
            run_refresh(&coordinator, &strategy, selected, reason).await?;
        }

        Command::Import { file } => {
            let path = file
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in OPML path"))?;
            let subscriptions = opml::parse(path).await?;
            if subscriptions.is_empty() {
                println!("No valid feeds found in {}", file.display());
                return Ok(());
            }
            let count = strategy
                .import_opml(&subscriptions)
                .await
                .map_err(|e| anyhow::anyhow!("Import failed: {}", e))?;
            println!("Imported {} feeds", count);
        }

        Command::Export { dir } => {
            let feeds = strategy
                .list_feeds()
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            let folders = strategy
                .list_folders()
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            let folder_titles: std::collections::HashMap<i64, String> =
                folders.into_iter().map(|f| (f.id, f.title)).collect();

            let outlines: Vec<opml::OpmlFeed> = feeds
                .into_iter()
                .map(|f| opml::OpmlFeed {
                    title: f.title,
                    xml_url: f.url,
                    html_url: f.html_url,
                    folder: f.folder_id.and_then(|id| folder_titles.get(&id).cloned()),
                })
                .collect();

            let dir = dir.unwrap_or_else(|| PathBuf::from("."));
            let path = dir.join(opml::export_filename());
            opml::export_to_file(&outlines, &path)?;
            println!("Exported {} feeds to {}", outlines.len(), path.display());
        }

        Command::Feeds { action } => match action.unwrap_or(FeedsAction::List) {
            FeedsAction::List => {
                let feeds = strategy
                    .list_feeds()
                    .await
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                let unread = db.unread_counts_by_feed().await?;
                for feed in feeds {
                    println!(
                        "{:>5}  {}  {}",
                        unread.get(&feed.id).copied().unwrap_or(0),
                        feed.id,
                        feed.title
                    );
                }
            }
            FeedsAction::Add { url } => {
                let feed = strategy
                    .add_feed(&url)
                    .await
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                println!("Subscribed: {} ({})", feed.title, feed.id);
            }
            FeedsAction::Remove { feed } => {
                strategy
                    .remove_feed(&feed_id_of(&feed))
                    .await
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                println!("Unsubscribed");
            }
        },

        Command::Folders { action } => match action.unwrap_or(FoldersAction::List) {
            FoldersAction::List => {
                for folder in strategy
                    .list_folders()
                    .await
                    .map_err(|e| anyhow::anyhow!("{}", e))?
                {
                    println!("{:>5}  {}", folder.id, folder.title);
                }
            }
            FoldersAction::Create { title } => {
                let id = strategy
                    .create_folder(&title)
                    .await
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                println!("Created folder {}", id);
            }
            FoldersAction::Rename { id, title } => {
                strategy
                    .rename_folder(id, &title)
                    .await
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                println!("Renamed");
            }
            FoldersAction::Delete { id } => {
                strategy
                    .delete_folder(id)
                    .await
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                println!("Deleted (feeds unassigned, not removed)");
            }
            FoldersAction::Assign { feed, folder } => {
                strategy
                    .set_feed_folder(&feed_id_of(&feed), folder)
                    .await
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                println!("Assigned");
            }
        },

        Command::Mark { action } => match action {
            MarkAction::Read { article_id } => strategy
                .set_read(&article_id, true)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?,
            MarkAction::Unread { article_id } => strategy
                .set_read(&article_id, false)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?,
            MarkAction::Save { article_id } => strategy
                .set_saved(&article_id, true)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?,
            MarkAction::Unsave { article_id } => strategy
                .set_saved(&article_id, false)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?,
            MarkAction::AllRead { feed } => {
                let feed_id = feed.map(|f| feed_id_of(&f));
                let count = strategy
                    .mark_all_read(feed_id.as_deref())
                    .await
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                println!("Marked {} articles read", count);
            }
        },

        Command::Search { query, feed } => {
            let page = db
                .search_page(&SearchQuery {
                    query,
                    feed_id: feed.map(|f| feed_id_of(&f)),
                    page: 0,
                    page_size: 25,
                })
                .await?;
            println!("{} matches", page.total);
            for article in page.articles {
                println!(
                    "{}  {}  {}",
                    article.id,
                    article.source.as_deref().unwrap_or("-"),
                    article.title
                );
            }
        }

        Command::Watch => {
            let scheduler = Arc::new(BackgroundScheduler::new(
                db.clone(),
                Arc::clone(&coordinator),
                Arc::clone(&strategy),
            ));
            if let Some(marker) = scheduler.consume_marker().await? {
                println!("{} new articles since last session", marker.count);
            }
            let interval = Duration::from_secs(config.background_interval_minutes * 60);
            if !scheduler.register(config.background_refresh, interval) {
                anyhow::bail!("Background refresh is disabled in the config");
            }
            println!("Watching (Ctrl-C to stop)");
            tokio::signal::ctrl_c().await?;
            println!("Stopped");
        }
    }

    Ok(())
}
