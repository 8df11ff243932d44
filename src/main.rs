// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! nntpvfs — virtual-filesystem gateway over Usenet/NZB content.
//!
//! Usage:
//!   nntpvfs serve  --config config.toml
//!   nntpvfs ingest <nzb-path> --config config.toml --category movies --job-name "Some.Release.2026"
//!   nntpvfs ls     <path> --config config.toml
//!   nntpvfs cat    <id-or-path> --config config.toml
//!   nntpvfs health --config config.toml
//!
//! There is no WebDAV/HTTP surface here (explicit non-goal); `ls`/`cat`
//! exist only to drive the VFS `open`/list contract from a shell, the way
//! the teacher's CLI drove its pool files and segment index directly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{stdout, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use nntpvfs::config::{Config, ProviderPriority};
use nntpvfs::events::EventBus;
use nntpvfs::fetch::FetchEngine;
use nntpvfs::health::HealthScheduler;
use nntpvfs::ingest::IngestionPipeline;
use nntpvfs::pool::{spawn_reaper, Pool};
use nntpvfs::provider::{OperationContext, Provider, UsageType};
use nntpvfs::stream::SeekableRead;
use nntpvfs::vfs::{open_item, FileBlobStore, InMemoryMetadataStore, Item, MetadataStore, ROOT_ITEM_ID};

#[derive(Parser)]
#[command(name = "nntpvfs", about = "Virtual-filesystem gateway over Usenet/NZB content", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the health-check scheduler and idle reaper as background tasks and block.
    Serve {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Run the ingestion pipeline once and print the resulting item tree.
    Ingest {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Path to the .nzb file on disk.
        nzb_path: PathBuf,
        #[arg(long)]
        category: String,
        #[arg(long)]
        job_name: String,
    },
    /// List the children of a directory in the virtual tree.
    Ls {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Path, e.g. "movies/Some.Release.2026". Empty or "/" lists the root.
        #[arg(default_value = "")]
        path: String,
    },
    /// Open an item by id or path and stream its bytes to stdout.
    Cat {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Item id (UUID) or full path.
        id_or_path: String,
    },
    /// Run one health-check sweep and exit.
    Health {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve { config } => run_serve(config).await,
        Command::Ingest { config, nzb_path, category, job_name } => {
            run_ingest(config, nzb_path, category, job_name).await
        }
        Command::Ls { config, path } => run_ls(config, path).await,
        Command::Cat { config, id_or_path } => run_cat(config, id_or_path).await,
        Command::Health { config } => run_health(config).await,
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

/// Everything a subcommand needs, wired the same way regardless of which
/// one runs (spec §4.1/§4.3 composition root).
struct Bootstrap {
    config: Arc<Config>,
    pools: Vec<Pool>,
    engine: Arc<FetchEngine>,
    metadata: Arc<InMemoryMetadataStore>,
    blobs: Arc<FileBlobStore>,
    events: EventBus,
}

fn bootstrap(config_path: PathBuf) -> Result<Bootstrap> {
    let config = Config::from_file(&config_path).context("failed to load config")?;
    let config = Arc::new(config);

    let global = Arc::new(Semaphore::new(config.limits.global_connection_cap));
    let pools: Vec<Pool> = config
        .providers
        .iter()
        .map(|p| Pool::new(Provider::from(p), global.clone()))
        .collect();

    let primaries: Vec<Pool> = pools
        .iter()
        .filter(|p| p.provider().priority == ProviderPriority::Primary)
        .cloned()
        .collect();
    let backups: Vec<Pool> = pools
        .iter()
        .filter(|p| p.provider().priority == ProviderPriority::Backup)
        .cloned()
        .collect();

    let engine = Arc::new(FetchEngine::new(primaries, backups, config.timeouts.segment_fetch));
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(FileBlobStore::new(config.paths.blob_root.clone()));
    let events = EventBus::default();

    Ok(Bootstrap { config, pools, engine, metadata, blobs, events })
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn run_serve(config_path: PathBuf) -> Result<()> {
    let bs = bootstrap(config_path)?;
    info!(providers = bs.config.providers.len(), "starting nntpvfs");

    let shutdown = CancellationToken::new();
    let reaper_handles: Vec<_> = bs
        .pools
        .iter()
        .map(|pool| spawn_reaper(pool.clone(), bs.config.timeouts.idle_timeout, shutdown.clone()))
        .collect();

    let health = HealthScheduler::new(bs.metadata.clone(), bs.engine.clone(), bs.pools.clone(), bs.events.clone());
    let health_shutdown = shutdown.clone();
    let health_handle = tokio::spawn(async move {
        health.run(health_shutdown, unix_now).await;
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c, shutting down"),
        Err(e) => error!(error = %e, "signal error"),
    }

    shutdown.cancel();
    let _ = health_handle.await;
    for handle in reaper_handles {
        handle.abort();
    }
    Ok(())
}

async fn run_ingest(config_path: PathBuf, nzb_path: PathBuf, category: String, job_name: String) -> Result<()> {
    let bs = bootstrap(config_path)?;
    let nzb_xml = std::fs::read(&nzb_path).with_context(|| format!("reading {}", nzb_path.display()))?;

    let pipeline = IngestionPipeline::new(
        bs.engine.clone(),
        bs.pools.clone(),
        bs.metadata.clone(),
        bs.blobs.clone(),
        bs.events.clone(),
        bs.config.clone(),
    );

    let top_level = pipeline
        .ingest(&nzb_xml, &job_name, &category, unix_now())
        .await
        .context("ingestion failed")?;

    println!("Ingested {} item(s) under content/{category}/{job_name}:", top_level.len());
    for id in top_level {
        if let Some(item) = bs.metadata.get_item(id).await? {
            print_item_line(&item, 0);
        }
    }
    Ok(())
}

async fn run_ls(config_path: PathBuf, path: String) -> Result<()> {
    let bs = bootstrap(config_path)?;

    let parent_id = resolve_path(&*bs.metadata, &path).await?;
    let mut children = bs.metadata.list_children(parent_id).await?;
    children.sort_by(|a, b| a.name.cmp(&b.name));

    if children.is_empty() {
        println!("(empty)");
    }
    for child in &children {
        print_item_line(child, 0);
    }
    Ok(())
}

async fn run_cat(config_path: PathBuf, id_or_path: String) -> Result<()> {
    let bs = bootstrap(config_path)?;

    let item = resolve_item(&*bs.metadata, &id_or_path)
        .await?
        .with_context(|| format!("no such item: {id_or_path}"))?;

    let ctx = OperationContext::new(UsageType::Streaming).with_job_name(item.name.clone());
    let mut stream = open_item(&*bs.metadata, bs.engine.clone(), &bs.pools, &bs.config.limits, &item, ctx)
        .await
        .context("opening item")?;

    let mut out = stdout();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = stream.read(&mut buf).await.context("reading stream")?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).await.context("writing stdout")?;
    }
    out.flush().await.ok();
    stream.close().await;
    Ok(())
}

async fn run_health(config_path: PathBuf) -> Result<()> {
    let bs = bootstrap(config_path)?;
    let health = HealthScheduler::new(bs.metadata.clone(), bs.engine.clone(), bs.pools.clone(), bs.events.clone());
    let checked = health.run_once(unix_now()).await.context("health sweep failed")?;
    println!("Checked {checked} item(s).");
    Ok(())
}

/// Resolve a `/`-delimited path to the directory item id it names, `""`/`/`
/// meaning the synthetic root (spec §3).
async fn resolve_path(store: &dyn MetadataStore, path: &str) -> Result<Uuid> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(ROOT_ITEM_ID);
    }
    match store.get_item_by_path(trimmed).await? {
        Some(item) => Ok(item.id),
        None => bail!("no such directory: {path}"),
    }
}

/// Resolve a CLI argument that may be a UUID or a full path into an [`Item`].
async fn resolve_item(store: &dyn MetadataStore, id_or_path: &str) -> Result<Option<Item>> {
    if let Ok(id) = Uuid::parse_str(id_or_path) {
        return store.get_item(id).await.map_err(Into::into);
    }
    store
        .get_item_by_path(id_or_path.trim_matches('/'))
        .await
        .map_err(Into::into)
}

fn print_item_line(item: &Item, depth: usize) {
    let indent = "  ".repeat(depth);
    let size = item.size.map(|s| s.to_string()).unwrap_or_else(|| "?".into());
    println!("{indent}{:<36} {:>12}  {}", item.id.to_string(), size, item.name);
}
