// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kfs_meta::engine::SizeOutcome;
use kfs_meta::librarian::Librarian;
use kfs_meta::listing::Listing;
use kfs_meta::operations::Operations;
use kfs_meta::protocol::{self, ListMode, ListingRequest, OperationRequest, SortBy};
use kfs_meta::{Config, GlobalState, SharedState};

#[derive(Parser)]
#[command(author, version, about = "Metadata index and enrichment engine for a file tree", long_about = None)]
struct Cli {
    /// JSON config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Tree root
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Directory holding kfs.db instead of the tree root
    #[arg(long, global = true)]
    db_dir: Option<PathBuf>,
    /// Metadata service base URL
    #[arg(long, global = true)]
    meta_host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run maintenance and the watcher until Ctrl-C
    Serve,
    /// Reconcile the store with the filesystem
    Index {
        #[arg(default_value = "")]
        prefix: String,
        /// Repeat until a pass finds no changes
        #[arg(long)]
        dynamic: bool,
    },
    /// Drop records whose files are gone
    Orphans {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Aggregate size of a directory
    Size {
        prefix: String,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// List a directory as JSON
    List {
        #[arg(default_value = "")]
        path: String,
        #[arg(long)]
        find: bool,
        #[arg(long, default_value = "")]
        search: String,
        #[arg(long, default_value = "modtime")]
        sort_by: SortBy,
        /// Ascending order
        #[arg(long)]
        asc: bool,
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long, default_value = "")]
        open_with: String,
    },
    /// Cover image reference of a directory as JSON
    Thumb { path: String },
    /// Apply an action (delete, star, restore, unzip, label=X, mark=N, icons=Y)
    Op {
        dir: String,
        action: String,
        #[arg(required = true)]
        files: Vec<String>,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if config.root.as_os_str().is_empty() {
        config.root = std::env::current_dir()?;
    }
    if let Some(db_dir) = &cli.db_dir {
        config.db_dir = Some(db_dir.clone());
    }
    if let Some(host) = &cli.meta_host {
        config.meta_host = host.clone();
    }
    config.root = std::fs::canonicalize(&config.root).with_context(|| format!("root {}", config.root.display()))?;
    config.validate()?;
    Ok(config)
}

fn print_json(body: &[u8]) {
    println!("{}", String::from_utf8_lossy(body));
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing::info!("=");
    tracing::info!("kfs-meta {} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("Root: {}", config.root.display());
    tracing::info!("=");

    let state = GlobalState::open(config)?;
    tracing::info!("✓ Store opened: {}", state.store.db_path().display());
    tracing::info!("✓ Indexer, size and enrichment pools ready");

    match cli.command {
        Commands::Serve => serve(state).await?,
        Commands::Index { prefix, dynamic } => {
            if dynamic {
                let report = state.indexer.index_dynamically(vec![prefix]).await?;
                tracing::info!("✓ Dynamic index: {:?}", report);
            } else {
                let indexer = Arc::clone(&state.indexer);
                let stats = tokio::task::spawn_blocking(move || indexer.index(&[prefix])).await??;
                tracing::info!("✓ Index pass: {:?}", stats);
            }
        }
        Commands::Orphans { prefix } => {
            let removed = state.indexer.remove_orphan(&[prefix])?;
            tracing::info!("✓ Removed {} orphan record(s)", removed);
        }
        Commands::Size { prefix, timeout_ms } => {
            match state.sizer.size_with_timeout(&prefix, Duration::from_millis(timeout_ms)).await? {
                SizeOutcome::Computed(size) => println!("{}\t{}", size, bytesize::ByteSize(size).to_string_as(true)),
                SizeOutcome::Pending => println!("pending"),
            }
        }
        Commands::List { path, find, search, sort_by, asc, page, limit, open_with } => {
            let req = ListingRequest {
                path,
                mode: if find { ListMode::Find } else { ListMode::Read },
                search,
                sort_by,
                sort_desc: !asc,
                page,
                limit,
                open_with,
                ..ListingRequest::default()
            };
            let cancel = CancellationToken::new();
            print_json(&protocol::respond(Listing::list(&state, &req, &cancel).await)?);
        }
        Commands::Thumb { path } => match Listing::thumb(&state, &path).await {
            Ok(body) => print_json(&body),
            Err(e) => print_json(&protocol::respond::<()>(Err(e))?),
        },
        Commands::Op { dir, action, files } => {
            let req = OperationRequest { dir, files: files.into_iter().map(|f| (f, true)).collect(), action };
            print_json(&protocol::respond(Operations::apply(&state, &req).await)?);
        }
    }

    Ok(())
}

async fn serve(state: SharedState) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut librarian = Librarian::new(Arc::clone(&state), cancel.clone());
    librarian.start()?;
    tracing::info!("✓ Librarian (maintenance every {:?}) started", state.config.maintenance_interval);

    tokio::signal::ctrl_c().await?;
    tracing::info!("kfs-meta shutting down after {:?}...", state.uptime());
    librarian.stop().await;
    Ok(())
}
