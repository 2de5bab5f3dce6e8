//! Devatlas binary — thin CLI shell over the [`devatlas_server`] library.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use devatlas_server::agent::runtime::RuntimeConfig;
use devatlas_server::agent::{AgentRuntime, openai::OpenAiProvider};
use devatlas_server::config::{CODE_COLLECTION, Config};
use devatlas_server::embed::{EmbeddingClient, HttpEmbeddingClient};
use devatlas_server::indexer::{IndexQueue, Indexer};
use devatlas_server::search::SearchEngine;
use devatlas_server::store::MetaStore;
use devatlas_server::stream::{StreamState, routes};
use devatlas_server::tools::{
    ToolRegistry, register_code_tools, register_fs_tools, register_knowledge_tools,
    register_task_tools,
};
use devatlas_server::types::{CancelToken, SearchRequest};
use devatlas_server::vector::{HttpVectorStore, VectorStore};
use devatlas_server::watch::WatchManager;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Code index and agent backend: semantic search over live-indexed
/// repositories with a streaming tool-calling agent.
#[derive(Parser)]
#[command(name = "devatlas", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path (default: ./devatlas.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a folder and run its initial scan
    AddFolder {
        /// Absolute folder path (host or container namespace)
        path: String,
        /// Optional human description
        #[arg(long)]
        description: Option<String>,
    },
    /// Remove an indexed folder and everything derived from it
    RemoveFolder {
        /// Folder path as originally added
        path: String,
    },
    /// Re-scan an indexed folder
    Scan {
        /// Folder path as originally added
        path: String,
    },
    /// Semantic code search
    Search {
        /// Query text
        query: String,
        /// Max results
        #[arg(long, default_value_t = 10)]
        limit: u32,
        /// Restrict to one indexed folder
        #[arg(long)]
        folder: Option<String>,
    },
    /// Show indexed folders and store counts
    Status,
    /// Run the streaming agent server (default)
    Serve,
}

// ---------------------------------------------------------------------------
// Component wiring
// ---------------------------------------------------------------------------

struct Backend {
    config: Config,
    store: Arc<MetaStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    indexer: Arc<Indexer>,
    search: Arc<SearchEngine>,
}

fn build_backend(config: Config) -> anyhow::Result<Backend> {
    let store = Arc::new(MetaStore::open(&config.db_path).context("opening metadata store")?);
    let vectors: Arc<dyn VectorStore> = Arc::new(HttpVectorStore::new(
        &config.vector_url,
        config.vector_api_key.clone(),
    ));
    let embedder: Arc<dyn EmbeddingClient> = Arc::new(HttpEmbeddingClient::new(
        &config.embedding_url,
        config.embedding_api_key.clone(),
        &config.embedding_model,
        config.embedding_dim,
    ));
    let mapper = Arc::new(config.path_mapper());
    if mapper.has_mappings() {
        info!(mappings = mapper.snapshot_mappings().len(), "Path mappings configured");
    }

    let indexer = Arc::new(Indexer::new(
        Arc::clone(&store),
        Arc::clone(&vectors),
        Arc::clone(&embedder),
        Arc::clone(&mapper),
        CODE_COLLECTION,
    ));
    let search = Arc::new(SearchEngine::new(
        Arc::clone(&store),
        Arc::clone(&vectors),
        Arc::clone(&embedder),
        mapper,
        CODE_COLLECTION,
    ));

    Ok(Backend { config, store, vectors, embedder, indexer, search })
}

async fn resolve_folder_id(backend: &Backend, path: &str) -> anyhow::Result<String> {
    let canonical = backend.indexer.mapper().to_container(path);
    let folder = backend
        .store
        .folder_by_path(&canonical)
        .await?
        .with_context(|| format!("folder '{canonical}' is not indexed"))?;
    Ok(folder.id)
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Serve mode
// ---------------------------------------------------------------------------

async fn serve(backend: Backend) -> anyhow::Result<()> {
    // A missing collection at startup is fatal; everything downstream
    // assumes it exists.
    backend
        .vectors
        .ensure_collection(CODE_COLLECTION, backend.embedder.dimensions())
        .await
        .context("creating vector collection")?;

    let provider =
        Arc::new(OpenAiProvider::from_config(&backend.config).context("configuring LLM provider")?);

    let mut registry = ToolRegistry::new();
    register_code_tools(
        &mut registry,
        Arc::clone(&backend.indexer),
        Arc::clone(&backend.search),
    )?;
    register_fs_tools(&mut registry, Arc::clone(backend.indexer.mapper()))?;
    register_task_tools(&mut registry, Arc::clone(&backend.store))?;
    register_knowledge_tools(
        &mut registry,
        Arc::clone(&backend.store),
        Arc::clone(&backend.vectors),
        Arc::clone(&backend.embedder),
    )?;
    info!(tools = registry.len(), "Tool registry ready");

    let runtime_config = RuntimeConfig {
        llm_timeout: std::time::Duration::from_secs(backend.config.llm_timeout_secs),
        ..RuntimeConfig::default()
    };
    let runtime = Arc::new(AgentRuntime::new(
        Arc::clone(&backend.store),
        Arc::new(registry),
        provider,
        runtime_config,
    ));

    // Incremental indexing: worker pool plus one watcher per folder.
    let shutdown = CancelToken::new();
    let queue = IndexQueue::start(Arc::clone(&backend.indexer), 4, shutdown.clone());
    let watcher = Arc::new(WatchManager::new(
        Arc::clone(&backend.indexer),
        queue,
        Arc::clone(backend.indexer.mapper()),
        shutdown.clone(),
    ));
    for folder in backend.store.list_folders().await? {
        if let Err(e) = watcher.watch_folder(&folder) {
            warn!(folder = folder.path.as_str(), error = %e, "Could not watch folder");
        }
    }
    info!(folders = watcher.watched_count(), "File watchers started");

    let app = routes(StreamState { runtime })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let bind = format!("{}:{}", backend.config.bind_addr, backend.config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let port = listener.local_addr()?.port();
    info!(port = port, "Stream server listening on ws://{}:{port}/ws/{{session}}", backend.config.bind_addr);
    // Machine-readable line for scripts (not through tracing)
    eprintln!("DEVATLAS_PORT={port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    watcher.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devatlas=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    // Unhandled panics are a runtime abort, distinct from config failures.
    std::panic::set_hook(Box::new(|info| {
        eprintln!("fatal: {info}");
        std::process::exit(2);
    }));

    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Configuration invalid");
            std::process::exit(1);
        }
    };

    let backend = match build_backend(config) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "Startup failed");
            std::process::exit(1);
        }
    };

    let outcome = match cli.command.unwrap_or(Commands::Serve) {
        Commands::AddFolder { path, description } => {
            run_add_folder(&backend, &path, description.as_deref()).await
        }
        Commands::RemoveFolder { path } => run_remove_folder(&backend, &path).await,
        Commands::Scan { path } => run_scan(&backend, &path).await,
        Commands::Search { query, limit, folder } => {
            run_search(&backend, &query, limit, folder).await
        }
        Commands::Status => run_status(&backend).await,
        Commands::Serve => serve(backend).await,
    };

    if let Err(e) = outcome {
        error!(error = %e, "Command failed");
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// CLI command handlers
// ---------------------------------------------------------------------------

async fn run_add_folder(
    backend: &Backend,
    path: &str,
    description: Option<&str>,
) -> anyhow::Result<()> {
    let folder = backend.indexer.add_folder(path, description).await?;
    let counters = backend
        .indexer
        .scan_folder(&folder.id, &CancelToken::new())
        .await?;
    println!("Added {} (id {})", folder.path, folder.id);
    println!(
        "Scanned {} files: {} indexed, {} updated, {} skipped",
        counters.total_files, counters.files_indexed, counters.files_updated, counters.files_skipped
    );
    Ok(())
}

async fn run_remove_folder(backend: &Backend, path: &str) -> anyhow::Result<()> {
    let folder_id = resolve_folder_id(backend, path).await?;
    backend.indexer.remove_folder(&folder_id).await?;
    println!("Removed {path}");
    Ok(())
}

async fn run_scan(backend: &Backend, path: &str) -> anyhow::Result<()> {
    let folder_id = resolve_folder_id(backend, path).await?;
    let counters = backend
        .indexer
        .scan_folder(&folder_id, &CancelToken::new())
        .await?;
    println!(
        "Scanned {} files: {} indexed, {} updated, {} skipped",
        counters.total_files, counters.files_indexed, counters.files_updated, counters.files_skipped
    );
    Ok(())
}

async fn run_search(
    backend: &Backend,
    query: &str,
    limit: u32,
    folder: Option<String>,
) -> anyhow::Result<()> {
    let hits = backend
        .search
        .search(&SearchRequest {
            query: query.to_string(),
            limit: Some(limit),
            folder_path: folder,
            ..SearchRequest::default()
        })
        .await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "{:>2}. {} [{}:{}-{}] score={:.3}",
            rank + 1,
            hit.relative_path,
            hit.language,
            hit.start_line,
            hit.end_line,
            hit.score
        );
        if let Some(first_line) = hit.content.lines().find(|l| !l.trim().is_empty()) {
            println!("    {}", first_line.trim());
        }
    }
    Ok(())
}

async fn run_status(backend: &Backend) -> anyhow::Result<()> {
    let folders = backend.store.list_folders().await?;
    let counts = backend.store.counts().await?;

    println!(
        "{} folders, {} files, {} chunks, {} sessions, {} messages",
        counts.folders, counts.files, counts.chunks, counts.sessions, counts.messages
    );
    for folder in folders {
        let scanned = folder
            .last_scanned_at
            .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
        println!(
            "  {} [{}] {} files, last scan {}{}",
            folder.path,
            folder.status.as_str(),
            folder.file_count,
            scanned,
            folder.error.map_or_else(String::new, |e| format!(" ({e})")),
        );
    }
    Ok(())
}
