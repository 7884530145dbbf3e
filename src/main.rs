//! Farsight binary — thin CLI shell over the [`farsight`] library crate.

use clap::Parser;
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use farsight::api::{self, AppContext, FINALIZE_AGE_SECS};
use farsight::evaluator::Evaluator;
use farsight::index::{CodeIndex, IndexSet};
use farsight::intent::IntentGraph;
use farsight::outline::EnrichmentStore;
use farsight::predict::PredictionEngine;
use farsight::registry::{ProjectEntry, ProjectRegistry};
use farsight::scorer::Scorer;
use farsight::store::{MemoryStore, RedisStore, ScoreStore};
use farsight::transition::TransitionModel;
use farsight::tuner::WeightTuner;
use farsight::types::IndexConfig;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Predictive file-context sidecar — watches agent tool use, learns access
/// patterns, and serves prefetched ranked file context.
#[derive(Parser)]
#[command(name = "farsight", version, about, long_about = None)]
struct Cli {
    /// Code root to index (default: current directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Named project (repeatable, format: NAME=PATH)
    #[arg(long = "project", value_name = "NAME=PATH")]
    projects: Vec<String>,

    /// Directory of cloned external repos; each subdirectory becomes a project
    #[arg(long)]
    repos_dir: Option<PathBuf>,

    /// KV connection string (FARSIGHT_KV_URL is honored when unset)
    #[arg(long)]
    kv_url: Option<String>,

    /// Force the in-memory score store (no KV; state dies with the process)
    #[arg(long)]
    memory_store: bool,

    /// Bind port (default: PORT env var, then scan 8450-8459)
    #[arg(long)]
    port: Option<u16>,

    /// Bind to 0.0.0.0 instead of 127.0.0.1
    #[arg(long)]
    bind_all: bool,

    /// Directory of agent session logs to replay into the transition model
    #[arg(long)]
    sessions_dir: Option<PathBuf>,

    /// Wall-clock seconds saved per avoided token, for savings reporting
    #[arg(long, default_value_t = 0.0075)]
    seconds_per_token: f64,

    /// Project registry file (default: ~/.farsight/projects.json)
    #[arg(long)]
    registry_file: Option<PathBuf>,
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
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("farsight=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // ---------------------------------------------------------------------
    // Project registry + specs
    // ---------------------------------------------------------------------

    let registry_file = cli
        .registry_file
        .clone()
        .or_else(|| farsight::config_dir().map(|d| d.join("projects.json")))
        .unwrap_or_else(|| PathBuf::from(".farsight-projects.json"));
    let registry = Arc::new(ProjectRegistry::load(registry_file));

    let mut specs: Vec<(String, PathBuf)> = Vec::new();

    let code_root = cli
        .root
        .clone()
        .or_else(|| std::env::var_os("FARSIGHT_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| {
                error!("Could not determine current directory. Use --root <path>");
                std::process::exit(1);
            })
        });
    let code_root = code_root.canonicalize().unwrap_or_else(|e| {
        // Unreadable code root is a configuration error: abort.
        error!(root = %code_root.display(), error = %e, "Code root not found");
        std::process::exit(1);
    });
    let root_name = code_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("default")
        .to_string();
    specs.push((root_name, code_root));

    for spec in &cli.projects {
        match spec.split_once('=') {
            Some((name, path)) => {
                let root = PathBuf::from(path).canonicalize().unwrap_or_else(|e| {
                    error!(project = name, path = path, error = %e, "Project path not found");
                    std::process::exit(1);
                });
                specs.push((name.to_string(), root));
            }
            None => {
                error!(spec = spec.as_str(), "Invalid --project format, expected NAME=PATH");
                std::process::exit(1);
            }
        }
    }

    if let Some(repos_dir) = &cli.repos_dir {
        match std::fs::read_dir(repos_dir) {
            Ok(entries) => {
                for entry in entries.filter_map(|e| e.ok()) {
                    let path = entry.path();
                    if path.is_dir() {
                        let name =
                            entry.file_name().to_string_lossy().to_string();
                        specs.push((name, path));
                    }
                }
            }
            Err(e) => {
                warn!(dir = %repos_dir.display(), error = %e, "Repos directory unreadable, skipping");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Register and scan all projects (parallel via rayon)
    // ---------------------------------------------------------------------

    let entries: Vec<ProjectEntry> =
        specs.iter().map(|(name, root)| registry.register(name, root)).collect();
    let default_project = entries.first().map(|e| e.id.clone());

    let indexes = Arc::new(IndexSet::new());
    let scanned: Vec<(String, CodeIndex)> = entries
        .par_iter()
        .map(|entry| {
            let config = IndexConfig::load(entry.path.clone());
            (entry.id.clone(), CodeIndex::scan(&entry.name, &entry.path, config))
        })
        .collect();
    let total_files: usize = scanned.iter().map(|(_, i)| i.file_count()).sum();
    for (id, index) in scanned {
        indexes.insert(&id, index);
    }
    info!(projects = entries.len(), files = total_files, "Scan complete");

    // ---------------------------------------------------------------------
    // Score store: KV when reachable, in-memory degraded mode otherwise
    // ---------------------------------------------------------------------

    let kv_url = cli
        .kv_url
        .clone()
        .or_else(|| std::env::var("FARSIGHT_KV_URL").ok())
        .unwrap_or_else(|| "redis://127.0.0.1:6379/0".to_string());
    let store: Arc<dyn ScoreStore> = if cli.memory_store {
        info!("Using in-memory score store (--memory-store)");
        Arc::new(MemoryStore::new())
    } else {
        match RedisStore::connect(&kv_url).await {
            Ok(s) => {
                info!(url = kv_url.as_str(), "Connected to KV store");
                Arc::new(s)
            }
            Err(e) => {
                warn!(url = kv_url.as_str(), error = %e, "KV unreachable, falling back to in-memory store");
                Arc::new(MemoryStore::new())
            }
        }
    };

    // ---------------------------------------------------------------------
    // Composition root
    // ---------------------------------------------------------------------

    let scorer = Arc::new(Scorer::new(Arc::clone(&store)));
    let transitions = Arc::new(TransitionModel::new(Arc::clone(&store)));
    let evaluator = Arc::new(Evaluator::new(Arc::clone(&store)));
    let tuner = Arc::new(WeightTuner::new(Arc::clone(&store)));
    let engine = Arc::new(PredictionEngine::new(
        Arc::clone(&scorer),
        Arc::clone(&transitions),
        Arc::clone(&evaluator),
        Arc::clone(&tuner),
        Arc::clone(&indexes),
    ));

    let ctx = AppContext {
        indexes: Arc::clone(&indexes),
        intents: Arc::new(IntentGraph::new(cli.seconds_per_token)),
        scorer,
        transitions: Arc::clone(&transitions),
        evaluator: Arc::clone(&evaluator),
        tuner: Arc::clone(&tuner),
        engine,
        registry: Arc::clone(&registry),
        enrichment: Arc::new(EnrichmentStore::new()),
        default_project: default_project.clone(),
        start_time: std::time::Instant::now(),
    };

    // Replay persisted session logs into the transition model, off the
    // serving path.
    if let Some(sessions_dir) = cli.sessions_dir.clone() {
        if let (Some(project), Some(entry)) = (default_project.clone(), entries.first().cloned()) {
            let transitions = Arc::clone(&transitions);
            tokio::spawn(async move {
                if let Err(e) = farsight::session_log::replay_dir(
                    &transitions,
                    &project,
                    &entry.path,
                    &sessions_dir,
                )
                .await
                {
                    warn!(error = %e, "Session log replay failed");
                }
            });
        }
    }

    // Live re-indexing.
    let _watcher = farsight::watch::start_watcher(Arc::clone(&indexes));

    // Periodic maintenance: finalize stale batches (feeding misses back to
    // the tuner) and decay recency scores.
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
            loop {
                interval.tick().await;
                let mut projects: Vec<String> =
                    ctx.registry.all().into_iter().map(|e| e.id).collect();
                projects.push(farsight::types::GLOBAL_PROJECT.to_string());
                for project in projects {
                    match ctx.evaluator.finalize(&project, FINALIZE_AGE_SECS, None).await {
                        Ok(finalized) => {
                            for (_, arm) in &finalized {
                                if let Some(arm) = arm {
                                    let _ =
                                        ctx.tuner.record_feedback(&project, *arm, false).await;
                                }
                            }
                            if !finalized.is_empty() {
                                info!(project = project.as_str(), count = finalized.len(), "Finalized stale prediction batches");
                            }
                        }
                        Err(e) => warn!(error = %e, "Batch finalization failed"),
                    }
                    if let Err(e) = ctx.scorer.apply_decay(&project, None).await {
                        warn!(error = %e, "Recency decay failed");
                    }
                }
            }
        });
    }

    // ---------------------------------------------------------------------
    // HTTP server
    // ---------------------------------------------------------------------

    // Per-request deadline; downstream work is dropped with the future.
    let app = api::router(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(10)))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let explicit_port: Option<u16> =
        cli.port.or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()));
    let listener = if let Some(port) = explicit_port {
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await.unwrap_or_else(|e| {
            error!(port = port, error = %e, "Could not bind to port");
            std::process::exit(1);
        })
    } else {
        const BASE: u16 = 8450;
        const RANGE: u16 = 10;
        let mut found = None;
        for port in BASE..BASE + RANGE {
            if let Ok(l) = tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                found = Some(l);
                break;
            }
        }
        found.unwrap_or_else(|| {
            error!(range_start = BASE, range_end = BASE + RANGE - 1, "No free port found");
            eprintln!("  Try: farsight --port <port>");
            std::process::exit(1);
        })
    };

    let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    info!(port = port, "http://localhost:{port}");
    // Machine-readable line for hook scripts (not through tracing).
    eprintln!("FARSIGHT_PORT={port}");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.unwrap();
}
