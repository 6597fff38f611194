//! git-broker - serve or query a git repository through the caching broker
//!
//! # Usage
//! ```bash
//! git-broker serve /path/to/repository          # Start HTTP server
//! git-broker status /path/to/repository         # Working tree status as JSON
//! git-broker log /path/to/repository --limit 5  # Recent commits as JSON
//! git-broker branches /path/to/repository       # Branches as JSON
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use git_broker::git::{Repository, SharedRepo};
use git_broker::{GitService, ServiceConfig, routes};

/// Concurrent git broker with result caching, process pooling and lock-aware retries
#[derive(Parser)]
#[command(name = "git-broker")]
#[command(about = "Serve and query git repositories through a caching broker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// git executable, overriding `runner.executable` from the config file
    #[arg(long, global = true, value_name = "PATH")]
    git: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the repository over HTTP
    Serve {
        #[arg(value_name = "REPO_PATH")]
        repo_path: PathBuf,

        /// Port to run the server on
        #[arg(short, long, default_value = "3001")]
        port: u16,
    },
    /// Print working tree status
    Status {
        #[arg(value_name = "REPO_PATH")]
        repo_path: PathBuf,
    },
    /// Print recent commits
    Log {
        #[arg(value_name = "REPO_PATH")]
        repo_path: PathBuf,

        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Print local and remote branches
    Branches {
        #[arg(value_name = "REPO_PATH")]
        repo_path: PathBuf,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_repository(service: &Arc<GitService>, path: &Path) -> anyhow::Result<SharedRepo> {
    let repo = Repository::open(Arc::clone(service), path)
        .with_context(|| format!("Failed to open repository at {}", path.display()))?;
    Ok(Arc::new(repo))
}

async fn serve(service: Arc<GitService>, repo: SharedRepo, port: u16) -> anyhow::Result<()> {
    if let Err(e) = service.watch(repo.id()) {
        warn!(error = %e, "filesystem watching unavailable, relying on TTL and explicit refreshes");
    }

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(routes::create_router(Arc::clone(&repo)))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to port {port}; try --port <PORT>"))?;

    println!();
    println!("  git-broker");
    println!();
    println!("  Repository: {}", repo.path);
    println!("  Server:     http://{addr}");
    println!("  Git:        {}", service.git_program().display());
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
        }
        println!("\n  Shutting down...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn run(command: &Commands, service: &Arc<GitService>) -> anyhow::Result<()> {
    match command {
        Commands::Serve { repo_path, port } => {
            let repo = open_repository(service, repo_path)?;
            serve(Arc::clone(service), repo, *port).await
        }
        Commands::Status { repo_path } => {
            let repo = open_repository(service, repo_path)?;
            print_json(&repo.status().await?)
        }
        Commands::Log { repo_path, limit } => {
            let repo = open_repository(service, repo_path)?;
            print_json(&repo.commits(*limit, 0, None).await?)
        }
        Commands::Branches { repo_path } => {
            let repo = open_repository(service, repo_path)?;
            print_json(&repo.list_branches().await?)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing (quieter for production)
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(git) = cli.git {
        config.runner.executable = Some(git);
    }
    let service = Arc::new(GitService::new(config));
    service.start();

    let result = run(&cli.command, &service).await;
    service.shutdown().await;
    result
}
