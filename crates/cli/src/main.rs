mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use db::{
    ClusterRepository, EntityFilter, EntityStore, MemoryStore, PageRequest, TaskRepository,
    TaskStore,
};
use orchestrator::{CLOUD_INIT_ENTITY_TYPE, SCRIPTED_ENTITY_TYPE};
use server::config::ServerConfig;
use server::{create_router, state::AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{CliConfig, CONFIG_FILE};

const DATA_DIR: &str = ".clusterctl";
const DEFAULT_DB_NAME: &str = "clusters.db";

#[derive(Parser)]
#[command(name = "clusterctl")]
#[command(about = "Kubernetes cluster lifecycle service", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding configuration and the cluster database
    #[arg(long, global = true, default_value = DATA_DIR)]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Write default configuration and create the database
    Init,
    /// Run the HTTP API
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        /// Keep clusters and tasks in memory instead of the database
        #[arg(long)]
        in_memory: bool,
    },
    /// List stored clusters
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init) => init(&cli.data_dir).await,
        Some(Commands::Serve { port, in_memory }) => serve(&cli.data_dir, port, in_memory).await,
        Some(Commands::Status) => status(&cli.data_dir).await,
        None => serve(&cli.data_dir, None, false).await,
    }
}

fn database_url(data_dir: &Path) -> String {
    format!("sqlite:{}", data_dir.join(DEFAULT_DB_NAME).display())
}

async fn init(data_dir: &Path) -> Result<()> {
    if data_dir.join(CONFIG_FILE).exists() {
        println!("Already initialized at {}", data_dir.display());
        return Ok(());
    }

    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    CliConfig::default().save(data_dir).await?;
    ServerConfig::default()
        .write(data_dir)
        .await
        .context("Failed to write server config")?;

    let pool = db::create_pool(&database_url(data_dir))
        .await
        .context("Failed to create database pool")?;
    db::run_migrations(&pool).await?;

    println!();
    println!("Initialized clusterctl in {}", data_dir.display());
    println!();
    println!("Created:");
    println!("  {}/", data_dir.display());
    println!("  ├── {}", CONFIG_FILE);
    println!("  ├── {}", server::config::CONFIG_FILE);
    println!("  └── {}", DEFAULT_DB_NAME);
    println!();
    println!("Next steps:");
    println!("  1. Set orchestrator.default_template in {}", CONFIG_FILE);
    println!("  2. Run 'clusterctl serve' to start the API");

    Ok(())
}

async fn serve(data_dir: &Path, port: Option<u16>, in_memory: bool) -> Result<()> {
    init_tracing();

    let config = CliConfig::load(data_dir).await?;
    let server_config = ServerConfig::read(data_dir).await;
    let port = port.unwrap_or(config.server.port);

    let (entities, task_store): (Arc<dyn EntityStore>, Arc<dyn TaskStore>) = if in_memory {
        tracing::info!("Using in-memory cluster store");
        let store = Arc::new(MemoryStore::new());
        (
            store.clone() as Arc<dyn EntityStore>,
            store as Arc<dyn TaskStore>,
        )
    } else {
        tokio::fs::create_dir_all(data_dir).await?;
        let url = database_url(data_dir);
        tracing::info!(database = %url, "Using SQLite cluster store");

        let pool = db::create_pool(&url)
            .await
            .context("Failed to create database pool")?;
        db::run_migrations(&pool).await?;
        (
            Arc::new(ClusterRepository::new(pool.clone())) as Arc<dyn EntityStore>,
            Arc::new(TaskRepository::new(pool)) as Arc<dyn TaskStore>,
        )
    };

    let state = AppState::simulated(entities, task_store, &server_config, config.orchestrator)
        .context("Failed to build cluster backends")?;
    if server_config.task_prune_interval_secs > 0 {
        state.spawn_task_pruner(Duration::from_secs(server_config.task_prune_interval_secs));
    }
    let app = create_router(state);

    let address = format!("{}:{}", config.server.host, port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;

    println!();
    println!("clusterctl");
    println!("════════════════════════════════════════");
    println!();
    println!("  API Server:  http://localhost:{}", port);
    println!("  Swagger UI:  http://localhost:{}/swagger-ui", port);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

async fn status(data_dir: &Path) -> Result<()> {
    let db_path = data_dir.join(DEFAULT_DB_NAME);
    if !db_path.exists() {
        println!("No cluster database at {}.", db_path.display());
        println!("Run 'clusterctl init' to initialize.");
        return Ok(());
    }

    let config = CliConfig::load(data_dir).await?;
    let pool = db::create_pool(&database_url(data_dir)).await?;
    let clusters = ClusterRepository::new(pool);

    let mut entity_types = vec![SCRIPTED_ENTITY_TYPE.to_string(), CLOUD_INIT_ENTITY_TYPE.to_string()];
    if !entity_types.contains(&config.orchestrator.entity_type) {
        entity_types.push(config.orchestrator.entity_type);
    }

    let mut entities = Vec::new();
    for entity_type in &entity_types {
        let page = clusters
            .list_by_type(entity_type, &EntityFilter::default(), PageRequest::all())
            .await?;
        entities.extend(page.items);
    }
    entities.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    println!();
    if entities.is_empty() {
        println!("No clusters yet.");
    } else {
        println!("Clusters ({}):", entities.len());
        for entity in &entities {
            let phase = entity.status.phase;
            let status_icon = if phase.is_busy() {
                "◐"
            } else if phase.status == cluster_core::OperationStatus::Failed {
                "✗"
            } else {
                "●"
            };
            println!(
                "  {} {:<25} {:<20} {} nodes  {}/{}  {}",
                status_icon,
                entity.name,
                phase.to_string(),
                entity.status.nodes.len(),
                entity.org_name,
                entity.vdc_name,
                entity.entity_type,
            );
        }
    }
    println!();

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clusterctl=info,server=info,orchestrator=info,tower_http=info".into()),
        )
        .init();
}
