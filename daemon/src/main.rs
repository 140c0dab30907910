use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use overture_daemon::config::Args;
use overture_daemon::hub;
use overture_daemon::project::{ManifestProjectStore, ProjectStore};
use overture_daemon::prompt::PromptLoader;
use overture_daemon::registry::AdapterRegistry;
use overture_daemon::state::DaemonState;
use overture_daemon::store::JsonlMessageStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.config()?;

    let token = if args.require_auth() {
        match &args.token {
            Some(token) => Some(token.clone()),
            None => {
                error!("Token required. Use --token or set OVERTURE_DAEMON_TOKEN");
                std::process::exit(1);
            }
        }
    } else {
        warn!("Auth disabled (--insecure-no-auth). Do not use in production!");
        None
    };

    let data_dir = args.data_dir();
    info!("Data directory: {}", data_dir.display());
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
        info!("Created data directory: {}", data_dir.display());
    }

    let projects = Arc::new(ManifestProjectStore::load(&data_dir)?);
    let project_count = projects.list().await.len();
    info!("Loaded {} project(s)", project_count);

    let registry = Arc::new(AdapterRegistry::new(config.availability_cache));
    let messages = Arc::new(JsonlMessageStore::new(data_dir.join("messages")));
    let prompts = Arc::new(PromptLoader::new(args.prompts_dir.clone()));

    let state = Arc::new(DaemonState::new(
        config, token, registry, messages, projects, prompts,
    ));

    let app = hub::router(state.clone());
    let listener = TcpListener::bind(&args.listen).await?;
    info!("Listening on {}", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<DaemonState>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down");
    state.shutdown().await;
}
