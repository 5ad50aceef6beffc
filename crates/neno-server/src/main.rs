//! Neno Server - OpenAI/Ollama-compatible HTTP API over the inference
//! engine core.
//!
//! Exit codes: 0 success, 1 fatal initialization error, 2 invalid
//! configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod executor;
mod state;

use neno_core::{EngineCore, RunnerConfig, Tokenizer};

use executor::DaemonExecutor;
use neno_core::engine::ModelExecutor;
use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "neno", about = "Continuous-batching LLM inference server")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "neno.toml")]
    config: PathBuf,

    /// Override the configured listen address (host:port).
    #[arg(long)]
    listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "neno_server=debug,neno_core=debug,tower_http=debug"
    } else {
        "neno_server=info,neno_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting neno server");

    let config = match RunnerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal initialization error");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli, config: RunnerConfig) -> anyhow::Result<()> {
    let tokenizer = match &config.model.tokenizer_dir {
        Some(dir) => Some(Arc::new(Tokenizer::from_path(dir)?)),
        None => None,
    };

    let target: Arc<dyn ModelExecutor> =
        Arc::new(DaemonExecutor::connect(&config.model.daemon_socket)?);
    let draft: Option<Arc<dyn ModelExecutor>> = match &config.model.draft_daemon_socket {
        Some(socket) => Some(Arc::new(DaemonExecutor::connect(socket)?)),
        None => None,
    };

    let engine = Arc::new(EngineCore::new(
        config.engine.clone(),
        target,
        draft,
        tokenizer,
    )?);
    let state = AppState::new(engine.clone(), config.model.name.clone());

    let app = api::create_router(state, config.server.cors_enabled);

    let addr = cli.listen.unwrap_or_else(|| config.listen_addr());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    engine.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
