//! Main entry point for the task orchestrator CLI.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use task_orchestrator::{
    cli,
    health::HealthMonitor,
    llm::ChatCompletionsClient,
    orchestrator::{OrchestrationOutcome, Orchestrator},
    server::{self, AppState},
    settings::Settings,
    state::StateSnapshot,
    store::{self, PersistentRegistry},
    telemetry,
    worker::HttpWorkerClient,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let settings = Settings::load()?;

    // Initialize telemetry
    telemetry::init(&settings.logging)?;

    // Execute the requested command
    match args.command {
        cli::Commands::Serve { addr } => serve(settings, addr).await,
        cli::Commands::Run { goal, state_file } => {
            let registry = load_registry(&settings).await?;
            let orchestrator = build_orchestrator(&settings, registry.clone(), state_file)?;
            let outcome = orchestrator.execute(&goal).await?;
            finish(&registry, outcome).await
        }
        cli::Commands::Resume { state_file } => {
            let snapshot = StateSnapshot::load_from_file(&state_file).await?;
            let registry = load_registry(&settings).await?;
            let orchestrator = build_orchestrator(&settings, registry.clone(), Some(state_file))?;
            orchestrator.restore_state(snapshot)?;
            let outcome = orchestrator.resume().await?;
            finish(&registry, outcome).await
        }
        cli::Commands::Agents => {
            let registry = load_registry(&settings).await?;
            println!("{}", serde_json::to_string_pretty(&registry.export_agents())?);
            Ok(())
        }
    }
}

/// Registry from the configured store, plus any seed cards.
async fn load_registry(settings: &Settings) -> Result<Arc<PersistentRegistry>> {
    let store = store::from_config(&settings.registry).await?;
    let registry = Arc::new(PersistentRegistry::new(store));
    registry.load().await?;

    if let Some(seed) = &settings.registry.seed_file {
        registry.seed_from_file(seed).await?;
        registry.save().await?;
    }
    Ok(registry)
}

fn build_orchestrator(
    settings: &Settings,
    registry: Arc<PersistentRegistry>,
    state_file: Option<PathBuf>,
) -> Result<Arc<Orchestrator>> {
    if settings.llm.api_key.is_none() {
        warn!("No LLM API key configured (ORCH_LLM_API_KEY); requests are sent unauthenticated");
    }
    let generator = Arc::new(ChatCompletionsClient::new(&settings.llm)?);
    let worker = Arc::new(HttpWorkerClient::new(settings.orchestrator.task_timeout())?);

    let mut orchestrator = Orchestrator::new(registry, generator, worker, &settings.orchestrator);
    if let Some(path) = state_file {
        orchestrator = orchestrator.with_state_file(path);
    }
    Ok(Arc::new(orchestrator))
}

async fn finish(registry: &PersistentRegistry, outcome: OrchestrationOutcome) -> Result<()> {
    registry.save().await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if outcome.success {
        Ok(())
    } else {
        Err(anyhow!(
            "Orchestration failed: {}",
            outcome.error.unwrap_or_else(|| "Unknown error".to_string())
        ))
    }
}

async fn serve(settings: Settings, addr: Option<SocketAddr>) -> Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => format!("{}:{}", settings.server.host, settings.server.port)
            .parse()
            .map_err(|e| anyhow!("Invalid server address: {}", e))?,
    };

    let registry = load_registry(&settings).await?;
    let orchestrator = build_orchestrator(&settings, registry.clone(), None)?;

    let monitor = if settings.health.enabled {
        info!("Starting health monitor every {}s", settings.health.interval_seconds);
        Some(HealthMonitor::new(registry.clone(), &settings.health)?.spawn())
    } else {
        None
    };

    let state = AppState {
        registry: registry.clone(),
        orchestrator,
    };
    let result = server::serve(addr, state, &settings.server).await;

    if let Some(handle) = monitor {
        handle.abort();
    }
    if let Err(e) = registry.save().await {
        error!("Failed to persist registry on shutdown: {}", e);
    }
    result
}
