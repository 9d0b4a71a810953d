use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use clap::{Parser, Subcommand};
use tracing::Level;

use quorum_coordinator::{
    DriverConfig, MessageRouter, OrchestratorConfig, PartyRegistry, PoolConfig, RouterConfig,
    SessionOrchestrator, SignRequest, StaticProvisioner, WorkerPool,
};
use quorum_core::{Provisioner, Transport};
use quorum_protocol::SimulatedEngineFactory;
use quorum_server::{AppState, ServerConfig};
use quorum_settings::{QuorumSettings, TransportMode};
use quorum_telemetry::{MetricsRecorder, TelemetryConfig};
use quorum_transport::{HttpTransport, HttpTransportConfig, LocalTransport};

#[derive(Parser)]
#[command(name = "quorum", version, about = "Threshold keygen and signing coordinator")]
struct Cli {
    /// Settings file. Defaults to $QUORUM_CONFIG, then ./quorum.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP coordinator (default).
    Serve,
    /// Run one keygen session in-process and print the public key.
    Keygen {
        #[arg(short, long, default_value_t = 2)]
        threshold: u16,
        #[arg(short = 'n', long, default_value_t = 3)]
        parties: u16,
        /// Sign this message with the new key afterwards.
        #[arg(long)]
        sign: Option<String>,
    },
    /// Print the effective settings as JSON.
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => quorum_settings::load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => quorum_settings::load_settings().context("failed to load settings")?,
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Serve => serve(settings).await,
        Command::Keygen {
            threshold,
            parties,
            sign,
        } => keygen_once(settings, threshold, parties, sign).await,
    }
}

fn telemetry_config(settings: &QuorumSettings) -> TelemetryConfig {
    let log_level = settings.logging.level.parse::<Level>().unwrap_or_else(|_| {
        eprintln!("unknown log level {:?}, using info", settings.logging.level);
        Level::INFO
    });
    let module_levels = settings
        .logging
        .modules
        .iter()
        .filter_map(|(module, level)| level.parse::<Level>().ok().map(|l| (module.clone(), l)))
        .collect();
    TelemetryConfig {
        log_level,
        module_levels,
        json: settings.logging.json,
        metrics_enabled: true,
    }
}

/// Seed the pool from units already running, then top up to `min_idle`.
async fn seed_pool(pool: &WorkerPool, provisioner: &dyn Provisioner, min_idle: usize) -> anyhow::Result<()> {
    for unit in provisioner.list_running().await? {
        pool.add_existing(unit);
    }
    let idle = pool.idle_count();
    if min_idle > idle {
        match provisioner.create(min_idle - idle).await {
            Ok(units) => {
                for unit in units {
                    pool.add_existing(unit);
                }
            }
            Err(e) => tracing::warn!(error = %e, min_idle, idle, "could not reach minimum idle workers"),
        }
    }
    tracing::info!(workers = pool.len(), "worker pool seeded");
    Ok(())
}

async fn build_orchestrator(
    settings: &QuorumSettings,
    metrics: Option<Arc<MetricsRecorder>>,
) -> anyhow::Result<Arc<SessionOrchestrator>> {
    let provisioner: Arc<dyn Provisioner> = Arc::new(StaticProvisioner::new(settings.pool.workers.clone()));

    let mut pool = WorkerPool::new(PoolConfig {
        allocate_timeout: settings.pool.allocate_timeout(),
    });
    if let Some(m) = &metrics {
        pool = pool.with_metrics(Arc::clone(m));
    }
    let pool = Arc::new(pool);
    seed_pool(&pool, provisioner.as_ref(), settings.pool.min_idle).await?;

    let registry = Arc::new(PartyRegistry::new());
    let call_timeout = Duration::from_millis(settings.router.call_timeout_ms);
    let transport: Arc<dyn Transport> = match settings.transport.mode {
        TransportMode::Local => Arc::new(LocalTransport::new(registry.clone())),
        TransportMode::Http => Arc::new(HttpTransport::new(HttpTransportConfig {
            scheme: settings.transport.scheme.clone(),
            call_timeout,
        })?),
    };

    let mut router = MessageRouter::new(
        Arc::clone(&registry),
        transport,
        RouterConfig {
            max_attempts: settings.router.max_attempts,
            backoff: Duration::from_millis(settings.router.backoff_ms),
            call_timeout,
        },
    );
    if let Some(m) = &metrics {
        router = router.with_metrics(Arc::clone(m));
    }

    let config = OrchestratorConfig {
        session_timeout: Duration::from_millis(settings.session.timeout_ms),
        max_parties: u16::try_from(settings.session.max_parties).unwrap_or(u16::MAX),
        auto_provision: settings.pool.auto_provision,
        min_idle: settings.pool.min_idle,
        driver: DriverConfig {
            flush_timeout: Duration::from_millis(settings.session.flush_timeout_ms),
        },
    };
    let mut orchestrator = SessionOrchestrator::new(
        pool,
        registry,
        Arc::new(router),
        Arc::new(SimulatedEngineFactory),
        config,
    )
    .with_provisioner(provisioner);
    if let Some(m) = metrics {
        orchestrator = orchestrator.with_metrics(m);
    }
    Ok(Arc::new(orchestrator))
}

async fn serve(settings: QuorumSettings) -> anyhow::Result<()> {
    let telemetry = quorum_telemetry::init_telemetry(telemetry_config(&settings));
    tracing::info!(
        transport = ?settings.transport.mode,
        filter = telemetry.filter(),
        "starting quorum coordinator"
    );

    let orchestrator = build_orchestrator(&settings, telemetry.metrics()).await?;
    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        request_timeout: settings.server.request_timeout(),
    };
    let handle = quorum_server::start(config, AppState::new(Arc::clone(&orchestrator), telemetry.metrics()))
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "quorum coordinator ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    orchestrator.abort_all();
    handle.shutdown().await;
    Ok(())
}

async fn keygen_once(
    mut settings: QuorumSettings,
    threshold: u16,
    parties: u16,
    message: Option<String>,
) -> anyhow::Result<()> {
    // Parties run in this process.
    settings.transport.mode = TransportMode::Local;
    settings.logging.json = false;
    let telemetry = quorum_telemetry::init_telemetry(telemetry_config(&settings));
    let orchestrator = build_orchestrator(&settings, telemetry.metrics()).await?;

    let key = orchestrator.keygen(threshold, parties).await?;
    println!("session:    {}", key.session_id);
    println!("public key: {}", hex::encode(&key.public_key));

    if let Some(message) = message {
        let sig = orchestrator
            .sign(SignRequest {
                parties,
                key_share: key.public_key.clone(),
                message: message.into_bytes().into(),
            })
            .await?;
        println!("key share:  {}", BASE64_STANDARD.encode(&key.public_key));
        println!("r:          {}", hex::encode(&sig.r));
        println!("s:          {}", hex::encode(&sig.s));
    }
    Ok(())
}
