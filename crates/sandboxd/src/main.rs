use std::fmt;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use runtime_docker::{ensure_isolated_network, DockerConfig, DockerRuntime};
use sandbox_core::ContainerRuntime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::FormatTime;

use sandboxd::config::Config;
use sandboxd::events::{EventSink, LogSink, WebhookSink};
use sandboxd::gateway::Gateway;
use sandboxd::governor::{Governor, GovernorConfig};
use sandboxd::http::{router, AppState};
use sandboxd::lifecycle::{Controller, ControllerConfig};
use sandboxd::registry::Registry;
use sandboxd::store::{MemoryStore, RedisStore, StateStore};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "sandboxd", version, about = "Sandbox lifecycle manager")]
struct Cli {
    /// Bind address (overrides SANDBOX_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides SANDBOX_PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::from_env()?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    let config = Arc::new(config);

    let runtime = DockerRuntime::new(DockerConfig {
        binary: config.docker_binary.clone(),
        ..DockerConfig::default()
    })
    .await?;
    ensure_isolated_network(&config.docker_binary, &config.network).await?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);
    info!(backend = %runtime.name(), network = %config.network, "container runtime ready");

    let store: Arc<dyn StateStore> = match &config.redis_url {
        Some(url) => {
            info!(url = %url, "using redis state store");
            Arc::new(RedisStore::new(url)?)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let registry = Arc::new(Registry::new(Arc::clone(&store), config.purge_grace));
    let restored = registry.restore().await;
    if restored > 0 {
        warn!(count = restored, "restored persisted sandbox records; stale ones will be reaped");
    }

    let governor = Arc::new(Governor::new(GovernorConfig {
        max_sandboxes: config.max_containers,
        cpu_ceiling_milli: config.cpu_ceiling_milli,
        memory_ceiling_mb: config.memory_ceiling_mb,
        owner_max: config.owner_max,
    }));

    let events: Arc<dyn EventSink> = match &config.event_webhook {
        Some(url) => Arc::new(WebhookSink::new(url)),
        None => Arc::new(LogSink),
    };

    let controller = Arc::new(Controller::new(
        Arc::clone(&runtime),
        Arc::clone(&registry),
        Arc::clone(&governor),
        events,
        ControllerConfig::from(config.as_ref()),
    ));
    let gateway = Arc::new(Gateway::new(
        Arc::clone(&runtime),
        Arc::clone(&registry),
        config.job_timeout,
    ));

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(Arc::clone(&controller).run_sweeper(shutdown.clone()));

    let app = router(AppState {
        config: Arc::clone(&config),
        registry,
        governor,
        controller: Arc::clone(&controller),
        gateway,
    });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, max_containers = config.max_containers, "sandboxd listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    // Server stopped: stop the sweep, then retire every live sandbox so no
    // containers outlive the manager.
    shutdown.cancel();
    if let Err(e) = sweeper.await {
        error!(error = %e, "sweeper task panicked");
    }
    info!("draining live sandboxes");
    controller.drain().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        // Fall through: treat the listener failure as an immediate shutdown
        // request rather than running unstoppable.
    }
    info!("shutdown signal received");
}
