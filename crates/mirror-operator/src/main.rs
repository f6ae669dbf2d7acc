//! fleet-mirror - mirrors Kubernetes resources from a main cluster to followers

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mirror_common::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use mirror_common::telemetry::{init_telemetry, TelemetryConfig};
use mirror_common::{DEFAULT_HEALTH_PORT, DEFAULT_RESYNC_PERIOD, DEFAULT_WORKERS};
use mirror_controller::{KubeConnector, Registry, RegistryOptions};
use mirror_operator::{health, shutdown, startup};

/// fleet-mirror - keep resources on follower clusters in sync with a main cluster
#[derive(Parser, Debug)]
#[command(name = "fleet-mirror", version, about, long_about = None)]
struct Cli {
    /// Directory holding cluster.yaml and mirror.yaml (default: /config/, then ./config/)
    #[arg(long, env = "FLEET_MIRROR_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Workers per mirror controller
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Only run controllers while holding the leader lease
    #[arg(long)]
    enable_election: bool,

    /// Namespace of the leader lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    election_namespace: String,

    /// Port for /health and /ready
    #[arg(long, default_value_t = DEFAULT_HEALTH_PORT)]
    health_port: u16,

    /// Log filter (e.g. "debug" or "info,mirror_controller=trace"); overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    text_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        log_level: cli.log_level.clone(),
        json_logs: !cli.text_logs,
        ..Default::default()
    })?;

    let config = startup::load_config(cli.config_dir.as_deref())?;

    let token = CancellationToken::new();
    tokio::spawn(shutdown::cancel_on_signal(token.clone()));

    let registry = Arc::new(Registry::new(
        Arc::new(KubeConnector::default()),
        RegistryOptions {
            workers: cli.workers,
            resync_period: DEFAULT_RESYNC_PERIOD,
        },
        token.child_token(),
    ));
    let health_server = tokio::spawn(health::serve(cli.health_port, registry.clone(), token.clone()));

    let leadership = if cli.enable_election {
        match elect(&cli.election_namespace, &token).await? {
            Some(task) => Some(task),
            None => {
                health_server.await?;
                return Ok(());
            }
        }
    } else {
        None
    };

    let result = startup::run(&config, &registry, &token).await;
    token.cancel();

    if let Some(task) = leadership {
        task.await?;
    }
    health_server.await?;
    info!("fleet-mirror stopped");
    result
}

/// Wait for the leader lease; `None` if stopped first
///
/// The returned task cancels `token` when leadership is lost and releases the
/// lease once `token` fires.
async fn elect(
    namespace: &str,
    token: &CancellationToken,
) -> anyhow::Result<Option<tokio::task::JoinHandle<()>>> {
    let client = kube::Client::try_default().await?;
    let identity = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("fleet-mirror-{}", std::process::id()));
    let elector = Arc::new(LeaderElector::new(client, LEADER_LEASE_NAME, namespace, &identity));

    let mut guard = tokio::select! {
        guard = elector.acquire() => guard,
        _ = token.cancelled() => return Ok(None),
    };

    let token = token.clone();
    Ok(Some(tokio::spawn(async move {
        tokio::select! {
            _ = guard.lost() => {
                warn!("leadership lost, stopping");
                token.cancel();
            }
            _ = token.cancelled() => {
                if let Err(e) = guard.release().await {
                    warn!(error = %e, "failed to release leader lease");
                }
            }
        }
    })))
}
