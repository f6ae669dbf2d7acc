//! Configuration loading and registry bootstrap

use std::path::Path;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mirror_common::config::AppConfig;
use mirror_controller::Registry;

/// Find, load and validate the configuration
///
/// `dir` overrides the default search path (`/config/`, then `./config/`).
pub fn load_config(dir: Option<&Path>) -> anyhow::Result<AppConfig> {
    let dir = AppConfig::discover(dir).context("no configuration directory found")?;
    let config = AppConfig::load_from_dir(&dir)
        .with_context(|| format!("failed to load configuration from {}", dir.display()))?;
    config.validate().context("invalid configuration")?;
    info!(
        dir = %dir.display(),
        clusters = config.clusters.len(),
        mirrors = config.mirrors.len(),
        "configuration loaded"
    );
    Ok(config)
}

/// Register clusters and mirrors, then start everything
///
/// A cluster that can't be connected aborts startup. A mirror that fails to
/// build is logged and skipped so the others keep running. Returns false if
/// `token` fired before the caches were warm.
pub async fn bootstrap(config: &AppConfig, registry: &Registry) -> anyhow::Result<bool> {
    for cluster in &config.clusters {
        registry
            .init_cluster(cluster)
            .await
            .with_context(|| format!("unable to initialize cluster {}", cluster.name))?;
    }

    for mirror in &config.mirrors {
        match registry.update_mirror(mirror).await {
            Ok(()) => info!(mirror = %mirror.name, "mirror running"),
            Err(e) => error!(mirror = %mirror.name, error = %e, "failed to build mirror"),
        }
    }

    Ok(registry.start_all().await?)
}

/// Bootstrap, then run until `token` fires and stop the registry
pub async fn run(config: &AppConfig, registry: &Registry, token: &CancellationToken) -> anyhow::Result<()> {
    if bootstrap(config, registry).await? {
        token.cancelled().await;
    }
    registry.shutdown().await;
    Ok(())
}
