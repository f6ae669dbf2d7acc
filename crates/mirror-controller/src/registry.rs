//! Cluster registry and mirror lifecycle
//!
//! The registry owns one [`ClusterConnection`] per configured cluster and the
//! mirror controllers built on top of them. Structural changes (cluster
//! add/update, mirror add/remove) are serialized under a single lock;
//! steady-state cache reads and client calls never take it.
//!
//! Mirrors are never mutated in place. Reconfiguring a mirror tears down every
//! controller it owns and builds fresh ones against the current clients.
//!
//! Connections are retained once created, even when no mirror references them
//! any more.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::discovery::ApiResource;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mirror_common::config::{ClusterConfig, MirrorDefinition, ResourceType};
use mirror_common::metrics::ControllerLabels;
use mirror_common::{Error, Result, DEFAULT_RESYNC_PERIOD, DEFAULT_WORKERS};
use mirror_filter::Filter;

use crate::client::{connection_error, Connector, ResourceClient};
use crate::controller::{controller_name, MirrorController};
use crate::informer::{InformerFactory, Lister};
use crate::selector::MatchRules;
use crate::sync::{Follower, Syncer};

// ============================================================================
// Cluster connections
// ============================================================================

/// Client and informer factories of one cluster, swapped as a unit on update
#[derive(Clone)]
struct ClusterParts {
    config: ClusterConfig,
    client: Arc<dyn ResourceClient>,
    /// Source-side caches, resynced periodically
    factory: Arc<InformerFactory>,
    /// Follower-side caches, warmed before any controller runs
    warmup: Arc<InformerFactory>,
}

impl ClusterParts {
    fn shutdown(&self) {
        self.factory.shutdown();
        self.warmup.shutdown();
    }
}

/// A source controller registered on its cluster
struct ControllerHandle {
    mirror: String,
    controller: Arc<MirrorController>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerHandle {
    fn start(&self) {
        let mut task = self.task.lock();
        if task.is_none() {
            *task = Some(tokio::spawn(Arc::clone(&self.controller).run()));
        }
    }

    async fn stop(self) {
        self.controller.stop();
        let task = self.task.lock().take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    warn!(mirror = %self.controller.name(), error = %e, "controller task failed");
                }
            }
            None => self.controller.detach(),
        }
    }
}

/// A known cluster
pub struct ClusterConnection {
    name: String,
    parts: RwLock<ClusterParts>,
    /// Follower-side listers keyed by controller name
    listers: DashMap<String, Lister>,
    /// Controllers using this cluster as their source, keyed by controller name
    controllers: DashMap<String, ControllerHandle>,
}

impl ClusterConnection {
    fn new(parts: ClusterParts) -> Self {
        Self {
            name: parts.config.name.clone(),
            parts: RwLock::new(parts),
            listers: DashMap::new(),
            controllers: DashMap::new(),
        }
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration the current client was built from
    pub fn config(&self) -> ClusterConfig {
        self.parts.read().config.clone()
    }

    /// Lister this cluster serves to a controller as a follower
    pub fn lister(&self, controller: &str) -> Option<Lister> {
        self.listers.get(controller).map(|l| l.clone())
    }

    /// Names of controllers sourcing from this cluster
    pub fn controller_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.controllers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn parts(&self) -> ClusterParts {
        self.parts.read().clone()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registry tuning
#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    /// Workers per mirror controller
    pub workers: usize,
    /// Resync period of source-side caches
    pub resync_period: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            resync_period: DEFAULT_RESYNC_PERIOD,
        }
    }
}

/// Process-wide table of clusters and mirrors
pub struct Registry {
    connector: Arc<dyn Connector>,
    options: RegistryOptions,
    root: CancellationToken,
    lock: tokio::sync::Mutex<()>,
    clusters: DashMap<String, Arc<ClusterConnection>>,
    mirrors: DashMap<String, MirrorDefinition>,
    started: AtomicBool,
    ready: AtomicBool,
}

impl Registry {
    /// Create an empty registry; everything it starts stops with `root`
    pub fn new(connector: Arc<dyn Connector>, options: RegistryOptions, root: CancellationToken) -> Self {
        Self {
            connector,
            options,
            root,
            lock: tokio::sync::Mutex::new(()),
            clusters: DashMap::new(),
            mirrors: DashMap::new(),
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
        }
    }

    /// Register a cluster; no-op if one with this name exists
    pub async fn init_cluster(&self, config: &ClusterConfig) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.clusters.contains_key(&config.name) {
            debug!(cluster = %config.name, "cluster already registered");
            return Ok(());
        }

        let parts = self.connect(config).await?;
        self.clusters.insert(
            config.name.clone(),
            Arc::new(ClusterConnection::new(parts)),
        );
        info!(cluster = %config.name, "cluster registered");
        Ok(())
    }

    /// Register or rebuild a cluster
    ///
    /// Every mirror that uses the cluster as source or follower is rebuilt so
    /// it picks up the new client and caches.
    pub async fn update_cluster(&self, config: &ClusterConfig) -> Result<()> {
        let _guard = self.lock.lock().await;
        let parts = self.connect(config).await?;

        let existing = self.clusters.get(&config.name).map(|c| Arc::clone(c.value()));
        match existing {
            Some(conn) => {
                let old = std::mem::replace(&mut *conn.parts.write(), parts);
                old.shutdown();
                info!(cluster = %config.name, "cluster connection rebuilt");
            }
            None => {
                self.clusters.insert(
                    config.name.clone(),
                    Arc::new(ClusterConnection::new(parts)),
                );
                info!(cluster = %config.name, "cluster registered");
            }
        }

        let affected: Vec<MirrorDefinition> = self
            .mirrors
            .iter()
            .filter(|m| {
                let clusters = &m.config.clusters;
                clusters.main == config.name || clusters.follower.contains(&config.name)
            })
            .map(|m| m.value().clone())
            .collect();

        let mut first_error = None;
        for definition in affected {
            if let Err(e) = self.apply_mirror(&definition).await {
                warn!(mirror = %definition.name, cluster = %config.name, error = %e, "failed to rebuild mirror");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Create or replace every controller of a mirror
    pub async fn update_mirror(&self, definition: &MirrorDefinition) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.apply_mirror(definition).await
    }

    /// Tear down every controller of a mirror
    pub async fn delete_mirror(&self, definition: &MirrorDefinition) -> Result<()> {
        let _guard = self.lock.lock().await;
        let removed = self.teardown(&definition.name).await;
        self.mirrors.remove(&definition.name);
        info!(mirror = %definition.name, controllers = removed, "mirror deleted");
        Ok(())
    }

    /// Warm every follower cache, then start every controller
    ///
    /// Returns false if the root token fired before the caches synced.
    /// Controllers added afterwards start immediately.
    pub async fn start_all(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(self.is_ready());
        }

        let clusters: Vec<Arc<ClusterConnection>> =
            self.clusters.iter().map(|c| Arc::clone(c.value())).collect();

        info!(clusters = clusters.len(), "warming follower caches");
        for conn in &clusters {
            conn.parts().warmup.start();
        }
        for conn in &clusters {
            if !conn.parts().warmup.wait_for_cache_sync(&self.root).await {
                warn!(cluster = %conn.name, "cancelled while warming caches");
                return Ok(false);
            }
            debug!(cluster = %conn.name, "follower caches warm");
        }

        let mut started = 0;
        for conn in &clusters {
            conn.parts().factory.start();
            for handle in conn.controllers.iter() {
                handle.start();
                started += 1;
            }
        }

        self.ready.store(true, Ordering::SeqCst);
        info!(controllers = started, "all mirror controllers started");
        Ok(true)
    }

    /// Stop every controller and cache
    pub async fn shutdown(&self) {
        let _guard = self.lock.lock().await;
        self.ready.store(false, Ordering::SeqCst);

        let clusters: Vec<Arc<ClusterConnection>> =
            self.clusters.iter().map(|c| Arc::clone(c.value())).collect();
        for conn in &clusters {
            let names = conn.controller_names();
            for name in names {
                if let Some((_, handle)) = conn.controllers.remove(&name) {
                    handle.stop().await;
                }
            }
            conn.listers.clear();
            conn.parts().shutdown();
        }
        info!("registry shut down");
    }

    /// Whether [`Registry::start_all`] completed its warm-up
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Look up a cluster
    pub fn cluster(&self, name: &str) -> Option<Arc<ClusterConnection>> {
        self.clusters.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Registered cluster names
    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// Currently applied mirror definition
    pub fn mirror(&self, name: &str) -> Option<MirrorDefinition> {
        self.mirrors.get(name).map(|m| m.value().clone())
    }

    /// Look up a running or pending controller by name
    pub fn controller(&self, name: &str) -> Option<Arc<MirrorController>> {
        self.clusters
            .iter()
            .find_map(|c| c.controllers.get(name).map(|h| Arc::clone(&h.controller)))
    }

    async fn connect(&self, config: &ClusterConfig) -> Result<ClusterParts> {
        let client = self
            .connector
            .connect(config)
            .await
            .map_err(|e| connection_error(&config.name, e))?;

        let factory = Arc::new(InformerFactory::new(
            config.name.clone(),
            Arc::clone(&client),
            Some(self.options.resync_period),
            &self.root,
        ));
        let warmup = Arc::new(InformerFactory::new(
            config.name.clone(),
            Arc::clone(&client),
            None,
            &self.root,
        ));
        if self.started.load(Ordering::SeqCst) {
            factory.start();
            warmup.start();
        }

        Ok(ClusterParts {
            config: config.clone(),
            client,
            factory,
            warmup,
        })
    }

    fn connection(&self, mirror: &str, cluster: &str, role: &str) -> Result<Arc<ClusterConnection>> {
        self.cluster(cluster).ok_or_else(|| {
            Error::config_for(mirror, format!("{} cluster {:?} is not registered", role, cluster))
        })
    }

    /// Delete-then-recreate; caller holds the registry lock
    async fn apply_mirror(&self, definition: &MirrorDefinition) -> Result<()> {
        definition.validate()?;
        MatchRules::new(&definition.config, definition.selector.as_ref())
            .map_err(|e| Error::config_for(&definition.name, e.to_string()))?;
        let filter = Filter::compile(&definition.name, &definition.filter)
            .map_err(|e| Error::config_for(&definition.name, e.to_string()))?;

        let clusters = &definition.config.clusters;
        let source = self.connection(&definition.name, &clusters.main, "source")?;
        let follower_conns = clusters
            .follower
            .iter()
            .map(|name| self.connection(&definition.name, name, "follower"))
            .collect::<Result<Vec<_>>>()?;

        let source_parts = source.parts();
        let mut resolved: Vec<(ResourceType, ApiResource)> = Vec::with_capacity(definition.resources.len());
        for rt in unique(&definition.resources) {
            let ar = source_parts.client.resolve(rt).await?;
            resolved.push((rt.clone(), ar));
        }

        let removed = self.teardown(&definition.name).await;
        if removed > 0 {
            debug!(mirror = %definition.name, controllers = removed, "replaced existing controllers");
        }

        for (rt, ar) in resolved {
            let name = controller_name(&definition.name, &rt);
            let informer = source_parts.factory.for_resource(&ar);

            let followers: Vec<Follower> = follower_conns
                .iter()
                .map(|conn| {
                    let parts = conn.parts();
                    let lister = parts.warmup.for_resource(&ar).lister();
                    conn.listers.insert(name.clone(), lister.clone());
                    Follower {
                        cluster: conn.name.clone(),
                        client: parts.client,
                        lister,
                    }
                })
                .collect();

            let labels = ControllerLabels::new(&definition.name, &rt);
            let syncer = Syncer::new(labels, ar, informer.lister(), followers, filter.clone());
            let controller = Arc::new(MirrorController::new(
                definition,
                &rt,
                informer,
                syncer,
                self.options.workers,
                &self.root,
            )?);
            controller.attach();

            let handle = ControllerHandle {
                mirror: definition.name.clone(),
                controller,
                task: Mutex::new(None),
            };
            if self.started.load(Ordering::SeqCst) {
                handle.start();
            }
            source.controllers.insert(name.clone(), handle);
            debug!(mirror = %definition.name, controller = %name, "controller registered");
        }

        self.mirrors.insert(definition.name.clone(), definition.clone());
        info!(
            mirror = %definition.name,
            source = %clusters.main,
            followers = clusters.follower.len(),
            resources = definition.resources.len(),
            "mirror applied"
        );
        Ok(())
    }

    /// Stop and unregister every controller of a mirror; returns how many
    async fn teardown(&self, mirror: &str) -> usize {
        let clusters: Vec<Arc<ClusterConnection>> =
            self.clusters.iter().map(|c| Arc::clone(c.value())).collect();

        let mut removed_names = HashSet::new();
        for conn in &clusters {
            let names: Vec<String> = conn
                .controllers
                .iter()
                .filter(|h| h.mirror == mirror)
                .map(|h| h.key().clone())
                .collect();
            for name in names {
                if let Some((name, handle)) = conn.controllers.remove(&name) {
                    handle.stop().await;
                    removed_names.insert(name);
                }
            }
        }

        for conn in &clusters {
            conn.listers.retain(|name, _| !removed_names.contains(name));
        }
        removed_names.len()
    }
}

fn unique(resources: &[ResourceType]) -> Vec<&ResourceType> {
    let mut seen = HashSet::new();
    resources.iter().filter(|rt| seen.insert(*rt)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockConnector, MockResourceClient, WatchStream};
    use futures::StreamExt;
    use kube::runtime::watcher::Event;
    use mirror_common::config::{MirrorClusters, MirrorSyncConfig};
    use mirror_common::kube_utils::api_resource_for;

    /// Client whose watches list nothing and then stay open
    fn idle_client() -> MockResourceClient {
        let mut client = MockResourceClient::new();
        client
            .expect_resolve()
            .returning(|rt| Ok(api_resource_for(rt)));
        client.expect_watch().returning(|_| -> WatchStream {
            futures::stream::iter(vec![Ok(Event::Init), Ok(Event::InitDone)])
                .chain(futures::stream::pending())
                .boxed()
        });
        client
    }

    fn connector() -> Arc<dyn Connector> {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(|_| Ok(Arc::new(idle_client()) as Arc<dyn ResourceClient>));
        Arc::new(connector)
    }

    fn cluster(name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn mirror(name: &str, main: &str, followers: &[&str]) -> MirrorDefinition {
        MirrorDefinition {
            name: name.to_string(),
            config: MirrorSyncConfig {
                clusters: MirrorClusters {
                    main: main.to_string(),
                    follower: followers.iter().map(|f| f.to_string()).collect(),
                },
                sync_create: true,
                sync_delete: true,
                ..Default::default()
            },
            resources: vec![ResourceType::new("", "v1", "ConfigMap")],
            selector: None,
            filter: Vec::new(),
        }
    }

    async fn registry_with(clusters: &[&str]) -> Registry {
        let registry = Registry::new(connector(), RegistryOptions::default(), CancellationToken::new());
        for name in clusters {
            registry.init_cluster(&cluster(name)).await.unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_init_cluster_is_idempotent() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Ok(Arc::new(idle_client()) as Arc<dyn ResourceClient>));
        let registry = Registry::new(Arc::new(connector), RegistryOptions::default(), CancellationToken::new());

        registry.init_cluster(&cluster("a")).await.unwrap();
        registry.init_cluster(&cluster("a")).await.unwrap();
        assert_eq!(registry.cluster_names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_init_cluster_connection_failure() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(|_| Err(Error::internal("dial tcp: connection refused")));
        let registry = Registry::new(Arc::new(connector), RegistryOptions::default(), CancellationToken::new());

        let err = registry.init_cluster(&cluster("edge")).await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(err.cluster(), Some("edge"));
        assert!(registry.cluster("edge").is_none());
    }

    /// Story: a mirror registers a controller on its source and listers on its followers
    #[tokio::test]
    async fn story_update_mirror_wires_source_and_followers() {
        let registry = registry_with(&["a", "b", "c"]).await;
        registry.update_mirror(&mirror("m", "a", &["b", "c"])).await.unwrap();

        let name = "m/v1/ConfigMap";
        assert_eq!(registry.cluster("a").unwrap().controller_names(), vec![name]);
        assert!(registry.cluster("b").unwrap().lister(name).is_some());
        assert!(registry.cluster("c").unwrap().lister(name).is_some());
        assert!(registry.cluster("a").unwrap().lister(name).is_none());
        assert!(registry.controller(name).is_some());
        assert!(registry.mirror("m").is_some());
    }

    #[tokio::test]
    async fn test_unknown_follower_leaves_existing_mirror_untouched() {
        let registry = registry_with(&["a", "b"]).await;
        registry.update_mirror(&mirror("m", "a", &["b"])).await.unwrap();

        let err = registry
            .update_mirror(&mirror("m", "a", &["b", "ghost"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert_eq!(registry.cluster("a").unwrap().controller_names(), vec!["m/v1/ConfigMap"]);
        assert_eq!(registry.mirror("m").unwrap().config.clusters.follower, vec!["b"]);
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected() {
        let registry = registry_with(&["a"]).await;
        let err = registry.update_mirror(&mirror("m", "a", &[])).await.unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    /// Story: reconfiguring a mirror replaces its controllers rather than mutating them
    #[tokio::test]
    async fn story_update_mirror_replaces_controllers() {
        let registry = registry_with(&["a", "b", "c"]).await;
        registry.update_mirror(&mirror("m", "a", &["b"])).await.unwrap();
        let before = registry.controller("m/v1/ConfigMap").unwrap();

        registry.update_mirror(&mirror("m", "a", &["c"])).await.unwrap();
        let after = registry.controller("m/v1/ConfigMap").unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert!(before.queue().is_shutting_down());
        assert!(registry.cluster("b").unwrap().lister("m/v1/ConfigMap").is_none());
        assert!(registry.cluster("c").unwrap().lister("m/v1/ConfigMap").is_some());
    }

    #[tokio::test]
    async fn test_moving_source_cluster_removes_old_controller() {
        let registry = registry_with(&["a", "b"]).await;
        registry.update_mirror(&mirror("m", "a", &["b"])).await.unwrap();
        registry.update_mirror(&mirror("m", "b", &["a"])).await.unwrap();

        assert!(registry.cluster("a").unwrap().controller_names().is_empty());
        assert_eq!(registry.cluster("b").unwrap().controller_names(), vec!["m/v1/ConfigMap"]);
        assert!(registry.cluster("a").unwrap().lister("m/v1/ConfigMap").is_some());
    }

    #[tokio::test]
    async fn test_delete_mirror_cleans_up() {
        let registry = registry_with(&["a", "b"]).await;
        let m = mirror("m", "a", &["b"]);
        registry.update_mirror(&m).await.unwrap();
        let controller = registry.controller("m/v1/ConfigMap").unwrap();

        registry.delete_mirror(&m).await.unwrap();
        assert!(registry.controller("m/v1/ConfigMap").is_none());
        assert!(registry.cluster("b").unwrap().lister("m/v1/ConfigMap").is_none());
        assert!(registry.mirror("m").is_none());
        assert!(controller.queue().is_shutting_down());
        // Connections are kept
        assert_eq!(registry.cluster_names(), vec!["a", "b"]);
    }

    /// Story: start_all warms follower caches before any controller runs
    #[tokio::test]
    async fn story_start_all_runs_controllers_after_warmup() {
        let registry = registry_with(&["a", "b"]).await;
        registry.update_mirror(&mirror("m", "a", &["b"])).await.unwrap();
        assert!(!registry.is_ready());

        assert!(registry.start_all().await.unwrap());
        assert!(registry.is_ready());

        let controller = registry.controller("m/v1/ConfigMap").unwrap();
        let mut phase = controller.watch_phase();
        tokio::time::timeout(
            Duration::from_secs(5),
            phase.wait_for(|p| *p == crate::controller::Phase::Running),
        )
        .await
        .expect("controller should reach Running")
        .unwrap();

        registry.shutdown().await;
        assert!(!registry.is_ready());
        assert_eq!(controller.phase(), crate::controller::Phase::Stopped);
    }

    #[tokio::test]
    async fn test_update_cluster_rebuilds_dependent_mirrors() {
        let registry = registry_with(&["a", "b"]).await;
        registry.update_mirror(&mirror("m", "a", &["b"])).await.unwrap();
        let before = registry.controller("m/v1/ConfigMap").unwrap();

        registry.update_cluster(&cluster("b")).await.unwrap();
        let after = registry.controller("m/v1/ConfigMap").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));

        registry.update_cluster(&cluster("fresh")).await.unwrap();
        assert_eq!(registry.cluster_names(), vec!["a", "b", "fresh"]);
    }

    #[test]
    fn test_unique_resources() {
        let cm = ResourceType::new("", "v1", "ConfigMap");
        let secret = ResourceType::new("", "v1", "Secret");
        let list = vec![cm.clone(), secret.clone(), cm.clone()];
        assert_eq!(unique(&list), vec![&cm, &secret]);
    }
}
