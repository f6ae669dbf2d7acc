//! Watch-backed object caches with change notifications
//!
//! An [`Informer`] keeps a reflector store for one resource type on one
//! cluster current and turns watch events into add/update/delete
//! notifications for registered [`ResourceEventHandler`]s. Handlers are called
//! synchronously on the watch task and must only enqueue.
//!
//! During a (re-)list the watcher delivers objects one by one, but the store
//! only swaps in the new snapshot once the list is complete. Notifications for
//! listed objects are therefore held back until then, so a handler reacting to
//! an add always finds the object in the cache.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::ResourceExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mirror_common::kube_utils::{object_key, split_key};

use crate::client::ResourceClient;

/// Receives change notifications from an [`Informer`]
pub trait ResourceEventHandler: Send + Sync {
    /// Object appeared
    fn on_add(&self, obj: &DynamicObject);
    /// Object changed, or was re-delivered by a resync
    fn on_update(&self, old: &DynamicObject, new: &DynamicObject);
    /// Object disappeared; `obj` is its last known state
    fn on_delete(&self, obj: &DynamicObject);
}

/// Namespace-qualified key of an object
pub fn key_of(obj: &DynamicObject) -> String {
    object_key(obj.metadata.namespace.as_deref(), &obj.name_any())
}

/// Read-only view of an informer's cache
#[derive(Clone)]
pub struct Lister {
    resource: ApiResource,
    store: Store<DynamicObject>,
    synced: watch::Receiver<bool>,
}

impl Lister {
    /// Build a view over a store; `synced` flips to true after the first list
    pub fn new(resource: ApiResource, store: Store<DynamicObject>, synced: watch::Receiver<bool>) -> Self {
        Self {
            resource,
            store,
            synced,
        }
    }

    /// Look up an object by `namespace/name` key
    pub fn get(&self, key: &str) -> Option<Arc<DynamicObject>> {
        let (namespace, name) = split_key(key);
        let mut obj_ref = ObjectRef::new_with(name, self.resource.clone());
        if let Some(ns) = namespace {
            obj_ref = obj_ref.within(ns);
        }
        self.store.get(&obj_ref)
    }

    /// Every cached object
    pub fn list(&self) -> Vec<Arc<DynamicObject>> {
        self.store.state()
    }

    /// Whether the initial list has completed
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait for the initial list; false if cancelled first
    pub async fn wait_synced(&self, token: &CancellationToken) -> bool {
        let mut rx = self.synced.clone();
        let synced = async move { rx.wait_for(|s| *s).await.map(|_| ()) };
        tokio::select! {
            result = synced => result.is_ok(),
            _ = token.cancelled() => false,
        }
    }
}

type HandlerList = Vec<(String, Arc<dyn ResourceEventHandler>)>;

/// Cache and change feed for one resource type on one cluster
pub struct Informer {
    cluster: String,
    resource: ApiResource,
    client: Arc<dyn ResourceClient>,
    store: Store<DynamicObject>,
    // Taken by the watch task; `None` once running
    writer: Mutex<Option<Writer<DynamicObject>>>,
    handlers: RwLock<HandlerList>,
    synced: watch::Sender<bool>,
    resync: Option<Duration>,
}

impl Informer {
    /// Create an informer; nothing is watched until [`Informer::run`]
    pub fn new(
        cluster: impl Into<String>,
        resource: ApiResource,
        client: Arc<dyn ResourceClient>,
        resync: Option<Duration>,
    ) -> Self {
        let writer = Writer::new(resource.clone());
        let store = writer.as_reader();
        let (synced, _) = watch::channel(false);
        Self {
            cluster: cluster.into(),
            resource,
            client,
            store,
            writer: Mutex::new(Some(writer)),
            handlers: RwLock::new(Vec::new()),
            synced,
            resync,
        }
    }

    /// Resource type being watched
    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    /// Read-only view of the cache
    pub fn lister(&self) -> Lister {
        Lister::new(self.resource.clone(), self.store.clone(), self.synced.subscribe())
    }

    /// Whether the initial list has completed
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait for the initial list; false if cancelled first
    pub async fn wait_synced(&self, token: &CancellationToken) -> bool {
        self.lister().wait_synced(token).await
    }

    /// Register a handler under a unique name
    ///
    /// On an informer that already synced, the handler immediately receives
    /// an add for every cached object.
    pub fn add_handler(&self, name: impl Into<String>, handler: Arc<dyn ResourceEventHandler>) {
        let name = name.into();
        {
            let mut handlers = self.handlers.write();
            handlers.retain(|(existing, _)| *existing != name);
            handlers.push((name, Arc::clone(&handler)));
        }
        if self.has_synced() {
            for obj in self.store.state() {
                handler.on_add(&obj);
            }
        }
    }

    /// Detach a handler; returns whether it was registered
    pub fn remove_handler(&self, name: &str) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| existing != name);
        handlers.len() != before
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Watch until cancelled
    ///
    /// A second call while the first is running returns immediately.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let Some(mut writer) = self.writer.lock().take() else {
            debug!(cluster = %self.cluster, resource = %self.resource.plural, "informer already running");
            return;
        };

        info!(cluster = %self.cluster, resource = %self.resource.plural, "starting informer");
        let mut stream = self.client.watch(&self.resource);
        let mut resync = self.resync.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut listing: Option<Vec<DynamicObject>> = None;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = next_tick(&mut resync) => self.resync_all(),
                event = stream.next() => match event {
                    Some(Ok(event)) => self.apply(&mut writer, &mut listing, event),
                    Some(Err(e)) => {
                        warn!(cluster = %self.cluster, resource = %self.resource.plural, error = %e, "watch error");
                    }
                    None => {
                        warn!(cluster = %self.cluster, resource = %self.resource.plural, "watch stream ended");
                        break;
                    }
                },
            }
        }

        debug!(cluster = %self.cluster, resource = %self.resource.plural, "informer stopped");
    }

    fn apply(
        &self,
        writer: &mut Writer<DynamicObject>,
        listing: &mut Option<Vec<DynamicObject>>,
        event: watcher::Event<DynamicObject>,
    ) {
        match &event {
            watcher::Event::Init => {
                writer.apply_watcher_event(&event);
                *listing = Some(Vec::new());
            }
            watcher::Event::InitApply(obj) => {
                writer.apply_watcher_event(&event);
                if let Some(buffer) = listing.as_mut() {
                    buffer.push(obj.clone());
                }
            }
            watcher::Event::InitDone => {
                let previous: HashMap<String, Arc<DynamicObject>> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|obj| (key_of(&obj), obj))
                    .collect();
                writer.apply_watcher_event(&event);
                // Flag first: a handler attached from here on gets the replay
                let first_sync = !self.synced.send_replace(true);

                let listed = listing.take().unwrap_or_default();
                let mut seen = HashSet::with_capacity(listed.len());
                for obj in &listed {
                    let key = key_of(obj);
                    match previous.get(&key) {
                        Some(old) => self.dispatch(|h| h.on_update(old, obj)),
                        None => self.dispatch(|h| h.on_add(obj)),
                    }
                    seen.insert(key);
                }
                for (key, old) in &previous {
                    if !seen.contains(key) {
                        self.dispatch(|h| h.on_delete(old));
                    }
                }

                if first_sync {
                    info!(
                        cluster = %self.cluster,
                        resource = %self.resource.plural,
                        objects = listed.len(),
                        "informer synced"
                    );
                }
            }
            watcher::Event::Apply(obj) => {
                let old = self.lister().get(&key_of(obj));
                writer.apply_watcher_event(&event);
                match old {
                    Some(old) => self.dispatch(|h| h.on_update(&old, obj)),
                    None => self.dispatch(|h| h.on_add(obj)),
                }
            }
            watcher::Event::Delete(obj) => {
                writer.apply_watcher_event(&event);
                self.dispatch(|h| h.on_delete(obj));
            }
        }
    }

    fn resync_all(&self) {
        let objects = self.store.state();
        debug!(cluster = %self.cluster, resource = %self.resource.plural, objects = objects.len(), "resync");
        for obj in &objects {
            self.dispatch(|h| h.on_update(obj, obj));
        }
    }

    fn dispatch(&self, f: impl Fn(&dyn ResourceEventHandler)) {
        let handlers: Vec<Arc<dyn ResourceEventHandler>> =
            self.handlers.read().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in &handlers {
            f(handler.as_ref());
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Informers for one cluster, at most one per resource type
pub struct InformerFactory {
    cluster: String,
    client: Arc<dyn ResourceClient>,
    resync: Option<Duration>,
    informers: Mutex<HashMap<String, Arc<Informer>>>,
    started: AtomicBool,
    token: CancellationToken,
}

impl InformerFactory {
    /// Create a factory whose watches stop when `parent` is cancelled
    ///
    /// `resync` of `None` disables periodic re-delivery.
    pub fn new(
        cluster: impl Into<String>,
        client: Arc<dyn ResourceClient>,
        resync: Option<Duration>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            client,
            resync,
            informers: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            token: parent.child_token(),
        }
    }

    /// Get or create the informer for a resource type
    ///
    /// On a started factory a new informer starts watching immediately.
    pub fn for_resource(&self, ar: &ApiResource) -> Arc<Informer> {
        let key = format!("{}/{}", ar.api_version, ar.plural);
        let mut informers = self.informers.lock();
        if let Some(existing) = informers.get(&key) {
            return Arc::clone(existing);
        }

        let informer = Arc::new(Informer::new(
            self.cluster.clone(),
            ar.clone(),
            Arc::clone(&self.client),
            self.resync,
        ));
        informers.insert(key, Arc::clone(&informer));
        if self.started.load(Ordering::SeqCst) {
            self.spawn(&informer);
        }
        informer
    }

    /// Start every registered informer, and any registered later
    pub fn start(&self) {
        let informers = self.informers.lock();
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for informer in informers.values() {
            self.spawn(informer);
        }
    }

    /// Whether [`InformerFactory::start`] was called
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Wait until every registered informer has listed once
    pub async fn wait_for_cache_sync(&self, token: &CancellationToken) -> bool {
        let informers: Vec<Arc<Informer>> = self.informers.lock().values().cloned().collect();
        for informer in informers {
            if !informer.wait_synced(token).await {
                return false;
            }
        }
        true
    }

    /// Stop every watch started by this factory
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    fn spawn(&self, informer: &Arc<Informer>) {
        tokio::spawn(Arc::clone(informer).run(self.token.clone()));
    }
}
