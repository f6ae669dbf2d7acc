//! Mirror controller: one per mirror and resource type
//!
//! The controller subscribes to the source informer, turns matching change
//! notifications into queue keys and runs a fixed pool of workers that hand
//! each key to the [`Syncer`].
//!
//! Lifecycle: `Stopped -> Syncing -> Running -> ShuttingDown -> Stopped`.
//! Workers only start once the source cache and every follower cache have
//! completed their initial list.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use kube::api::DynamicObject;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mirror_common::config::{MirrorDefinition, ResourceType};
use mirror_common::metrics::{self, ControllerLabels};
use mirror_common::Result;

use crate::informer::{key_of, Informer, ResourceEventHandler};
use crate::queue::{RateLimit, WorkQueue};
use crate::selector::MatchRules;
use crate::sync::Syncer;

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not running
    Stopped,
    /// Waiting for caches to complete their initial list
    Syncing,
    /// Workers are draining the queue
    Running,
    /// Stop requested, finishing in-flight work
    ShuttingDown,
}

/// Controller name used in logs and handler registration
pub fn controller_name(mirror: &str, resource: &ResourceType) -> String {
    format!("{}/{}", mirror, resource)
}

/// Enqueues keys of source objects that pass the mirror's match rules
struct MirrorEventHandler {
    name: String,
    rules: MatchRules,
    sync_create: bool,
    sync_delete: bool,
    queue: Arc<WorkQueue<String>>,
}

impl ResourceEventHandler for MirrorEventHandler {
    fn on_add(&self, obj: &DynamicObject) {
        if self.sync_create && self.rules.matches(obj) {
            self.queue.add(key_of(obj));
        }
    }

    fn on_update(&self, _old: &DynamicObject, new: &DynamicObject) {
        if self.rules.matches(new) {
            self.queue.add(key_of(new));
        }
    }

    fn on_delete(&self, obj: &DynamicObject) {
        if !self.sync_delete {
            debug!(mirror = %self.name, key = %key_of(obj), "delete sync disabled, ignoring");
            return;
        }
        if self.rules.matches(obj) {
            self.queue.add(key_of(obj));
        }
    }
}

/// Watches one resource type on the source cluster and syncs it to followers
pub struct MirrorController {
    name: String,
    labels: ControllerLabels,
    source: Arc<Informer>,
    handler: Arc<MirrorEventHandler>,
    queue: Arc<WorkQueue<String>>,
    syncer: Arc<Syncer>,
    workers: usize,
    phase: watch::Sender<Phase>,
    stop: CancellationToken,
}

impl MirrorController {
    /// Build a controller for one resource type of `definition`
    ///
    /// `parent` is the registry's root token; the controller stops when it or
    /// [`MirrorController::stop`] fires.
    pub fn new(
        definition: &MirrorDefinition,
        resource: &ResourceType,
        source: Arc<Informer>,
        syncer: Syncer,
        workers: usize,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let name = controller_name(&definition.name, resource);
        let labels = ControllerLabels::new(&definition.name, resource);
        let rules = MatchRules::new(&definition.config, definition.selector.as_ref())?;
        let queue = Arc::new(WorkQueue::new(labels.clone(), RateLimit::default()));
        let handler = Arc::new(MirrorEventHandler {
            name: name.clone(),
            rules,
            sync_create: definition.config.sync_create,
            sync_delete: definition.config.sync_delete,
            queue: Arc::clone(&queue),
        });
        let (phase, _) = watch::channel(Phase::Stopped);

        Ok(Self {
            name,
            labels,
            source,
            handler,
            queue,
            syncer: Arc::new(syncer.with_sync_delete(definition.config.sync_delete)),
            workers: workers.max(1),
            phase,
            stop: parent.child_token(),
        })
    }

    /// Controller name, `mirror/apiVersion/kind`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Subscribe to lifecycle changes
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Work queue fed by the event handler
    pub fn queue(&self) -> &Arc<WorkQueue<String>> {
        &self.queue
    }

    /// Start consuming source notifications
    ///
    /// Events arriving before [`MirrorController::run`] are queued and
    /// processed once the workers start.
    pub fn attach(&self) {
        self.source
            .add_handler(self.name.clone(), Arc::clone(&self.handler) as Arc<dyn ResourceEventHandler>);
    }

    /// Stop consuming notifications and shut the queue down
    pub fn detach(&self) {
        self.source.remove_handler(&self.name);
        self.queue.shutdown();
    }

    /// Request shutdown
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for caches, run workers until stopped, then drain the queue
    pub async fn run(self: Arc<Self>) {
        self.attach();
        self.phase.send_replace(Phase::Syncing);
        info!(mirror = %self.name, followers = self.syncer.followers().len(), "waiting for caches to sync");

        if !self.wait_for_caches().await {
            info!(mirror = %self.name, "stopped before caches synced");
            self.finish(Vec::new()).await;
            return;
        }

        self.phase.send_replace(Phase::Running);
        info!(mirror = %self.name, workers = self.workers, "starting workers");
        let workers = (0..self.workers)
            .map(|id| tokio::spawn(Arc::clone(&self).worker(id)))
            .collect();

        self.stop.cancelled().await;
        self.finish(workers).await;
    }

    async fn wait_for_caches(&self) -> bool {
        if !self.source.wait_synced(&self.stop).await {
            return false;
        }
        for follower in self.syncer.followers() {
            if !follower.lister.wait_synced(&self.stop).await {
                return false;
            }
            debug!(mirror = %self.name, follower = %follower.cluster, "follower cache synced");
        }
        true
    }

    async fn finish(&self, workers: Vec<JoinHandle<()>>) {
        self.phase.send_replace(Phase::ShuttingDown);
        self.detach();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(mirror = %self.name, error = %e, "worker task failed");
            }
        }
        self.phase.send_replace(Phase::Stopped);
        info!(mirror = %self.name, "controller stopped");
    }

    async fn worker(self: Arc<Self>, id: usize) {
        debug!(mirror = %self.name, worker = id, "worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(mirror = %self.name, worker = id, "worker stopped");
    }

    async fn process(&self, key: &String) {
        let outcome = AssertUnwindSafe(self.syncer.sync(key)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => self.queue.forget(key),
            Ok(Err(e)) => {
                if e.is_soft() {
                    debug!(mirror = %self.name, key = %key, error = %e, "sync deferred");
                } else {
                    info!(mirror = %self.name, key = %key, error = %e, "error syncing, will retry");
                }
                self.retry(key);
            }
            Err(panic) => {
                error!(mirror = %self.name, key = %key, panic = %panic_message(&panic), "sync panicked");
                self.retry(key);
            }
        }
    }

    fn retry(&self, key: &String) {
        self.queue.add_rate_limited(key.clone());
        metrics::record_retry(&self.labels);
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
