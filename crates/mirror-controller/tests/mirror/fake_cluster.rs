//! In-memory cluster used by the mirror tests
//!
//! Holds objects of a single resource type, hands out monotonically increasing
//! resourceVersions and echoes every successful write into open watches, the
//! way an API server would. Creates can be made to fail on demand.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use mirror_common::config::{ClusterConfig, ResourceType};
use mirror_common::kube_utils::{api_resource_for, build_api_resource, object_key};
use mirror_common::{Error, Result};
use mirror_controller::{Connector, ResourceClient, WatchStream};

/// Kind of a recorded API call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Replace,
    Delete,
}

#[derive(Debug, Clone)]
enum Change {
    Apply(DynamicObject),
    Delete(DynamicObject),
}

struct State {
    objects: BTreeMap<String, DynamicObject>,
    next_version: u64,
    next_uid: u64,
    /// Every create/replace/delete call, successful or not
    calls: Vec<(Op, String)>,
    /// Successful writes only
    writes: Vec<(Op, String)>,
    failing_creates: usize,
}

pub struct FakeCluster {
    name: String,
    state: Mutex<State>,
    changes: broadcast::Sender<Change>,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn key_of(obj: &DynamicObject) -> String {
    object_key(obj.metadata.namespace.as_deref(), &obj.name_any())
}

impl FakeCluster {
    pub fn new(name: &str) -> Arc<Self> {
        let (changes, _) = broadcast::channel(1024);
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                next_version: 1,
                next_uid: 1,
                calls: Vec::new(),
                writes: Vec::new(),
                failing_creates: 0,
            }),
            changes,
        })
    }

    /// Next resourceVersion handed out by this cluster
    pub fn set_next_version(&self, version: u64) {
        self.state.lock().next_version = version;
    }

    /// Fail the next `n` create calls with ServiceUnavailable
    pub fn fail_next_creates(&self, n: usize) {
        self.state.lock().failing_creates = n;
    }

    /// Create or overwrite an object as a user of this cluster would
    pub fn put(&self, mut obj: DynamicObject) -> DynamicObject {
        let mut state = self.state.lock();
        let key = key_of(&obj);
        let existing_uid = state.objects.get(&key).and_then(|o| o.metadata.uid.clone());
        obj.metadata.uid = Some(existing_uid.unwrap_or_else(|| next_uid(&mut state, &self.name)));
        obj.metadata.resource_version = Some(next_version(&mut state));
        state.objects.insert(key, obj.clone());
        let _ = self.changes.send(Change::Apply(obj.clone()));
        obj
    }

    /// Remove an object as a user of this cluster would
    pub fn remove(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(obj) = state.objects.remove(key) {
            let _ = self.changes.send(Change::Delete(obj));
        }
    }

    pub fn get(&self, key: &str) -> Option<DynamicObject> {
        self.state.lock().objects.get(key).cloned()
    }

    pub fn calls(&self, op: Op) -> usize {
        self.state.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }

    pub fn writes(&self) -> usize {
        self.state.lock().writes.len()
    }
}

fn next_version(state: &mut State) -> String {
    let version = state.next_version;
    state.next_version += 1;
    version.to_string()
}

fn next_uid(state: &mut State, cluster: &str) -> String {
    let uid = state.next_uid;
    state.next_uid += 1;
    format!("{cluster}-uid-{uid}")
}

#[async_trait]
impl ResourceClient for FakeCluster {
    async fn resolve(&self, resource: &ResourceType) -> Result<ApiResource> {
        Ok(api_resource_for(resource))
    }

    async fn create(&self, _ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = key_of(obj);
        let mut state = self.state.lock();
        state.calls.push((Op::Create, key.clone()));

        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(api_error(503, "ServiceUnavailable", format!("{} is unavailable", self.name)));
        }
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{key} already exists")));
        }

        let mut stored = obj.clone();
        stored.metadata.uid = Some(next_uid(&mut state, &self.name));
        stored.metadata.resource_version = Some(next_version(&mut state));
        state.objects.insert(key.clone(), stored.clone());
        state.writes.push((Op::Create, key));
        let _ = self.changes.send(Change::Apply(stored.clone()));
        Ok(stored)
    }

    async fn replace(&self, _ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = key_of(obj);
        let mut state = self.state.lock();
        state.calls.push((Op::Replace, key.clone()));

        let Some((uid, current_version)) = state
            .objects
            .get(&key)
            .map(|current| (current.metadata.uid.clone(), current.metadata.resource_version.clone()))
        else {
            return Err(api_error(404, "NotFound", format!("{key} not found")));
        };
        if obj.metadata.resource_version != current_version {
            return Err(api_error(409, "Conflict", format!("{key} was modified")));
        }

        let mut stored = obj.clone();
        stored.metadata.uid = uid;
        stored.metadata.resource_version = Some(next_version(&mut state));
        state.objects.insert(key.clone(), stored.clone());
        state.writes.push((Op::Replace, key));
        let _ = self.changes.send(Change::Apply(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, _ar: &ApiResource, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push((Op::Delete, key.to_string()));

        let Some(obj) = state.objects.remove(key) else {
            return Err(api_error(404, "NotFound", format!("{key} not found")));
        };
        state.writes.push((Op::Delete, key.to_string()));
        let _ = self.changes.send(Change::Delete(obj));
        Ok(())
    }

    fn watch(&self, _ar: &ApiResource) -> WatchStream {
        // Subscribe under the lock so no write falls between snapshot and stream
        let state = self.state.lock();
        let live = BroadcastStream::new(self.changes.subscribe());
        let mut initial = vec![Ok(Event::Init)];
        initial.extend(state.objects.values().cloned().map(|obj| Ok(Event::InitApply(obj))));
        initial.push(Ok(Event::InitDone));
        drop(state);

        let live = live.filter_map(|change| async move {
            match change {
                Ok(Change::Apply(obj)) => Some(Ok(Event::Apply(obj))),
                Ok(Change::Delete(obj)) => Some(Ok(Event::Delete(obj))),
                Err(_) => None,
            }
        });
        futures::stream::iter(initial).chain(live).boxed()
    }
}

/// Hands out pre-built fake clusters by name
#[derive(Default)]
pub struct FakeConnector {
    clusters: Mutex<BTreeMap<String, Arc<FakeCluster>>>,
}

impl FakeConnector {
    pub fn add(&self, cluster: Arc<FakeCluster>) {
        self.clusters.lock().insert(cluster.name.clone(), cluster);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, cluster: &ClusterConfig) -> Result<Arc<dyn ResourceClient>> {
        let found = self.clusters.lock().get(&cluster.name).cloned();
        match found {
            Some(fake) => Ok(fake as Arc<dyn ResourceClient>),
            None => Err(Error::connection_for(&cluster.name, "no such fake cluster")),
        }
    }
}

pub fn configmaps() -> ApiResource {
    build_api_resource("v1", "ConfigMap")
}

/// A ConfigMap with one data entry
pub fn configmap(ns: &str, name: &str, labels: &[(&str, &str)], value: &str) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &configmaps()).within(ns);
    if !labels.is_empty() {
        obj.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }
    obj.data = serde_json::json!({ "data": { "x": value } });
    obj
}

/// Poll `check` until it holds, panicking after a few seconds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
