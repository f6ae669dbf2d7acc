//! Cluster access seam
//!
//! Everything the engine does against a cluster goes through
//! [`ResourceClient`], so the sync logic and the informers can be exercised
//! against mocks or in-memory fakes. [`Connector`] turns a cluster definition
//! into a client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::discovery::{ApiResource, Discovery};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use mirror_common::config::{ClusterConfig, ResourceType};
use mirror_common::kube_utils::{
    api_resource_for, create_client_with_timeout, find_discovered_resource, split_key,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT,
};
use mirror_common::{Error, Result};

/// Server-side watch timeout in seconds
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Watch event stream for one resource type
pub type WatchStream =
    BoxStream<'static, std::result::Result<watcher::Event<DynamicObject>, watcher::Error>>;

/// Structured-resource operations against one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Resolve a configured resource type to a full API resource
    async fn resolve(&self, resource: &ResourceType) -> Result<ApiResource>;

    /// Create an object
    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object; `metadata.resourceVersion` guards against lost updates
    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Delete the object with the given `namespace/name` key
    async fn delete(&self, ar: &ApiResource, key: &str) -> Result<()>;

    /// Watch all objects of a resource type across namespaces
    ///
    /// The stream starts with a full listing (`Init`, `InitApply`*, `InitDone`)
    /// and repeats it after every re-list.
    fn watch(&self, ar: &ApiResource) -> WatchStream;
}

/// Builds clients for configured clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a client for a cluster
    async fn connect(&self, cluster: &ClusterConfig) -> Result<Arc<dyn ResourceClient>>;
}

/// [`ResourceClient`] backed by a kube-rs client
pub struct KubeResourceClient {
    cluster: String,
    client: Client,
}

impl KubeResourceClient {
    /// Wrap a kube client
    pub fn new(cluster: impl Into<String>, client: Client) -> Self {
        Self {
            cluster: cluster.into(),
            client,
        }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, ar),
            _ => Api::all_with(self.client.clone(), ar),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn resolve(&self, resource: &ResourceType) -> Result<ApiResource> {
        let discovery = Discovery::new(self.client.clone())
            .filter(&[resource.group.as_str()])
            .run()
            .await;

        match discovery {
            Ok(discovery) => {
                if let Some(ar) = find_discovered_resource(&discovery, resource) {
                    return Ok(ar);
                }
            }
            Err(e) => {
                warn!(cluster = %self.cluster, resource = %resource, error = %e, "API discovery failed");
            }
        }

        let ar = api_resource_for(resource);
        debug!(cluster = %self.cluster, resource = %resource, plural = %ar.plural, "using guessed API resource");
        Ok(ar)
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(ar, obj.namespace().as_deref());
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(ar, obj.namespace().as_deref());
        Ok(api.replace(&obj.name_any(), &PostParams::default(), obj).await?)
    }

    async fn delete(&self, ar: &ApiResource, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key);
        self.api(ar, namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    fn watch(&self, ar: &ApiResource) -> WatchStream {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), ar);
        watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
            .default_backoff()
            .boxed()
    }
}

/// [`Connector`] that builds kube-rs clients from kubeconfigs
pub struct KubeConnector {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl KubeConnector {
    /// Connector with custom client timeouts
    pub fn with_timeouts(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }
}

impl Default for KubeConnector {
    fn default() -> Self {
        Self::with_timeouts(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }
}

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(&self, cluster: &ClusterConfig) -> Result<Arc<dyn ResourceClient>> {
        let client =
            create_client_with_timeout(cluster, self.connect_timeout, self.read_timeout).await?;
        debug!(cluster = %cluster.name, "cluster client created");
        Ok(Arc::new(KubeResourceClient::new(&cluster.name, client)))
    }
}

/// Map a connection failure that surfaced as some other error class
pub(crate) fn connection_error(cluster: &str, err: Error) -> Error {
    match err {
        Error::Connection { .. } => err,
        other => Error::connection_for(cluster, other.to_string()),
    }
}
