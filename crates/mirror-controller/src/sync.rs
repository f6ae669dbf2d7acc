//! Cross-cluster apply of one source object
//!
//! [`Syncer::sync`] reconciles every follower against the source cache for a
//! single key:
//!
//! - source object gone: delete it on every follower (absent counts as done),
//!   or do nothing when delete sync is off
//! - follower lacks it: create the transformed object
//! - follower has it: update, unless the follower's version annotation says it
//!   already carries this source version or a newer one
//!
//! Followers are handled in order and the first hard failure aborts the pass;
//! the key is retried as a whole and followers already in sync are skipped by
//! the version check.

use std::sync::Arc;

use kube::api::{DynamicObject, TypeMeta};
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use mirror_common::kube_utils::{is_already_exists, is_conflict, is_not_found};
use mirror_common::metrics::{self, ControllerLabels, EventKind, Outcome, SyncTimer};
use mirror_common::{Error, Result, SOURCE_VERSION_ANNOTATION};
use mirror_filter::{Filter, TransformError};

use crate::client::ResourceClient;
use crate::informer::Lister;

/// A follower cluster as seen by one controller
#[derive(Clone)]
pub struct Follower {
    /// Cluster name
    pub cluster: String,
    /// Client for writes
    pub client: Arc<dyn ResourceClient>,
    /// Warmed cache of the follower's objects of this resource type
    pub lister: Lister,
}

/// Applies source state to followers for one mirror controller
pub struct Syncer {
    name: String,
    labels: ControllerLabels,
    resource: ApiResource,
    source: Lister,
    followers: Vec<Follower>,
    filter: Filter,
    sync_delete: bool,
}

impl Syncer {
    /// A syncer that propagates deletions; see [`Syncer::with_sync_delete`]
    pub fn new(
        labels: ControllerLabels,
        resource: ApiResource,
        source: Lister,
        followers: Vec<Follower>,
        filter: Filter,
    ) -> Self {
        Self {
            name: format!("{}/{}", labels.mirror(), labels.resource()),
            labels,
            resource,
            source,
            followers,
            filter,
            sync_delete: true,
        }
    }

    /// Whether a key missing from the source deletes it from followers
    ///
    /// Keys can reach the worker after the source object is gone even when
    /// delete events are filtered out (a retry in backoff, a queued update),
    /// so the gate is applied here too.
    pub fn with_sync_delete(mut self, sync_delete: bool) -> Self {
        self.sync_delete = sync_delete;
        self
    }

    /// Followers in sync order
    pub fn followers(&self) -> &[Follower] {
        &self.followers
    }

    /// Reconcile all followers for `key`
    pub async fn sync(&self, key: &str) -> Result<()> {
        let Some(source) = self.source.get(key) else {
            if !self.sync_delete {
                debug!(mirror = %self.name, key = %key, "source gone and delete sync disabled, skipping");
                return Ok(());
            }
            let timer = SyncTimer::start(&self.labels, EventKind::Delete);
            let result = self.delete_everywhere(key).await;
            timer.complete();
            return result;
        };

        let kind = if self.followers.iter().all(|f| f.lister.get(key).is_none()) {
            EventKind::Add
        } else {
            EventKind::Update
        };
        let timer = SyncTimer::start(&self.labels, kind);
        let result = self.apply_everywhere(key, &source).await;
        timer.complete();
        result
    }

    async fn delete_everywhere(&self, key: &str) -> Result<()> {
        debug!(mirror = %self.name, key = %key, "deleting from followers");
        for follower in &self.followers {
            match follower.client.delete(&self.resource, key).await {
                Ok(()) => {
                    debug!(mirror = %self.name, follower = %follower.cluster, key = %key, "deleted");
                    metrics::record_outcome(&self.labels, Outcome::Deleted);
                }
                Err(Error::Kube { source }) if is_not_found(&source) => {
                    debug!(mirror = %self.name, follower = %follower.cluster, key = %key, "already absent");
                }
                Err(e) => {
                    warn!(mirror = %self.name, follower = %follower.cluster, key = %key, error = %e, "failed to delete");
                    metrics::record_error(&self.labels, EventKind::Delete, &e.reason());
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn apply_everywhere(&self, key: &str, source: &DynamicObject) -> Result<()> {
        let version = source_version(key, source)?;
        let doc = serde_json::to_value(source)
            .map_err(|e| Error::malformed(key, format!("failed to encode source object: {}", e)))?;

        for follower in &self.followers {
            match follower.lister.get(key) {
                None => self.create(follower, key, doc.clone(), version).await?,
                Some(existing) => self.update(follower, key, doc.clone(), version, &existing).await?,
            }
        }
        Ok(())
    }

    async fn create(&self, follower: &Follower, key: &str, doc: Value, version: i64) -> Result<()> {
        let obj = self
            .render(key, doc, None, version)
            .inspect_err(|e| metrics::record_error(&self.labels, EventKind::Add, &e.reason()))?;

        match follower.client.create(&self.resource, &obj).await {
            Ok(_) => {
                info!(mirror = %self.name, follower = %follower.cluster, key = %key, version, "created");
            }
            Err(Error::Kube { source }) if is_already_exists(&source) => {
                debug!(mirror = %self.name, follower = %follower.cluster, key = %key, "already exists");
            }
            Err(e) => {
                warn!(mirror = %self.name, follower = %follower.cluster, key = %key, error = %e, "failed to create");
                metrics::record_error(&self.labels, EventKind::Add, &e.reason());
                return Err(e);
            }
        }
        metrics::record_outcome(&self.labels, Outcome::Added);
        Ok(())
    }

    async fn update(
        &self,
        follower: &Follower,
        key: &str,
        doc: Value,
        version: i64,
        existing: &DynamicObject,
    ) -> Result<()> {
        let stored = stored_version(existing);
        if stored >= version {
            debug!(mirror = %self.name, follower = %follower.cluster, key = %key, version, stored, "already synced");
            metrics::record_outcome(&self.labels, Outcome::Synced);
            return Ok(());
        }

        let reference = serde_json::to_value(existing)
            .map_err(|e| Error::malformed(key, format!("failed to encode follower object: {}", e)))?;
        let obj = self
            .render(key, doc, Some(&reference), version)
            .inspect_err(|e| metrics::record_error(&self.labels, EventKind::Update, &e.reason()))?;

        match follower.client.replace(&self.resource, &obj).await {
            Ok(_) => {
                info!(mirror = %self.name, follower = %follower.cluster, key = %key, version, "updated");
                metrics::record_outcome(&self.labels, Outcome::Updated);
                Ok(())
            }
            Err(Error::Kube { source }) if is_conflict(&source) => {
                debug!(mirror = %self.name, follower = %follower.cluster, key = %key, "update conflict");
                metrics::record_outcome(&self.labels, Outcome::Conflict);
                Err(Error::conflict(key, &follower.cluster))
            }
            Err(e) => {
                warn!(mirror = %self.name, follower = %follower.cluster, key = %key, error = %e, "failed to update");
                metrics::record_error(&self.labels, EventKind::Update, &e.reason());
                Err(e)
            }
        }
    }

    /// Transform, stamp the version annotation and decode
    fn render(
        &self,
        key: &str,
        doc: Value,
        reference: Option<&Value>,
        version: i64,
    ) -> Result<DynamicObject> {
        let transformed = self
            .filter
            .apply(doc, reference)
            .map_err(|e| transform_error(key, e))?;
        let mut obj: DynamicObject = serde_json::from_value(transformed)
            .map_err(|e| Error::malformed(key, format!("transformed object is invalid: {}", e)))?;

        obj.annotations_mut()
            .insert(SOURCE_VERSION_ANNOTATION.to_string(), version.to_string());
        if obj.types.is_none() {
            obj.types = Some(TypeMeta {
                api_version: self.resource.api_version.clone(),
                kind: self.resource.kind.clone(),
            });
        }
        Ok(obj)
    }
}

fn transform_error(key: &str, err: TransformError) -> Error {
    Error::malformed(key, err.to_string())
}

/// Source resourceVersion as a version token
fn source_version(key: &str, obj: &DynamicObject) -> Result<i64> {
    let raw = obj.resource_version().unwrap_or_default();
    raw.parse()
        .map_err(|_| Error::malformed(key, format!("resourceVersion {:?} is not numeric", raw)))
}

/// Version token recorded on a follower object; missing or garbled reads as 0
fn stored_version(obj: &DynamicObject) -> i64 {
    obj.annotations()
        .get(SOURCE_VERSION_ANNOTATION)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
