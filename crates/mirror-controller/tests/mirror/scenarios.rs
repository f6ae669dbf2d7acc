//! Stories about objects flowing from a source cluster to its followers

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

use mirror_common::config::{ClusterConfig, MirrorClusters, MirrorDefinition, MirrorSyncConfig, ResourceType};
use mirror_common::SOURCE_VERSION_ANNOTATION;
use mirror_controller::{Phase, Registry, RegistryOptions};

use super::fake_cluster::{configmap, eventually, FakeCluster, FakeConnector, Op};

const CONTROLLER: &str = "m/v1/ConfigMap";

struct Fleet {
    registry: Registry,
    main: Arc<FakeCluster>,
    follower: Arc<FakeCluster>,
    root: CancellationToken,
}

impl Fleet {
    /// Registry over clusters `a` (source) and `b` (follower), not yet started
    async fn new(sync_config: MirrorSyncConfig) -> Self {
        let main = FakeCluster::new("a");
        let follower = FakeCluster::new("b");
        let connector = FakeConnector::default();
        connector.add(Arc::clone(&main));
        connector.add(Arc::clone(&follower));

        let root = CancellationToken::new();
        let registry = Registry::new(
            Arc::new(connector),
            RegistryOptions {
                workers: 2,
                resync_period: Duration::from_secs(600),
            },
            root.clone(),
        );
        for name in ["a", "b"] {
            registry
                .init_cluster(&ClusterConfig {
                    name: name.to_string(),
                    ..Default::default()
                })
                .await
                .expect("fake cluster connects");
        }

        let definition = MirrorDefinition {
            name: "m".to_string(),
            config: MirrorSyncConfig {
                clusters: MirrorClusters {
                    main: "a".to_string(),
                    follower: vec!["b".to_string()],
                },
                ..sync_config
            },
            resources: vec![ResourceType::new("", "v1", "ConfigMap")],
            selector: None,
            filter: Vec::new(),
        };
        registry.update_mirror(&definition).await.expect("mirror applies");

        Self {
            registry,
            main,
            follower,
            root,
        }
    }

    async fn start(&self) {
        assert!(self.registry.start_all().await.expect("start succeeds"));
        let controller = self.registry.controller(CONTROLLER).expect("controller registered");
        let mut phase = controller.watch_phase();
        tokio::time::timeout(Duration::from_secs(5), phase.wait_for(|p| *p == Phase::Running))
            .await
            .expect("controller reaches Running")
            .expect("phase channel open");
    }

    fn follower_version(&self, key: &str) -> Option<String> {
        self.follower
            .get(key)
            .and_then(|obj| obj.annotations().get(SOURCE_VERSION_ANNOTATION).cloned())
    }

    /// Version annotation as seen through the follower cache
    fn cached_follower_version(&self, key: &str) -> Option<String> {
        self.registry
            .cluster("b")?
            .lister(CONTROLLER)?
            .get(key)
            .and_then(|obj| obj.annotations().get(SOURCE_VERSION_ANNOTATION).cloned())
    }

    /// Wait until the controller has nothing pending or backing off for `key`
    async fn settle(&self, key: &str) {
        let controller = self.registry.controller(CONTROLLER).expect("controller registered");
        let key = key.to_string();
        eventually("queue to drain", || {
            controller.queue().is_empty() && controller.queue().num_requeues(&key) == 0
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    async fn stop(self) {
        self.registry.shutdown().await;
        self.root.cancel();
    }
}

fn create_and_delete() -> MirrorSyncConfig {
    MirrorSyncConfig {
        sync_create: true,
        sync_delete: true,
        ..Default::default()
    }
}

/// Story: a new source object is created on the follower, a newer version
/// updates it, and re-delivering the same version writes nothing
#[tokio::test]
async fn story_create_update_and_duplicate_delivery() {
    let fleet = Fleet::new(create_and_delete()).await;
    fleet.start().await;

    fleet.main.set_next_version(5);
    fleet.main.put(configmap("ns", "foo", &[], "1"));
    eventually("create on follower", || fleet.follower_version("ns/foo").as_deref() == Some("5")).await;
    eventually("follower cache to catch up", || {
        fleet.cached_follower_version("ns/foo").as_deref() == Some("5")
    })
    .await;

    fleet.main.put(configmap("ns", "foo", &[], "2"));
    eventually("update on follower", || fleet.follower_version("ns/foo").as_deref() == Some("6")).await;
    eventually("follower cache to catch up", || {
        fleet.cached_follower_version("ns/foo").as_deref() == Some("6")
    })
    .await;

    let mirrored = fleet.follower.get("ns/foo").expect("object mirrored");
    assert_eq!(mirrored.data["data"]["x"], "2");
    assert_eq!(fleet.follower.calls(Op::Create), 1);
    assert_eq!(fleet.follower.calls(Op::Replace), 1);
    assert_eq!(fleet.follower.writes(), 2);

    // Duplicate delivery of the version 6 state
    let controller = fleet.registry.controller(CONTROLLER).unwrap();
    controller.queue().add("ns/foo".to_string());
    fleet.settle("ns/foo").await;
    assert_eq!(fleet.follower.writes(), 2);
    assert_eq!(fleet.follower_version("ns/foo").as_deref(), Some("6"));

    fleet.stop().await;
}

/// Story: follower-side bookkeeping survives an update from the source
#[tokio::test]
async fn story_update_keeps_follower_identity() {
    let fleet = Fleet::new(create_and_delete()).await;
    fleet.start().await;

    fleet.main.put(configmap("ns", "foo", &[], "1"));
    eventually("create on follower", || fleet.follower.get("ns/foo").is_some()).await;
    let created = fleet.follower.get("ns/foo").unwrap();
    eventually("follower cache to catch up", || fleet.cached_follower_version("ns/foo").is_some()).await;

    fleet.main.put(configmap("ns", "foo", &[], "2"));
    eventually("update on follower", || {
        fleet
            .follower
            .get("ns/foo")
            .is_some_and(|o| o.data["data"]["x"] == "2")
    })
    .await;

    let updated = fleet.follower.get("ns/foo").unwrap();
    assert_eq!(updated.metadata.uid, created.metadata.uid);
    assert_ne!(updated.metadata.uid, fleet.main.get("ns/foo").unwrap().metadata.uid);
    fleet.stop().await;
}

/// Story: deleting a source object only propagates when delete sync is on
#[tokio::test]
async fn story_deletion_gating() {
    let keep = Fleet::new(MirrorSyncConfig {
        sync_create: true,
        sync_delete: false,
        ..Default::default()
    })
    .await;
    keep.start().await;
    keep.main.put(configmap("ns", "foo", &[], "1"));
    eventually("create on follower", || keep.follower.get("ns/foo").is_some()).await;

    keep.main.remove("ns/foo");
    keep.settle("ns/foo").await;
    assert!(keep.follower.get("ns/foo").is_some());
    assert_eq!(keep.follower.calls(Op::Delete), 0);
    keep.stop().await;

    let propagate = Fleet::new(create_and_delete()).await;
    propagate.start().await;
    propagate.main.put(configmap("ns", "foo", &[], "1"));
    eventually("create on follower", || propagate.follower.get("ns/foo").is_some()).await;

    propagate.main.remove("ns/foo");
    eventually("delete on follower", || propagate.follower.get("ns/foo").is_none()).await;
    assert_eq!(propagate.follower.calls(Op::Delete), 1);
    propagate.stop().await;
}

/// Story: a key still backing off when its source is deleted does not turn
/// into a follower delete while delete sync is off
#[tokio::test]
async fn story_source_deleted_during_retry_backoff_without_delete_sync() {
    let fleet = Fleet::new(MirrorSyncConfig {
        sync_create: true,
        sync_delete: false,
        ..Default::default()
    })
    .await;
    fleet.start().await;

    fleet.follower.fail_next_creates(5);
    fleet.main.put(configmap("ns", "foo", &[], "1"));
    eventually("first create attempt", || fleet.follower.calls(Op::Create) >= 1).await;

    fleet.main.remove("ns/foo");
    fleet.settle("ns/foo").await;

    assert_eq!(fleet.follower.calls(Op::Delete), 0);
    assert!(fleet.follower.get("ns/foo").is_none());
    fleet.stop().await;
}

/// Story: a follower that is briefly unavailable receives the object on retry
#[tokio::test]
async fn story_transient_create_failure_is_retried() {
    let fleet = Fleet::new(create_and_delete()).await;
    fleet.start().await;

    fleet.follower.fail_next_creates(2);
    fleet.main.put(configmap("ns", "foo", &[], "1"));

    eventually("create after retries", || fleet.follower.get("ns/foo").is_some()).await;
    assert_eq!(fleet.follower.calls(Op::Create), 3);
    fleet.settle("ns/foo").await;
    assert_eq!(fleet.follower.writes(), 1);
    fleet.stop().await;
}

/// Story: with create sync off, only objects changing after startup are mirrored
#[tokio::test]
async fn story_create_sync_disabled_ignores_new_objects() {
    let fleet = Fleet::new(MirrorSyncConfig {
        sync_create: false,
        sync_delete: true,
        ..Default::default()
    })
    .await;
    fleet.start().await;

    fleet.main.put(configmap("ns", "foo", &[], "1"));
    fleet.settle("ns/foo").await;
    assert!(fleet.follower.get("ns/foo").is_none());

    // An update is honoured and lands as a create on the follower
    fleet.main.put(configmap("ns", "foo", &[], "2"));
    eventually("update mirrored", || fleet.follower.get("ns/foo").is_some()).await;
    fleet.stop().await;
}

/// Story: objects outside the mirror's namespace stay on the source
#[tokio::test]
async fn story_namespace_filter_applies_end_to_end() {
    let fleet = Fleet::new(MirrorSyncConfig {
        namespace: "team".to_string(),
        ..create_and_delete()
    })
    .await;
    fleet.start().await;

    fleet.main.put(configmap("other", "skip", &[], "1"));
    fleet.main.put(configmap("team", "keep", &[], "1"));

    eventually("matching object mirrored", || fleet.follower.get("team/keep").is_some()).await;
    fleet.settle("other/skip").await;
    assert!(fleet.follower.get("other/skip").is_none());
    fleet.stop().await;
}

/// Story: objects already on the source at startup are mirrored once caches warm
#[tokio::test]
async fn story_preexisting_objects_mirrored_on_start() {
    let fleet = Fleet::new(create_and_delete()).await;
    fleet.main.put(configmap("ns", "early", &[("app", "web")], "1"));

    fleet.start().await;
    eventually("preexisting object mirrored", || fleet.follower.get("ns/early").is_some()).await;

    let mirrored = fleet.follower.get("ns/early").unwrap();
    assert_eq!(mirrored.labels().get("app").map(String::as_str), Some("web"));
    fleet.stop().await;
}
