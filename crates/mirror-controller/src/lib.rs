//! Mirror engine for fleet-mirror
//!
//! Watches resources on a source cluster and keeps copies of them on follower
//! clusters:
//!
//! - [`informer`]: watch-backed caches with change notifications
//! - [`queue`]: deduplicating, rate-limited work queue
//! - [`controller`]: per mirror and resource type watch/queue/worker pipeline
//! - [`sync`]: create/update/delete against followers with version gating
//! - [`registry`]: cluster connections and mirror lifecycle

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod informer;
pub mod queue;
pub mod registry;
pub mod selector;
pub mod sync;

pub use client::{Connector, KubeConnector, KubeResourceClient, ResourceClient, WatchStream};
pub use controller::{MirrorController, Phase};
pub use informer::{Informer, InformerFactory, Lister, ResourceEventHandler};
pub use queue::{RateLimit, WorkQueue};
pub use registry::{ClusterConnection, Registry, RegistryOptions};
pub use selector::MatchRules;
pub use sync::{Follower, Syncer};
