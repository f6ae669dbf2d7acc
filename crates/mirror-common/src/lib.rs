//! Common types for fleet-mirror: configuration, errors, metrics and Kubernetes helpers

#![deny(missing_docs)]

use std::time::Duration;

pub mod config;
pub mod error;
pub mod kube_utils;
pub mod leader_election;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation stamped on every follower object with the source object's
/// resourceVersion at the time of the last successful apply.
pub const SOURCE_VERSION_ANNOTATION: &str = "fleet-mirror.dev/source-resource-version";

/// Default number of workers draining each mirror controller's queue
pub const DEFAULT_WORKERS: usize = 8;

/// Resync period of the general-purpose informer factory.
///
/// Every cached source object is re-delivered as an update once per period,
/// which repairs followers that drifted without a source change.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Default port for the health endpoint
pub const DEFAULT_HEALTH_PORT: u16 = 9527;
