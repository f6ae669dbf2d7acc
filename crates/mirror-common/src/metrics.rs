//! Metrics registry for mirror observability
//!
//! Provides OpenTelemetry metrics for:
//! - Event handling (latency, outcome counts, errors, retries)
//! - Work queues (depth per mirror controller)
//!
//! Every instrument carries a `name` label holding the mirror name and a
//! `resource` label holding the mirrored type (`apps/v1/Deployment`).

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for mirror metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("fleet-mirror"));

/// Histogram buckets in milliseconds
const DURATION_BUCKETS_MS: &[f64] = &[
    0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 100.0, 500.0, 1000.0, 5000.0,
];

// ============================================================================
// Event Handling Metrics
// ============================================================================

/// Histogram of event handling latency
///
/// Labels:
/// - `name`: mirror name
/// - `resource`: mirrored resource type
/// - `event_type`: add, update, delete
pub static EVENT_HANDLE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("mirror_event_handle_duration_milliseconds")
        .with_description("Latency of mirror event handling in milliseconds")
        .with_unit("ms")
        .with_boundaries(DURATION_BUCKETS_MS.to_vec())
        .build()
});

/// Counter of handled events by outcome
///
/// Labels:
/// - `name`: mirror name
/// - `resource`: mirrored resource type
/// - `event_type`: added, update, deleted, synced, conflict
pub static EVENT_HANDLE_COUNT: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("mirror_event_handle_total")
        .with_description("Total number of handled mirror events by outcome")
        .with_unit("{events}")
        .build()
});

/// Counter of failed event handling
///
/// Labels:
/// - `name`: mirror name
/// - `resource`: mirrored resource type
/// - `event_type`: add, update, delete
/// - `error_type`: API reason or error class
pub static EVENT_HANDLE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("mirror_event_handle_errors_total")
        .with_description("Total number of mirror event handling errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of rate-limited requeues
///
/// Labels:
/// - `name`: mirror name
/// - `resource`: mirrored resource type
pub static EVENT_HANDLE_RETRIES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("mirror_event_handle_retries_total")
        .with_description("Total number of mirror event requeues")
        .with_unit("{retries}")
        .build()
});

// ============================================================================
// Queue Metrics
// ============================================================================

/// Gauge of pending work queue items
///
/// Labels:
/// - `name`: mirror name
/// - `resource`: mirrored resource type
pub static QUEUE_LENGTH: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("mirror_event_queue_length")
        .with_description("Number of queued mirror events")
        .with_unit("{events}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Kind of source event being handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Object appeared in the source cluster
    Add,
    /// Object changed in the source cluster (or was resynced)
    Update,
    /// Object disappeared from the source cluster
    Delete,
}

impl EventKind {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-follower outcome of a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Follower object was created
    Added,
    /// Follower object was replaced
    Updated,
    /// Follower object was deleted (or already absent)
    Deleted,
    /// Follower already carried this source version
    Synced,
    /// Update lost an optimistic-concurrency race
    Conflict,
}

impl Outcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "update",
            Self::Deleted => "deleted",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
        }
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Labels identifying one mirror controller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerLabels {
    mirror: String,
    resource: String,
}

impl ControllerLabels {
    /// Labels for `resource` mirrored by `mirror`
    pub fn new(mirror: impl Into<String>, resource: impl ToString) -> Self {
        Self {
            mirror: mirror.into(),
            resource: resource.to_string(),
        }
    }

    /// The mirror name
    pub fn mirror(&self) -> &str {
        &self.mirror
    }

    /// The mirrored resource type
    pub fn resource(&self) -> &str {
        &self.resource
    }

    fn with(&self, extra: &[KeyValue]) -> Vec<KeyValue> {
        let mut attrs = Vec::with_capacity(2 + extra.len());
        attrs.push(KeyValue::new("name", self.mirror.clone()));
        attrs.push(KeyValue::new("resource", self.resource.clone()));
        attrs.extend_from_slice(extra);
        attrs
    }
}

/// Times one event handling pass
pub struct SyncTimer {
    labels: ControllerLabels,
    kind: EventKind,
    start: Instant,
}

impl SyncTimer {
    /// Start timing an event for a mirror controller
    pub fn start(labels: &ControllerLabels, kind: EventKind) -> Self {
        Self {
            labels: labels.clone(),
            kind,
            start: Instant::now(),
        }
    }

    /// Record the elapsed time
    pub fn complete(self) {
        let millis = self.start.elapsed().as_secs_f64() * 1000.0;
        EVENT_HANDLE_DURATION.record(
            millis,
            &self.labels.with(&[KeyValue::new("event_type", self.kind.as_str())]),
        );
    }
}

/// Count one per-follower outcome
pub fn record_outcome(labels: &ControllerLabels, outcome: Outcome) {
    EVENT_HANDLE_COUNT.add(
        1,
        &labels.with(&[KeyValue::new("event_type", outcome.as_str())]),
    );
}

/// Count a failed event handling pass
pub fn record_error(labels: &ControllerLabels, kind: EventKind, error_type: &str) {
    EVENT_HANDLE_ERRORS.add(
        1,
        &labels.with(&[
            KeyValue::new("event_type", kind.as_str()),
            KeyValue::new("error_type", error_type.to_string()),
        ]),
    );
}

/// Count a requeue
pub fn record_retry(labels: &ControllerLabels) {
    EVENT_HANDLE_RETRIES.add(1, &labels.with(&[]));
}

/// Update the queue depth gauge
pub fn set_queue_length(labels: &ControllerLabels, len: usize) {
    QUEUE_LENGTH.record(i64::try_from(len).unwrap_or(i64::MAX), &labels.with(&[]));
}
