//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction for member clusters, resource type resolution against
//! API discovery, object keys, and classification of API errors.

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiResource, Discovery};
use kube::{Client, Config};
use tracing::{debug, warn};

use crate::config::{ClusterConfig, ResourceType};
use crate::Error;

/// Default connection timeout for member cluster clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for member cluster clients
///
/// Must exceed the watch timeout, otherwise long polls are cut off by the client.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Create a client for a configured cluster with default timeouts
///
/// An inline kubeconfig takes precedence over a kubeconfig path. With neither
/// set the ambient configuration is inferred (in-cluster or `$KUBECONFIG`).
pub async fn create_client(cluster: &ClusterConfig) -> Result<Client, Error> {
    create_client_with_timeout(cluster, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a client for a configured cluster with custom timeouts
pub async fn create_client_with_timeout(
    cluster: &ClusterConfig,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let name = cluster.name.as_str();
    let mut config = if !cluster.config.is_empty() {
        let kubeconfig = Kubeconfig::from_yaml(&cluster.config).map_err(|e| {
            Error::connection_for(name, format!("failed to parse inline kubeconfig: {}", e))
        })?;
        from_kubeconfig(name, kubeconfig).await?
    } else if !cluster.config_path.is_empty() {
        let kubeconfig = Kubeconfig::read_from(Path::new(&cluster.config_path)).map_err(|e| {
            Error::connection_for(
                name,
                format!("failed to read kubeconfig {}: {}", cluster.config_path, e),
            )
        })?;
        from_kubeconfig(name, kubeconfig).await?
    } else {
        debug!(cluster = %name, "no kubeconfig given, inferring client configuration");
        Config::infer()
            .await
            .map_err(|e| Error::connection_for(name, format!("failed to infer config: {}", e)))?
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config)
        .map_err(|e| Error::connection_for(name, format!("failed to create client: {}", e)))
}

async fn from_kubeconfig(cluster: &str, kubeconfig: Kubeconfig) -> Result<Config, Error> {
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::connection_for(cluster, format!("failed to load kubeconfig: {}", e)))
}

/// Build an ApiResource from a known apiVersion and kind.
///
/// The plural is guessed with [`pluralize_kind`]; prefer discovery results
/// when a live cluster is available.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Resolve a configured resource type against discovery results.
///
/// `rt.kind` matches either the Kind or the plural resource name, case
/// insensitively. Returns `None` when the group/version does not serve it.
pub fn find_discovered_resource(discovery: &Discovery, rt: &ResourceType) -> Option<ApiResource> {
    let wanted = rt.kind.to_lowercase();
    for api_group in discovery.groups() {
        if api_group.name() != rt.group {
            continue;
        }
        for (ar, _caps) in api_group.versioned_resources(&rt.version) {
            if ar.kind.to_lowercase() == wanted || ar.plural == wanted {
                debug!(resource = %rt, plural = %ar.plural, kind = %ar.kind, "resolved resource type");
                return Some(ar);
            }
        }
    }
    warn!(resource = %rt, "resource type not found in API discovery");
    None
}

/// Build an ApiResource for a configured resource type without discovery
///
/// A lower-case `kind` is taken to be the plural resource name already.
pub fn api_resource_for(rt: &ResourceType) -> ApiResource {
    let is_plural = rt.kind.chars().next().is_some_and(|c| c.is_lowercase());
    let mut ar = build_api_resource(&rt.api_version(), &rt.kind);
    if is_plural {
        ar.plural = rt.kind.clone();
    }
    ar
}

/// Parse an apiVersion string into (group, version)
///
/// ```
/// use mirror_common::kube_utils::parse_api_version;
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Known irregular plurals
const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("ingress", "ingresses"),
    ("networkpolicy", "networkpolicies"),
    ("podsecuritypolicy", "podsecuritypolicies"),
    ("priorityclass", "priorityclasses"),
    ("storageclass", "storageclasses"),
    ("ingressclass", "ingressclasses"),
    ("runtimeclass", "runtimeclasses"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for irregular kinds, falling back to simple English
/// pluralization rules.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Namespace-qualified object key: `namespace/name`, or `name` when cluster-scoped
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Split an object key back into (namespace, name)
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

/// Whether the error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a create failed because the object already exists
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

/// Whether an update lost an optimistic-concurrency race
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason != "AlreadyExists")
}

/// Short label describing a kube error, suitable for a metrics dimension
pub fn reason_for_error(err: &kube::Error) -> String {
    match err {
        kube::Error::Api(ae) if !ae.reason.is_empty() => ae.reason.clone(),
        kube::Error::Api(ae) => format!("HTTP{}", ae.code),
        kube::Error::HyperError(_) | kube::Error::Service(_) => "Transport".to_string(),
        kube::Error::SerdeError(_) => "Serialization".to_string(),
        _ => "ClientError".to_string(),
    }
}
