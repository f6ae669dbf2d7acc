//! Cluster and mirror configuration
//!
//! The on-disk layout is two YAML documents in one directory:
//! - `cluster.yaml` - the `clusters:` list (name + kubeconfig)
//! - `mirror.yaml` - the `mirrors:` list (what to copy, from where, to where)
//!
//! Both deserialize into [`AppConfig`]; loading merges them.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// File holding the cluster list
pub const CLUSTER_CONFIG_FILE: &str = "cluster.yaml";
/// File holding the mirror list
pub const MIRROR_CONFIG_FILE: &str = "mirror.yaml";
/// Directories searched when no explicit config directory is given
pub const DEFAULT_CONFIG_DIRS: &[&str] = &["/config/", "./config/"];

/// Complete process configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Known clusters
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    /// Mirror definitions
    #[serde(default)]
    pub mirrors: Vec<MirrorDefinition>,
}

/// Connection settings for one cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Unique cluster name referenced by mirrors
    pub name: String,
    /// Inline kubeconfig YAML; takes precedence over `config_path`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config: String,
    /// Path to a kubeconfig file
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_path: String,
}

/// A named description of what to copy from a source cluster to followers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorDefinition {
    /// Unique mirror name, used as the metrics `name` label
    pub name: String,
    /// Clusters and matching rules
    #[serde(default)]
    pub config: MirrorSyncConfig,
    /// Resource types mirrored by this definition
    #[serde(default)]
    pub resources: Vec<ResourceType>,
    /// Label selector objects must match; unset matches everything
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// Ordered field actions applied to every mirrored object
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<FilterAction>,
}

/// Source/follower clusters of a mirror
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorClusters {
    /// Source ("main") cluster name
    #[serde(rename = "master", default)]
    pub main: String,
    /// Follower cluster names
    #[serde(default)]
    pub follower: Vec<String>,
}

/// Matching and propagation settings of a mirror
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSyncConfig {
    /// Source and follower clusters
    #[serde(default)]
    pub clusters: MirrorClusters,
    /// Only objects in this namespace match (empty = any)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Objects in this namespace never match (empty = no exclusion)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub not_in_namespace: String,
    /// Only objects with exactly this name match (empty = any)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_name: String,
    /// Honour creation events from the source
    #[serde(default)]
    pub sync_create: bool,
    /// Honour deletion events from the source
    #[serde(default)]
    pub sync_delete: bool,
}

/// Resource type descriptor
///
/// `kind` may be either the Kind (`ConfigMap`) or the plural resource name
/// (`configmaps`); it is resolved against API discovery when the mirror is
/// built. An empty `group` is the core API group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceType {
    /// API group
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Kind or plural resource name
    pub kind: String,
}

impl ResourceType {
    /// Create a resource type descriptor
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// One configured filter action
///
/// `action` is kept as a string so that unknown actions survive parsing and
/// can be reported (and skipped) when the mirror is built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterAction {
    /// `replace`, `delete` or `set`
    pub action: String,
    /// Dot-separated field path
    pub key: String,
    /// Literal value (JSON, or a plain string)
    #[serde(default)]
    pub value: String,
}

impl AppConfig {
    /// Load `cluster.yaml` and `mirror.yaml` from a directory and merge them
    ///
    /// Either file may be missing, but not both.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut merged = AppConfig::default();
        let mut found = false;

        for file in [CLUSTER_CONFIG_FILE, MIRROR_CONFIG_FILE] {
            let path = dir.join(file);
            if !path.exists() {
                debug!(path = %path.display(), "config file not present");
                continue;
            }
            found = true;
            let part = Self::load_file(&path)?;
            merged.clusters.extend(part.clusters);
            merged.mirrors.extend(part.mirrors);
        }

        if !found {
            return Err(Error::config(format!(
                "neither {} nor {} found in {}",
                CLUSTER_CONFIG_FILE,
                MIRROR_CONFIG_FILE,
                dir.display()
            )));
        }
        Ok(merged)
    }

    /// Parse one YAML document
    pub fn load_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&data)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(data: &str) -> std::result::Result<Self, serde_yaml::Error> {
        // An empty document deserializes to unit, not to an empty mapping
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(data)
    }

    /// Find the configuration directory
    ///
    /// An explicit directory wins; otherwise the first of
    /// [`DEFAULT_CONFIG_DIRS`] holding a config file is used.
    pub fn discover(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(dir) = explicit {
            return Ok(dir.to_path_buf());
        }
        DEFAULT_CONFIG_DIRS
            .iter()
            .map(PathBuf::from)
            .find(|dir| dir.join(CLUSTER_CONFIG_FILE).exists() || dir.join(MIRROR_CONFIG_FILE).exists())
            .ok_or_else(|| {
                Error::config(format!(
                    "no configuration found in {}",
                    DEFAULT_CONFIG_DIRS.join(", ")
                ))
            })
    }

    /// Look up a cluster by name
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Check cross-references between clusters and mirrors
    pub fn validate(&self) -> Result<()> {
        let mut cluster_names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return Err(Error::config("cluster with empty name"));
            }
            if !cluster_names.insert(cluster.name.as_str()) {
                return Err(Error::config_for(&cluster.name, "duplicate cluster name"));
            }
        }

        let mut mirror_names = HashSet::new();
        for mirror in &self.mirrors {
            if !mirror_names.insert(mirror.name.as_str()) {
                return Err(Error::config_for(&mirror.name, "duplicate mirror name"));
            }
            mirror.validate()?;
            let clusters = &mirror.config.clusters;
            if !cluster_names.contains(clusters.main.as_str()) {
                return Err(Error::config_for(
                    &mirror.name,
                    format!("unknown source cluster {:?}", clusters.main),
                ));
            }
            if let Some(unknown) = clusters
                .follower
                .iter()
                .find(|f| !cluster_names.contains(f.as_str()))
            {
                return Err(Error::config_for(
                    &mirror.name,
                    format!("unknown follower cluster {:?}", unknown),
                ));
            }
        }
        Ok(())
    }
}

impl MirrorDefinition {
    /// Checks that need no knowledge of other definitions
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("mirror with empty name"));
        }
        let clusters = &self.config.clusters;
        if clusters.main.is_empty() {
            return Err(Error::config_for(&self.name, "source cluster is required"));
        }
        if clusters.follower.is_empty() {
            return Err(Error::config_for(&self.name, "at least one follower is required"));
        }
        if clusters.follower.contains(&clusters.main) {
            return Err(Error::config_for(
                &self.name,
                format!("source cluster {:?} is also listed as a follower", clusters.main),
            ));
        }
        if self.resources.is_empty() {
            return Err(Error::config_for(&self.name, "at least one resource is required"));
        }
        if let Some(rt) = self.resources.iter().find(|r| r.version.is_empty() || r.kind.is_empty()) {
            return Err(Error::config_for(
                &self.name,
                format!("resource {:?} needs both version and kind", rt),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTERS: &str = r#"
clusters:
  - name: main
    configPath: /etc/kube/main.yaml
  - name: edge
    config: |
      apiVersion: v1
      kind: Config
"#;

    const MIRRORS: &str = r#"
mirrors:
  - name: configs
    config:
      clusters:
        master: main
        follower: [edge]
      namespace: apps
      notInNamespace: kube-system
      targetName: settings
      syncCreate: true
      syncDelete: false
    resources:
      - version: v1
        kind: configmaps
    selector:
      matchLabels:
        env: prod
    filter:
      - action: set
        key: metadata.labels.mirrored
        value: '"true"'
      - action: delete
        key: data.secret
"#;

    fn sample() -> AppConfig {
        let mut cfg = AppConfig::from_yaml(CLUSTERS).expect("clusters parse");
        cfg.mirrors = AppConfig::from_yaml(MIRRORS).expect("mirrors parse").mirrors;
        cfg
    }

    #[test]
    fn test_parse_camel_case_field_names() {
        let cfg = sample();
        assert_eq!(cfg.clusters.len(), 2);
        assert_eq!(cfg.clusters[0].config_path, "/etc/kube/main.yaml");
        assert!(cfg.clusters[1].config.contains("kind: Config"));

        let m = &cfg.mirrors[0];
        assert_eq!(m.config.clusters.main, "main");
        assert_eq!(m.config.clusters.follower, vec!["edge".to_string()]);
        assert_eq!(m.config.not_in_namespace, "kube-system");
        assert_eq!(m.config.target_name, "settings");
        assert!(m.config.sync_create);
        assert!(!m.config.sync_delete);
        assert_eq!(m.resources[0], ResourceType::new("", "v1", "configmaps"));
        let labels = m
            .selector
            .as_ref()
            .and_then(|s| s.match_labels.as_ref())
            .expect("matchLabels");
        assert_eq!(labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(m.filter.len(), 2);
        assert_eq!(m.filter[1].value, "");
    }

    #[test]
    fn test_sample_is_valid() {
        sample().validate().expect("sample config should validate");
    }

    #[test]
    fn test_empty_document_is_empty_config() {
        assert_eq!(AppConfig::from_yaml("  \n").unwrap(), AppConfig::default());
    }

    #[test]
    fn test_resource_type_display() {
        assert_eq!(ResourceType::new("", "v1", "configmaps").to_string(), "v1/configmaps");
        assert_eq!(
            ResourceType::new("apps", "v1", "Deployment").to_string(),
            "apps/v1/Deployment"
        );
    }

    /// Story: a mirror pointing at a cluster nobody configured is rejected up front
    #[test]
    fn story_unknown_follower_rejected() {
        let mut cfg = sample();
        cfg.mirrors[0].config.clusters.follower.push("ghost".to_string());
        let err = cfg.validate().expect_err("unknown follower must fail");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_unknown_source_rejected() {
        let mut cfg = sample();
        cfg.mirrors[0].config.clusters.main = "nowhere".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_source_as_follower_rejected() {
        let mut cfg = sample();
        cfg.mirrors[0].config.clusters.follower.push("main".to_string());
        let err = cfg.validate().expect_err("self-mirroring must fail");
        assert!(err.to_string().contains("also listed as a follower"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut cfg = sample();
        cfg.clusters.push(cfg.clusters[0].clone());
        assert!(cfg.validate().is_err());

        let mut cfg = sample();
        cfg.mirrors.push(cfg.mirrors[0].clone());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_mirror_without_resources_rejected() {
        let mut cfg = sample();
        cfg.mirrors[0].resources.clear();
        assert!(cfg.mirrors[0].validate().is_err());
    }

    #[test]
    fn test_load_from_dir_merges_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CLUSTER_CONFIG_FILE), CLUSTERS).unwrap();
        std::fs::write(dir.path().join(MIRROR_CONFIG_FILE), MIRRORS).unwrap();

        let cfg = AppConfig::load_from_dir(dir.path()).expect("load");
        assert_eq!(cfg, sample());
        assert!(cfg.cluster("edge").is_some());
        assert!(cfg.cluster("missing").is_none());
    }

    #[test]
    fn test_load_from_empty_dir_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(AppConfig::load_from_dir(dir.path()).is_err());
    }

    #[test]
    fn test_discover_prefers_explicit_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let found = AppConfig::discover(Some(dir.path())).expect("explicit dir");
        assert_eq!(found, dir.path());
    }
}
