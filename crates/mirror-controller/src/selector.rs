//! Which source objects a mirror applies to

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::DynamicObject;
use kube::core::{Selector, SelectorExt};
use kube::ResourceExt;

use mirror_common::config::MirrorSyncConfig;
use mirror_common::{Error, Result};

/// Match predicate of one mirror
#[derive(Debug, Clone, Default)]
pub struct MatchRules {
    namespace: String,
    not_in_namespace: String,
    target_name: String,
    selector: Option<Selector>,
}

impl MatchRules {
    /// Build from a mirror's sync settings and optional selector
    ///
    /// An unknown operator, or `In`/`NotIn` without values, is a config error.
    pub fn new(config: &MirrorSyncConfig, selector: Option<&LabelSelector>) -> Result<Self> {
        let selector = selector
            .map(|s| Selector::try_from(s.clone()))
            .transpose()
            .map_err(|e| Error::config(format!("invalid label selector: {}", e)))?;
        Ok(Self {
            namespace: config.namespace.clone(),
            not_in_namespace: config.not_in_namespace.clone(),
            target_name: config.target_name.clone(),
            selector,
        })
    }

    /// Namespace, exclusion, label and name filters must all pass
    pub fn matches(&self, obj: &DynamicObject) -> bool {
        let namespace = obj.metadata.namespace.as_deref().unwrap_or_default();
        if !self.namespace.is_empty() && namespace != self.namespace {
            return false;
        }
        if !self.not_in_namespace.is_empty() && namespace == self.not_in_namespace {
            return false;
        }
        if let Some(selector) = &self.selector {
            if !selector.matches(obj.labels()) {
                return false;
            }
        }
        self.target_name.is_empty() || obj.name_any() == self.target_name
    }
}
