use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of the Kubernetes object an event was observed on.
///
/// `uid` is the primary key for graph nodes. `(kind, namespace, name)` can
/// collide across time after a delete/recreate and must never be used as one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// API group, empty for the core group.
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Empty for cluster-scoped resources.
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ResourceRef {
    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    /// `group/version/kind` triple, `core` standing in for the empty group.
    pub fn gvk_key(&self) -> String {
        let group = if self.group.is_empty() {
            "core"
        } else {
            &self.group
        };
        format!("{group}/{}/{}", self.version, self.kind)
    }

    /// Stable key identifying the object across resource versions, used by
    /// the final-resource-state snapshot in hour files.
    pub fn resource_key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.group, self.version, self.kind, self.namespace, self.name
        )
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_ref() -> ResourceRef {
        ResourceRef {
            group: String::new(),
            version: "v1".into(),
            kind: "Pod".into(),
            namespace: "default".into(),
            name: "web-0".into(),
            uid: "a-1".into(),
            resource_version: "100".into(),
            ..Default::default()
        }
    }

    #[test]
    fn gvk_key_substitutes_core_group() {
        assert_eq!(pod_ref().gvk_key(), "core/v1/Pod");
    }

    #[test]
    fn resource_key_is_stable_across_resource_versions() {
        let mut a = pod_ref();
        let mut b = pod_ref();
        a.resource_version = "100".into();
        b.resource_version = "200".into();
        assert_eq!(a.resource_key(), b.resource_key());
    }
}
