use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer guarding cleanup of the delivery-engine applications of a Cluster.
pub const CLUSTER_FINALIZER: &str = "cluster.core.arlon.io";

/// ClusterSpec defines the desired state of Cluster
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug)]
#[kube(
    group = "core.arlon.io",
    version = "v1",
    kind = "Cluster",
    namespaced
)]
#[kube(status = "ClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Git location of the template describing the underlying compute cluster.
    pub cluster_template: RepoSpec,

    /// Overrides the Helm chart deployed as the platform application.
    #[serde(default)]
    pub arlon_helm_chart: Option<RepoSpec>,

    /// Enables the cluster autoscaler running on the management cluster.
    #[serde(default)]
    pub autoscaler: Option<AutoscalerSpec>,
}

/// A directory at a revision of a git repository.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    pub url: String,
    pub path: String,
    pub revision: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerSpec {
    /// API server of the management cluster the autoscaler talks to.
    pub mgmt_cluster_host: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub state: ClusterState,

    /// Latest human-readable diagnosis.
    #[serde(default)]
    pub message: String,

    /// Name of the Cluster API cluster found in the validated template.
    #[serde(default)]
    pub inner_cluster_name: String,

    #[serde(default)]
    pub observed_generation: Option<i64>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterState {
    #[serde(rename = "")]
    Unset,
    #[serde(rename = "initializing")]
    Initializing,
    #[serde(rename = "retrying")]
    Retrying,
    #[serde(rename = "created")]
    Created,
}

impl Default for ClusterState {
    fn default() -> Self {
        ClusterState::Unset
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClusterState::Unset => "",
            ClusterState::Initializing => "initializing",
            ClusterState::Retrying => "retrying",
            ClusterState::Created => "created",
        })
    }
}

impl Cluster {
    pub fn state(&self) -> ClusterState {
        self.status
            .as_ref()
            .map(|status| status.state)
            .unwrap_or_default()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|finalizers| finalizers.iter().any(|f| f == CLUSTER_FINALIZER))
            .unwrap_or(false)
    }
}

/// ProfileSpec defines a named selection of bundles
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug)]
#[kube(
    group = "core.arlon.io",
    version = "v1",
    kind = "Profile",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    #[serde(default)]
    pub description: String,

    /// Names of the bundles making up this profile.
    #[serde(default)]
    pub bundles: Vec<String>,

    /// Repository the profile is rendered into. Profiles without one are
    /// applied directly and never touch git.
    #[serde(default)]
    pub repo_url: Option<String>,

    #[serde(default)]
    pub repo_path: Option<String>,

    #[serde(default)]
    pub repo_branch: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_to_legacy_strings() {
        assert_eq!(serde_json::to_string(&ClusterState::Unset).unwrap(), "\"\"");
        assert_eq!(
            serde_json::to_string(&ClusterState::Retrying).unwrap(),
            "\"retrying\""
        );
        let state: ClusterState = serde_json::from_str("\"created\"").unwrap();
        assert_eq!(state, ClusterState::Created);
    }

    #[test]
    fn empty_status_defaults_to_unset() {
        let status: ClusterStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.state, ClusterState::Unset);
        assert!(status.inner_cluster_name.is_empty());
    }

    #[test]
    fn finalizer_lookup() {
        let mut cluster = Cluster::new(
            "foo",
            ClusterSpec {
                cluster_template: RepoSpec {
                    url: "https://example/repo.git".to_string(),
                    path: "p".to_string(),
                    revision: "main".to_string(),
                },
                arlon_helm_chart: None,
                autoscaler: None,
            },
        );
        assert!(!cluster.has_finalizer());
        cluster.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]);
        assert!(cluster.has_finalizer());
        assert_eq!(cluster.state(), ClusterState::Unset);
    }
}
