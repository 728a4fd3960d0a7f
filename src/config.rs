use std::time::Duration;

use crate::types::RepoSpec;

pub const DEFAULT_CHART_URL: &str = "https://github.com/arlonproj/arlon.git";
pub const DEFAULT_CHART_PATH: &str = "pkg/cluster/manifests";
pub const DEFAULT_CHART_REVISION: &str = "v0.10.0";

/// Settings injected into the cluster reconciler at construction.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace holding Argo CD applications and repository secrets.
    pub argocd_namespace: String,
    /// Namespace the platform application deploys into.
    pub arlon_namespace: String,
    /// Chart deployed as the platform application unless a Cluster overrides it.
    pub default_chart: RepoSpec,
    /// Revisit delay returned on every retryable failure.
    pub retry_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            argocd_namespace: "argocd".to_string(),
            arlon_namespace: "arlon".to_string(),
            default_chart: RepoSpec {
                url: DEFAULT_CHART_URL.to_string(),
                path: DEFAULT_CHART_PATH.to_string(),
                revision: DEFAULT_CHART_REVISION.to_string(),
            },
            retry_delay: Duration::from_secs(10),
        }
    }
}
