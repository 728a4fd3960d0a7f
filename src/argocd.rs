//! Argo CD adapter: repository credentials and Application resources.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ControllerConfig;
use crate::git::RepoCreds;
use crate::store::is_not_found;
use crate::types::RepoSpec;

pub const SECRET_TYPE_LABEL: &str = "argocd.argoproj.io/secret-type";
pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const CLUSTER_LABEL: &str = "arlon-cluster";
pub const IN_CLUSTER_SERVER: &str = "https://kubernetes.default.svc";
const INNER_CLUSTER_ANNOTATION: &str = "arlon.io/inner-cluster-name";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("unexpected status {code}: {message}")]
    UnexpectedStatus { code: u16, message: String },
    #[error("failed to get status from delivery engine: {0}")]
    Transport(#[source] kube::Error),
}

impl From<kube::Error> for DeliveryError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => DeliveryError::UnexpectedStatus {
                code: response.code,
                message: response.message,
            },
            other => DeliveryError::Transport(other),
        }
    }
}

/// ApplicationSpec mirrors the subset of the Argo CD Application the
/// controller writes.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, PartialEq)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "Application",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    pub project: String,
    pub source: ApplicationSource,
    pub destination: ApplicationDestination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub target_revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmSource>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmSource {
    #[serde(default)]
    pub parameters: Vec<HelmParameter>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
pub struct HelmParameter {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDestination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<SyncPolicyAutomated>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicyAutomated {
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub self_heal: bool,
}

impl SyncPolicy {
    pub fn automated() -> Self {
        SyncPolicy {
            automated: Some(SyncPolicyAutomated {
                prune: true,
                self_heal: true,
            }),
            sync_options: vec!["CreateNamespace=true".to_string()],
        }
    }
}

/// Looks up credentials for git repositories registered with the delivery engine.
#[async_trait]
pub trait RepoCredentials: Send + Sync {
    async fn repo_credentials(&self, repo_url: &str) -> Result<RepoCreds, DeliveryError>;
}

/// Entry point to the delivery engine's application API.
#[async_trait]
pub trait DeliveryEngine: Send + Sync {
    async fn application_client(&self) -> Result<Arc<dyn ApplicationClient>, DeliveryError>;
}

#[async_trait]
pub trait ApplicationClient: Send + Sync {
    /// `Ok(None)` means the application does not exist yet.
    async fn find_application(&self, name: &str) -> Result<Option<Application>, DeliveryError>;

    async fn create_application(&self, app: &Application) -> Result<Application, DeliveryError>;

    /// Deleting an application that does not exist succeeds.
    async fn delete_application(&self, name: &str) -> Result<(), DeliveryError>;
}

pub fn platform_app_name(cluster_name: &str) -> String {
    format!("{}-arlon", cluster_name)
}

fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), "arlon".to_string()),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Whether `app` was created by the controller for `cluster_name`.
pub fn belongs_to_cluster(app: &Application, cluster_name: &str) -> bool {
    app.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(CLUSTER_LABEL))
        .map(|value| value == cluster_name)
        .unwrap_or(false)
}

/// Autoscaler data carried into the platform application.
#[derive(Clone, Copy, Debug)]
pub struct AutoscalerParams<'a> {
    pub mgmt_cluster_host: &'a str,
    pub inner_cluster_name: &'a str,
}

/// Builds the application deploying the arlon chart for a cluster.
pub fn platform_application(
    cluster_name: &str,
    chart: &RepoSpec,
    autoscaler: Option<AutoscalerParams<'_>>,
    config: &ControllerConfig,
) -> Application {
    let mut parameters = vec![
        HelmParameter {
            name: "clusterName".to_string(),
            value: cluster_name.to_string(),
        },
        HelmParameter {
            name: "arlonNamespace".to_string(),
            value: config.arlon_namespace.clone(),
        },
    ];
    if let Some(autoscaler) = autoscaler {
        parameters.extend([
            HelmParameter {
                name: "gen2CASEnabled".to_string(),
                value: "true".to_string(),
            },
            HelmParameter {
                name: "casMgmtClusterHost".to_string(),
                value: autoscaler.mgmt_cluster_host.to_string(),
            },
            HelmParameter {
                name: "innerClusterName".to_string(),
                value: autoscaler.inner_cluster_name.to_string(),
            },
        ]);
    }

    let mut app = Application::new(
        &platform_app_name(cluster_name),
        ApplicationSpec {
            project: "default".to_string(),
            source: ApplicationSource {
                repo_url: chart.url.clone(),
                path: chart.path.clone(),
                target_revision: chart.revision.clone(),
                helm: Some(HelmSource { parameters }),
            },
            destination: ApplicationDestination {
                server: Some(IN_CLUSTER_SERVER.to_string()),
                name: None,
                namespace: Some(config.arlon_namespace.clone()),
            },
            sync_policy: Some(SyncPolicy::automated()),
        },
    );
    app.metadata.namespace = Some(config.argocd_namespace.clone());
    app.metadata.labels = Some(cluster_labels(cluster_name));
    app
}

/// Builds the application materializing the cluster template itself.
pub fn workload_application(
    cluster_name: &str,
    inner_cluster_name: &str,
    template: &RepoSpec,
    config: &ControllerConfig,
) -> Application {
    let mut app = Application::new(
        cluster_name,
        ApplicationSpec {
            project: "default".to_string(),
            source: ApplicationSource {
                repo_url: template.url.clone(),
                path: template.path.clone(),
                target_revision: template.revision.clone(),
                helm: None,
            },
            destination: ApplicationDestination {
                server: Some(IN_CLUSTER_SERVER.to_string()),
                name: None,
                namespace: Some(cluster_name.to_string()),
            },
            sync_policy: Some(SyncPolicy::automated()),
        },
    );
    app.metadata.namespace = Some(config.argocd_namespace.clone());
    app.metadata.labels = Some(cluster_labels(cluster_name));
    app.metadata.annotations = Some(BTreeMap::from([(
        INNER_CLUSTER_ANNOTATION.to_string(),
        inner_cluster_name.to_string(),
    )]));
    app
}

/// Picks credentials for `repo_url` from Argo CD repository secrets. A
/// `repository` secret with the exact URL wins over the longest matching
/// `repo-creds` URL prefix.
pub fn select_credentials(secrets: &[Secret], repo_url: &str) -> Option<RepoCreds> {
    let normalized = normalize_url(repo_url);
    let mut best_template: Option<(usize, RepoCreds)> = None;

    for secret in secrets {
        let secret_type = secret
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SECRET_TYPE_LABEL))
            .map(String::as_str);
        let url = match secret_field(secret, "url") {
            Some(url) => url,
            None => continue,
        };
        match secret_type {
            Some("repository") if normalize_url(&url) == normalized => {
                return Some(creds_from_secret(secret));
            }
            Some("repo-creds") if normalized.starts_with(normalize_url(&url)) => {
                let len = url.len();
                if best_template.as_ref().map_or(true, |(best, _)| len > *best) {
                    best_template = Some((len, creds_from_secret(secret)));
                }
            }
            _ => {}
        }
    }
    best_template.map(|(_, creds)| creds)
}

fn normalize_url(url: &str) -> &str {
    let url = url.trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url)
}

fn secret_field(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|value| String::from_utf8(value.0.clone()).ok())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .cloned()
        })
}

fn creds_from_secret(secret: &Secret) -> RepoCreds {
    RepoCreds {
        username: secret_field(secret, "username"),
        password: secret_field(secret, "password"),
        ssh_private_key: secret_field(secret, "sshPrivateKey"),
    }
}

/// Argo CD backed by the Kubernetes API of the management cluster.
#[derive(Clone)]
pub struct KubeDeliveryEngine {
    client: kube::Client,
    namespace: String,
}

impl KubeDeliveryEngine {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        KubeDeliveryEngine {
            client,
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl RepoCredentials for KubeDeliveryEngine {
    async fn repo_credentials(&self, repo_url: &str) -> Result<RepoCreds, DeliveryError> {
        let secrets = Api::<Secret>::namespaced(self.client.clone(), &self.namespace)
            .list(&ListParams::default().labels(SECRET_TYPE_LABEL))
            .await?;
        match select_credentials(&secrets.items, repo_url) {
            Some(creds) => Ok(creds),
            None => {
                tracing::debug!(
                    %repo_url,
                    "no repository credentials registered, using anonymous access"
                );
                Ok(RepoCreds::default())
            }
        }
    }
}

#[async_trait]
impl DeliveryEngine for KubeDeliveryEngine {
    async fn application_client(&self) -> Result<Arc<dyn ApplicationClient>, DeliveryError> {
        Ok(Arc::new(KubeApplicationClient {
            api: Api::namespaced(self.client.clone(), &self.namespace),
        }))
    }
}

struct KubeApplicationClient {
    api: Api<Application>,
}

#[async_trait]
impl ApplicationClient for KubeApplicationClient {
    async fn find_application(&self, name: &str) -> Result<Option<Application>, DeliveryError> {
        match self.api.get(name).await {
            Ok(app) => Ok(Some(app)),
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn create_application(&self, app: &Application) -> Result<Application, DeliveryError> {
        Ok(self.api.create(&PostParams::default(), app).await?)
    }

    async fn delete_application(&self, name: &str) -> Result<(), DeliveryError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
