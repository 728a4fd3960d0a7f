use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::{Context, ReconcilerAction};
use kube::ResourceExt;
use thiserror::Error;
use tracing::Instrument;

use crate::argocd::{
    self, belongs_to_cluster, platform_app_name, AutoscalerParams, DeliveryEngine,
    RepoCredentials,
};
use crate::config::ControllerConfig;
use crate::store::{ClusterStore, StoreError};
use crate::template::TemplateValidator;
use crate::types::{Cluster, ClusterState, CLUSTER_FINALIZER};

pub struct Data {
    pub reconciler: ClusterReconciler,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Failed to get cluster: {0}")]
    GetClusterFailed(#[source] StoreError),
    #[error("Failed to add finalizer: {0}")]
    AddFinalizerFailed(#[source] StoreError),
    #[error("Failed to remove finalizer: {0}")]
    RemoveFinalizerFailed(#[source] StoreError),
    #[error("Failed to update status: {0}")]
    UpdateStatusFailed(#[source] StoreError),
}

/// The status a decision branch wants persisted, and when to come back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub state: ClusterState,
    pub message: String,
    pub inner_cluster_name: Option<String>,
    pub requeue_after: Option<Duration>,
}

impl Transition {
    fn to(
        state: ClusterState,
        message: impl Into<String>,
        requeue_after: Option<Duration>,
    ) -> Self {
        Transition {
            state,
            message: message.into(),
            inner_cluster_name: None,
            requeue_after,
        }
    }

    fn retrying(message: impl Into<String>, delay: Duration) -> Self {
        Transition::to(ClusterState::Retrying, message, Some(delay))
    }
}

/// Drives a Cluster from an empty status to `created`.
///
/// Each pass performs at most one delivery-engine mutation, persists the
/// outcome in the Cluster status and tells the scheduler when to revisit.
pub struct ClusterReconciler {
    store: Arc<dyn ClusterStore>,
    credentials: Arc<dyn RepoCredentials>,
    engine: Arc<dyn DeliveryEngine>,
    validator: Arc<dyn TemplateValidator>,
    config: ControllerConfig,
}

impl ClusterReconciler {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        credentials: Arc<dyn RepoCredentials>,
        engine: Arc<dyn DeliveryEngine>,
        validator: Arc<dyn TemplateValidator>,
        config: ControllerConfig,
    ) -> Self {
        ClusterReconciler {
            store,
            credentials,
            engine,
            validator,
            config,
        }
    }

    /// Runs one reconciliation pass and returns the requested revisit delay.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Option<Duration>, Error> {
        let cluster = match self
            .store
            .get(namespace, name)
            .await
            .map_err(Error::GetClusterFailed)?
        {
            Some(cluster) => cluster,
            None => {
                tracing::info!("cluster is gone -- ok");
                return Ok(None);
            }
        };

        if cluster.metadata.deletion_timestamp.is_some() {
            return self.reconcile_delete(cluster).await;
        }
        if cluster.state() == ClusterState::Created {
            tracing::debug!("cluster is already created");
            return Ok(None);
        }
        // The finalizer must be durable before anything is created in the
        // delivery engine.
        if !cluster.has_finalizer() {
            let mut cluster = cluster;
            cluster
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(CLUSTER_FINALIZER.to_string());
            self.store
                .replace(&cluster)
                .await
                .map_err(Error::AddFinalizerFailed)?;
            tracing::info!("added finalizer");
            return Ok(None);
        }

        let transition = self.next_transition(&cluster).await;
        self.update_state(cluster, transition).await
    }

    /// Decides the next step for a Cluster that holds the finalizer and is
    /// not yet created.
    ///
    /// Creating the workload application leaves the Cluster `initializing`;
    /// the next pass observes the application and marks it `created`.
    pub async fn next_transition(&self, cluster: &Cluster) -> Transition {
        let name = cluster.name();
        let template = &cluster.spec.cluster_template;
        let status = cluster.status.clone().unwrap_or_default();
        let retry_delay = self.config.retry_delay;

        if status.inner_cluster_name.is_empty() {
            tracing::info!("validating cluster template ...");
            let creds = match self.credentials.repo_credentials(&template.url).await {
                Ok(creds) => creds,
                Err(error) => {
                    return Transition::retrying(
                        format!("failed to get repo creds: {}", error),
                        retry_delay,
                    )
                }
            };
            return match self
                .validator
                .validate(&creds, &template.url, &template.revision, &template.path)
                .await
            {
                Ok(inner_cluster_name) => Transition {
                    inner_cluster_name: Some(inner_cluster_name),
                    ..Transition::to(
                        ClusterState::Initializing,
                        "cluster template validation successful",
                        None,
                    )
                },
                Err(error) => Transition::retrying(
                    format!("failed to validate cluster template: {}", error),
                    retry_delay,
                ),
            };
        }

        let apps = match self.engine.application_client().await {
            Ok(apps) => apps,
            Err(error) => {
                return Transition::retrying(
                    format!("failed to get argocd application client: {}", error),
                    retry_delay,
                )
            }
        };

        let platform_name = platform_app_name(&name);
        match apps.find_application(&platform_name).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let chart = cluster
                    .spec
                    .arlon_helm_chart
                    .as_ref()
                    .unwrap_or(&self.config.default_chart);
                let autoscaler = cluster
                    .spec
                    .autoscaler
                    .as_ref()
                    .map(|autoscaler| AutoscalerParams {
                        mgmt_cluster_host: &autoscaler.mgmt_cluster_host,
                        inner_cluster_name: &status.inner_cluster_name,
                    });
                let app = argocd::platform_application(&name, chart, autoscaler, &self.config);
                return match apps.create_application(&app).await {
                    Ok(_) => Transition::to(
                        ClusterState::Initializing,
                        "arlon application created",
                        Some(retry_delay),
                    ),
                    Err(error) => Transition::retrying(
                        format!("failed to create arlon application: {}", error),
                        retry_delay,
                    ),
                };
            }
            Err(error) => {
                return Transition::retrying(
                    format!("failed to get arlon application: {}", error),
                    retry_delay,
                )
            }
        }

        match apps.find_application(&name).await {
            Ok(Some(_)) => Transition::to(
                ClusterState::Created,
                "cluster app already exists -- ok",
                Some(retry_delay),
            ),
            Ok(None) => {
                let app = argocd::workload_application(
                    &name,
                    &status.inner_cluster_name,
                    template,
                    &self.config,
                );
                match apps.create_application(&app).await {
                    Ok(_) => Transition::to(
                        ClusterState::Initializing,
                        "cluster application created",
                        Some(retry_delay),
                    ),
                    Err(error) => Transition::retrying(
                        format!("failed to create cluster application: {}", error),
                        retry_delay,
                    ),
                }
            }
            Err(error) => Transition::retrying(
                format!("failed to get cluster application: {}", error),
                retry_delay,
            ),
        }
    }

    async fn update_state(
        &self,
        mut cluster: Cluster,
        transition: Transition,
    ) -> Result<Option<Duration>, Error> {
        let generation = cluster.metadata.generation;
        let status = cluster.status.get_or_insert_with(Default::default);
        status.state = transition.state;
        status.message = transition.message;
        status.observed_generation = generation;
        if let Some(inner_cluster_name) = transition.inner_cluster_name {
            status.inner_cluster_name = inner_cluster_name;
        }
        if status.state == ClusterState::Retrying {
            tracing::warn!(state = %status.state, "{} ... setting state", status.message);
        } else {
            tracing::info!(state = %status.state, "{} ... setting state", status.message);
        }

        if let Err(error) = self.store.replace_status(&cluster).await {
            tracing::error!(%error, "unable to update cluster status");
            return Err(Error::UpdateStatusFailed(error));
        }
        Ok(transition.requeue_after)
    }

    /// Removes the applications created for the cluster, then releases the
    /// finalizer so the resource can go away.
    async fn reconcile_delete(&self, mut cluster: Cluster) -> Result<Option<Duration>, Error> {
        if !cluster.has_finalizer() {
            tracing::info!("cluster is being deleted and holds no finalizer");
            return Ok(None);
        }
        let name = cluster.name();
        let retry_delay = self.config.retry_delay;

        let apps = match self.engine.application_client().await {
            Ok(apps) => apps,
            Err(error) => {
                let transition = Transition::retrying(
                    format!("failed to get argocd application client: {}", error),
                    retry_delay,
                );
                return self.update_state(cluster, transition).await;
            }
        };
        for app_name in [name.clone(), platform_app_name(&name)] {
            let result = match apps.find_application(&app_name).await {
                Ok(Some(app)) if belongs_to_cluster(&app, &name) => {
                    tracing::info!(application = %app_name, "deleting application");
                    apps.delete_application(&app_name).await
                }
                Ok(_) => Ok(()),
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                let transition = Transition::retrying(
                    format!("failed to delete application {}: {}", app_name, error),
                    retry_delay,
                );
                return self.update_state(cluster, transition).await;
            }
        }

        if let Some(finalizers) = cluster.metadata.finalizers.as_mut() {
            finalizers.retain(|finalizer| finalizer != CLUSTER_FINALIZER);
        }
        self.store
            .replace(&cluster)
            .await
            .map_err(Error::RemoveFinalizerFailed)?;
        tracing::info!("removed finalizer");
        Ok(None)
    }
}

pub async fn reconcile(
    cluster: Arc<Cluster>,
    ctx: Context<Data>,
) -> Result<ReconcilerAction, Error> {
    let namespace = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = cluster
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let span = tracing::info_span!("reconcile", %namespace, %name);

    let requeue_after = ctx
        .get_ref()
        .reconciler
        .reconcile(&namespace, &name)
        .instrument(span)
        .await?;
    Ok(ReconcilerAction { requeue_after })
}

pub fn error_policy(error: &Error, _ctx: Context<Data>) -> ReconcilerAction {
    tracing::error!(%error);
    ReconcilerAction {
        requeue_after: Some(Duration::from_secs(3)),
    }
}
