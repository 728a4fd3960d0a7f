use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arlon::argocd::KubeDeliveryEngine;
use arlon::config::{
    ControllerConfig, DEFAULT_CHART_PATH, DEFAULT_CHART_REVISION, DEFAULT_CHART_URL,
};
use arlon::reconcile;
use arlon::store::KubeClusterStore;
use arlon::template::GitTemplateValidator;
use arlon::types::{Cluster, RepoSpec};
use clap::Parser;
use futures_util::stream::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Context, Controller};
use kube::Client;
use tracing_subscriber::EnvFilter;

/// Reconciles arlon Cluster resources.
#[derive(Parser, Debug)]
#[command(name = "controller", version, about)]
struct Args {
    /// Namespace of Argo CD applications and repository secrets.
    #[arg(long, env = "ARLON_ARGOCD_NAMESPACE", default_value = "argocd")]
    argocd_ns: String,

    /// Namespace the platform application deploys into.
    #[arg(long, env = "ARLON_NAMESPACE", default_value = "arlon")]
    arlon_ns: String,

    /// Seconds to wait before revisiting a cluster after a failure.
    #[arg(long, env = "ARLON_RETRY_DELAY_SECONDS", default_value_t = 10)]
    retry_delay_seconds: u64,

    #[arg(long, env = "ARLON_CHART_URL", default_value = DEFAULT_CHART_URL)]
    chart_url: String,

    #[arg(long, env = "ARLON_CHART_PATH", default_value = DEFAULT_CHART_PATH)]
    chart_path: String,

    #[arg(long, env = "ARLON_CHART_REVISION", default_value = DEFAULT_CHART_REVISION)]
    chart_revision: String,
}

impl Args {
    fn config(&self) -> ControllerConfig {
        ControllerConfig {
            argocd_namespace: self.argocd_ns.clone(),
            arlon_namespace: self.arlon_ns.clone(),
            default_chart: RepoSpec {
                url: self.chart_url.clone(),
                path: self.chart_path.clone(),
                revision: self.chart_revision.clone(),
            },
            retry_delay: Duration::from_secs(self.retry_delay_seconds),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.config();

    let client = Client::try_default().await?;

    let engine = Arc::new(KubeDeliveryEngine::new(client.clone(), &config.argocd_namespace));
    let reconciler = reconcile::ClusterReconciler::new(
        Arc::new(KubeClusterStore::new(client.clone())),
        engine.clone(),
        engine,
        Arc::new(GitTemplateValidator),
        config,
    );

    let cluster_api = Api::<Cluster>::all(client);

    Controller::new(cluster_api, ListParams::default())
        .shutdown_on_signal()
        .run(
            reconcile::reconcile,
            reconcile::error_policy,
            Context::new(reconcile::Data { reconciler }),
        )
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("reconciled {:?}", o),
                Err(e) => tracing::warn!("reconcile failed: {}", e),
            }
        })
        .await;

    tracing::info!("controller terminated");

    Ok(())
}
