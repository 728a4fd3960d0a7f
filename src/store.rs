use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use thiserror::Error;

use crate::types::Cluster;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("kubernetes API request failed: {0}")]
    Api(#[from] kube::Error),
    #[error("failed to serialize cluster: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

/// Persistence of Cluster records.
///
/// Writes carry the resourceVersion read by `get`, so a stale write fails and
/// the change event is redelivered.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Returns `None` when the Cluster no longer exists.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError>;

    /// Writes metadata (finalizers) of the Cluster.
    async fn replace(&self, cluster: &Cluster) -> Result<Cluster, StoreError>;

    /// Writes the status sub-resource of the Cluster.
    async fn replace_status(&self, cluster: &Cluster) -> Result<Cluster, StoreError>;
}

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

pub struct KubeClusterStore {
    client: kube::Client,
}

impl KubeClusterStore {
    pub fn new(client: kube::Client) -> Self {
        KubeClusterStore { client }
    }

    fn api_for(&self, cluster: &Cluster) -> Result<Api<Cluster>, StoreError> {
        let namespace = cluster
            .namespace()
            .ok_or(StoreError::MissingObjectKey(".metadata.namespace"))?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError> {
        let api = Api::<Cluster>::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cluster) => Ok(Some(cluster)),
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn replace(&self, cluster: &Cluster) -> Result<Cluster, StoreError> {
        let name = cluster
            .metadata
            .name
            .as_deref()
            .ok_or(StoreError::MissingObjectKey(".metadata.name"))?;
        Ok(self
            .api_for(cluster)?
            .replace(name, &PostParams::default(), cluster)
            .await?)
    }

    async fn replace_status(&self, cluster: &Cluster) -> Result<Cluster, StoreError> {
        let name = cluster
            .metadata
            .name
            .as_deref()
            .ok_or(StoreError::MissingObjectKey(".metadata.name"))?;
        Ok(self
            .api_for(cluster)?
            .replace_status(name, &PostParams::default(), serde_json::to_vec(cluster)?)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn only_404_is_not_found() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(!is_not_found(&api_error(500)));
    }
}
