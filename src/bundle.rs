use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use thiserror::Error;

use crate::store::is_not_found;

pub const BUNDLE_TYPE_LABEL: &str = "arlon-type";
pub const BUNDLE_TYPE: &str = "bundle";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle {0} not found")]
    NotFound(String),
    #[error("configmap {0} is not a bundle")]
    NotABundle(String),
    #[error("bundle {name} is malformed: {reason}")]
    Malformed { name: String, reason: String },
    #[error("failed to get bundle {name}: {source}")]
    Api {
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// A unit of template content rendered into a profile's repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bundle {
    pub name: String,
    pub description: String,
    pub kind: BundleKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BundleKind {
    /// Manifests stored inline and copied into the profile repository.
    Static { data: String },
    /// Manifests living in their own repository.
    Dynamic {
        repo_url: String,
        repo_path: String,
        repo_revision: String,
    },
}

impl Bundle {
    pub fn validate(&self) -> Result<(), BundleError> {
        let malformed = |reason: &str| BundleError::Malformed {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() || self.name.contains('/') || self.name.starts_with('.') {
            return Err(malformed("invalid name"));
        }
        match &self.kind {
            BundleKind::Static { data } if data.trim().is_empty() => Err(malformed("empty data")),
            BundleKind::Dynamic { repo_url, .. } if repo_url.is_empty() => {
                Err(malformed("empty repository url"))
            }
            _ => Ok(()),
        }
    }

    /// Reads a bundle from its ConfigMap representation.
    pub fn from_config_map(cm: &ConfigMap) -> Result<Bundle, BundleError> {
        let name = cm.metadata.name.clone().unwrap_or_default();
        let is_bundle = cm
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(BUNDLE_TYPE_LABEL))
            .map(|value| value == BUNDLE_TYPE)
            .unwrap_or(false);
        if !is_bundle {
            return Err(BundleError::NotABundle(name));
        }
        let data = cm.data.clone().unwrap_or_default();
        let description = data.get("description").cloned().unwrap_or_default();
        let kind = if let Some(content) = data.get("data") {
            BundleKind::Static {
                data: content.clone(),
            }
        } else if let Some(repo_url) = data.get("repo-url") {
            BundleKind::Dynamic {
                repo_url: repo_url.clone(),
                repo_path: data.get("repo-path").cloned().ok_or_else(|| {
                    BundleError::Malformed {
                        name: name.clone(),
                        reason: "missing repo-path".to_string(),
                    }
                })?,
                repo_revision: data
                    .get("repo-revision")
                    .cloned()
                    .unwrap_or_else(|| "HEAD".to_string()),
            }
        } else {
            return Err(BundleError::Malformed {
                name,
                reason: "neither data nor repo-url set".to_string(),
            });
        };
        let bundle = Bundle {
            name,
            description,
            kind,
        };
        bundle.validate()?;
        Ok(bundle)
    }
}

/// Resolves bundle names to their contents.
#[async_trait]
pub trait BundleSource: Send + Sync {
    async fn bundles(&self, names: &[String]) -> Result<Vec<Bundle>, BundleError>;
}

/// Bundles stored as ConfigMaps in the arlon namespace.
pub struct KubeBundleSource {
    api: Api<ConfigMap>,
}

impl KubeBundleSource {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        KubeBundleSource {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl BundleSource for KubeBundleSource {
    async fn bundles(&self, names: &[String]) -> Result<Vec<Bundle>, BundleError> {
        let mut bundles = Vec::with_capacity(names.len());
        for name in names {
            let cm = match self.api.get(name).await {
                Ok(cm) => cm,
                Err(error) if is_not_found(&error) => {
                    return Err(BundleError::NotFound(name.clone()))
                }
                Err(source) => {
                    return Err(BundleError::Api {
                        name: name.clone(),
                        source,
                    })
                }
            };
            bundles.push(Bundle::from_config_map(&cm)?);
        }
        Ok(bundles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn config_map(name: &str, labelled: bool, data: &[(&str, &str)]) -> ConfigMap {
        let labels = labelled.then(|| {
            BTreeMap::from([(BUNDLE_TYPE_LABEL.to_string(), BUNDLE_TYPE.to_string())])
        });
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels,
                ..ObjectMeta::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..ConfigMap::default()
        }
    }

    #[test]
    fn static_bundle_from_config_map() {
        let bundle = Bundle::from_config_map(&config_map(
            "guestbook",
            true,
            &[("data", "kind: ConfigMap\n"), ("description", "demo")],
        ))
        .unwrap();
        assert_eq!(bundle.description, "demo");
        assert!(matches!(bundle.kind, BundleKind::Static { .. }));
    }

    #[test]
    fn dynamic_bundle_defaults_revision() {
        let bundle = Bundle::from_config_map(&config_map(
            "cni",
            true,
            &[("repo-url", "https://example/cni.git"), ("repo-path", "calico")],
        ))
        .unwrap();
        assert_eq!(
            bundle.kind,
            BundleKind::Dynamic {
                repo_url: "https://example/cni.git".to_string(),
                repo_path: "calico".to_string(),
                repo_revision: "HEAD".to_string(),
            }
        );
    }

    #[test]
    fn unlabelled_config_map_is_rejected() {
        let error =
            Bundle::from_config_map(&config_map("x", false, &[("data", "a: b")])).unwrap_err();
        assert!(matches!(error, BundleError::NotABundle(_)));
    }

    #[test]
    fn empty_static_bundle_is_malformed() {
        let error = Bundle::from_config_map(&config_map("x", true, &[("data", "  ")])).unwrap_err();
        assert!(matches!(error, BundleError::Malformed { .. }));
    }
}
