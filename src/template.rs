//! Validation of cluster templates stored in git.
//!
//! A usable template is a kustomize directory holding exactly one Cluster API
//! `Cluster`; its name becomes the inner cluster name.

use std::path::Path;

use async_trait::async_trait;
use git2::build::RepoBuilder;
use git2::{FetchOptions, ObjectType, Repository, Tree};
use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

use crate::git::{remote_callbacks, RepoCreds};

const KUSTOMIZATION_FILES: [&str; 3] = ["kustomization.yaml", "kustomization.yml", "Kustomization"];
const CLUSTER_API_GROUP: &str = "cluster.x-k8s.io/";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to create working directory: {0}")]
    TempDir(#[source] std::io::Error),
    #[error("failed to clone repository: {0}")]
    Clone(#[source] git2::Error),
    #[error("invalid revision: {0}")]
    InvalidRevision(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("path is not a directory: {0}")]
    NotADirectory(String),
    #[error("missing kustomization file in {0}")]
    MissingKustomization(String),
    #[error("failed to parse {file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no cluster resource found in {0}")]
    NoClusterResource(String),
    #[error("found {0} cluster resources, expected exactly one")]
    MultipleClusterResources(usize),
    #[error("cluster resource in {0} has no name")]
    UnnamedCluster(String),
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    #[error("validation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Checks that a repository location holds a usable cluster template.
#[async_trait]
pub trait TemplateValidator: Send + Sync {
    /// Returns the inner cluster name declared by the template.
    async fn validate(
        &self,
        creds: &RepoCreds,
        repo_url: &str,
        revision: &str,
        path: &str,
    ) -> Result<String, TemplateError>;
}

#[derive(Clone, Debug, Default)]
pub struct GitTemplateValidator;

#[async_trait]
impl TemplateValidator for GitTemplateValidator {
    async fn validate(
        &self,
        creds: &RepoCreds,
        repo_url: &str,
        revision: &str,
        path: &str,
    ) -> Result<String, TemplateError> {
        let creds = creds.clone();
        let repo_url = repo_url.to_string();
        let revision = revision.to_string();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || validate_git_dir(&creds, &repo_url, &revision, &path))
            .await?
    }
}

/// Clones `repo_url` and validates the template at `revision`/`path`.
pub fn validate_git_dir(
    creds: &RepoCreds,
    repo_url: &str,
    revision: &str,
    path: &str,
) -> Result<String, TemplateError> {
    let dir = tempfile::Builder::new()
        .prefix("arlon-template-")
        .tempdir()
        .map_err(TemplateError::TempDir)?;

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(remote_callbacks(creds));
    let mut builder = RepoBuilder::new();
    builder.bare(true);
    builder.fetch_options(fetch_options);
    let repo = builder
        .clone(repo_url, dir.path())
        .map_err(TemplateError::Clone)?;

    let tree = template_tree(&repo, revision, path)?;
    let files = yaml_files(&repo, &tree, path)?;
    find_cluster_name(path, &files)
}

fn template_tree<'r>(
    repo: &'r Repository,
    revision: &str,
    path: &str,
) -> Result<Tree<'r>, TemplateError> {
    let candidates = [
        revision.to_string(),
        format!("origin/{}", revision),
        format!("refs/tags/{}", revision),
    ];
    let commit = candidates
        .iter()
        .find_map(|spec| {
            repo.revparse_single(spec)
                .and_then(|object| object.peel_to_commit())
                .ok()
        })
        .ok_or_else(|| TemplateError::InvalidRevision(revision.to_string()))?;
    let root = commit.tree()?;

    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        return Ok(root);
    }
    let entry = root
        .get_path(Path::new(trimmed))
        .map_err(|_| TemplateError::PathNotFound(path.to_string()))?;
    if entry.kind() != Some(ObjectType::Tree) {
        return Err(TemplateError::NotADirectory(path.to_string()));
    }
    Ok(repo.find_tree(entry.id())?)
}

/// Returns (file name, contents) of the yaml files directly under `tree`.
fn yaml_files(
    repo: &Repository,
    tree: &Tree<'_>,
    path: &str,
) -> Result<Vec<(String, String)>, TemplateError> {
    let mut has_kustomization = false;
    let mut files = Vec::new();
    for entry in tree.iter() {
        if entry.kind() != Some(ObjectType::Blob) {
            continue;
        }
        let name = match entry.name() {
            Some(name) => name.to_string(),
            None => continue,
        };
        if KUSTOMIZATION_FILES.contains(&name.as_str()) {
            has_kustomization = true;
            continue;
        }
        if !(name.ends_with(".yaml") || name.ends_with(".yml")) {
            continue;
        }
        let blob = repo.find_blob(entry.id())?;
        files.push((name, String::from_utf8_lossy(blob.content()).into_owned()));
    }
    if !has_kustomization {
        return Err(TemplateError::MissingKustomization(path.to_string()));
    }
    Ok(files)
}

/// Finds the single Cluster API cluster declared across `files`.
pub fn find_cluster_name(path: &str, files: &[(String, String)]) -> Result<String, TemplateError> {
    let mut clusters = Vec::new();
    for (file, contents) in files {
        for document in serde_yaml::Deserializer::from_str(contents) {
            let value = Value::deserialize(document).map_err(|source| TemplateError::Parse {
                file: file.clone(),
                source,
            })?;
            if value.is_null() {
                continue;
            }
            if is_capi_cluster(&value) {
                clusters.push((file, value));
            }
        }
    }
    match clusters.as_slice() {
        [] => Err(TemplateError::NoClusterResource(path.to_string())),
        [(file, cluster)] => cluster
            .get("metadata")
            .and_then(|metadata| metadata.get("name"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or_else(|| TemplateError::UnnamedCluster(file.to_string())),
        many => Err(TemplateError::MultipleClusterResources(many.len())),
    }
}

fn is_capi_cluster(value: &Value) -> bool {
    let kind = value.get("kind").and_then(Value::as_str);
    let api_version = value.get("apiVersion").and_then(Value::as_str);
    kind == Some("Cluster")
        && api_version
            .map(|version| version.starts_with(CLUSTER_API_GROUP))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER: &str = "apiVersion: cluster.x-k8s.io/v1beta1\nkind: Cluster\nmetadata:\n  name: capi-foo\n";
    const MACHINES: &str = "apiVersion: cluster.x-k8s.io/v1beta1\nkind: MachineDeployment\nmetadata:\n  name: md\n";

    fn file(name: &str, contents: &str) -> (String, String) {
        (name.to_string(), contents.to_string())
    }

    #[test]
    fn finds_cluster_among_documents() {
        let combined = format!("# header\n---\n{}---\n{}", MACHINES, CLUSTER);
        let name = find_cluster_name("p", &[file("all.yaml", &combined)]).unwrap();
        assert_eq!(name, "capi-foo");
    }

    #[test]
    fn finds_cluster_written_on_the_marker_line() {
        let inline = "--- {apiVersion: cluster.x-k8s.io/v1beta1, kind: Cluster, metadata: {name: capi-inline}}\n";
        let name = find_cluster_name("p", &[file("a.yaml", inline)]).unwrap();
        assert_eq!(name, "capi-inline");
    }

    #[test]
    fn skips_empty_documents() {
        let padded = format!("---\n---\n{}---\n", CLUSTER);
        let name = find_cluster_name("p", &[file("a.yaml", &padded)]).unwrap();
        assert_eq!(name, "capi-foo");
    }

    #[test]
    fn ignores_clusters_of_other_groups() {
        let other = "apiVersion: example.com/v1\nkind: Cluster\nmetadata:\n  name: x\n";
        let error = find_cluster_name("p", &[file("a.yaml", other)]).unwrap_err();
        assert!(matches!(error, TemplateError::NoClusterResource(_)));
    }

    #[test]
    fn rejects_multiple_clusters() {
        let error = find_cluster_name("p", &[file("a.yaml", CLUSTER), file("b.yaml", CLUSTER)])
            .unwrap_err();
        assert!(matches!(error, TemplateError::MultipleClusterResources(2)));
    }

    #[test]
    fn rejects_unnamed_cluster() {
        let unnamed = "apiVersion: cluster.x-k8s.io/v1beta1\nkind: Cluster\nmetadata: {}\n";
        let error = find_cluster_name("p", &[file("a.yaml", unnamed)]).unwrap_err();
        assert!(matches!(error, TemplateError::UnnamedCluster(_)));
    }

    #[test]
    fn invalid_revision_message() {
        let error = TemplateError::InvalidRevision("v9".to_string());
        assert_eq!(error.to_string(), "invalid revision: v9");
    }
}
