//! Rendering of profile manifests into a working tree.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::argocd::{
    Application, ApplicationDestination, ApplicationSource, ApplicationSpec, SyncPolicy,
};
use crate::bundle::{Bundle, BundleError, BundleKind};
use crate::git::WorkingTree;

/// Replaced by the per-cluster reference after serialization.
const CLUSTER_NAME_TOKEN: &str = "__ARLON_CLUSTER_NAME__";

/// Helm expression resolving to the cluster a profile chart is installed for.
pub const CLUSTER_NAME_VALUE: &str = "{{ .Values.clusterName }}";

pub struct EmbeddedFile {
    pub path: &'static str,
    pub contents: &'static str,
}

/// Helm chart wrapping the bundle applications of a profile.
pub const PROFILE_CHART: &[EmbeddedFile] = &[
    EmbeddedFile {
        path: "Chart.yaml",
        contents: include_str!("../manifests/profile/Chart.yaml"),
    },
    EmbeddedFile {
        path: "values.yaml",
        contents: include_str!("../manifests/profile/values.yaml"),
    },
    EmbeddedFile {
        path: "templates/_helpers.tpl",
        contents: include_str!("../manifests/profile/templates/_helpers.tpl"),
    },
];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no embedded files under {0}")]
    EmptySource(String),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    InvalidBundle(#[from] BundleError),
    #[error("failed to serialize application for bundle {bundle}: {source}")]
    Serialize {
        bundle: String,
        #[source]
        source: serde_yaml::Error,
    },
}

fn write(tree: &WorkingTree, path: PathBuf, contents: &[u8]) -> Result<(), ManifestError> {
    tree.write_file(&path, contents)
        .map_err(|source| ManifestError::Write { path, source })
}

/// Copies the files of `source` found under `src_root` into `dest`,
/// overwriting existing files.
pub fn copy_manifests(
    tree: &WorkingTree,
    source: &[EmbeddedFile],
    src_root: &str,
    dest: &Path,
) -> Result<usize, ManifestError> {
    let root = src_root.trim_matches('/');
    let mut copied = 0;
    for file in source {
        let relative = if root.is_empty() || root == "." {
            file.path
        } else {
            match file
                .path
                .strip_prefix(root)
                .and_then(|rest| rest.strip_prefix('/'))
            {
                Some(rest) => rest,
                None => continue,
            }
        };
        write(tree, dest.join(relative), file.contents.as_bytes())?;
        copied += 1;
    }
    if copied == 0 {
        return Err(ManifestError::EmptySource(src_root.to_string()));
    }
    Ok(copied)
}

/// Renders one Application template per bundle into `templates_path`.
///
/// Static bundle data lands in `<repo_path>/bundles/<name>/data.yaml`. The
/// cluster name inside every template is `placeholder`, left for the delivery
/// engine to resolve when the chart is installed for a cluster.
pub fn process_bundles(
    tree: &WorkingTree,
    placeholder: &str,
    repo_url: &str,
    repo_path: &str,
    templates_path: &Path,
    bundles: &[Bundle],
) -> Result<(), ManifestError> {
    for bundle in bundles {
        bundle.validate()?;
        let source = match &bundle.kind {
            BundleKind::Static { data } => {
                let dir = Path::new(repo_path).join("bundles").join(&bundle.name);
                write(tree, dir.join("data.yaml"), data.as_bytes())?;
                ApplicationSource {
                    repo_url: repo_url.to_string(),
                    path: dir.to_string_lossy().into_owned(),
                    target_revision: "HEAD".to_string(),
                    helm: None,
                }
            }
            BundleKind::Dynamic {
                repo_url,
                repo_path,
                repo_revision,
            } => ApplicationSource {
                repo_url: repo_url.clone(),
                path: repo_path.clone(),
                target_revision: repo_revision.clone(),
                helm: None,
            },
        };
        let manifest = serde_yaml::to_string(&bundle_application(&bundle.name, source))
            .map_err(|source| ManifestError::Serialize {
                bundle: bundle.name.clone(),
                source,
            })?
            .replace(CLUSTER_NAME_TOKEN, placeholder);
        write(
            tree,
            templates_path.join(format!("{}.yaml", bundle.name)),
            manifest.as_bytes(),
        )?;
        tracing::debug!(bundle = %bundle.name, "rendered bundle");
    }
    Ok(())
}

fn bundle_application(bundle_name: &str, source: ApplicationSource) -> Application {
    Application::new(
        &format!("{}-{}", CLUSTER_NAME_TOKEN, bundle_name),
        ApplicationSpec {
            project: "default".to_string(),
            source,
            destination: ApplicationDestination {
                server: None,
                name: Some(CLUSTER_NAME_TOKEN.to_string()),
                namespace: Some("default".to_string()),
            },
            sync_policy: Some(SyncPolicy::automated()),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn static_bundle(name: &str) -> Bundle {
        Bundle {
            name: name.to_string(),
            description: String::new(),
            kind: BundleKind::Static {
                data: "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: demo\n".to_string(),
            },
        }
    }

    #[test]
    fn copies_the_profile_chart() {
        let dir = tempfile::tempdir().unwrap();
        let tree = WorkingTree::new(dir.path());
        let copied = copy_manifests(&tree, PROFILE_CHART, ".", Path::new("profiles/p1")).unwrap();
        assert_eq!(copied, PROFILE_CHART.len());
        let chart = fs::read_to_string(dir.path().join("profiles/p1/Chart.yaml")).unwrap();
        assert!(chart.contains("arlon-profile"));
        assert!(dir.path().join("profiles/p1/templates/_helpers.tpl").exists());
    }

    #[test]
    fn copy_from_subdirectory_strips_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let tree = WorkingTree::new(dir.path());
        let copied = copy_manifests(&tree, PROFILE_CHART, "templates", Path::new("t")).unwrap();
        assert_eq!(copied, 1);
        assert!(dir.path().join("t/_helpers.tpl").exists());
        assert!(matches!(
            copy_manifests(&tree, PROFILE_CHART, "missing", Path::new("t")),
            Err(ManifestError::EmptySource(_))
        ));
    }

    #[test]
    fn static_bundle_is_rendered_with_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let tree = WorkingTree::new(dir.path());
        process_bundles(
            &tree,
            CLUSTER_NAME_VALUE,
            "https://example/profiles.git",
            "profiles/p1",
            Path::new("profiles/p1/templates"),
            &[static_bundle("guestbook")],
        )
        .unwrap();

        let data =
            fs::read_to_string(dir.path().join("profiles/p1/bundles/guestbook/data.yaml")).unwrap();
        assert!(data.contains("kind: Namespace"));

        let template =
            fs::read_to_string(dir.path().join("profiles/p1/templates/guestbook.yaml")).unwrap();
        assert!(template.contains("{{ .Values.clusterName }}-guestbook"));
        assert!(template.contains("profiles/p1/bundles/guestbook"));
        assert!(!template.contains(CLUSTER_NAME_TOKEN));
    }

    #[test]
    fn dynamic_bundle_points_at_its_repository() {
        let dir = tempfile::tempdir().unwrap();
        let tree = WorkingTree::new(dir.path());
        let bundle = Bundle {
            name: "cni".to_string(),
            description: String::new(),
            kind: BundleKind::Dynamic {
                repo_url: "https://example/cni.git".to_string(),
                repo_path: "calico".to_string(),
                repo_revision: "v3".to_string(),
            },
        };
        process_bundles(&tree, "X", "unused", "p", Path::new("p/templates"), &[bundle]).unwrap();
        let template = fs::read_to_string(dir.path().join("p/templates/cni.yaml")).unwrap();
        assert!(template.contains("https://example/cni.git"));
        assert!(template.contains("X-cni"));
        assert!(!dir.path().join("p/bundles").exists());
    }

    #[test]
    fn malformed_bundle_aborts_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let tree = WorkingTree::new(dir.path());
        let mut broken = static_bundle("broken");
        broken.kind = BundleKind::Static {
            data: String::new(),
        };
        let error = process_bundles(
            &tree,
            "X",
            "u",
            "p",
            Path::new("p/templates"),
            &[broken, static_bundle("later")],
        )
        .unwrap_err();
        assert!(matches!(error, ManifestError::InvalidBundle(_)));
        assert!(!dir.path().join("p/templates/later.yaml").exists());
    }
}
