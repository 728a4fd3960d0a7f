//! Materialization of a profile into a git repository.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use kube::ResourceExt;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::argocd::{DeliveryError, RepoCredentials};
use crate::bundle::{Bundle, BundleError, BundleSource};
use crate::git::{self, Checkout, GitError, RepoCreds, DEFAULT_REMOTE};
use crate::manifests::{self, ManifestError, CLUSTER_NAME_VALUE, PROFILE_CHART};
use crate::types::Profile;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile {0} has no git repository configured")]
    MissingTarget(String),
    #[error("failed to get bundles: {0}")]
    ResolveBundles(#[source] BundleError),
    #[error("failed to get repo creds: {0}")]
    RepoCreds(#[source] DeliveryError),
    #[error("failed to clone repo: {0}")]
    Clone(#[source] GitError),
    #[error("failed to get repo worktree: {0}")]
    Worktree(#[source] GitError),
    #[error("failed to copy embedded content: {0}")]
    CopyManifests(#[source] ManifestError),
    #[error("failed to process bundles: {0}")]
    ProcessBundles(#[source] ManifestError),
    #[error("failed to commit changes: {0}")]
    Commit(#[source] GitError),
    #[error("failed to push to remote repository: {0}")]
    Push(#[source] GitError),
    #[error("materialization task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Where a profile is rendered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitTarget {
    pub repo_url: String,
    pub repo_path: String,
    pub repo_branch: String,
}

impl GitTarget {
    /// The target recorded on the profile itself. The branch defaults to `main`.
    pub fn from_profile(profile: &Profile) -> Result<GitTarget, ProfileError> {
        let missing = || ProfileError::MissingTarget(profile.name());
        let repo_url = profile.spec.repo_url.clone().ok_or_else(missing)?;
        let repo_path = profile.spec.repo_path.clone().ok_or_else(missing)?;
        Ok(GitTarget {
            repo_url,
            repo_path,
            repo_branch: profile
                .spec
                .repo_branch
                .clone()
                .unwrap_or_else(|| "main".to_string()),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The rendered tree matched the last commit; nothing was pushed.
    Unchanged,
    Pushed,
}

/// Serializes materializations targeting the same repository branch.
#[derive(Clone, Default)]
pub struct RepoLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RepoLocks {
    pub async fn lock(&self, repo_url: &str, branch: &str) -> OwnedMutexGuard<()> {
        let key = format!("{}#{}", repo_url, branch);
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // only the map refers to these: nobody holds or waits for them
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Runs `work` on the blocking pool while holding `guard`. The guard is
/// released when `work` returns, even if the returned handle is dropped.
pub fn spawn_locked<F, T>(guard: OwnedMutexGuard<()>, work: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        work()
    })
}

pub struct ProfileMaterializer {
    bundles: Arc<dyn BundleSource>,
    credentials: Arc<dyn RepoCredentials>,
    locks: RepoLocks,
    workspace: PathBuf,
}

impl ProfileMaterializer {
    pub fn new(bundles: Arc<dyn BundleSource>, credentials: Arc<dyn RepoCredentials>) -> Self {
        ProfileMaterializer {
            bundles,
            credentials,
            locks: RepoLocks::default(),
            workspace: std::env::temp_dir(),
        }
    }

    /// Clones into `workspace` instead of the system temporary directory.
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Renders the bundles of `profile` into `target` and pushes the result
    /// as a single commit, if anything changed.
    pub async fn create_in_git(
        &self,
        profile: &Profile,
        target: &GitTarget,
    ) -> Result<Outcome, ProfileError> {
        let span = tracing::info_span!(
            "profile",
            profile = %profile.name(),
            repo = %target.repo_url
        );
        async {
            let bundles = self
                .bundles
                .bundles(&profile.spec.bundles)
                .await
                .map_err(ProfileError::ResolveBundles)?;
            let creds = self
                .credentials
                .repo_credentials(&target.repo_url)
                .await
                .map_err(ProfileError::RepoCreds)?;

            let guard = self.locks.lock(&target.repo_url, &target.repo_branch).await;
            let workspace = self.workspace.clone();
            let target = target.clone();
            let message = format!("arlon: update profile {}", profile.name());
            let span = tracing::Span::current();
            spawn_locked(guard, move || {
                span.in_scope(|| materialize(&workspace, &target, &creds, &bundles, &message))
            })
            .await?
        }
        .instrument(span)
        .await
    }
}

/// Clone, render, commit and push. Blocking.
///
/// The clone under `workspace` is removed once the flow succeeds and kept
/// for inspection when a later stage fails.
pub fn materialize(
    workspace: &Path,
    target: &GitTarget,
    creds: &RepoCreds,
    bundles: &[Bundle],
    message: &str,
) -> Result<Outcome, ProfileError> {
    let checkout = git::clone_repo_in(workspace, &target.repo_url, &target.repo_branch, creds)
        .map_err(ProfileError::Clone)?;
    match render_and_push(&checkout, target, bundles, message) {
        Ok(outcome) => Ok(outcome),
        Err(error) => {
            let workdir = checkout.keep();
            tracing::warn!(workdir = %workdir.display(), %error, "keeping working directory");
            Err(error)
        }
    }
}

fn render_and_push(
    checkout: &Checkout,
    target: &GitTarget,
    bundles: &[Bundle],
    message: &str,
) -> Result<Outcome, ProfileError> {
    let tree = checkout.worktree().map_err(ProfileError::Worktree)?;

    manifests::copy_manifests(&tree, PROFILE_CHART, ".", Path::new(&target.repo_path))
        .map_err(ProfileError::CopyManifests)?;
    let templates_path = Path::new(&target.repo_path).join("templates");
    manifests::process_bundles(
        &tree,
        CLUSTER_NAME_VALUE,
        &target.repo_url,
        &target.repo_path,
        &templates_path,
        bundles,
    )
    .map_err(ProfileError::ProcessBundles)?;

    let changed = checkout
        .commit_changes(&tree, message)
        .map_err(ProfileError::Commit)?;
    if !changed {
        tracing::info!("no changed files, skipping commit & push");
        return Ok(Outcome::Unchanged);
    }
    checkout
        .push(DEFAULT_REMOTE)
        .map_err(ProfileError::Push)?;
    tracing::info!("successfully pushed working tree");
    Ok(Outcome::Pushed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProfileSpec;
    use std::time::Duration;

    fn profile(repo_url: Option<&str>) -> Profile {
        Profile::new(
            "p1",
            ProfileSpec {
                description: String::new(),
                bundles: vec![],
                repo_url: repo_url.map(str::to_string),
                repo_path: Some("profiles/p1".to_string()),
                repo_branch: None,
            },
        )
    }

    #[test]
    fn target_from_profile_defaults_branch() {
        let target = GitTarget::from_profile(&profile(Some("https://example/p.git"))).unwrap();
        assert_eq!(target.repo_branch, "main");
        assert_eq!(target.repo_path, "profiles/p1");
        assert!(matches!(
            GitTarget::from_profile(&profile(None)),
            Err(ProfileError::MissingTarget(_))
        ));
    }

    #[tokio::test]
    async fn same_repository_is_serialized() {
        let locks = RepoLocks::default();
        let held = locks.lock("https://example/p.git", "main").await;

        let contender = locks.clone();
        let waiting = tokio::spawn(async move {
            let _guard = contender.lock("https://example/p.git", "main").await;
        });
        let other_branch = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock("https://example/p.git", "dev"),
        )
        .await;
        assert!(other_branch.is_ok());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        drop(held);
        waiting.await.unwrap();
    }

    #[tokio::test]
    async fn lock_outlives_a_cancelled_caller() {
        let locks = RepoLocks::default();
        let guard = locks.lock("https://example/p.git", "main").await;
        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = running.clone();
        let handle = spawn_locked(guard, move || {
            std::thread::sleep(Duration::from_millis(300));
            flag.store(false, std::sync::atomic::Ordering::SeqCst);
        });

        // the caller gives up; the blocking work keeps going
        let cancelled = tokio::time::timeout(Duration::from_millis(50), handle).await;
        assert!(cancelled.is_err());
        let contender = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock("https://example/p.git", "main"),
        )
        .await;
        assert!(contender.is_err());
        assert!(running.load(std::sync::atomic::Ordering::SeqCst));

        let _guard = locks.lock("https://example/p.git", "main").await;
        assert!(!running.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn released_locks_are_pruned() {
        let locks = RepoLocks::default();
        drop(locks.lock("https://example/a.git", "main").await);
        let held = locks.lock("https://example/b.git", "main").await;
        drop(locks.lock("https://example/c.git", "main").await);
        let keys: Vec<String> = {
            let map = locks.locks.lock().unwrap();
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            keys
        };
        assert_eq!(
            keys,
            vec![
                "https://example/b.git#main".to_string(),
                "https://example/c.git#main".to_string(),
            ]
        );
        drop(held);
    }
}
