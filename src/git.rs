//! Version-control adapter.
//!
//! Every operation works on a freshly cloned, exclusively owned checkout, so
//! nothing here locks. Callers serialize access to a shared remote branch.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use git2::build::RepoBuilder;
use git2::{
    Cred, CredentialType, ErrorCode, FetchOptions, IndexAddOption, PushOptions, RemoteCallbacks,
    Repository, Signature, StatusOptions,
};
use tempfile::TempDir;
use thiserror::Error;

pub const DEFAULT_REMOTE: &str = "origin";

const COMMITTER_NAME: &str = "arlon automation";
const COMMITTER_EMAIL: &str = "arlon@arlon.io";
const MAX_AUTH_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to create working directory: {0}")]
    TempDir(#[source] io::Error),
    #[error("failed to clone {url}: {source}")]
    Clone {
        url: String,
        #[source]
        source: git2::Error,
    },
    #[error("repository has no working tree")]
    Bare,
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    #[error("remote rejected {0}")]
    PushRejected(String),
}

/// Authentication material for a git remote.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RepoCreds {
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_private_key: Option<String>,
}

impl fmt::Debug for RepoCreds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoCreds")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field(
                "ssh_private_key",
                &self.ssh_private_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

pub(crate) fn remote_callbacks(creds: &RepoCreds) -> RemoteCallbacks<'_> {
    let mut attempts = 0;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, allowed_types| {
        attempts += 1;
        if attempts > MAX_AUTH_ATTEMPTS {
            return Err(git2::Error::from_str("authentication failed"));
        }
        if allowed_types.contains(CredentialType::SSH_KEY) {
            if let Some(key) = creds.ssh_private_key.as_deref() {
                return Cred::ssh_key_from_memory(
                    username_from_url.unwrap_or("git"),
                    None,
                    key,
                    None,
                );
            }
        }
        if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) {
            if let (Some(username), Some(password)) =
                (creds.username.as_deref(), creds.password.as_deref())
            {
                return Cred::userpass_plaintext(username, password);
            }
        }
        Cred::default()
    });
    callbacks
}

/// A mutable view of a checkout's files.
#[derive(Clone, Debug)]
pub struct WorkingTree {
    root: PathBuf,
}

impl WorkingTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkingTree { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `contents` at `relative`, creating parent directories and
    /// overwriting any existing file.
    pub fn write_file(&self, relative: impl AsRef<Path>, contents: &[u8]) -> io::Result<()> {
        let relative = relative.as_ref();
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path {} escapes the working tree", relative.display()),
            ));
        }
        let target = self.root.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, contents)
    }
}

/// A cloned repository with the credentials used to clone it.
///
/// The clone is removed when the checkout is dropped, unless it is kept with
/// [`Checkout::keep`].
pub struct Checkout {
    repo: Repository,
    dir: TempDir,
    branch: String,
    creds: RepoCreds,
}

/// Clones `url` at `branch` into a new temporary directory.
pub fn clone_repo(url: &str, branch: &str, creds: &RepoCreds) -> Result<Checkout, GitError> {
    clone_repo_in(&std::env::temp_dir(), url, branch, creds)
}

/// Clones `url` at `branch` into a new directory under `parent`.
pub fn clone_repo_in(
    parent: &Path,
    url: &str,
    branch: &str,
    creds: &RepoCreds,
) -> Result<Checkout, GitError> {
    let dir = tempfile::Builder::new()
        .prefix("arlon-")
        .tempdir_in(parent)
        .map_err(GitError::TempDir)?;
    let workdir = dir.path();

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(remote_callbacks(creds));

    let mut builder = RepoBuilder::new();
    builder.branch(branch);
    builder.fetch_options(fetch_options);
    let repo = builder
        .clone(url, workdir)
        .map_err(|source| GitError::Clone {
            url: url.to_string(),
            source,
        })?;

    tracing::debug!(%url, %branch, workdir = %workdir.display(), "cloned repository");

    Ok(Checkout {
        repo,
        dir,
        branch: branch.to_string(),
        creds: creds.clone(),
    })
}

impl Checkout {
    pub fn workdir(&self) -> &Path {
        self.dir.path()
    }

    /// Leaves the clone on disk and returns its location.
    pub fn keep(self) -> PathBuf {
        let Checkout { repo, dir, .. } = self;
        drop(repo);
        dir.into_path()
    }

    pub fn worktree(&self) -> Result<WorkingTree, GitError> {
        let root = self.repo.workdir().ok_or(GitError::Bare)?;
        Ok(WorkingTree::new(root))
    }

    /// Stages every change in `tree` and commits it. Returns false without
    /// committing when nothing differs from the last commit.
    pub fn commit_changes(&self, tree: &WorkingTree, message: &str) -> Result<bool, GitError> {
        let mut status_options = StatusOptions::new();
        status_options
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let changed_files = self.repo.statuses(Some(&mut status_options))?.len();
        if changed_files == 0 {
            return Ok(false);
        }

        let mut index = self.repo.index()?;
        index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"], None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let git_tree = self.repo.find_tree(tree_id)?;

        let parent = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(error) if error.code() == ErrorCode::UnbornBranch => None,
            Err(error) => return Err(error.into()),
        };
        let parents: Vec<_> = parent.iter().collect();

        let signature = Signature::now(COMMITTER_NAME, COMMITTER_EMAIL)?;
        let commit = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &git_tree,
            &parents,
        )?;
        tracing::info!(
            %commit,
            changed_files,
            workdir = %tree.root().display(),
            "committed changes"
        );
        Ok(true)
    }

    /// Pushes the checked out branch to `remote_name`.
    pub fn push(&self, remote_name: &str) -> Result<(), GitError> {
        let mut remote = self.repo.find_remote(remote_name)?;
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", self.branch);
        let mut rejected = None;
        {
            let mut callbacks = remote_callbacks(&self.creds);
            callbacks.push_update_reference(|reference, status| {
                if let Some(message) = status {
                    rejected = Some(format!("{}: {}", reference, message));
                }
                Ok(())
            });
            let mut push_options = PushOptions::new();
            push_options.remote_callbacks(callbacks);
            remote.push(&[refspec.as_str()], Some(&mut push_options))?;
        }
        match rejected {
            Some(reason) => Err(GitError::PushRejected(reason)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_file_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let tree = WorkingTree::new(dir.path());
        tree.write_file("a/b/c.yaml", b"x: 1\n").unwrap();
        tree.write_file("a/b/c.yaml", b"x: 2\n").unwrap();
        let written = fs::read_to_string(dir.path().join("a/b/c.yaml")).unwrap();
        assert_eq!(written, "x: 2\n");
    }

    #[test]
    fn write_file_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let tree = WorkingTree::new(dir.path());
        let error = tree.write_file("../outside.yaml", b"").unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
        assert!(tree.write_file("/etc/passwd", b"").is_err());
    }

    #[test]
    fn creds_debug_redacts_secrets() {
        let creds = RepoCreds {
            username: Some("bob".to_string()),
            password: Some("hunter2".to_string()),
            ssh_private_key: None,
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("bob"));
        assert!(!rendered.contains("hunter2"));
    }
}
