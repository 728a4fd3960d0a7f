//! Named git repository contexts kept in a local JSON file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_ALIAS: &str = "default";
const REPO_CTX_FILE: &str = "repoctx";

#[derive(Debug, Error)]
pub enum RepoCtxError {
    #[error("cannot locate config directory: no home directory")]
    NoHome,
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("repository alias {0} is already registered")]
    DuplicateAlias(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RepoCtx {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub alias: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RepoCtxCfg {
    #[serde(default)]
    pub current: RepoCtx,
    #[serde(default)]
    pub repos: Vec<RepoCtx>,
}

/// `~/.config/arlon/repoctx`
pub fn default_path() -> Result<PathBuf, RepoCtxError> {
    let home = dirs::home_dir().ok_or(RepoCtxError::NoHome)?;
    Ok(home
        .join(".config")
        .join("arlon")
        .join(REPO_CTX_FILE))
}

/// Reads the contexts at `path`. `None` means the file is missing or empty.
pub fn load(path: &Path) -> Result<Option<RepoCtxCfg>, RepoCtxError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RepoCtxError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if content.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&content)?))
}

pub fn save(path: &Path, cfg: &RepoCtxCfg) -> Result<(), RepoCtxError> {
    let write_error = |source| RepoCtxError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    let data = serde_json::to_vec_pretty(cfg)?;
    fs::write(path, data).map_err(write_error)
}

impl RepoCtxCfg {
    /// Adds a context. The `default` alias also becomes the current context.
    pub fn register(&mut self, ctx: RepoCtx) -> Result<(), RepoCtxError> {
        if self.repos.iter().any(|repo| repo.alias == ctx.alias) {
            return Err(RepoCtxError::DuplicateAlias(ctx.alias));
        }
        if ctx.alias == DEFAULT_ALIAS {
            self.current = ctx.clone();
        }
        self.repos.push(ctx);
        Ok(())
    }

    /// Removes the context named `alias`, returning whether it existed.
    pub fn unregister(&mut self, alias: &str) -> bool {
        let position = match self.repos.iter().position(|repo| repo.alias == alias) {
            Some(position) => position,
            None => return false,
        };
        if alias == DEFAULT_ALIAS && self.current.alias == DEFAULT_ALIAS {
            self.current = RepoCtx::default();
        }
        self.repos.remove(position);
        true
    }
}
