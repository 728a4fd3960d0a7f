use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use arlon::argocd::KubeDeliveryEngine;
use arlon::bundle::KubeBundleSource;
use arlon::profile::{GitTarget, Outcome, ProfileMaterializer};
use arlon::repoctx::{self, RepoCtx, RepoCtxCfg};
use arlon::types::Profile;
use clap::{Args, Parser, Subcommand};
use kube::api::{Api, DeleteParams};
use kube::Client;
use tracing_subscriber::EnvFilter;

/// arlon command line
#[derive(Parser)]
#[command(name = "arlon", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage local git repository contexts.
    #[command(subcommand)]
    Gitrepo(GitrepoCommand),

    /// Manage profiles.
    #[command(subcommand)]
    Profile(ProfileCommand),
}

#[derive(Subcommand)]
enum GitrepoCommand {
    /// Register a repository under an alias.
    Register {
        url: String,
        #[arg(long, default_value = repoctx::DEFAULT_ALIAS)]
        alias: String,
        #[command(flatten)]
        file: RepoCtxFile,
    },
    /// Unregister a previously registered repository.
    Unregister {
        alias: String,
        #[command(flatten)]
        file: RepoCtxFile,
    },
}

#[derive(Args)]
struct RepoCtxFile {
    /// Repository context file, defaults to ~/.config/arlon/repoctx
    #[arg(long)]
    config: Option<PathBuf>,
}

impl RepoCtxFile {
    fn path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => Ok(repoctx::default_path()?),
        }
    }
}

#[derive(Subcommand)]
enum ProfileCommand {
    /// Delete a profile.
    Delete {
        name: String,
        /// The arlon namespace
        #[arg(long, default_value = "arlon")]
        ns: String,
    },
    /// Render a profile's bundles into its git repository and push them.
    Push {
        name: String,
        /// The arlon namespace
        #[arg(long, default_value = "arlon")]
        ns: String,
        /// The Argo CD namespace
        #[arg(long, default_value = "argocd")]
        argocd_ns: String,
        /// Overrides the repository recorded on the profile.
        #[arg(long)]
        repo_url: Option<String>,
        #[arg(long)]
        repo_path: Option<String>,
        #[arg(long)]
        repo_branch: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(message) => {
            println!("{}", message);
            ExitCode::SUCCESS
        }
        Err(error) => {
            println!("error: {:#}", error);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<String> {
    match cli.command {
        Commands::Gitrepo(GitrepoCommand::Register { url, alias, file }) => {
            let path = file.path()?;
            let mut cfg = repoctx::load(&path)?.unwrap_or_default();
            cfg.register(RepoCtx {
                url,
                alias: alias.clone(),
            })?;
            repoctx::save(&path, &cfg)?;
            Ok(format!("Repository {} registered", alias))
        }
        Commands::Gitrepo(GitrepoCommand::Unregister { alias, file }) => {
            let path = file.path()?;
            let mut cfg: RepoCtxCfg = match repoctx::load(&path)? {
                Some(cfg) => cfg,
                None => return Ok("no repositories registered".to_string()),
            };
            if !cfg.unregister(&alias) {
                return Ok(format!("Repository {} is not registered", alias));
            }
            repoctx::save(&path, &cfg)?;
            Ok(format!("Repository {} deleted", alias))
        }
        Commands::Profile(ProfileCommand::Delete { name, ns }) => {
            let client = Client::try_default()
                .await
                .context("failed to get k8s client config")?;
            Api::<Profile>::namespaced(client, &ns)
                .delete(&name, &DeleteParams::default())
                .await
                .with_context(|| format!("failed to delete profile {}", name))?;
            Ok(format!("Profile {} deleted", name))
        }
        Commands::Profile(ProfileCommand::Push {
            name,
            ns,
            argocd_ns,
            repo_url,
            repo_path,
            repo_branch,
        }) => {
            let client = Client::try_default()
                .await
                .context("failed to get k8s client config")?;
            let mut profile = Api::<Profile>::namespaced(client.clone(), &ns)
                .get(&name)
                .await
                .with_context(|| format!("failed to get profile {}", name))?;
            profile.spec.repo_url = repo_url.or(profile.spec.repo_url);
            profile.spec.repo_path = repo_path.or(profile.spec.repo_path);
            profile.spec.repo_branch = repo_branch.or(profile.spec.repo_branch);
            let target = GitTarget::from_profile(&profile)?;

            let materializer = ProfileMaterializer::new(
                Arc::new(KubeBundleSource::new(client.clone(), &ns)),
                Arc::new(KubeDeliveryEngine::new(client, &argocd_ns)),
            );
            match materializer.create_in_git(&profile, &target).await? {
                Outcome::Unchanged => Ok(format!("Profile {} is up to date", name)),
                Outcome::Pushed => Ok(format!(
                    "Profile {} pushed to {} ({})",
                    name, target.repo_url, target.repo_branch
                )),
            }
        }
    }
}
