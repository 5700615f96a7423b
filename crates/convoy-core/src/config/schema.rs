//! Configuration schema for convoy.toml

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::{
    DEFAULT_BRANCH, DocumentBackend, FilesystemBackend, GitBackend, MemoryBackend,
    ObjectStoreBackend,
};

/// Root configuration structure for convoy.toml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvoyConfig {
    /// Where desired state is declared
    #[serde(default)]
    pub intent: BackendConfig,

    /// Where releases, runs and converged state live
    #[serde(default)]
    pub state: BackendConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktrees: Option<WorktreeConfig>,
}

/// Storage backend of one store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Filesystem {
        root: PathBuf,
    },
    Git {
        path: PathBuf,
        #[serde(default = "default_branch")]
        branch: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote: Option<String>,
    },
    /// `s3://bucket/prefix`; credentials come from `AWS_*` variables
    S3 {
        url: Url,
    },
    /// Not persisted; for tests and dry runs
    #[default]
    Memory,
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

impl BackendConfig {
    /// Construct the configured backend.
    pub fn open(&self) -> anyhow::Result<Arc<dyn DocumentBackend>> {
        Ok(match self {
            Self::Filesystem { root } => {
                std::fs::create_dir_all(root).with_context(|| {
                    format!("Failed to create store directory: {}", root.display())
                })?;
                Arc::new(FilesystemBackend::new(root.clone()))
            }
            Self::Git {
                path,
                branch,
                remote,
            } => Arc::new(GitBackend::open(path, branch.clone(), remote.clone())?),
            Self::S3 { url } => Arc::new(ObjectStoreBackend::with_url(url)?),
            Self::Memory => Arc::new(MemoryBackend::new()),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            Self::Filesystem { root } if root.as_os_str().is_empty() => {
                anyhow::bail!("Filesystem backend needs a root directory")
            }
            Self::Git { path, branch, .. } => {
                if path.as_os_str().is_empty() {
                    anyhow::bail!("Git backend needs a repository path");
                }
                if branch.is_empty() || branch.contains(char::is_whitespace) {
                    anyhow::bail!("Invalid git branch '{}'", branch);
                }
                Ok(())
            }
            Self::S3 { url } if url.scheme() != "s3" => {
                anyhow::bail!("S3 backend URL must use the s3:// scheme: {}", url)
            }
            _ => Ok(()),
        }
    }
}

/// Local clones used to check out release commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeConfig {
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Repo name (as in refs) to local clone
    #[serde(default)]
    pub repos: BTreeMap<String, PathBuf>,
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("convoy-worktrees")
}

impl ConvoyConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.intent
            .validate()
            .context("Invalid intent backend configuration")?;
        self.state
            .validate()
            .context("Invalid state backend configuration")?;
        if let Some(worktrees) = &self.worktrees {
            for (repo, path) in &worktrees.repos {
                if repo.is_empty() || path.as_os_str().is_empty() {
                    anyhow::bail!("Invalid worktree repo entry '{}'", repo);
                }
            }
        }
        Ok(())
    }
}
