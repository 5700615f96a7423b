//! Disposable git worktrees pinned to a release commit.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use tracing::{debug, warn};

/// Checkouts created by this process, for directory names.
static CHECKOUTS: AtomicU64 = AtomicU64::new(0);

/// Produces checkouts of `repo` at exactly `commit`.
pub trait WorktreeProvider: fmt::Debug + Send + Sync {
    fn checkout(&self, repo: &str, commit: &str) -> anyhow::Result<Worktree>;
}

/// A checked-out directory, removed when dropped.
#[derive(Debug)]
pub struct Worktree {
    path: PathBuf,
    /// Repository the worktree is registered with
    source: Option<PathBuf>,
}

impl Worktree {
    /// A plain directory that is only deleted on drop.
    pub fn unregistered(path: PathBuf) -> Self {
        Self { path, source: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Worktree {
    fn drop(&mut self) {
        if let Some(source) = &self.source
            && let Some(path) = self.path.to_str()
            && let Err(err) = run_git(Some(source), &["worktree", "remove", "--force", path])
        {
            warn!(path = %self.path.display(), error = %err, "failed to remove worktree");
        }
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Worktrees created from local clones, one per configured repo.
#[derive(Debug, Clone)]
pub struct GitWorktrees {
    repos: BTreeMap<String, PathBuf>,
    scratch_dir: PathBuf,
}

impl GitWorktrees {
    pub fn new(repos: BTreeMap<String, PathBuf>, scratch_dir: PathBuf) -> Self {
        Self { repos, scratch_dir }
    }

    fn source(&self, repo: &str) -> anyhow::Result<&Path> {
        self.repos
            .get(repo)
            .map(PathBuf::as_path)
            .ok_or_else(|| anyhow::anyhow!("No local clone configured for repo '{}'", repo))
    }

    /// Full SHA of `commit` in `source`, fetching it from origin when missing.
    fn resolve_commit(source: &Path, commit: &str) -> anyhow::Result<String> {
        let rev = format!("{}^{{commit}}", commit);
        match git_rev_parse(Some(source), &rev) {
            Ok(sha) => Ok(sha),
            Err(err) => {
                debug!(commit, error = %err, "commit not present locally, fetching");
                run_git(Some(source), &["fetch", "origin", commit])?;
                git_rev_parse(Some(source), &rev)
            }
        }
    }

    /// Fresh directory for a checkout of `sha`, named `<sha12>-<pid>-<n>`.
    fn worktree_dir(&self, sha: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.scratch_dir).with_context(|| {
            format!(
                "Failed to create worktree directory: {}",
                self.scratch_dir.display()
            )
        })?;
        let short = sha.get(..12).unwrap_or(sha);
        loop {
            let n = CHECKOUTS.fetch_add(1, Ordering::Relaxed);
            let candidate = self
                .scratch_dir
                .join(format!("{}-{}-{}", short, std::process::id(), n));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
    }
}

impl WorktreeProvider for GitWorktrees {
    fn checkout(&self, repo: &str, commit: &str) -> anyhow::Result<Worktree> {
        let source = self.source(repo)?;
        let sha = Self::resolve_commit(source, commit)
            .with_context(|| format!("Commit {} not found in {}", commit, repo))?;
        // Drop registrations whose directories are gone.
        run_git(Some(source), &["worktree", "prune"])?;
        let dir = self.worktree_dir(&sha)?;
        let dir_str = dir
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid worktree dir: {}", dir.display()))?;

        run_git(Some(source), &["worktree", "add", "--detach", dir_str, &sha])?;
        let worktree = Worktree {
            path: dir.clone(),
            source: Some(source.to_path_buf()),
        };

        let head = git_rev_parse(Some(&dir), "HEAD")?;
        if head != sha {
            anyhow::bail!(
                "Worktree for {} is at {} instead of {}",
                repo,
                head,
                sha
            );
        }
        debug!(repo, commit = %sha, path = %dir.display(), "created worktree");
        Ok(worktree)
    }
}

fn git_command(cwd: Option<&Path>, args: &[&str]) -> Command {
    let mut cmd = Command::new("git");
    cmd.args(args).env_remove("GIT_DIR").env_remove("GIT_WORK_TREE");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd
}

fn run_git(cwd: Option<&Path>, args: &[&str]) -> anyhow::Result<()> {
    let output = git_command(cwd, args)
        .output()
        .with_context(|| format!("Failed to run git {:?}", args))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("Git command failed {:?}: {}", args, stderr.trim());
    }
    Ok(())
}

fn git_rev_parse(cwd: Option<&Path>, rev: &str) -> anyhow::Result<String> {
    let output = git_command(cwd, &["rev-parse", "--verify", rev])
        .output()
        .with_context(|| format!("Failed to run git rev-parse {}", rev))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git rev-parse {} failed: {}", rev, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unknown_repo_is_an_error() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let worktrees = GitWorktrees::new(BTreeMap::new(), tmp.path().join("scratch"));
        let err = worktrees
            .checkout("github.com/acme/app", "abc")
            .expect_err("checkout should fail");
        assert!(err.to_string().contains("No local clone"));
    }

    #[test]
    fn unregistered_worktree_is_removed_on_drop() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let dir = tmp.path().join("wt");
        std::fs::create_dir_all(dir.join("nested")).expect("mkdir should succeed");
        drop(Worktree::unregistered(dir.clone()));
        assert!(!dir.exists());
    }
}
