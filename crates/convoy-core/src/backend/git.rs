//! Storage in a git branch: every batch becomes one commit.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use git2::build::TreeUpdateBuilder;
use git2::{
    FileMode, ObjectType, PushOptions, RemoteCallbacks, Repository, Signature, Tree,
    TreeWalkMode, TreeWalkResult,
};
use tracing::{debug, info};

use super::{Change, DocumentBackend, ensure_relative_path};

pub const DEFAULT_BRANCH: &str = "main";

pub struct GitBackend {
    repo: Mutex<Repository>,
    path: PathBuf,
    branch: String,
    remote: Option<String>,
}

impl fmt::Debug for GitBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitBackend")
            .field("path", &self.path)
            .field("branch", &self.branch)
            .field("remote", &self.remote)
            .finish()
    }
}

impl GitBackend {
    /// Open the repository at `path`, creating a bare one if nothing is there.
    pub fn open(
        path: impl AsRef<Path>,
        branch: impl Into<String>,
        remote: Option<String>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let repo = match Repository::open(&path) {
            Ok(repo) => repo,
            Err(err) if err.code() == git2::ErrorCode::NotFound => {
                std::fs::create_dir_all(&path).with_context(|| {
                    format!("Failed to create repository directory: {}", path.display())
                })?;
                Repository::init_bare(&path).with_context(|| {
                    format!("Failed to initialize repository: {}", path.display())
                })?
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to open repository: {}", path.display()));
            }
        };
        Ok(Self {
            repo: Mutex::new(repo),
            path,
            branch: branch.into(),
            remote,
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Repository>> {
        self.repo
            .lock()
            .map_err(|_| anyhow::anyhow!("Git backend lock poisoned"))
    }

    /// Tree at the branch head, or `None` before the first commit.
    fn head_tree<'r>(&self, repo: &'r Repository) -> anyhow::Result<Option<Tree<'r>>> {
        match repo.find_reference(&self.branch_ref()) {
            Ok(reference) => {
                let commit = reference
                    .peel_to_commit()
                    .with_context(|| format!("Branch '{}' does not point at a commit", self.branch))?;
                Ok(Some(commit.tree()?))
            }
            Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read branch '{}'", self.branch)),
        }
    }

    /// Fetch the remote branch and move the local branch to it.
    pub fn pull(&self) -> anyhow::Result<()> {
        let Some(remote_name) = self.remote.as_deref() else {
            return Ok(());
        };
        let repo = self.lock()?;
        let mut remote = repo
            .find_remote(remote_name)
            .with_context(|| format!("Failed to find remote '{}'", remote_name))?;
        let tracking = format!("refs/remotes/{}/{}", remote_name, self.branch);
        let refspec = format!("+{}:{}", self.branch_ref(), tracking);
        remote
            .fetch(&[refspec.as_str()], None, None)
            .with_context(|| format!("Failed to fetch from '{}'", remote_name))?;

        let target = repo
            .find_reference(&tracking)
            .and_then(|reference| reference.peel_to_commit())
            .with_context(|| format!("Remote branch '{}' not found", tracking))?;
        repo.reference(&self.branch_ref(), target.id(), true, "convoy pull")
            .with_context(|| format!("Failed to update branch '{}'", self.branch))?;
        info!(branch = %self.branch, commit = %target.id(), "pulled state branch");
        Ok(())
    }

    fn push(&self, repo: &Repository) -> anyhow::Result<()> {
        let Some(remote_name) = self.remote.as_deref() else {
            return Ok(());
        };
        let mut remote = repo
            .find_remote(remote_name)
            .with_context(|| format!("Failed to find remote '{}'", remote_name))?;

        let rejection: RefCell<Option<String>> = RefCell::new(None);
        let mut callbacks = RemoteCallbacks::new();
        callbacks.push_update_reference(|refname, status| {
            if let Some(message) = status {
                *rejection.borrow_mut() = Some(format!("{}: {}", refname, message));
            }
            Ok(())
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);

        let refspec = format!("{}:{}", self.branch_ref(), self.branch_ref());
        remote
            .push(&[refspec.as_str()], Some(&mut options))
            .with_context(|| format!("Failed to push to '{}'", remote_name))?;
        drop(options);

        if let Some(reason) = rejection.into_inner() {
            anyhow::bail!("Push to '{}' was rejected ({}); pull and retry", remote_name, reason);
        }
        Ok(())
    }
}

impl DocumentBackend for GitBackend {
    fn read(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        ensure_relative_path(path)?;
        let repo = self.lock()?;
        let Some(tree) = self.head_tree(&repo)? else {
            return Ok(None);
        };
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(err) if err.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("Failed to look up {}", path)),
        };
        if entry.kind() != Some(ObjectType::Blob) {
            return Ok(None);
        }
        let blob = repo
            .find_blob(entry.id())
            .with_context(|| format!("Failed to read blob for {}", path))?;
        Ok(Some(blob.content().to_vec()))
    }

    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let repo = self.lock()?;
        let Some(tree) = self.head_tree(&repo)? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            let Some(name) = entry.name() else {
                return TreeWalkResult::Skip;
            };
            let full = format!("{}{}", root, name);
            if entry.kind() == Some(ObjectType::Tree) {
                // Only descend into directories that can still reach the prefix.
                let dir = format!("{}/", full);
                if dir.starts_with(prefix) || prefix.starts_with(&dir) {
                    return TreeWalkResult::Ok;
                }
                return TreeWalkResult::Skip;
            }
            if full.starts_with(prefix) {
                out.push(full);
            }
            TreeWalkResult::Ok
        })
        .context("Failed to walk state tree")?;
        out.sort();
        Ok(out)
    }

    fn write_batch(&self, message: &str, changes: &[Change]) -> anyhow::Result<()> {
        // Last write to a path wins.
        let mut deduped: BTreeMap<&str, Option<&[u8]>> = BTreeMap::new();
        for change in changes {
            ensure_relative_path(&change.path)?;
            deduped.insert(change.path.as_str(), change.data.as_deref());
        }

        let repo = self.lock()?;
        let head = match repo.find_reference(&self.branch_ref()) {
            Ok(reference) => Some(reference.peel_to_commit()?),
            Err(err) if err.code() == git2::ErrorCode::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        let baseline = match &head {
            Some(commit) => commit.tree()?,
            None => {
                let empty = repo.treebuilder(None)?.write()?;
                repo.find_tree(empty)?
            }
        };

        let mut builder = TreeUpdateBuilder::new();
        for (path, data) in &deduped {
            match data {
                Some(bytes) => {
                    let oid = repo
                        .blob(bytes)
                        .with_context(|| format!("Failed to write blob for {}", path))?;
                    builder.upsert(*path, oid, FileMode::Blob);
                }
                None => {
                    // libgit2 rejects removing entries that are not there.
                    if baseline.get_path(Path::new(path)).is_ok() {
                        builder.remove(*path);
                    }
                }
            }
        }
        let tree_id = builder
            .create_updated(&repo, &baseline)
            .context("Failed to build updated tree")?;
        if tree_id == baseline.id() {
            debug!(branch = %self.branch, message, "no changes to commit");
            return Ok(());
        }
        let tree = repo.find_tree(tree_id)?;

        let signature = repo
            .signature()
            .or_else(|_| Signature::now("convoy", "convoy@localhost"))
            .context("Failed to build commit signature")?;
        let parents: Vec<&git2::Commit<'_>> = head.iter().collect();
        let commit = repo
            .commit(
                Some(&self.branch_ref()),
                &signature,
                &signature,
                message,
                &tree,
                &parents,
            )
            .with_context(|| format!("Failed to commit to branch '{}'", self.branch))?;
        debug!(branch = %self.branch, %commit, changes = deduped.len(), message, "committed");

        self.push(&repo)
    }
}
