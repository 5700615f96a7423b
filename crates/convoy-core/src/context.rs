//! Engine context for dependency wiring.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ConvoyConfig, default_config_path, load_config};
use crate::package::FunctionRunner;
use crate::release::ReleaseTracker;
use crate::store::RefStore;
use crate::telemetry::Tracer;
use crate::worker::{GitWorktrees, Worker, WorktreeProvider};

/// Opened stores plus the configuration they came from.
///
/// Frontends create this once and build trackers and workers from it. Backends
/// are opened eagerly so misconfiguration surfaces at startup.
#[derive(Debug, Clone)]
pub struct EngineContext {
    config_path: Option<PathBuf>,
    config: ConvoyConfig,
    intent: RefStore,
    state: RefStore,
}

impl EngineContext {
    /// Open the backends named by `config`.
    pub fn new(config: ConvoyConfig) -> anyhow::Result<Self> {
        let intent = RefStore::new(config.intent.open()?, Tracer::new("intent"));
        let state = RefStore::new(config.state.open()?, Tracer::new("state"));
        Ok(Self {
            config_path: None,
            config,
            intent,
            state,
        })
    }

    /// Load the config at `path` (or the default location) and open it.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };
        let mut context = Self::new(load_config(&path)?)?;
        context.config_path = Some(path);
        Ok(context)
    }

    pub fn config(&self) -> &ConvoyConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn intent(&self) -> &RefStore {
        &self.intent
    }

    pub fn state(&self) -> &RefStore {
        &self.state
    }

    /// Get a ReleaseTracker that also mirrors deploys into Intent.
    pub fn release_tracker(&self, runner: Arc<dyn FunctionRunner>) -> ReleaseTracker {
        ReleaseTracker::new(self.state.clone(), runner, Tracer::new("release"))
            .with_intent(self.intent.clone())
    }

    /// Get the worktree provider, if any repos are configured.
    pub fn worktrees(&self) -> Option<Arc<dyn WorktreeProvider>> {
        let config = self.config.worktrees.as_ref()?;
        Some(Arc::new(GitWorktrees::new(
            config.repos.clone(),
            config.scratch_dir.clone(),
        )))
    }

    /// Get a Worker wired to both stores.
    pub fn worker(&self, runner: Arc<dyn FunctionRunner>) -> Worker {
        let worker = Worker::new(
            self.intent.clone(),
            self.release_tracker(runner),
            Tracer::new("worker"),
        );
        match self.worktrees() {
            Some(worktrees) => worker.with_worktrees(worktrees),
            None => worker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::refs::Ref;
    use crate::store::RefAccess;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn filesystem_stores_are_created_and_shared() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let config = ConvoyConfig {
            intent: BackendConfig::Filesystem {
                root: tmp.path().join("intent"),
            },
            state: BackendConfig::Filesystem {
                root: tmp.path().join("state"),
            },
            worktrees: None,
        };
        let context = EngineContext::new(config).expect("context should open");
        let reference = Ref::parse("repo/-/pkg/+/custom/x").expect("ref should parse");
        context
            .intent()
            .set(&reference, "custom", &json!(1))
            .expect("set should succeed");

        let reopened = EngineContext::new(context.config().clone()).expect("context should open");
        assert_eq!(reopened.intent().get(&reference).expect("get should succeed"), json!(1));
        assert!(!reopened.state().exists(&reference).expect("exists should succeed"));
        assert!(reopened.worktrees().is_none());
    }
}
