//! Directory tree storage: one file per path.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use super::{Change, DocumentBackend, ensure_relative_path};

/// Suffix of in-flight temp files; never reported by `list`.
const TMP_SUFFIX: &str = ".convoy-tmp";

#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> anyhow::Result<PathBuf> {
        ensure_relative_path(path)?;
        Ok(self.root.join(path))
    }

    /// Write atomically (tmp + rename).
    fn write_file(&self, path: &str, data: &[u8]) -> anyhow::Result<()> {
        let full = self.full_path(path)?;
        let parent = full
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Storage path has no parent: {}", full.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

        let file_name = full
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Storage path has no file name: {}", full.display()))?
            .to_string_lossy()
            .to_string();
        let tmp = parent.join(format!("{}.{}{}", file_name, std::process::id(), TMP_SUFFIX));
        fs::write(&tmp, data)
            .with_context(|| format!("Failed to write temp file: {}", tmp.display()))?;
        fs::rename(&tmp, &full)
            .with_context(|| format!("Failed to replace file: {}", full.display()))?;
        Ok(())
    }

    fn remove_file(&self, path: &str) -> anyhow::Result<()> {
        let full = self.full_path(path)?;
        match fs::remove_file(&full) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to remove file: {}", full.display()));
            }
        }
        self.prune_empty_dirs(&full);
        Ok(())
    }

    /// Remove now-empty parent directories up to (not including) the root.
    fn prune_empty_dirs(&self, removed: &Path) {
        let mut dir = removed.parent();
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
    }

    fn walk(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> anyhow::Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read directory: {}", dir.display()));
            }
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let child_rel = if rel.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", rel, name)
            };
            if entry.file_type()?.is_dir() {
                self.walk(&entry.path(), &child_rel, out)?;
            } else if !name.ends_with(TMP_SUFFIX) {
                out.push(child_rel);
            }
        }
        Ok(())
    }
}

impl DocumentBackend for FilesystemBackend {
    fn read(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let full = self.full_path(path)?;
        match fs::read(&full) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read file: {}", full.display())),
        }
    }

    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        // Walk from the deepest directory the prefix names, then filter.
        let dir_rel = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_rel.is_empty() {
            self.root.clone()
        } else {
            self.full_path(dir_rel)?
        };
        let mut out = Vec::new();
        self.walk(&start, dir_rel, &mut out)?;
        out.retain(|path| path.starts_with(prefix));
        out.sort();
        Ok(out)
    }

    fn write_batch(&self, message: &str, changes: &[Change]) -> anyhow::Result<()> {
        debug!(root = %self.root.display(), changes = changes.len(), message, "filesystem write");
        for change in changes {
            match &change.data {
                Some(data) => self.write_file(&change.path, data)?,
                None => self.remove_file(&change.path)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_remove_round_trip() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let backend = FilesystemBackend::new(tmp.path());

        backend
            .write("refs/repo/-/pkg/+/custom/x/@object.json", b"{}")
            .expect("write should succeed");
        assert_eq!(
            backend
                .read("refs/repo/-/pkg/+/custom/x/@object.json")
                .expect("read should succeed"),
            Some(b"{}".to_vec())
        );

        backend
            .remove("refs/repo/-/pkg/+/custom/x/@object.json")
            .expect("remove should succeed");
        assert!(
            backend
                .read("refs/repo/-/pkg/+/custom/x/@object.json")
                .expect("read should succeed")
                .is_none()
        );
        // Empty directories are pruned back to the root.
        assert!(!tmp.path().join("refs").exists());
    }

    #[test]
    fn list_filters_by_partial_prefix() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let backend = FilesystemBackend::new(tmp.path());
        for path in [
            "refs/repo/-/pkg/@a/@object.json",
            "refs/repo/-/pkg/@b/@object.json",
            "refs/repo/-/pkg/+/@object.json",
        ] {
            backend.write(path, b"{}").expect("write should succeed");
        }

        let listed = backend.list("refs/repo/-/pkg/@").expect("list should succeed");
        assert_eq!(
            listed,
            vec![
                "refs/repo/-/pkg/@a/@object.json".to_string(),
                "refs/repo/-/pkg/@b/@object.json".to_string(),
            ]
        );
        assert!(backend.list("refs/nothing/").expect("list should succeed").is_empty());
    }

    #[test]
    fn rejects_escaping_paths() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let backend = FilesystemBackend::new(tmp.path());
        assert!(backend.write("../escape", b"x").is_err());
        assert!(backend.read("/etc/hostname").is_err());
    }
}
