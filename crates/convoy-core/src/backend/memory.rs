//! Map-backed storage for tests and ephemeral stores.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{Change, DocumentBackend};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored paths.
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentBackend for MemoryBackend {
    fn read(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("Memory backend lock poisoned"))?;
        Ok(entries.get(path).cloned())
    }

    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("Memory backend lock poisoned"))?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, _)| path.clone())
            .collect())
    }

    fn write_batch(&self, _message: &str, changes: &[Change]) -> anyhow::Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("Memory backend lock poisoned"))?;
        for change in changes {
            match &change.data {
                Some(data) => {
                    entries.insert(change.path.clone(), data.clone());
                }
                None => {
                    entries.remove(&change.path);
                }
            }
        }
        Ok(())
    }
}
