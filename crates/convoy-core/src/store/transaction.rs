use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{RefAccess, RefStore};
use crate::backend::{MatchRequest, SetRequest, StorageObject};
use crate::telemetry::Tracer;

/// Buffered write session over a [`RefStore`].
///
/// Reads and matches through the transaction see its own pending writes; other
/// handles see nothing until [`commit`](Self::commit). Dropping the transaction
/// discards the buffer.
#[derive(Debug)]
pub struct Transaction<'s> {
    store: &'s RefStore,
    pending: RefCell<BTreeMap<String, Option<StorageObject>>>,
}

impl<'s> Transaction<'s> {
    pub(super) fn new(store: &'s RefStore) -> Self {
        Self {
            store,
            pending: RefCell::new(BTreeMap::new()),
        }
    }

    /// Number of distinct paths written so far.
    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    /// Flush every buffered write as one backend batch (one commit on git).
    pub fn commit(self, message: &str) -> anyhow::Result<()> {
        let pending = self.pending.into_inner();
        if pending.is_empty() {
            debug!(message, "empty transaction");
            return Ok(());
        }
        let requests: Vec<SetRequest> = pending
            .into_iter()
            .map(|(path, object)| SetRequest { path, object })
            .collect();
        debug!(message, writes = requests.len(), "commit transaction");
        self.store.store(message, requests)
    }
}

impl RefAccess for Transaction<'_> {
    fn load(&self, path: &str) -> anyhow::Result<Option<StorageObject>> {
        if let Some(buffered) = self.pending.borrow().get(path) {
            return Ok(buffered.clone());
        }
        self.store.load(path)
    }

    fn store(&self, _message: &str, requests: Vec<SetRequest>) -> anyhow::Result<()> {
        let mut pending = self.pending.borrow_mut();
        for request in requests {
            pending.insert(request.path, request.object);
        }
        Ok(())
    }

    fn find(&self, request: &MatchRequest) -> anyhow::Result<Vec<String>> {
        let mut paths: BTreeSet<String> = self.store.find(request)?.into_iter().collect();
        for (path, object) in self.pending.borrow().iter() {
            if !request.matches(path) {
                continue;
            }
            match object {
                Some(_) => {
                    paths.insert(path.clone());
                }
                None => {
                    paths.remove(path);
                }
            }
        }
        Ok(paths.into_iter().collect())
    }

    fn tracer(&self) -> &Tracer {
        self.store.tracer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::Ref;
    use crate::status::Status;
    use serde_json::json;

    fn r(s: &str) -> Ref {
        Ref::parse(s).expect("ref should parse")
    }

    #[test]
    fn reads_see_buffered_writes_before_commit() {
        let store = RefStore::in_memory();
        let other = store.clone();
        let doc = r("repo/-/pkg/+/custom/x");

        let tx = store.start_transaction();
        tx.set(&doc, "custom", &json!("a")).expect("set should succeed");
        tx.set_status(&doc, Status::Pending).expect("set_status should succeed");

        assert_eq!(tx.get(&doc).expect("get should succeed"), json!("a"));
        assert_eq!(tx.match_refs("repo/-/pkg/+/custom/*").expect("match should succeed"), vec![doc.clone()]);
        assert!(!other.exists(&doc).expect("exists should succeed"));

        tx.commit("write x").expect("commit should succeed");
        assert_eq!(other.get(&doc).expect("get should succeed"), json!("a"));
        assert_eq!(other.status(&doc).expect("status should succeed"), Some(Status::Pending));
    }

    #[test]
    fn buffered_deletes_hide_stored_paths() {
        let store = RefStore::in_memory();
        let doc = r("repo/-/pkg/+/custom/x");
        store.set(&doc, "custom", &json!(1)).expect("set should succeed");

        let tx = store.start_transaction();
        tx.delete(&doc).expect("delete should succeed");
        assert!(!tx.exists(&doc).expect("exists should succeed"));
        assert!(tx.match_refs("**").expect("match should succeed").is_empty());
        drop(tx);

        // Dropped without commit: nothing changed.
        assert!(store.exists(&doc).expect("exists should succeed"));
    }

    #[test]
    fn last_write_wins_within_a_transaction() {
        let store = RefStore::in_memory();
        let doc = r("repo/-/pkg/+/custom/x");
        let tx = store.start_transaction();
        tx.set(&doc, "custom", &json!(1)).expect("set should succeed");
        tx.set(&doc, "custom", &json!(2)).expect("set should succeed");
        assert_eq!(tx.len(), 1);
        tx.commit("twice").expect("commit should succeed");
        assert_eq!(store.get(&doc).expect("get should succeed"), json!(2));
    }
}
