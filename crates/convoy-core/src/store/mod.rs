//! Ref-addressed document store.
//!
//! [`RefAccess`] carries the whole ref API (content, links, status markers,
//! dependency indexes, glob queries) on top of three primitives. [`RefStore`]
//! implements them directly against a backend; a [`Transaction`] buffers writes
//! and overlays them on reads until it is committed as one backend batch.

mod layout;
mod transaction;

pub use layout::{
    OBJECT_FILE, dependants_path, dependencies_path, object_path, select_fragment,
    status_path, status_prefix,
};
pub use transaction::Transaction;

use std::slice;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::backend::pattern::split_directory_prefix;
use crate::backend::{DocumentBackend, Glob, MatchRequest, MemoryBackend, SetRequest, StorageObject};
use crate::error::{StoreError, is_not_found, not_found};
use crate::refs::Ref;
use crate::status::Status;
use crate::telemetry::Tracer;

/// Longest chain of links followed before giving up.
pub const MAX_LINK_DEPTH: usize = 16;

pub trait RefAccess {
    /// Stored object at a raw backend path.
    fn load(&self, path: &str) -> anyhow::Result<Option<StorageObject>>;

    /// Apply a batch of raw writes.
    fn store(&self, message: &str, requests: Vec<SetRequest>) -> anyhow::Result<()>;

    /// Raw backend paths matching `request`, sorted.
    fn find(&self, request: &MatchRequest) -> anyhow::Result<Vec<String>>;

    fn tracer(&self) -> &Tracer;

    /// Body (or fragment of the body) stored at `reference`, following links.
    fn get(&self, reference: &Ref) -> anyhow::Result<Value> {
        let (_, object) = self.get_object(reference)?;
        select_fragment(&object.body, &reference.fragment)
            .cloned()
            .ok_or_else(|| not_found(reference.to_string()))
    }

    fn get_as<T: DeserializeOwned>(&self, reference: &Ref) -> anyhow::Result<T> {
        let value = self.get(reference)?;
        serde_json::from_value(value)
            .with_context(|| format!("Failed to decode document at {}", reference))
    }

    /// Content object behind `reference` and the ref it actually lives at.
    fn get_object(&self, reference: &Ref) -> anyhow::Result<(Ref, StorageObject)> {
        ensure_absolute(reference)?;
        let resolved = self.resolve_link(&reference.without_fragment())?;
        match self.load(&object_path(&resolved))? {
            Some(object) if !object.is_link() => Ok((resolved, object)),
            _ => Err(not_found(reference.to_string())),
        }
    }

    fn exists(&self, reference: &Ref) -> anyhow::Result<bool> {
        match self.get(reference) {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Write content at `reference` (at its fragment, when it has one).
    ///
    /// Writes through links; the inbound link set of existing content is kept.
    fn set<T: Serialize + ?Sized>(
        &self,
        reference: &Ref,
        body_type: &str,
        value: &T,
    ) -> anyhow::Result<()> {
        ensure_absolute(reference)?;
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize document for {}", reference))?;
        let resolved = self.resolve_link(&reference.without_fragment())?;
        if resolved.is_latest() {
            return Err(StoreError::LatestIsLink(reference.to_string()).into());
        }
        let path = object_path(&resolved);
        let mut object = match self.load(&path)? {
            Some(existing) if existing.is_link() => {
                anyhow::bail!("Cannot write content over link at {}", resolved)
            }
            Some(mut existing) => {
                existing.body_type = Some(body_type.to_string());
                existing
            }
            None => StorageObject::content(body_type, Value::Null),
        };
        layout::insert_fragment(&mut object.body, &reference.fragment, value)?;
        debug!(reference = %resolved, body_type, "set");
        self.store(&format!("Set {}", resolved), vec![SetRequest::put(path, object)])
    }

    /// Remove `reference`. A link is unlinked; content is removed together with
    /// every link pointing at it. Absent refs are ignored.
    fn delete(&self, reference: &Ref) -> anyhow::Result<()> {
        ensure_absolute(reference)?;
        let reference = reference.without_fragment();
        if let Some(object) = self.load(&object_path(&reference))?
            && object.is_link()
        {
            return self.unlink(&reference);
        }
        let resolved = self.resolve_link(&reference)?;
        let path = object_path(&resolved);
        let Some(object) = self.load(&path)? else {
            return Ok(());
        };
        let mut requests = vec![SetRequest::delete(path)];
        for link in &object.links {
            let link = Ref::parse(link)
                .with_context(|| format!("Invalid inbound link '{}' on {}", link, resolved))?;
            requests.push(SetRequest::delete(object_path(&link)));
        }
        debug!(reference = %resolved, links = object.links.len(), "delete");
        self.store(&format!("Delete {}", resolved), requests)
    }

    /// Refs whose documents match `pattern` (a glob over rendered refs).
    fn match_refs(&self, pattern: &str) -> anyhow::Result<Vec<Ref>> {
        let suffix = format!("/{}", OBJECT_FILE);
        let request = ref_match_request(pattern, vec![suffix.clone()])?;
        self.find(&request)?
            .iter()
            .map(|path| layout::ref_from_path(path, &suffix))
            .collect()
    }

    /// Refs matching `pattern` that carry one of `statuses`.
    fn match_status(&self, pattern: &str, statuses: &[Status]) -> anyhow::Result<Vec<(Ref, Status)>> {
        let suffixes: Vec<String> = statuses.iter().map(|s| format!("/status/{}", s)).collect();
        let request = ref_match_request(pattern, suffixes)?;
        let mut out = Vec::new();
        for path in self.find(&request)? {
            let Some((head, name)) = path.rsplit_once("/status/") else {
                continue;
            };
            let status: Status = name.parse()?;
            let reference = layout::ref_from_path(head, "")?;
            out.push((reference, status));
        }
        Ok(out)
    }

    /// Point `reference` at the content behind `target`.
    ///
    /// A previous link at `reference` is replaced, pruning its old target's
    /// inbound set, all in the same write.
    fn link(&self, reference: &Ref, target: &Ref) -> anyhow::Result<()> {
        ensure_absolute(reference)?;
        let reference = reference.without_fragment();
        let (target, mut target_object) = self.get_object(&target.without_fragment())?;
        if target == reference {
            anyhow::bail!("Cannot link {} to itself", reference);
        }
        let name = reference.to_string();
        let link_path = object_path(&reference);
        let mut requests = Vec::new();

        match self.load(&link_path)? {
            Some(existing) if existing.is_link() => {
                let previous = link_target_ref(&existing, &reference)?;
                if previous == target && target_object.links.contains(&name) {
                    return Ok(());
                }
                if previous != target
                    && let Some(mut old) = self.load(&object_path(&previous))?
                    && !old.is_link()
                {
                    old.links.retain(|link| link != &name);
                    requests.push(SetRequest::put(object_path(&previous), old));
                }
            }
            Some(_) => anyhow::bail!("Cannot link {}: it holds content", reference),
            None => {}
        }

        if !target_object.links.contains(&name) {
            target_object.links.push(name);
        }
        requests.push(SetRequest::put(object_path(&target), target_object));
        requests.push(SetRequest::put(link_path, StorageObject::link(target.to_string())));
        debug!(reference = %reference, target = %target, "link");
        self.store(&format!("Link {} to {}", reference, target), requests)
    }

    /// Remove the link at `reference`; absent links are ignored.
    fn unlink(&self, reference: &Ref) -> anyhow::Result<()> {
        let reference = reference.without_fragment();
        let link_path = object_path(&reference);
        let Some(existing) = self.load(&link_path)? else {
            return Ok(());
        };
        if !existing.is_link() {
            anyhow::bail!("{} is not a link", reference);
        }
        let target = link_target_ref(&existing, &reference)?;
        let mut requests = vec![SetRequest::delete(link_path)];
        if let Some(mut object) = self.load(&object_path(&target))?
            && !object.is_link()
        {
            let name = reference.to_string();
            object.links.retain(|link| link != &name);
            requests.push(SetRequest::put(object_path(&target), object));
        }
        debug!(reference = %reference, target = %target, "unlink");
        self.store(&format!("Unlink {}", reference), requests)
    }

    /// Follow links from `reference` (or from its closest linked ancestor) to the
    /// ref where content would live. The fragment is carried over.
    fn resolve_link(&self, reference: &Ref) -> anyhow::Result<Ref> {
        let mut current = reference.without_fragment();
        for _ in 0..MAX_LINK_DEPTH {
            match self.next_link_hop(&current)? {
                Some(next) => current = next,
                None => return Ok(current.with_fragment(reference.fragment.clone())),
            }
        }
        Err(StoreError::LinkCycle(reference.to_string()).into())
    }

    /// One hop of link resolution, or `None` when `reference` is not behind a link.
    fn next_link_hop(&self, reference: &Ref) -> anyhow::Result<Option<Ref>> {
        if let Some(object) = self.load(&object_path(reference))? {
            if !object.is_link() {
                return Ok(None);
            }
            return link_target_ref(&object, reference).map(Some);
        }
        let rendered = reference.path();
        let mut ancestor = reference.parent();
        while let Some(candidate) = ancestor {
            if let Some(object) = self.load(&object_path(&candidate))?
                && object.is_link()
            {
                let target = link_target_ref(&object, &candidate)?;
                let remainder = &rendered[candidate.path().len()..];
                let redirected = format!("{}{}", target, remainder);
                return Ref::parse(&redirected)
                    .with_context(|| format!("Failed to redirect {} through {}", reference, candidate))
                    .map(Some);
            }
            ancestor = candidate.parent();
        }
        Ok(None)
    }

    /// Refs of the links currently pointing at the content behind `reference`.
    fn get_links(&self, reference: &Ref) -> anyhow::Result<Vec<Ref>> {
        let (resolved, object) = self.get_object(reference)?;
        object
            .links
            .iter()
            .map(|link| {
                Ref::parse(link)
                    .with_context(|| format!("Invalid inbound link '{}' on {}", link, resolved))
            })
            .collect()
    }

    /// Replace whatever status marker `reference` has with `status`.
    fn set_status(&self, reference: &Ref, status: Status) -> anyhow::Result<()> {
        ensure_absolute(reference)?;
        let resolved = self.resolve_link(&reference.without_fragment())?;
        let mut requests: Vec<SetRequest> = Status::ALL
            .into_iter()
            .filter(|other| *other != status)
            .map(|other| SetRequest::delete(status_path(&resolved, other)))
            .collect();
        requests.push(SetRequest::put(
            status_path(&resolved, status),
            StorageObject::content("status", Value::String(status.to_string())),
        ));
        debug!(reference = %resolved, %status, "set status");
        self.store(&format!("Set {} status to {}", resolved, status), requests)
    }

    fn status(&self, reference: &Ref) -> anyhow::Result<Option<Status>> {
        ensure_absolute(reference)?;
        let resolved = self.resolve_link(&reference.without_fragment())?;
        let prefix = status_prefix(&resolved);
        let request = MatchRequest {
            prefix: prefix.clone(),
            suffixes: Vec::new(),
            glob: Glob::new("*")?,
        };
        match self.find(&request)?.first() {
            Some(path) => Ok(Some(path[prefix.len()..].parse()?)),
            None => Ok(None),
        }
    }

    /// Record that `reference` depends on `dependency` (both directions indexed).
    fn add_dependency(&self, reference: &Ref, dependency: &Ref) -> anyhow::Result<()> {
        self.update_dependency(reference, dependency, true)
    }

    fn remove_dependency(&self, reference: &Ref, dependency: &Ref) -> anyhow::Result<()> {
        self.update_dependency(reference, dependency, false)
    }

    fn get_dependencies(&self, reference: &Ref) -> anyhow::Result<Vec<Ref>> {
        self.read_index(&dependencies_path(&reference.without_fragment()))
    }

    fn get_dependants(&self, reference: &Ref) -> anyhow::Result<Vec<Ref>> {
        self.read_index(&dependants_path(&reference.without_fragment()))
    }

    fn update_dependency(&self, reference: &Ref, dependency: &Ref, add: bool) -> anyhow::Result<()> {
        ensure_absolute(reference)?;
        ensure_absolute(dependency)?;
        let reference = reference.without_fragment();
        let dependency = dependency.without_fragment();
        let forward = dependencies_path(&reference);
        let backward = dependants_path(&dependency);

        let mut requests = Vec::new();
        for (path, entry) in [(forward, &dependency), (backward, &reference)] {
            let mut index = self.read_index(&path)?;
            let present = index.contains(entry);
            if add && !present {
                index.push(entry.clone());
            } else if !add && present {
                index.retain(|existing| existing != entry);
            } else {
                continue;
            }
            requests.push(index_request(path, &index)?);
        }
        if requests.is_empty() {
            return Ok(());
        }
        let verb = if add { "Add" } else { "Remove" };
        self.store(
            &format!("{} dependency {} on {}", verb, reference, dependency),
            requests,
        )
    }

    fn read_index(&self, path: &str) -> anyhow::Result<Vec<Ref>> {
        match self.load(path)? {
            Some(object) => serde_json::from_value(object.body)
                .with_context(|| format!("Failed to decode dependency index at {}", path)),
            None => Ok(Vec::new()),
        }
    }
}

/// A [`RefAccess`] bound directly to a backend; every write is its own batch.
#[derive(Debug, Clone)]
pub struct RefStore {
    backend: Arc<dyn DocumentBackend>,
    tracer: Tracer,
}

impl RefStore {
    pub fn new(backend: Arc<dyn DocumentBackend>, tracer: Tracer) -> Self {
        Self { backend, tracer }
    }

    /// Store over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Tracer::disabled())
    }

    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    /// Begin buffering writes; nothing reaches the backend until
    /// [`Transaction::commit`].
    pub fn start_transaction(&self) -> Transaction<'_> {
        Transaction::new(self)
    }
}

impl RefAccess for RefStore {
    fn load(&self, path: &str) -> anyhow::Result<Option<StorageObject>> {
        let mut objects = self.backend.get(slice::from_ref(&path.to_string()))?;
        Ok(objects.pop().flatten())
    }

    fn store(&self, message: &str, requests: Vec<SetRequest>) -> anyhow::Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        self.backend
            .set(message, &requests)
            .with_context(|| format!("Failed to write: {}", message))
    }

    fn find(&self, request: &MatchRequest) -> anyhow::Result<Vec<String>> {
        self.backend.match_paths(slice::from_ref(request))
    }

    fn tracer(&self) -> &Tracer {
        &self.tracer
    }
}

fn ensure_absolute(reference: &Ref) -> anyhow::Result<()> {
    if reference.is_relative() {
        anyhow::bail!("Ref '{}' is relative; resolve it against its package first", reference);
    }
    Ok(())
}

fn link_target_ref(object: &StorageObject, at: &Ref) -> anyhow::Result<Ref> {
    let target = object
        .link_target()
        .ok_or_else(|| anyhow::anyhow!("Link at {} has no target", at))?;
    Ref::parse(target).with_context(|| format!("Link at {} has invalid target '{}'", at, target))
}

fn ref_match_request(pattern: &str, suffixes: Vec<String>) -> anyhow::Result<MatchRequest> {
    let (directory, rest) = split_directory_prefix(pattern);
    Ok(MatchRequest {
        prefix: format!("{}{}", layout::REFS_ROOT, directory),
        suffixes,
        glob: Glob::new(rest)?,
    })
}

fn index_request(path: String, index: &[Ref]) -> anyhow::Result<SetRequest> {
    let body = serde_json::to_value(index).context("Failed to serialize dependency index")?;
    Ok(SetRequest::put(path, StorageObject::content("dependencies", body)))
}
