//! Raw document storage.
//!
//! A [`DocumentBackend`] stores opaque bytes under `/`-separated paths. The
//! structured layer on top ([`StorageObject`] envelopes, batched writes and
//! prefix/suffix/glob matching) is provided in terms of four primitives, so each
//! backend only decides how bytes are kept and how a batch is made durable.

mod filesystem;
mod git;
mod memory;
mod object_storage;
pub mod pattern;

pub use self::filesystem::FilesystemBackend;
pub use self::git::{DEFAULT_BRANCH, GitBackend};
pub use self::memory::MemoryBackend;
pub use self::object_storage::ObjectStoreBackend;
pub use pattern::Glob;

use std::collections::BTreeSet;
use std::fmt;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a stored object holds content or points at other content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Ref,
    Link,
}

/// Persisted envelope around every document.
///
/// Content: `{"kind":"ref","body_type":"<type>","body":<json>,"links":[...]}`.
/// Link: `{"kind":"link","body":"<target-ref>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageObject {
    pub kind: ObjectKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_type: Option<String>,
    pub body: Value,
    /// Refs of the link objects currently pointing at this content
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
}

impl StorageObject {
    pub fn content(body_type: impl Into<String>, body: Value) -> Self {
        Self {
            kind: ObjectKind::Ref,
            body_type: Some(body_type.into()),
            body,
            links: Vec::new(),
        }
    }

    pub fn link(target: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Link,
            body_type: None,
            body: Value::String(target.into()),
            links: Vec::new(),
        }
    }

    /// Target ref of a link object.
    pub fn link_target(&self) -> Option<&str> {
        match (self.kind, &self.body) {
            (ObjectKind::Link, Value::String(target)) => Some(target),
            _ => None,
        }
    }

    pub fn is_link(&self) -> bool {
        self.kind == ObjectKind::Link
    }
}

/// Encode an object as stored on disk.
pub fn encode_object(object: &StorageObject) -> anyhow::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(object).context("Failed to serialize object")?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_object(path: &str, bytes: &[u8]) -> anyhow::Result<StorageObject> {
    serde_json::from_slice(bytes).with_context(|| format!("Failed to parse object at {}", path))
}

/// A raw byte change; `None` removes the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    pub data: Option<Vec<u8>>,
}

/// A structured write; `None` deletes the object.
#[derive(Debug, Clone, PartialEq)]
pub struct SetRequest {
    pub path: String,
    pub object: Option<StorageObject>,
}

impl SetRequest {
    pub fn put(path: impl Into<String>, object: StorageObject) -> Self {
        Self {
            path: path.into(),
            object: Some(object),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            object: None,
        }
    }
}

/// Path query: everything under `prefix` ending in one of `suffixes` (any path when
/// empty) whose remainder, with prefix and suffix stripped, matches `glob`.
#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub prefix: String,
    pub suffixes: Vec<String>,
    pub glob: Glob,
}

impl MatchRequest {
    pub fn matches(&self, path: &str) -> bool {
        let Some(remainder) = path.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        if self.suffixes.is_empty() {
            return self.glob.is_match(remainder);
        }
        self.suffixes.iter().any(|suffix| {
            remainder
                .strip_suffix(suffix.as_str())
                .is_some_and(|stem| self.glob.is_match(stem))
        })
    }
}

/// Raw storage contract shared by every backend.
///
/// Implementations must treat deleting an absent path and overwriting an existing
/// one as ordinary successes.
pub trait DocumentBackend: fmt::Debug + Send + Sync {
    fn read(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// All stored paths starting with `prefix`.
    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    /// Apply `changes` as one durable unit (one commit for git).
    fn write_batch(&self, message: &str, changes: &[Change]) -> anyhow::Result<()>;

    fn write(&self, path: &str, data: &[u8]) -> anyhow::Result<()> {
        self.write_batch(
            &format!("Write {}", path),
            &[Change {
                path: path.to_string(),
                data: Some(data.to_vec()),
            }],
        )
    }

    fn remove(&self, path: &str) -> anyhow::Result<()> {
        self.write_batch(
            &format!("Remove {}", path),
            &[Change {
                path: path.to_string(),
                data: None,
            }],
        )
    }

    fn get(&self, paths: &[String]) -> anyhow::Result<Vec<Option<StorageObject>>> {
        paths
            .iter()
            .map(|path| match self.read(path)? {
                Some(bytes) => decode_object(path, &bytes).map(Some),
                None => Ok(None),
            })
            .collect()
    }

    fn set(&self, message: &str, requests: &[SetRequest]) -> anyhow::Result<()> {
        let changes = requests
            .iter()
            .map(|request| {
                let data = match &request.object {
                    Some(object) => Some(encode_object(object)?),
                    None => None,
                };
                Ok(Change {
                    path: request.path.clone(),
                    data,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        self.write_batch(message, &changes)
    }

    /// Sorted, de-duplicated paths matching any of `requests`.
    fn match_paths(&self, requests: &[MatchRequest]) -> anyhow::Result<Vec<String>> {
        let mut out = BTreeSet::new();
        for request in requests {
            let listed = self
                .list(&request.prefix)
                .with_context(|| format!("Failed to list paths under '{}'", request.prefix))?;
            out.extend(listed.into_iter().filter(|path| request.matches(path)));
        }
        Ok(out.into_iter().collect())
    }
}

/// Reject absolute paths and `..` segments before touching a backend.
pub(crate) fn ensure_relative_path(path: &str) -> anyhow::Result<()> {
    if path.is_empty() || path.starts_with('/') {
        anyhow::bail!("Storage path must be relative: '{}'", path);
    }
    if path.split('/').any(|segment| segment == ".." || segment == "." || segment.is_empty()) {
        anyhow::bail!("Storage path has an invalid segment: '{}'", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_and_content_envelopes_serialize_as_documented() {
        let link = StorageObject::link("repo/-/pkg/@abc");
        let json = serde_json::to_string(&link).expect("serialize should succeed");
        assert_eq!(json, r#"{"kind":"link","body":"repo/-/pkg/@abc"}"#);

        let mut content = StorageObject::content("custom", serde_json::json!("a"));
        content.links.push("repo/-/pkg/@".to_string());
        let json = serde_json::to_string(&content).expect("serialize should succeed");
        assert_eq!(
            json,
            r#"{"kind":"ref","body_type":"custom","body":"a","links":["repo/-/pkg/@"]}"#
        );
    }

    #[test]
    fn match_request_strips_prefix_and_suffix() {
        let request = MatchRequest {
            prefix: "refs/repo/-/pkg/".to_string(),
            suffixes: vec!["/status/pending".to_string(), "/status/paused".to_string()],
            glob: Glob::new("@*/deploy/*/*").expect("glob should compile"),
        };
        assert!(request.matches("refs/repo/-/pkg/@a/deploy/prod/1/status/pending"));
        assert!(request.matches("refs/repo/-/pkg/@a/deploy/prod/1/status/paused"));
        assert!(!request.matches("refs/repo/-/pkg/@a/deploy/prod/1/status/failed"));
        assert!(!request.matches("refs/other/-/pkg/@a/deploy/prod/1/status/pending"));
    }

    #[test]
    fn relative_path_validation() {
        assert!(ensure_relative_path("refs/a/@object.json").is_ok());
        assert!(ensure_relative_path("/etc/passwd").is_err());
        assert!(ensure_relative_path("refs/../x").is_err());
        assert!(ensure_relative_path("refs//x").is_err());
    }
}
