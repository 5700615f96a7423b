//! Where refs live in a backend, and JSON fragment access.

use anyhow::Context;
use serde_json::{Map, Value};

use crate::refs::Ref;
use crate::status::Status;

pub const OBJECT_FILE: &str = "@object.json";
pub const DEPENDENCIES_FILE: &str = "@dependencies.json";
pub const DEPENDANTS_FILE: &str = "@dependants.json";
pub const REFS_ROOT: &str = "refs/";

pub fn object_path(reference: &Ref) -> String {
    format!("{}/{}", reference.storage_path(), OBJECT_FILE)
}

pub fn status_prefix(reference: &Ref) -> String {
    format!("{}/status/", reference.storage_path())
}

pub fn status_path(reference: &Ref, status: Status) -> String {
    format!("{}{}", status_prefix(reference), status)
}

pub fn dependencies_path(reference: &Ref) -> String {
    format!("{}/{}", reference.storage_path(), DEPENDENCIES_FILE)
}

pub fn dependants_path(reference: &Ref) -> String {
    format!("{}/{}", reference.storage_path(), DEPENDANTS_FILE)
}

/// Inverse of [`object_path`] and friends: `refs/<ref>/<suffix>` back to the ref.
pub fn ref_from_path(path: &str, suffix: &str) -> anyhow::Result<Ref> {
    let stem = path
        .strip_prefix(REFS_ROOT)
        .and_then(|rest| rest.strip_suffix(suffix))
        .ok_or_else(|| anyhow::anyhow!("Path '{}' is not a stored ref", path))?;
    Ref::parse(stem).with_context(|| format!("Failed to parse stored ref at '{}'", path))
}

/// Walk `fragment` (`/`-separated object keys or array indexes) into `body`.
pub fn select_fragment<'a>(body: &'a Value, fragment: &str) -> Option<&'a Value> {
    if fragment.is_empty() {
        return Some(body);
    }
    fragment
        .split('/')
        .try_fold(body, |value, key| match value {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|idx| items.get(idx)),
            _ => None,
        })
}

/// Write `value` at `fragment` inside `body`, creating intermediate objects.
pub fn insert_fragment(body: &mut Value, fragment: &str, value: Value) -> anyhow::Result<()> {
    if fragment.is_empty() {
        *body = value;
        return Ok(());
    }
    let mut current = body;
    let mut keys = fragment.split('/').peekable();
    while let Some(key) = keys.next() {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            anyhow::bail!("Cannot set '{}': '{}' is not inside an object", fragment, key);
        };
        if keys.peek().is_none() {
            map.insert(key.to_string(), value);
            return Ok(());
        }
        current = map.entry(key.to_string()).or_insert(Value::Null);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn paths_round_trip() {
        let r = Ref::parse("repo/-/pkg/@abc/deploy/prod/1").expect("parse should succeed");
        let path = object_path(&r);
        assert_eq!(path, "refs/repo/-/pkg/@abc/deploy/prod/1/@object.json");
        assert_eq!(
            ref_from_path(&path, "/@object.json").expect("ref should parse"),
            r
        );
        assert_eq!(
            status_path(&r, Status::FailedRetried),
            "refs/repo/-/pkg/@abc/deploy/prod/1/status/failed_retried"
        );
    }

    #[test]
    fn fragments_walk_objects_and_arrays() {
        let body = json!({"outputs": {"urls": ["a", "b"]}});
        assert_eq!(select_fragment(&body, "outputs/urls/1"), Some(&json!("b")));
        assert_eq!(select_fragment(&body, "outputs/missing"), None);
        assert_eq!(select_fragment(&body, ""), Some(&body));

        let mut body = json!({"a": 1});
        insert_fragment(&mut body, "b/c", json!(2)).expect("insert should succeed");
        assert_eq!(body, json!({"a": 1, "b": {"c": 2}}));
        assert!(insert_fragment(&mut body, "a/x", json!(3)).is_err());
    }
}
