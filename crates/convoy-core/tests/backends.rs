use std::path::Path;
use std::sync::Arc;

use git2::Repository;
use object_store::memory::InMemory;
use serde_json::json;
use tempfile::TempDir;

use convoy_core::backend::{DocumentBackend, GitBackend, ObjectStoreBackend};
use convoy_core::telemetry::Tracer;
use convoy_core::{Ref, RefAccess, RefStore};

fn r(s: &str) -> Ref {
    Ref::parse(s).unwrap()
}

fn commit_count(path: &Path, branch: &str) -> usize {
    let repo = Repository::open(path).unwrap();
    let mut walk = repo.revwalk().unwrap();
    if walk.push_ref(&format!("refs/heads/{}", branch)).is_err() {
        return 0;
    }
    walk.count()
}

fn git_store(path: &Path, remote: Option<&str>) -> RefStore {
    let backend: Arc<dyn DocumentBackend> = Arc::new(
        GitBackend::open(path, "state", remote.map(str::to_string)).unwrap(),
    );
    RefStore::new(backend, Tracer::disabled())
}

#[test]
fn git_transaction_is_one_commit() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("state.git");
    let store = git_store(&path, None);
    assert_eq!(commit_count(&path, "state"), 0);

    let tx = store.start_transaction();
    for name in ["a", "b", "c"] {
        tx.set(
            &r(&format!("repo/-/pkg/+/custom/{}", name)),
            "custom",
            &json!(name),
        )
        .unwrap();
    }
    tx.commit("three documents").unwrap();
    assert_eq!(commit_count(&path, "state"), 1);

    // Rewriting identical content is not a new commit.
    store.set(&r("repo/-/pkg/+/custom/a"), "custom", &json!("a")).unwrap();
    assert_eq!(commit_count(&path, "state"), 1);

    store.delete(&r("repo/-/pkg/+/custom/b")).unwrap();
    assert_eq!(commit_count(&path, "state"), 2);

    let reopened = git_store(&path, None);
    assert_eq!(
        reopened.match_refs("repo/-/pkg/+/custom/*").unwrap(),
        vec![r("repo/-/pkg/+/custom/a"), r("repo/-/pkg/+/custom/c")]
    );
}

#[test]
fn git_push_conflicts_need_a_pull() {
    let temp = TempDir::new().unwrap();
    let origin = temp.path().join("origin.git");
    Repository::init_bare(&origin).unwrap();
    let origin_url = origin.to_str().unwrap();

    let mut stores = Vec::new();
    for name in ["one", "two"] {
        let path = temp.path().join(name);
        let repo = Repository::init_bare(&path).unwrap();
        repo.remote("origin", origin_url).unwrap();
        let backend = Arc::new(GitBackend::open(&path, "state", Some("origin".to_string())).unwrap());
        stores.push((backend.clone(), RefStore::new(backend, Tracer::disabled())));
    }
    let (_, first) = &stores[0];
    let (second_backend, second) = &stores[1];

    first.set(&r("repo/-/pkg/+/custom/x"), "custom", &json!(1)).unwrap();
    assert_eq!(commit_count(&origin, "state"), 1);

    assert!(second.set(&r("repo/-/pkg/+/custom/y"), "custom", &json!(2)).is_err());
    second_backend.pull().unwrap();
    assert_eq!(second.get(&r("repo/-/pkg/+/custom/x")).unwrap(), json!(1));
    second.set(&r("repo/-/pkg/+/custom/y"), "custom", &json!(2)).unwrap();
    assert_eq!(commit_count(&origin, "state"), 2);
}

#[test]
fn object_store_backend_serves_the_ref_api() {
    let backend: Arc<dyn DocumentBackend> =
        Arc::new(ObjectStoreBackend::new(Arc::new(InMemory::new()), "/convoy/state/").unwrap());
    let store = RefStore::new(backend.clone(), Tracer::disabled());
    let release = r("repo/-/pkg/@abc");
    store.set(&release, "release", &json!({"id": "abc"})).unwrap();
    store.link(&r("repo/-/pkg/@"), &release).unwrap();

    assert_eq!(store.get(&r("repo/-/pkg/@#id")).unwrap(), json!("abc"));
    assert_eq!(
        backend.list("refs/repo/-/pkg/@abc/").unwrap(),
        vec!["refs/repo/-/pkg/@abc/@object.json".to_string()]
    );
    store.delete(&release).unwrap();
    assert!(backend.list("refs/").unwrap().is_empty());
}
