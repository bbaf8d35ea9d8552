#![forbid(unsafe_code)]

use recoon_core::{
    EventType, NamespaceName, Object, Project, ProjectSpec, Repository, RepositorySpec, StoreError, VersionKind,
};
use recoon_persist::SqliteKv;
use recoon_schema::Schema;
use recoon_store::{ListOptions, Store};
use tokio::sync::mpsc;

fn store() -> (Store, mpsc::Receiver<recoon_core::Event>) {
    let kv = SqliteKv::open_in_memory().expect("kv");
    Store::open(kv, Schema::builtin(), 100).expect("store")
}

fn repo(ns: &str, name: &str) -> Repository {
    Repository::new(
        ns,
        name,
        RepositorySpec { project_name: "demo".into(), url: "git@x:y.git".into(), branch: "main".into(), path: "svc".into() },
    )
}

#[tokio::test]
async fn create_sets_identity_and_emits_add() {
    let (s, mut rx) = store();
    let mut input = repo("default", "r1");
    input.metadata.resource_version = 42;
    let created = s.create(input).await.expect("create");
    assert_eq!(created.metadata.resource_version, 0);
    assert_eq!(created.type_meta.kind, "Repository");
    assert_eq!(created.type_meta.version, "v1");

    let ev = rx.recv().await.expect("event");
    assert_eq!(ev.kind, EventType::Add);
    assert!(ev.previous.is_none());
    assert!(matches!(ev.object, Object::Repository(ref r) if r == &created));

    let err = s.create(repo("default", "r1")).await.expect_err("dup");
    assert!(err.is_already_exists());
}

#[tokio::test]
async fn invalid_identity_writes_nothing() {
    let (s, mut rx) = store();
    assert!(matches!(s.create(repo("default", "")).await, Err(StoreError::NameEmpty)));
    assert!(matches!(s.create(repo("", "r1")).await, Err(StoreError::NamespaceEmpty)));
    assert!(matches!(s.create(repo("default", "a/b")).await, Err(StoreError::Invalid(_))));
    assert!(rx.try_recv().is_err());
    // No partition was created either.
    assert!(s.list::<Repository>(&ListOptions::all()).expect_err("nf").is_not_found());
}

#[tokio::test]
async fn resource_version_bumps_by_one_and_stale_update_fails() {
    let (s, mut rx) = store();
    let mut r = s.create(repo("default", "r1")).await.expect("create");
    for want in 1..=3 {
        r.spec.as_mut().expect("spec").branch = format!("b{want}");
        r = s.update(r).await.expect("update");
        assert_eq!(r.metadata.resource_version, want);
    }
    let stored: Repository = s.get(&NamespaceName::new("default", "r1")).expect("get");
    assert_eq!(stored.metadata.resource_version, 3);

    let mut stale = stored.clone();
    stale.metadata.resource_version = 1;
    stale.spec.as_mut().expect("spec").branch = "stale".into();
    assert!(s.update(stale).await.expect_err("stale").is_conflict());
    let after: Repository = s.get(&NamespaceName::new("default", "r1")).expect("get");
    assert_eq!(after, stored);

    // add + three updates, nothing for the failed one
    let mut kinds = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        kinds.push(ev.kind);
    }
    assert_eq!(kinds, vec![EventType::Add, EventType::Update, EventType::Update, EventType::Update]);
}

#[tokio::test]
async fn update_event_carries_previous_image() {
    let (s, mut rx) = store();
    let r = s.create(repo("default", "r1")).await.expect("create");
    let _ = rx.recv().await;
    let mut next = r.clone();
    next.spec.as_mut().expect("spec").path = "other".into();
    s.update(next).await.expect("update");
    let ev = rx.recv().await.expect("event");
    assert_eq!(ev.kind, EventType::Update);
    let prev: Repository = ev.previous.as_ref().and_then(|p| p.to_resource()).expect("prev");
    assert_eq!(prev.spec.as_ref().map(|s| s.path.as_str()), Some("svc"));
    let cur: Repository = ev.object.to_resource().expect("cur");
    assert_eq!(cur.metadata.resource_version, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_updates_one_wins() {
    let (s, _rx) = store();
    let mut r = s.create(repo("default", "r1")).await.expect("create");
    for _ in 0..3 {
        r = s.update(r).await.expect("update");
    }
    assert_eq!(r.metadata.resource_version, 3);
    let (a, b) = (r.clone(), r.clone());
    let (s1, s2) = (s.clone(), s.clone());
    let h1 = tokio::spawn(async move { s1.update(a).await });
    let h2 = tokio::spawn(async move { s2.update(b).await });
    let results = [h1.await.expect("join"), h2.await.expect("join")];
    let ok: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(ok.len(), 1);
    assert_eq!(ok[0].metadata.resource_version, 4);
    assert!(results.iter().any(|r| matches!(r, Err(StoreError::ObjectChanged(_)))));
}

#[tokio::test]
async fn delete_emits_tombstone_once() {
    let (s, mut rx) = store();
    s.create(repo("default", "r1")).await.expect("create");
    let _ = rx.recv().await;
    let vk = VersionKind::new("v1", "Repository");
    let nn = NamespaceName::new("default", "r1");
    s.delete(&vk, &nn).await.expect("delete");
    let ev = rx.recv().await.expect("event");
    assert_eq!(ev.kind, EventType::Delete);
    let tomb = ev.object.as_tombstone().expect("tombstone");
    assert_eq!(tomb.type_meta.kind, "Repository");
    assert_eq!(tomb.metadata.name, "r1");
    let typed: Repository = tomb.decode().expect("decode");
    assert_eq!(typed.spec.map(|s| s.project_name), Some("demo".to_string()));

    // absent: no-op, no event
    s.delete(&vk, &nn).await.expect("idempotent");
    assert!(rx.try_recv().is_err());
    assert!(s.get::<Repository>(&nn).expect_err("gone").is_not_found());
    assert!(s.delete(&VersionKind::new("v1", "Ingress"), &nn).await.is_err());
}

#[tokio::test]
async fn list_filters_by_namespace_and_prefix() {
    let (s, _rx) = store();
    assert!(s.list::<Project>(&ListOptions::all()).expect_err("never created").is_not_found());
    assert!(s.list_or_empty::<Project>(&ListOptions::all()).expect("empty").is_empty());

    for (ns, name) in [("default", "x_y#main#a"), ("default", "x_y#main#b"), ("default", "x_z#main"), ("other", "x_y#main")] {
        s.create(repo(ns, name)).await.expect("create");
    }
    let names = |opts: ListOptions| -> Vec<String> {
        s.list::<Repository>(&opts).expect("list").into_iter().map(|r| r.metadata.name).collect()
    };
    assert_eq!(names(ListOptions::all()).len(), 4);
    assert_eq!(names(ListOptions::in_namespace("other")), vec!["x_y#main"]);
    assert_eq!(names(ListOptions::in_namespace("default").with_name_prefix("x_y#main")), vec!["x_y#main#a", "x_y#main#b"]);

    s.ensure_partition(recoon_core::ObjectKind::Project).expect("partition");
    assert!(s.list::<Project>(&ListOptions::all()).expect("empty").is_empty());
    let p = s
        .create(Project::new("project-demo", "demo", ProjectSpec { compose_path: "svc".into(), ..Default::default() }))
        .await
        .expect("create project");
    assert_eq!(p.type_meta.kind, "Project");
}

#[tokio::test]
async fn data_survives_reopen() {
    let dir = tempfile::tempdir().expect("tmp");
    let path = dir.path().join("recoon.db");
    {
        let (s, _rx) = Store::open(SqliteKv::open(&path).expect("kv"), Schema::builtin(), 10).expect("store");
        let r = s.create(repo("default", "r1")).await.expect("create");
        s.update(r).await.expect("update");
    }
    let (s, _rx) = Store::open(SqliteKv::open(&path).expect("kv"), Schema::builtin(), 10).expect("store");
    let r: Repository = s.get(&NamespaceName::new("default", "r1")).expect("get");
    assert_eq!(r.metadata.resource_version, 1);
}
