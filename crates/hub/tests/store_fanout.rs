#![forbid(unsafe_code)]

use std::sync::Arc;

use recoon_core::config::WatcherConfig;
use recoon_core::{EventType, NamespaceName, Project, ProjectSpec, Repository, RepositorySpec};
use recoon_hub::{CancellationToken, Watcher};
use recoon_persist::SqliteKv;
use recoon_schema::Schema;
use recoon_store::Store;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repository_subscriber_sees_only_repositories_in_commit_order() {
    let (store, events) = Store::open(SqliteKv::open_in_memory().expect("kv"), Schema::builtin(), 100).expect("store");
    let watcher = Arc::new(Watcher::new(events, &WatcherConfig::default()));
    let repo_vk = store.version_kind::<Repository>().expect("vk");
    let mut repos = watcher.watch(&[repo_vk.clone()]);
    let mut projects = watcher.watch(&[store.version_kind::<Project>().expect("vk")]);

    let cancel = CancellationToken::new();
    let run = {
        let (w, c) = (watcher.clone(), cancel.clone());
        tokio::spawn(async move { w.run(c).await })
    };

    let r = store
        .create(Repository::new("default", "r1", RepositorySpec { url: "git@x:y.git".into(), ..Default::default() }))
        .await
        .expect("create repo");
    store
        .create(Project::new("project-demo", "demo", ProjectSpec::default()))
        .await
        .expect("create project");
    store.update(r).await.expect("update repo");
    store.delete(&repo_vk, &NamespaceName::new("default", "r1")).await.expect("delete repo");

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let ev = repos.recv().await.expect("repo event");
        assert_eq!(ev.object.version_kind(), repo_vk);
        kinds.push(ev.kind);
    }
    assert_eq!(kinds, vec![EventType::Add, EventType::Update, EventType::Delete]);
    let p = projects.recv().await.expect("project event");
    assert_eq!(p.object.namespace_name(), NamespaceName::new("project-demo", "demo"));

    cancel.cancel();
    run.await.expect("join").expect("watcher");
    assert!(repos.recv().await.is_none());
    assert!(projects.recv().await.is_none());
}
