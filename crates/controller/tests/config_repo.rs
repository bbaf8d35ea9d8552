mod common;

use std::time::Duration;

use common::{eventually, open_store, Harness};
use recoon_controller::{reconcile_manifest, Manifest, ManifestRepo, MANIFEST_FILE};
use recoon_core::{Repository, CONFIG_REPO_NAME, DEFAULT_NAMESPACE, SYSTEM_NAMESPACE};
use recoon_ops::repository_name;
use recoon_store::ListOptions;

const COMPOSE_OK: &str = "services:\n  web:\n    image: nginx\n";

fn entry(name: &str, url: &str, path: &str) -> ManifestRepo {
    ManifestRepo { name: name.into(), url: url.into(), branch: "main".into(), path: path.into() }
}

fn names(store: &recoon_store::Store) -> Vec<String> {
    let mut v: Vec<String> = store
        .list_or_empty::<Repository>(&ListOptions::in_namespace(DEFAULT_NAMESPACE))
        .expect("list")
        .into_iter()
        .map(|r| r.metadata.name)
        .collect();
    v.sort();
    v
}

#[tokio::test]
async fn manifest_reconciliation_is_idempotent() {
    let (store, mut rx) = open_store();
    let manifest = Manifest { repos: vec![entry("demo", "git@x:y.git", "svc"), entry("web", "git@x:web.git", "")] };

    let first = reconcile_manifest(&store, &manifest).await.expect("first pass");
    assert_eq!(first.created.len(), 2);
    assert!(first.deleted.is_empty());
    let mut events = 0;
    while rx.try_recv().is_ok() {
        events += 1;
    }
    assert_eq!(events, 2);

    let second = reconcile_manifest(&store, &manifest).await.expect("second pass");
    assert!(second.is_noop());
    assert_eq!(second.unchanged, 2);
    assert!(rx.try_recv().is_err(), "second pass must not write");
    let repos = store.list_or_empty::<Repository>(&ListOptions::all()).expect("list");
    assert!(repos.iter().all(|r| r.metadata.resource_version == 0));

    // A spec change renames the entry: the old one goes, the new one comes.
    let changed = Manifest { repos: vec![entry("demo", "git@x:y.git", "svc2")] };
    let third = reconcile_manifest(&store, &changed).await.expect("third pass");
    assert_eq!(third.created, vec![repository_name("git@x:y.git", "main", "svc2")]);
    assert_eq!(third.deleted.len(), 2);
    assert_eq!(names(&store), vec![repository_name("git@x:y.git", "main", "svc2")]);
}

#[tokio::test]
async fn manifest_ignores_repositories_outside_the_default_namespace() {
    let (store, _rx) = open_store();
    store
        .create(Repository::new("team", "keep", Default::default()))
        .await
        .expect("create");
    let diff = reconcile_manifest(&store, &Manifest::default()).await.expect("reconcile");
    assert!(diff.is_noop());
    assert!(store.get::<Repository>(&recoon_core::NamespaceName::new("team", "keep")).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn config_repo_drives_the_fleet() {
    let cfg_url = "git@x:config.git";
    let h = Harness::start_with(|cfg| {
        cfg.config_repo.clone_url = cfg_url.into();
        cfg.config_repo.interval = Duration::from_millis(50);
    })
    .await;
    for (url, head) in [("git@x:y.git", "c1"), ("git@x:web.git", "w1")] {
        h.git.set_head(url, "main", head);
        h.git.put_file(url, "main", "docker-compose.yml", COMPOSE_OK);
    }
    let two = "repos:\n  - name: demo\n    url: git@x:y.git\n    branch: main\n  - name: web\n    url: git@x:web.git\n    branch: main\n";
    h.git.put_file(cfg_url, "main", MANIFEST_FILE, two);
    h.git.set_head(cfg_url, "main", "k1");

    eventually("config repo recorded", || {
        h.get::<Repository>(SYSTEM_NAMESPACE, CONFIG_REPO_NAME)
            .and_then(|r| r.status)
            .is_some_and(|s| s.current_commit_id == "k1")
    })
    .await;
    eventually("both projects exist", || h.project("demo").is_some() && h.project("web").is_some()).await;
    assert_eq!(names(&h.store).len(), 2);

    let one = "repos:\n  - name: demo\n    url: git@x:y.git\n    branch: main\n";
    h.git.put_file(cfg_url, "main", MANIFEST_FILE, one);
    h.git.set_head(cfg_url, "main", "k2");
    eventually("web removed", || h.project("web").is_none() && names(&h.store).len() == 1).await;
    eventually("web torn down", || h.compose.downs().contains(&"web".to_string())).await;
    assert!(h.project("demo").is_some());
    h.stop().await;
}
