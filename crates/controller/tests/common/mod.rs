#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use recoon_controller::{register, Collaborators};
use recoon_core::config::RetryConfig;
use recoon_core::{Config, Event, NamespaceName, ObjectKind, Project, Resource};
use recoon_hub::{CancellationToken, Runner, Watcher};
use recoon_ops::mock::{MockCompose, MockEvents, MockGit};
use recoon_persist::SqliteKv;
use recoon_schema::Schema;
use recoon_store::Store;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Harness {
    pub store: Store,
    pub git: Arc<MockGit>,
    pub compose: Arc<MockCompose>,
    pub events: Arc<MockEvents>,
    pub trigger: mpsc::Sender<()>,
    pub tmp: TempDir,
    cancel: CancellationToken,
    run: Option<JoinHandle<anyhow::Result<()>>>,
}

pub fn test_config(tmp: &TempDir) -> Config {
    let mut cfg = Config::default();
    cfg.store.git_dir = tmp.path().join("repos");
    cfg.retry = RetryConfig { attempts: 5, backoff: Duration::from_millis(20) };
    cfg.app_repo.interval = Duration::from_secs(3600);
    cfg.app_repo.pull_timeout = Duration::from_secs(5);
    cfg.watcher.send_timeout = Duration::from_secs(2);
    cfg.containers.restart_backoff = Duration::from_millis(200);
    cfg.containers.resubscribe_backoff = Duration::from_millis(50);
    cfg
}

pub fn open_store() -> (Store, mpsc::Receiver<Event>) {
    let (store, events) = Store::open(SqliteKv::open_in_memory().expect("kv"), Schema::builtin(), 100).expect("store");
    for kind in ObjectKind::ALL {
        store.ensure_partition(kind).expect("partition");
    }
    (store, events)
}

impl Harness {
    pub async fn start() -> Self { Self::start_with(|_| {}).await }

    /// `tune` adjusts the config and may seed the mock git before anything runs.
    pub async fn start_with(tune: impl FnOnce(&mut Config)) -> Self {
        let (store, rx) = open_store();
        Self::launch(store, rx, tune).await
    }

    /// Start over a store that already holds objects, as after a restart.
    /// Events left over from seeding are discarded.
    pub async fn launch(store: Store, mut rx: mpsc::Receiver<Event>, tune: impl FnOnce(&mut Config)) -> Self {
        while rx.try_recv().is_ok() {}
        let tmp = tempfile::tempdir().expect("tmp");
        let mut cfg = test_config(&tmp);
        tune(&mut cfg);
        let git = Arc::new(MockGit::new(&cfg.store.git_dir));
        let compose = Arc::new(MockCompose::new());
        let events = Arc::new(MockEvents::new());
        let watcher = Arc::new(Watcher::new(rx, &cfg.watcher));
        let (trigger, trigger_rx) = mpsc::channel(1);

        let cancel = CancellationToken::new();
        let mut runner = Runner::new(cancel.clone());
        let collab = Collaborators { git: git.clone(), compose: compose.clone(), events: events.clone() };
        register(&mut runner, watcher, store.clone(), collab, &cfg, trigger_rx).expect("register");
        runner.start_all();
        let run = tokio::spawn(runner.wait());
        Self { store, git, compose, events, trigger, tmp, cancel, run: Some(run) }
    }

    pub fn git_dir(&self) -> std::path::PathBuf { self.tmp.path().join("repos") }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(run) = self.run.take() {
            run.await.expect("join").expect("runner exits cleanly");
        }
    }

    pub fn project(&self, name: &str) -> Option<Project> {
        self.store.get::<Project>(&NamespaceName::new(format!("project-{name}"), name)).ok()
    }

    pub fn get<T: Resource>(&self, ns: &str, name: &str) -> Option<T> { self.store.get::<T>(&NamespaceName::new(ns, name)).ok() }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Let in-flight events drain.
pub async fn settle() { tokio::time::sleep(Duration::from_millis(300)).await; }

pub async fn eventually_async<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}
