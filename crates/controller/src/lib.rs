//! Recoon controllers.
//!
//! Every controller owns one watcher subscription and runs its handler under
//! the bounded retry of `recoon_hub::consume`. Controllers talk to each other
//! only through the store: the repository controller derives projects from
//! git state, the project controller drives compose, the event controller
//! and the puller feed external change back in as store updates.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use recoon_core::{Config, Event, Resource, StoreError};
use recoon_hub::{Runner, Watcher};
use recoon_ops::{ComposeOps, ContainerEvents, GitClient};
use recoon_store::{ListOptions, Store};
use tokio::sync::mpsc;
use tracing::info;

pub mod configrepo;
pub mod event;
pub mod project;
pub mod puller;
pub mod repository;

pub use configrepo::{reconcile_manifest, ConfigRepoSyncer, Manifest, ManifestDiff, ManifestRepo, MANIFEST_FILE};
pub use event::EventController;
pub use project::ProjectController;
pub use puller::{PullReport, Puller};
pub use repository::RepositoryController;

/// External systems the controllers act on.
#[derive(Clone)]
pub struct Collaborators {
    pub git: Arc<dyn GitClient>,
    pub compose: Arc<dyn ComposeOps>,
    pub events: Arc<dyn ContainerEvents>,
}

/// Subscribe every controller and add it, together with the watcher, to `runner`.
///
/// `trigger` requests an immediate puller cycle.
pub fn register(
    runner: &mut Runner,
    watcher: Arc<Watcher>,
    store: Store,
    collab: Collaborators,
    cfg: &Config,
    trigger: mpsc::Receiver<()>,
) -> Result<()> {
    let repos = RepositoryController::new(&watcher, store.clone(), collab.git.clone(), cfg.retry)?;
    let projects = ProjectController::new(&watcher, store.clone(), collab.compose.clone(), &cfg.containers, cfg.retry)?;
    let events = EventController::new(store.clone(), collab.events.clone()).with_backoff(cfg.containers.resubscribe_backoff);
    let puller = Puller::new(store.clone(), collab.git.clone(), &cfg.app_repo, trigger);
    let syncer = ConfigRepoSyncer::new(store, collab.git, &cfg.config_repo);

    runner.add_fn("watcher", move |cancel| async move { watcher.run(cancel).await });
    runner.add_fn("repository-controller", move |cancel| repos.run(cancel));
    runner.add_fn("project-controller", move |cancel| projects.run(cancel));
    runner.add_fn("event-controller", move |cancel| events.run(cancel));
    runner.add_fn("puller", move |cancel| puller.run(cancel));
    runner.add_fn("config-repo", move |cancel| syncer.run(cancel));
    info!("controllers registered");
    Ok(())
}

/// One synthetic update per stored object of kind `T`, so a restarted
/// controller passes every object through its update path once.
pub(crate) fn resync_backlog<T: Resource>(store: &Store) -> Result<Vec<Event>> {
    let all = store.list_or_empty::<T>(&ListOptions::all()).context("listing for resync")?;
    Ok(all
        .into_iter()
        .map(|obj| {
            let object = obj.into_object();
            Event::update(object.clone(), object)
        })
        .collect())
}

/// Malformed identities are input errors; retrying cannot fix them.
pub(crate) fn is_identity_error(e: &StoreError) -> bool {
    matches!(e, StoreError::NameEmpty | StoreError::NamespaceEmpty | StoreError::Invalid(_))
}
