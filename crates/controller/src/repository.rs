//! Repository controller: git state into `Repository` status, status into `Project`s.
//!
//! Regular repositories move Discovered → Cloned (status carries local path
//! and commit) → Synced (project derived). The config-repo singleton is
//! routed to manifest reconciliation instead.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use recoon_core::config::RetryConfig;
use recoon_core::{
    project_namespace, Event, EventType, NamespaceName, ObjectRef, Project, ProjectSpec, Repository, RepositorySpec,
    RepositoryStatus, CONFIG_REPO_NAME, SYSTEM_NAMESPACE,
};
use recoon_hub::{consume_with_backlog, CancellationToken, Watcher};
use recoon_ops::{checkout_name, GitClient};
use recoon_store::{ListOptions, Store};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::configrepo::{reconcile_manifest, Manifest, MANIFEST_FILE};
use crate::{is_identity_error, resync_backlog};

pub fn is_config_repo(nn: &NamespaceName) -> bool { nn.namespace == SYSTEM_NAMESPACE && nn.name == CONFIG_REPO_NAME }

pub struct RepositoryController {
    handler: RepositoryHandler,
    events: mpsc::Receiver<Event>,
    retry: RetryConfig,
}

impl RepositoryController {
    pub fn new(watcher: &Watcher, store: Store, git: Arc<dyn GitClient>, retry: RetryConfig) -> Result<Self> {
        let vk = store.version_kind::<Repository>()?;
        let events = watcher.watch(&[vk]);
        Ok(Self { handler: RepositoryHandler { store, git }, events, retry })
    }

    /// Every stored repository is queued once behind live events before the loop settles.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let backlog = resync_backlog::<Repository>(&self.handler.store).context("repository startup resync")?;
        info!(count = backlog.len(), "repository controller: resync queued");
        let h = &self.handler;
        consume_with_backlog("repository-controller", &cancel, self.retry, backlog, &mut self.events, move |ev| h.handle(ev)).await
    }
}

/// Event handling, separate from the subscription so it can be driven directly.
pub struct RepositoryHandler {
    store: Store,
    git: Arc<dyn GitClient>,
}

impl RepositoryHandler {
    pub fn new(store: Store, git: Arc<dyn GitClient>) -> Self { Self { store, git } }

    pub async fn handle(&self, ev: Event) -> Result<()> {
        let nn = ev.object.namespace_name();
        if is_config_repo(&nn) {
            return self.handle_config_repo(ev).await;
        }
        match ev.kind {
            EventType::Add => self.sync_checkout(&nn).await,
            EventType::Update => self.handle_update(&nn).await,
            EventType::Delete => self.handle_delete(ev).await,
        }
    }

    async fn handle_config_repo(&self, ev: Event) -> Result<()> {
        if ev.kind == EventType::Delete {
            error!("config-repo object was deleted; it is recreated by the next sync");
            return Ok(());
        }
        let repo = match self.store.get::<Repository>(&ev.object.namespace_name()) {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let Some(spec) = repo.spec else { return Ok(()) };
        let checkout = self.git.open_or_clone(&spec.url, &spec.branch).await.context("opening config repo")?;
        if let Err(e) = self.git.pull(&checkout).await {
            warn!(error = %format!("{e:#}"), "config repo: pull failed, using current worktree");
        }
        let raw = checkout.read_file(MANIFEST_FILE).await?;
        let manifest = Manifest::parse(&raw).with_context(|| format!("parsing {MANIFEST_FILE}"))?;
        let diff = reconcile_manifest(&self.store, &manifest).await?;
        info!(created = diff.created.len(), deleted = diff.deleted.len(), unchanged = diff.unchanged, "config repo: reconciled");
        Ok(())
    }

    /// Clone or open the checkout, pull, and record local path and commit when the commit moved.
    async fn sync_checkout(&self, nn: &NamespaceName) -> Result<()> {
        let mut repo = match self.store.get::<Repository>(nn) {
            Ok(r) => r,
            Err(e) if e.is_not_found() => {
                debug!(repo = %nn, "repository gone before clone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(spec) = repo.spec.clone() else { return Ok(()) };
        let checkout = self
            .git
            .open_or_clone(&spec.url, &spec.branch)
            .await
            .with_context(|| format!("cloning {}#{}", spec.url, spec.branch))?;
        self.git.pull(&checkout).await.with_context(|| format!("pulling {}#{}", spec.url, spec.branch))?;
        let commit = self.git.current_commit_id(&checkout).await?;
        let local_path = checkout.local_path().to_string_lossy().to_string();

        let status = repo.status.get_or_insert_with(RepositoryStatus::default);
        if status.current_commit_id == commit && status.local_path == local_path {
            debug!(repo = %nn, commit = %commit, "repository: up to date");
            return Ok(());
        }
        status.current_commit_id = commit.clone();
        status.local_path = local_path;
        self.store.update(repo).await.with_context(|| format!("recording commit of {nn}"))?;
        info!(repo = %nn, commit = %commit, "repository: checkout synced");
        Ok(())
    }

    async fn handle_update(&self, nn: &NamespaceName) -> Result<()> {
        let repo = match self.store.get::<Repository>(nn) {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match (&repo.spec, &repo.status) {
            (None, _) => Ok(()),
            (Some(_), None) => self.sync_checkout(nn).await,
            (Some(_), Some(_)) => self.sync_project(&repo).await,
        }
    }

    /// Create or re-point the project the repository declares.
    async fn sync_project(&self, repo: &Repository) -> Result<()> {
        let (Some(spec), Some(status)) = (&repo.spec, &repo.status) else { return Ok(()) };
        if spec.project_name.is_empty() {
            debug!(repo = %repo.metadata.namespace_name(), "repository: no project declared");
            return Ok(());
        }
        let nn = NamespaceName::new(project_namespace(&spec.project_name), &spec.project_name);
        let desired = ProjectSpec {
            local_path: status.local_path.clone(),
            repo: ObjectRef::to(repo),
            commit_id: status.current_commit_id.clone(),
            compose_path: spec.path.clone(),
        };
        match self.store.get::<Project>(&nn) {
            Ok(mut project) => {
                if project.spec.as_ref() == Some(&desired) {
                    return Ok(());
                }
                project.spec = Some(desired);
                self.store.update(project).await.with_context(|| format!("updating project {nn}"))?;
                info!(project = %nn, commit = %status.current_commit_id, "repository: project updated");
            }
            Err(e) if e.is_not_found() => match self.store.create(Project::new(&nn.namespace, &nn.name, desired)).await {
                Ok(_) => info!(project = %nn, commit = %status.current_commit_id, "repository: project created"),
                Err(e) if is_identity_error(&e) => warn!(project = %nn, error = %e, "repository: invalid project name"),
                Err(e) => return Err(anyhow::Error::new(e).context(format!("creating project {nn}"))),
            },
            Err(e) => return Err(anyhow::Error::new(e).context(format!("getting project {nn}"))),
        }
        Ok(())
    }

    async fn handle_delete(&self, ev: Event) -> Result<()> {
        let Some(old) = ev.object.to_resource::<Repository>() else {
            warn!(repo = %ev.object.namespace_name(), "repository: undecodable tombstone");
            return Ok(());
        };
        let nn = old.metadata.namespace_name();
        let Some(spec) = &old.spec else { return Ok(()) };

        if let Some(status) = old.status.as_ref().filter(|s| !s.local_path.is_empty()) {
            if self.shares_checkout(&nn, spec)? {
                info!(repo = %nn, path = %status.local_path, "repository: checkout still in use, keeping it");
            } else {
                remove_checkout(Path::new(&status.local_path)).await?;
                info!(repo = %nn, path = %status.local_path, "repository: checkout removed");
            }
        }

        if spec.project_name.is_empty() {
            return Ok(());
        }
        if self.project_claimed_elsewhere(&nn, &spec.project_name)? {
            info!(repo = %nn, project = %spec.project_name, "repository: project claimed by another repository");
            return Ok(());
        }
        let pnn = NamespaceName::new(project_namespace(&spec.project_name), &spec.project_name);
        self.store.delete_of::<Project>(&pnn).await.with_context(|| format!("deleting project {pnn}"))?;
        Ok(())
    }

    /// Whether any other repository resolves to the same checkout as `spec`.
    ///
    /// Manifest entries are named after their checkout, so a prefix list
    /// usually answers; otherwise every repository is compared.
    fn shares_checkout(&self, deleted: &NamespaceName, spec: &RepositorySpec) -> Result<bool> {
        let checkout = checkout_name(&spec.url, &spec.branch);
        let same = |r: &Repository| {
            r.metadata.namespace_name() != *deleted
                && r.spec.as_ref().is_some_and(|s| checkout_name(&s.url, &s.branch) == checkout)
        };
        let prefixed = ListOptions::in_namespace(&deleted.namespace).with_name_prefix(&checkout);
        if self.store.list_or_empty::<Repository>(&prefixed)?.iter().any(same) {
            return Ok(true);
        }
        Ok(self.store.list_or_empty::<Repository>(&ListOptions::all())?.iter().any(same))
    }

    fn project_claimed_elsewhere(&self, deleted: &NamespaceName, project_name: &str) -> Result<bool> {
        let all = self.store.list_or_empty::<Repository>(&ListOptions::all())?;
        Ok(all.iter().any(|r| {
            r.metadata.namespace_name() != *deleted && r.spec.as_ref().is_some_and(|s| s.project_name == project_name)
        }))
    }
}

async fn remove_checkout(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context(format!("removing {}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_the_config_repo_singleton() {
        assert!(is_config_repo(&NamespaceName::new(SYSTEM_NAMESPACE, CONFIG_REPO_NAME)));
        assert!(!is_config_repo(&NamespaceName::new("default", CONFIG_REPO_NAME)));
        assert!(!is_config_repo(&NamespaceName::new(SYSTEM_NAMESPACE, "other")));
    }
}
