//! Periodic and on-demand git sync of every project's repository.
//!
//! Repositories are grouped by local checkout so a shared clone is pulled
//! once per cycle. A repository is only updated when its commit moved.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use recoon_core::config::AppRepoConfig;
use recoon_core::{Project, Repository};
use recoon_hub::CancellationToken;
use recoon_ops::GitClient;
use recoon_store::{ListOptions, Store};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub groups: usize,
    pub failed: usize,
    pub updated: usize,
    pub orphaned: usize,
}

pub struct Puller {
    store: Store,
    git: Arc<dyn GitClient>,
    interval: Duration,
    pull_timeout: Duration,
    trigger: mpsc::Receiver<()>,
}

impl Puller {
    pub fn new(store: Store, git: Arc<dyn GitClient>, cfg: &AppRepoConfig, trigger: mpsc::Receiver<()>) -> Self {
        Self { store, git, interval: cfg.interval, pull_timeout: cfg.pull_timeout, trigger }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(interval_ms = self.interval.as_millis() as u64, "puller: started");
        let mut trigger_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
                t = self.trigger.recv(), if trigger_open => match t {
                    Some(()) => debug!("puller: reconcile requested"),
                    None => {
                        trigger_open = false;
                        continue;
                    }
                },
            }
            match self.run_once(&cancel).await {
                Ok(r) => debug!(groups = r.groups, failed = r.failed, updated = r.updated, orphaned = r.orphaned, "puller: cycle done"),
                Err(e) => warn!(error = %format!("{e:#}"), "puller: cycle failed"),
            }
        }
    }

    /// One sync cycle over every project.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<PullReport> {
        let started = Instant::now();
        let mut report = PullReport::default();
        let projects = self.store.list_or_empty::<Project>(&ListOptions::all()).context("listing projects")?;

        let mut groups: BTreeMap<String, Vec<Repository>> = BTreeMap::new();
        for project in projects {
            let Some(spec) = &project.spec else { continue };
            let pnn = project.metadata.namespace_name();
            let repo = match self.store.get::<Repository>(&spec.repo.namespace_name()) {
                Ok(r) => r,
                Err(e) if e.is_not_found() => {
                    info!(project = %pnn, repo = %spec.repo.namespace_name(), "puller: repository gone, deleting project");
                    self.store.delete_of::<Project>(&pnn).await.with_context(|| format!("deleting orphan {pnn}"))?;
                    report.orphaned += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let Some(status) = &repo.status else { continue };
            if repo.spec.is_none() || status.local_path.is_empty() {
                continue;
            }
            let group = groups.entry(status.local_path.clone()).or_default();
            if !group.iter().any(|r| r.metadata.name == repo.metadata.name && r.metadata.namespace == repo.metadata.namespace) {
                group.push(repo);
            }
        }

        report.groups = groups.len();
        for (path, repos) in groups {
            if cancel.is_cancelled() {
                break;
            }
            let Some(commit) = self.pull_group(&path, &repos).await else {
                report.failed += 1;
                continue;
            };
            for mut repo in repos {
                let nn = repo.metadata.namespace_name();
                let Some(status) = repo.status.as_mut() else { continue };
                if status.current_commit_id == commit {
                    continue;
                }
                status.current_commit_id = commit.clone();
                match self.store.update(repo).await {
                    Ok(_) => {
                        report.updated += 1;
                        info!(repo = %nn, commit = %commit, "puller: new commit");
                    }
                    Err(e) if e.is_not_found() => debug!(repo = %nn, "puller: repository deleted meanwhile"),
                    Err(e) => warn!(repo = %nn, error = %e, "puller: update failed, retrying next cycle"),
                }
            }
        }
        histogram!("puller_cycle_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(report)
    }

    /// Pull the shared checkout once. `None` when it failed or timed out.
    async fn pull_group(&self, path: &str, repos: &[Repository]) -> Option<String> {
        let first = repos.first()?;
        let spec = first.spec.as_ref()?;
        counter!("puller_pull_total", 1u64);
        let pull = async {
            let checkout = self.git.open_or_clone(&spec.url, &spec.branch).await?;
            self.git.pull(&checkout).await?;
            self.git.current_commit_id(&checkout).await
        };
        let err = match tokio::time::timeout(self.pull_timeout, pull).await {
            Ok(Ok(commit)) => return Some(commit),
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!("timed out after {:?}", self.pull_timeout),
        };
        counter!("puller_pull_failed_total", 1u64);
        warn!(path = %path, repo = %first.metadata.namespace_name(), error = %err, "puller: pull failed");
        None
    }
}
