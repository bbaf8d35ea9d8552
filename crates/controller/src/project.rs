//! Project controller: the single owner of `compose up`.
//!
//! A restart happens when the desired commit moved away from the last applied
//! one or the observed containers drifted. Otherwise a pass only observes and
//! never calls into compose.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use metrics::counter;
use recoon_core::config::{ContainerConfig, RetryConfig};
use recoon_core::{Condition, ConditionType, Event, EventType, NamespaceName, Project, ProjectStatus};
use recoon_hub::{consume_with_backlog, CancellationToken, Watcher};
use recoon_ops::{ComposeOps, ContainerSummary};
use recoon_schema::compose::validate_dir;
use recoon_store::Store;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::resync_backlog;

pub const UP_SUCCESS_MESSAGE: &str = "docker-compose up was successful";

pub struct ProjectController {
    handler: ProjectHandler,
    events: mpsc::Receiver<Event>,
    retry: RetryConfig,
}

impl ProjectController {
    pub fn new(
        watcher: &Watcher,
        store: Store,
        compose: Arc<dyn ComposeOps>,
        containers: &ContainerConfig,
        retry: RetryConfig,
    ) -> Result<Self> {
        let vk = store.version_kind::<Project>()?;
        let events = watcher.watch(&[vk]);
        let handler = ProjectHandler::new(store, compose).with_restart_backoff(containers.restart_backoff);
        Ok(Self { handler, events, retry })
    }

    /// Every stored project is queued once behind live events before the loop settles.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let backlog = resync_backlog::<Project>(&self.handler.store).context("project startup resync")?;
        info!(count = backlog.len(), "project controller: resync queued");
        let h = &self.handler;
        consume_with_backlog("project-controller", &cancel, self.retry, backlog, &mut self.events, move |ev| h.handle(ev)).await
    }
}

pub struct ProjectHandler {
    store: Store,
    compose: Arc<dyn ComposeOps>,
    restart_backoff: Duration,
}

/// Why a pass decided to restart, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    ContainerNotRunning,
    CommitChanged,
    ContainerCountChanged,
}

/// First reason to restart, or `None` when the observed state matches.
pub fn restart_reason(status: &ProjectStatus, commit_id: &str, containers: &[ContainerSummary]) -> Option<RestartReason> {
    if containers.iter().any(|c| !c.is_running()) {
        return Some(RestartReason::ContainerNotRunning);
    }
    if status.last_applied_commit_id != commit_id {
        return Some(RestartReason::CommitChanged);
    }
    if status.container_count != containers.len() {
        return Some(RestartReason::ContainerCountChanged);
    }
    None
}

impl ProjectHandler {
    pub fn new(store: Store, compose: Arc<dyn ComposeOps>) -> Self {
        Self { store, compose, restart_backoff: ContainerConfig::default().restart_backoff }
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub async fn handle(&self, ev: Event) -> Result<()> {
        match ev.kind {
            EventType::Add | EventType::Update => self.reconcile(&ev.object.namespace_name()).await,
            EventType::Delete => {
                self.teardown(ev).await;
                Ok(())
            }
        }
    }

    async fn reconcile(&self, nn: &NamespaceName) -> Result<()> {
        let mut project = match self.store.get::<Project>(nn) {
            Ok(p) => p,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let Some(spec) = project.spec.clone() else {
            debug!(project = %nn, "project: no spec yet");
            return Ok(());
        };
        let name = project.metadata.name.clone();
        let containers = self.compose.status(&name).await.with_context(|| format!("status of {name}"))?;
        let status = project.status.get_or_insert_with(ProjectStatus::default);
        let Some(reason) = restart_reason(status, &spec.commit_id, &containers) else {
            debug!(project = %nn, containers = containers.len(), "project: in sync");
            return Ok(());
        };
        if reason != RestartReason::CommitChanged && recently_applied(status, self.restart_backoff) {
            debug!(project = %nn, reason = ?reason, "project: restarted recently, waiting");
            return Ok(());
        }

        info!(project = %nn, reason = ?reason, commit = %spec.commit_id, "project: compose up");
        status.last_applied_commit_id = spec.commit_id.clone();
        status.conditions.clear();
        let dir: PathBuf = Path::new(&spec.local_path).join(&spec.compose_path);
        counter!("compose_up_total", 1u64);
        match self.compose.up(&name, &dir).await {
            Ok(()) => {
                status.conditions.insert(ConditionType::COMPOSE_SUCCESS, Condition::now("success", UP_SUCCESS_MESSAGE));
            }
            Err(e) => {
                counter!("compose_up_failed_total", 1u64);
                warn!(project = %nn, error = %format!("{e:#}"), "project: compose up failed");
                status.conditions.insert(ConditionType::COMPOSE_FAILURE, Condition::now("failure", format!("{e:#}")));
                if let Some(msg) = schema_problem(&dir) {
                    status.conditions.insert(ConditionType::COMPOSE_SCHEMA, Condition::now("invalid", msg));
                }
            }
        }

        let observed = match self.compose.status(&name).await {
            Ok(after) => after,
            Err(e) => {
                warn!(project = %nn, error = %format!("{e:#}"), "project: status after up failed, keeping earlier view");
                containers
            }
        };
        status.container_count = observed.len();

        match self.store.update(project).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(project = %nn, "project: deleted during reconcile");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("recording status of {nn}"))),
        }
    }

    /// Deletion is terminal; a failed teardown is logged only.
    async fn teardown(&self, ev: Event) {
        let Some(project) = ev.object.to_resource::<Project>() else {
            warn!(project = %ev.object.namespace_name(), "project: undecodable tombstone");
            return;
        };
        if project.spec.is_none() {
            return;
        }
        let name = &project.metadata.name;
        match self.compose.down(name).await {
            Ok(()) => info!(project = %name, "project: torn down"),
            Err(e) => error!(project = %name, error = %format!("{e:#}"), "project: compose down failed"),
        }
    }
}

/// Whether the last `up` for the applied commit is younger than `backoff`.
/// Every `up` leaves exactly one success or failure condition behind.
fn recently_applied(status: &ProjectStatus, backoff: Duration) -> bool {
    let last_up = [ConditionType::COMPOSE_SUCCESS, ConditionType::COMPOSE_FAILURE]
        .iter()
        .filter_map(|t| status.conditions.get(t))
        .map(|c| c.last_transition_time)
        .max();
    let Some(at) = last_up else { return false };
    match (Utc::now() - at).to_std() {
        Ok(age) => age < backoff,
        // Timestamp ahead of the local clock.
        Err(_) => true,
    }
}

fn schema_problem(dir: &Path) -> Option<String> {
    match validate_dir(dir) {
        Ok(issues) if issues.is_empty() => None,
        Ok(issues) => Some(issues.iter().map(|i| format!("{}: {}", i.path, i.error)).collect::<Vec<_>>().join("; ")),
        Err(e) => Some(format!("{e:#}")),
    }
}
