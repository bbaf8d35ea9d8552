//! Event controller: container stop/die/destroy into a project resync.
//!
//! The controller only bumps the owning project's resource version; deciding
//! whether to restart is left to the project controller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use recoon_core::config::ContainerConfig;
use recoon_core::{project_namespace, NamespaceName, Project};
use recoon_hub::CancellationToken;
use recoon_ops::{ContainerEvent, ContainerEvents};
use recoon_store::Store;
use tracing::{debug, info, warn};

pub struct EventController {
    store: Store,
    source: Arc<dyn ContainerEvents>,
    backoff: Duration,
}

impl EventController {
    pub fn new(store: Store, source: Arc<dyn ContainerEvents>) -> Self {
        Self { store, source, backoff: ContainerConfig::default().resubscribe_backoff }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("event controller: started");
        loop {
            match self.source.subscribe().await {
                Ok(mut handle) => loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            handle.cancel.cancel();
                            return Ok(());
                        }
                        next = handle.rx.recv() => match next {
                            Some(ev) => self.on_event(&ev).await?,
                            None => {
                                warn!("event controller: container event stream lost, resubscribing");
                                break;
                            }
                        }
                    }
                },
                Err(e) => warn!(error = %format!("{e:#}"), "event controller: subscribe failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }

    async fn on_event(&self, ev: &ContainerEvent) -> Result<()> {
        if !ev.is_stop() {
            return Ok(());
        }
        let Some(project) = ev.project() else {
            debug!(container = %ev.actor.id, action = %ev.action, "event controller: container outside any project");
            return Ok(());
        };
        debug!(project = %project, container = %ev.actor.id, action = %ev.action, "event controller: container stopped");
        self.trigger(project).await
    }

    /// Unchanged update of the project; a missing project was already torn down.
    pub async fn trigger(&self, project: &str) -> Result<()> {
        let nn = NamespaceName::new(project_namespace(project), project);
        let p = match self.store.get::<Project>(&nn) {
            Ok(p) => p,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match self.store.update(p).await {
            Ok(_) => Ok(()),
            // A concurrent write already produced an event for the project.
            Err(e) if e.is_conflict() || e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
