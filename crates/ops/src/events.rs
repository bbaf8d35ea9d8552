//! Live container lifecycle events from the engine.

use std::collections::BTreeMap;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::compose::COMPOSE_PROJECT_LABEL;
use crate::{cmd, pump_lines, CancelHandle, StreamHandle};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Actor {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerEvent {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: Actor,
}

impl ContainerEvent {
    /// Compose project owning the container, if any.
    pub fn project(&self) -> Option<&str> {
        self.actor.attributes.get(COMPOSE_PROJECT_LABEL).map(String::as_str).filter(|p| !p.is_empty())
    }

    /// Container stopped, died or was removed.
    pub fn is_stop(&self) -> bool {
        self.kind == "container" && matches!(self.action.as_str(), "stop" | "die" | "destroy")
    }
}

#[async_trait]
pub trait ContainerEvents: Send + Sync {
    /// The receiver closing means the connection to the engine was lost.
    async fn subscribe(&self) -> Result<StreamHandle<ContainerEvent>>;
}

pub struct DockerEvents {
    docker: String,
    capacity: usize,
}

impl Default for DockerEvents {
    fn default() -> Self { Self { docker: "docker".into(), capacity: 256 } }
}

impl DockerEvents {
    pub fn new(docker: impl Into<String>, capacity: usize) -> Self { Self { docker: docker.into(), capacity: capacity.max(1) } }
}

#[async_trait]
impl ContainerEvents for DockerEvents {
    async fn subscribe(&self) -> Result<StreamHandle<ContainerEvent>> {
        let mut child = cmd::command(&self.docker, &["events", "--filter", "type=container", "--format", "{{json .}}"], None, &[])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning docker events")?;
        let stdout = child.stdout.take().context("docker events: no stdout")?;
        let (tx, rx) = mpsc::channel::<ContainerEvent>(self.capacity);
        let (cancel, cancel_rx) = CancelHandle::pair();
        tokio::spawn(async move {
            info!("container events stream starting");
            pump_lines(ReaderStream::new(stdout), tx, cancel_rx, "docker-events", parse_event).await;
            let _ = child.kill().await;
        });
        Ok(StreamHandle { rx, cancel })
    }
}

fn parse_event(line: &str) -> Option<ContainerEvent> {
    match serde_json::from_str(line) {
        Ok(ev) => Some(ev),
        Err(e) => {
            debug!(error = %e, "container events: undecodable line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_engine_event() {
        let line = r#"{"status":"die","id":"abc","Type":"container","Action":"die","Actor":{"ID":"abc","Attributes":{"com.docker.compose.project":"demo","exitCode":"1"}},"scope":"local","time":1714557600}"#;
        let ev = parse_event(line).expect("decode");
        assert!(ev.is_stop());
        assert_eq!(ev.project(), Some("demo"));
        assert_eq!(ev.actor.id, "abc");

        let start = ContainerEvent { kind: "container".into(), action: "start".into(), actor: Actor::default() };
        assert!(!start.is_stop());
        assert_eq!(start.project(), None);
        assert!(parse_event("{").is_none());
    }
}
