//! Compose/container collaborator on top of the `docker` CLI.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cmd;

/// Label compose puts on every container of a project.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    /// Engine state, e.g. `running`, `exited`.
    pub state: String,
    /// Human status, e.g. `Up 2 hours`.
    pub status: String,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool { self.state == "running" }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[async_trait]
pub trait ComposeOps: Send + Sync {
    /// Bring the project in `dir` up, rebuilding and removing orphans.
    async fn up(&self, project: &str, dir: &Path) -> Result<()>;
    async fn down(&self, project: &str) -> Result<()>;
    /// Every container labelled with the project, running or not.
    async fn status(&self, project: &str) -> Result<Vec<ContainerSummary>>;
    /// Raw `--timestamps` output; see [`parse_log_lines`].
    async fn logs(&self, container_id: &str, since: Option<&str>, tail: usize) -> Result<String>;
}

pub struct DockerCompose {
    docker: String,
}

impl Default for DockerCompose {
    fn default() -> Self { Self { docker: "docker".into() } }
}

impl DockerCompose {
    pub fn new(docker: impl Into<String>) -> Self { Self { docker: docker.into() } }
}

#[async_trait]
impl ComposeOps for DockerCompose {
    async fn up(&self, project: &str, dir: &Path) -> Result<()> {
        cmd::run(&self.docker, &["compose", "-p", project, "up", "-d", "--build", "--quiet-pull", "--remove-orphans"], Some(dir), &[])
            .await
            .with_context(|| format!("compose up {project}"))?;
        info!(project = %project, dir = %dir.display(), "compose: up ok");
        Ok(())
    }

    async fn down(&self, project: &str) -> Result<()> {
        cmd::run(&self.docker, &["compose", "-p", project, "down", "--remove-orphans", "--rmi", "all"], None, &[])
            .await
            .with_context(|| format!("compose down {project}"))?;
        info!(project = %project, "compose: down ok");
        Ok(())
    }

    async fn status(&self, project: &str) -> Result<Vec<ContainerSummary>> {
        let filter = format!("label={COMPOSE_PROJECT_LABEL}={project}");
        let out = cmd::run(&self.docker, &["ps", "-a", "--no-trunc", "--filter", &filter, "--format", "{{json .}}"], None, &[])
            .await
            .with_context(|| format!("listing containers of {project}"))?;
        let containers = parse_ps_lines(&out.stdout)?;
        debug!(project = %project, count = containers.len(), "compose: status");
        Ok(containers)
    }

    async fn logs(&self, container_id: &str, since: Option<&str>, tail: usize) -> Result<String> {
        let tail = tail.to_string();
        let mut args = vec!["logs", "--timestamps", "--tail", tail.as_str()];
        if let Some(s) = since.filter(|s| !s.is_empty()) {
            args.extend(["--since", s]);
        }
        args.push(container_id);
        let out = cmd::run(&self.docker, &args, None, &[]).await.with_context(|| format!("logs of {container_id}"))?;
        // Containers log to both streams.
        Ok(match (out.stdout.is_empty(), out.stderr.is_empty()) {
            (_, true) => out.stdout,
            (true, false) => out.stderr,
            (false, false) => format!("{}\n{}", out.stdout, out.stderr),
        })
    }
}

#[derive(Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
}

/// One JSON object per line, as printed by `docker ps --format '{{json .}}'`.
pub fn parse_ps_lines(stdout: &str) -> Result<Vec<ContainerSummary>> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let raw: PsLine = serde_json::from_str(l).with_context(|| format!("decoding container line {l:?}"))?;
            Ok(ContainerSummary {
                id: raw.id,
                image: raw.image,
                labels: parse_labels(&raw.labels),
                state: raw.state,
                status: raw.status,
            })
        })
        .collect()
}

/// `k=v,k2=v2` into a map. Entries without `=` are kept with an empty value.
pub fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (kv.to_string(), String::new()),
        })
        .collect()
}

/// Lines look like `2024-05-01T10:00:00.123456789Z message`; others are skipped.
pub fn parse_log_lines(text: &str) -> Vec<LogLine> {
    text.lines()
        .filter_map(|l| {
            let (ts, msg) = l.split_once(' ').unwrap_or((l, ""));
            let timestamp = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
            Some(LogLine { timestamp, message: msg.to_string() })
        })
        .collect()
}
