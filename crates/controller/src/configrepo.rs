//! Config repo: the manifest that declares every managed repository, and the
//! syncer that keeps the `recoon-system/config-repo` object on its latest commit.
//!
//! Manifest entries are stored under `repository_name(url, branch, path)`. A
//! spec change therefore changes the name, so reconciliation only ever
//! creates and deletes; re-running it against the same manifest is a no-op.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use recoon_core::config::ConfigRepoConfig;
use recoon_core::{
    NamespaceName, Repository, RepositorySpec, RepositoryStatus, CONFIG_REPO_NAME, DEFAULT_NAMESPACE, SYSTEM_NAMESPACE,
};
use recoon_hub::CancellationToken;
use recoon_ops::{repository_name, GitClient};
use recoon_store::{ListOptions, Store};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::is_identity_error;

/// Manifest location relative to the config repo checkout.
pub const MANIFEST_FILE: &str = ".recoon.config.yml";

const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub repos: Vec<ManifestRepo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRepo {
    /// Project name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub path: String,
}

impl Manifest {
    /// An empty document is an empty manifest.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_slice(raw)?)
    }

    /// Desired repositories keyed by store name. Entries without url or name are skipped.
    pub fn desired(&self) -> BTreeMap<String, RepositorySpec> {
        let mut out = BTreeMap::new();
        for entry in &self.repos {
            if entry.url.trim().is_empty() || entry.name.trim().is_empty() {
                warn!(name = %entry.name, url = %entry.url, "manifest: entry without name or url skipped");
                continue;
            }
            let branch = if entry.branch.trim().is_empty() { DEFAULT_BRANCH } else { entry.branch.trim() };
            let spec = RepositorySpec {
                project_name: entry.name.trim().to_string(),
                url: entry.url.trim().to_string(),
                branch: branch.to_string(),
                path: entry.path.trim().to_string(),
            };
            out.insert(repository_name(&spec.url, &spec.branch, &spec.path), spec);
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: usize,
}

impl ManifestDiff {
    pub fn is_noop(&self) -> bool { self.created.is_empty() && self.deleted.is_empty() }
}

/// Converge the repositories of the default namespace onto `manifest`.
pub async fn reconcile_manifest(store: &Store, manifest: &Manifest) -> Result<ManifestDiff> {
    let desired = manifest.desired();
    let current = store
        .list_or_empty::<Repository>(&ListOptions::in_namespace(DEFAULT_NAMESPACE))
        .context("listing repositories")?;
    let mut diff = ManifestDiff::default();

    for (name, spec) in &desired {
        if current.iter().any(|r| &r.metadata.name == name) {
            diff.unchanged += 1;
            continue;
        }
        match store.create(Repository::new(DEFAULT_NAMESPACE, name, spec.clone())).await {
            Ok(_) => {
                info!(repo = %name, project = %spec.project_name, "manifest: repository created");
                diff.created.push(name.clone());
            }
            Err(e) if e.is_already_exists() => debug!(repo = %name, "manifest: created concurrently"),
            Err(e) if is_identity_error(&e) => warn!(repo = %name, error = %e, "manifest: invalid repository name"),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("creating repository {name}"))),
        }
    }

    let vk = store.version_kind::<Repository>()?;
    for stale in current.iter().filter(|r| !desired.contains_key(&r.metadata.name)) {
        let nn = stale.metadata.namespace_name();
        store.delete(&vk, &nn).await.with_context(|| format!("deleting repository {nn}"))?;
        info!(repo = %nn, "manifest: repository deleted");
        diff.deleted.push(stale.metadata.name.clone());
    }
    Ok(diff)
}

/// Keeps the config-repo object on the configured branch's latest commit.
pub struct ConfigRepoSyncer {
    store: Store,
    git: Arc<dyn GitClient>,
    url: String,
    branch: String,
    interval: Duration,
}

impl ConfigRepoSyncer {
    pub fn new(store: Store, git: Arc<dyn GitClient>, cfg: &ConfigRepoConfig) -> Self {
        Self { store, git, url: cfg.clone_url.clone(), branch: cfg.branch.clone(), interval: cfg.interval }
    }

    /// Idles until cancelled when no clone url is configured.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        if self.url.is_empty() {
            info!("config repo: no clone url configured, syncer idle");
            cancel.cancelled().await;
            return Ok(());
        }
        info!(url = %self.url, branch = %self.branch, "config repo: syncer started");
        loop {
            if let Err(e) = self.sync_once().await {
                warn!(error = %format!("{e:#}"), "config repo: sync failed, retrying next tick");
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Pull and record the commit. Returns whether the stored object changed.
    pub async fn sync_once(&self) -> Result<bool> {
        let checkout = self.git.open_or_clone(&self.url, &self.branch).await.context("opening config repo")?;
        self.git.pull(&checkout).await.context("pulling config repo")?;
        let commit = self.git.current_commit_id(&checkout).await?;
        let spec = RepositorySpec { project_name: String::new(), url: self.url.clone(), branch: self.branch.clone(), path: String::new() };
        let status = RepositoryStatus {
            local_path: checkout.local_path().to_string_lossy().to_string(),
            current_commit_id: commit.clone(),
            ..Default::default()
        };

        let nn = NamespaceName::new(SYSTEM_NAMESPACE, CONFIG_REPO_NAME);
        match self.store.get::<Repository>(&nn) {
            Ok(mut repo) => {
                let same_commit = repo.status.as_ref().is_some_and(|s| s.current_commit_id == commit);
                if same_commit && repo.spec.as_ref() == Some(&spec) {
                    return Ok(false);
                }
                repo.spec = Some(spec);
                repo.status = Some(status);
                self.store.update(repo).await.context("updating config repo")?;
            }
            Err(e) if e.is_not_found() => {
                let mut repo = Repository::new(SYSTEM_NAMESPACE, CONFIG_REPO_NAME, spec);
                repo.status = Some(status);
                self.store.create(repo).await.context("creating config repo")?;
            }
            Err(e) => return Err(e.into()),
        }
        info!(commit = %commit, "config repo: new commit recorded");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_and_derives_names() {
        let raw = br#"
repos:
  - name: demo
    url: git@x:y.git
    branch: main
    path: svc
  - name: web
    url: https://example.com/org/web.git
  - name: broken
    url: ""
  - url: git@x:nameless.git
"#;
        let m = Manifest::parse(raw).expect("parse");
        assert_eq!(m.repos.len(), 4);
        let desired = m.desired();
        assert_eq!(desired.len(), 2);
        let demo = desired.get("x_y#main#svc").expect("demo");
        assert_eq!(demo.project_name, "demo");
        assert_eq!(demo.path, "svc");
        let web = desired.get("example.com_org_web#main").expect("web defaults to main");
        assert_eq!(web.branch, "main");
    }

    #[test]
    fn empty_manifest_declares_nothing() {
        assert_eq!(Manifest::parse(b"\n").expect("parse"), Manifest::default());
        assert_eq!(Manifest::parse(b"repos: []\n").expect("parse").desired().len(), 0);
        assert!(Manifest::parse(b"repos: {").is_err());
    }
}
