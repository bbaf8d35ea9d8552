//! Recording in-memory collaborators for tests and offline frontends.
//!
//! `MockGit` materializes checkouts on the real filesystem under its git dir
//! so code reading files or removing directories behaves as in production.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::compose::{ComposeOps, ContainerSummary, COMPOSE_PROJECT_LABEL};
use crate::events::{ContainerEvent, ContainerEvents};
use crate::git::{checkout_name, GitCheckout, GitClient};
use crate::{CancelHandle, StreamHandle};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

#[derive(Default)]
struct Remote {
    commit: String,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct GitState {
    remotes: HashMap<(String, String), Remote>,
    heads: HashMap<PathBuf, String>,
    failing: HashSet<String>,
    hanging: HashSet<String>,
    clones: usize,
    pulls: Vec<PathBuf>,
}

pub struct MockGit {
    git_dir: PathBuf,
    state: Mutex<GitState>,
}

impl MockGit {
    pub fn new(git_dir: impl Into<PathBuf>) -> Self { Self { git_dir: git_dir.into(), state: Mutex::new(GitState::default()) } }

    /// Move the remote branch to `commit`.
    pub fn set_head(&self, url: &str, branch: &str, commit: &str) {
        lock(&self.state).remotes.entry((url.into(), branch.into())).or_default().commit = commit.into();
    }

    /// Stage a file on the remote branch; visible locally after the next clone or pull.
    pub fn put_file(&self, url: &str, branch: &str, rel: &str, body: impl Into<Vec<u8>>) {
        lock(&self.state).remotes.entry((url.into(), branch.into())).or_default().files.insert(rel.into(), body.into());
    }

    /// Make every operation on `url` fail.
    pub fn set_failing(&self, url: &str, failing: bool) {
        let mut st = lock(&self.state);
        if failing { st.failing.insert(url.into()); } else { st.failing.remove(url); }
    }

    /// Make clone and pull on `url` never complete, like a stalled network.
    pub fn set_hanging(&self, url: &str, hanging: bool) {
        let mut st = lock(&self.state);
        if hanging { st.hanging.insert(url.into()); } else { st.hanging.remove(url); }
    }

    async fn stall_if_hanging(&self, url: &str) {
        let hanging = lock(&self.state).hanging.contains(url);
        if hanging {
            std::future::pending::<()>().await;
        }
    }

    pub fn clone_count(&self) -> usize { lock(&self.state).clones }
    pub fn pull_count(&self) -> usize { lock(&self.state).pulls.len() }
    pub fn pulls_of(&self, path: &Path) -> usize { lock(&self.state).pulls.iter().filter(|p| p.as_path() == path).count() }

    fn sync_worktree(st: &mut GitState, co: &GitCheckout) -> Result<()> {
        let remote = st
            .remotes
            .get(&(co.url.clone(), co.branch.clone()))
            .ok_or_else(|| anyhow!("remote {}#{} not found", co.url, co.branch))?;
        std::fs::create_dir_all(&co.local_path).with_context(|| format!("creating {}", co.local_path.display()))?;
        for (rel, body) in &remote.files {
            let p = co.local_path.join(rel);
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&p, body).with_context(|| format!("writing {}", p.display()))?;
        }
        let commit = remote.commit.clone();
        st.heads.insert(co.local_path.clone(), commit);
        Ok(())
    }
}

#[async_trait]
impl GitClient for MockGit {
    fn local_path(&self, url: &str, branch: &str) -> PathBuf { self.git_dir.join(checkout_name(url, branch)) }

    async fn open_or_clone(&self, url: &str, branch: &str) -> Result<GitCheckout> {
        self.stall_if_hanging(url).await;
        let co = GitCheckout { url: url.into(), branch: branch.into(), local_path: self.local_path(url, branch) };
        let mut st = lock(&self.state);
        if st.failing.contains(url) {
            bail!("clone {url}: connection refused");
        }
        if !co.local_path.is_dir() || !st.heads.contains_key(&co.local_path) {
            Self::sync_worktree(&mut st, &co)?;
            st.clones += 1;
        }
        Ok(co)
    }

    async fn pull(&self, checkout: &GitCheckout) -> Result<()> {
        self.stall_if_hanging(&checkout.url).await;
        let mut st = lock(&self.state);
        if st.failing.contains(&checkout.url) {
            bail!("pull {}: connection refused", checkout.url);
        }
        Self::sync_worktree(&mut st, checkout)?;
        st.pulls.push(checkout.local_path.clone());
        Ok(())
    }

    async fn current_commit_id(&self, checkout: &GitCheckout) -> Result<String> {
        lock(&self.state)
            .heads
            .get(&checkout.local_path)
            .cloned()
            .ok_or_else(|| anyhow!("{} is not a checkout", checkout.local_path.display()))
    }
}

#[derive(Default)]
struct ComposeState {
    containers: HashMap<String, Vec<ContainerSummary>>,
    replicas: HashMap<String, usize>,
    failing_up: HashSet<String>,
    failing_down: HashSet<String>,
    ups: Vec<(String, PathBuf)>,
    downs: Vec<String>,
    logs: HashMap<String, String>,
}

/// Records `up`/`down` calls and keeps a fake container table per project.
#[derive(Default)]
pub struct MockCompose {
    state: Mutex<ComposeState>,
}

impl MockCompose {
    pub fn new() -> Self { Self::default() }

    /// Number of containers `up` starts for `project` (default 1).
    pub fn set_replicas(&self, project: &str, n: usize) { lock(&self.state).replicas.insert(project.into(), n); }

    pub fn set_failing_up(&self, project: &str, failing: bool) {
        let mut st = lock(&self.state);
        if failing { st.failing_up.insert(project.into()); } else { st.failing_up.remove(project); }
    }

    pub fn set_failing_down(&self, project: &str, failing: bool) {
        let mut st = lock(&self.state);
        if failing { st.failing_down.insert(project.into()); } else { st.failing_down.remove(project); }
    }

    /// Mark one container of the project as exited.
    pub fn stop_container(&self, project: &str, index: usize) {
        if let Some(c) = lock(&self.state).containers.get_mut(project).and_then(|cs| cs.get_mut(index)) {
            c.state = "exited".into();
            c.status = "Exited (1)".into();
        }
    }

    pub fn set_logs(&self, container_id: &str, text: &str) { lock(&self.state).logs.insert(container_id.into(), text.into()); }

    pub fn up_count(&self) -> usize { lock(&self.state).ups.len() }
    pub fn ups(&self) -> Vec<(String, PathBuf)> { lock(&self.state).ups.clone() }
    pub fn down_count(&self) -> usize { lock(&self.state).downs.len() }
    pub fn downs(&self) -> Vec<String> { lock(&self.state).downs.clone() }
    pub fn total_calls(&self) -> usize { self.up_count() + self.down_count() }
}

#[async_trait]
impl ComposeOps for MockCompose {
    async fn up(&self, project: &str, dir: &Path) -> Result<()> {
        let mut st = lock(&self.state);
        st.ups.push((project.into(), dir.to_path_buf()));
        if st.failing_up.contains(project) {
            bail!("compose up {project}: service \"web\" failed to build");
        }
        let n = st.replicas.get(project).copied().unwrap_or(1);
        let containers = (0..n)
            .map(|i| ContainerSummary {
                id: format!("{project}-{i}"),
                image: "mock:latest".into(),
                labels: BTreeMap::from([(COMPOSE_PROJECT_LABEL.to_string(), project.to_string())]),
                state: "running".into(),
                status: "Up 1 second".into(),
            })
            .collect();
        st.containers.insert(project.into(), containers);
        Ok(())
    }

    async fn down(&self, project: &str) -> Result<()> {
        let mut st = lock(&self.state);
        st.downs.push(project.into());
        if st.failing_down.contains(project) {
            bail!("compose down {project}: engine unavailable");
        }
        st.containers.remove(project);
        Ok(())
    }

    async fn status(&self, project: &str) -> Result<Vec<ContainerSummary>> {
        Ok(lock(&self.state).containers.get(project).cloned().unwrap_or_default())
    }

    async fn logs(&self, container_id: &str, _since: Option<&str>, _tail: usize) -> Result<String> {
        lock(&self.state).logs.get(container_id).cloned().ok_or_else(|| anyhow!("no such container: {container_id}"))
    }
}

/// Fan-out of injected container events to every live subscription.
#[derive(Default)]
pub struct MockEvents {
    senders: Mutex<Vec<mpsc::Sender<ContainerEvent>>>,
    subscribes: Mutex<usize>,
}

impl MockEvents {
    pub fn new() -> Self { Self::default() }

    pub async fn emit(&self, ev: ContainerEvent) {
        let senders: Vec<_> = lock(&self.senders).clone();
        for tx in senders {
            let _ = tx.send(ev.clone()).await;
        }
    }

    /// Close every subscription, as a lost engine connection would.
    pub fn disconnect(&self) { lock(&self.senders).clear(); }

    pub fn subscribe_count(&self) -> usize { *lock(&self.subscribes) }
}

#[async_trait]
impl ContainerEvents for MockEvents {
    async fn subscribe(&self) -> Result<StreamHandle<ContainerEvent>> {
        let (tx, rx) = mpsc::channel(64);
        lock(&self.senders).push(tx);
        *lock(&self.subscribes) += 1;
        let (cancel, _) = CancelHandle::pair();
        Ok(StreamHandle { rx, cancel })
    }
}
