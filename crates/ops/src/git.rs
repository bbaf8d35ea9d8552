//! Git collaborator: clone-or-open, pull, current commit, file access.
//!
//! Checkouts live under `git_dir/<checkout_name(url, branch)>`, so every
//! repository entry naming the same url and branch shares one directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cmd;
use crate::credentials::Credentials;

/// Filesystem-safe name of the checkout for `url` at `branch`.
///
/// `git@host:org/app.git` + `feature/x` becomes `host_org_app#feature+x`.
pub fn checkout_name(url: &str, branch: &str) -> String {
    let mut u = url.trim();
    if let Some(idx) = u.find("://") {
        u = &u[idx + 3..];
    }
    u = u.strip_prefix("git@").unwrap_or(u);
    u = u.trim_end_matches('/');
    u = u.strip_suffix(".git").unwrap_or(u);
    let u: String = u.chars().map(|c| if c == '/' || c == ':' { '_' } else { c }).collect();
    format!("{u}#{}", branch.trim().replace('/', "+"))
}

/// Store name of a repository entry: `checkout#path`, or just the checkout for the root.
pub fn repository_name(url: &str, branch: &str, path: &str) -> String {
    let base = checkout_name(url, branch);
    let p = path.trim().trim_matches('/').replace('/', "+");
    if p.is_empty() { base } else { format!("{base}#{p}") }
}

/// Handle on a local checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCheckout {
    pub url: String,
    pub branch: String,
    pub local_path: PathBuf,
}

impl GitCheckout {
    pub fn local_path(&self) -> &Path { &self.local_path }

    /// Read-only access to the worktree.
    pub async fn read_file(&self, rel: impl AsRef<Path>) -> Result<Vec<u8>> {
        let p = self.local_path.join(rel.as_ref());
        tokio::fs::read(&p).await.with_context(|| format!("reading {}", p.display()))
    }
}

#[async_trait]
pub trait GitClient: Send + Sync {
    /// Deterministic location of the checkout for `url` at `branch`.
    fn local_path(&self, url: &str, branch: &str) -> PathBuf;

    async fn open_or_clone(&self, url: &str, branch: &str) -> Result<GitCheckout>;
    async fn pull(&self, checkout: &GitCheckout) -> Result<()>;
    async fn current_commit_id(&self, checkout: &GitCheckout) -> Result<String>;
}

/// Shells out to the `git` binary.
pub struct GitCli {
    git_dir: PathBuf,
    creds: Option<Credentials>,
}

impl GitCli {
    pub fn new(git_dir: impl Into<PathBuf>, creds: Option<Credentials>) -> Self {
        Self { git_dir: git_dir.into(), creds }
    }

    fn envs(&self, url: &str) -> Vec<(&'static str, String)> {
        let ssh = url.starts_with("git@") || url.starts_with("ssh://");
        match (&self.creds, ssh) {
            (Some(c), true) => vec![("GIT_SSH_COMMAND", c.ssh_command())],
            _ => Vec::new(),
        }
    }

    async fn git(&self, url: &str, dir: Option<&Path>, args: &[&str]) -> Result<cmd::CmdOutput> {
        cmd::run("git", args, dir, &self.envs(url)).await
    }
}

#[async_trait]
impl GitClient for GitCli {
    fn local_path(&self, url: &str, branch: &str) -> PathBuf { self.git_dir.join(checkout_name(url, branch)) }

    async fn open_or_clone(&self, url: &str, branch: &str) -> Result<GitCheckout> {
        let local_path = self.local_path(url, branch);
        let checkout = GitCheckout { url: url.to_string(), branch: branch.to_string(), local_path: local_path.clone() };
        if local_path.join(".git").is_dir() {
            debug!(path = %local_path.display(), "git: opened existing checkout");
            return Ok(checkout);
        }
        tokio::fs::create_dir_all(&self.git_dir)
            .await
            .with_context(|| format!("creating {}", self.git_dir.display()))?;
        let dest = local_path.to_string_lossy().to_string();
        info!(url = %url, branch = %branch, path = %dest, "git: cloning");
        if let Err(e) = self.git(url, None, &["clone", "--single-branch", "--branch", branch, url, &dest]).await {
            if let Err(rm) = tokio::fs::remove_dir_all(&local_path).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %dest, error = %rm, "git: cleanup after failed clone");
                }
            }
            return Err(e.context(format!("cloning {url}#{branch}")));
        }
        Ok(checkout)
    }

    async fn pull(&self, checkout: &GitCheckout) -> Result<()> {
        let dir = Some(checkout.local_path.as_path());
        self.git(&checkout.url, dir, &["fetch", "--force", "origin", &checkout.branch])
            .await
            .with_context(|| format!("fetching {}#{}", checkout.url, checkout.branch))?;
        self.git(&checkout.url, dir, &["reset", "--hard", "FETCH_HEAD"]).await.context("resetting worktree")?;
        Ok(())
    }

    async fn current_commit_id(&self, checkout: &GitCheckout) -> Result<String> {
        let out = self.git(&checkout.url, Some(&checkout.local_path), &["rev-parse", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }
}
