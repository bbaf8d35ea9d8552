use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use recoon_api::ApiState;
use recoon_controller::Collaborators;
use recoon_core::config::{
    AppRepoConfig, ConfigRepoConfig, ContainerConfig, RetryConfig, SshConfig, StoreConfig, UiConfig, WatcherConfig,
};
use recoon_core::{Config, ObjectKind};
use recoon_hub::{CancellationToken, Runner, Watcher};
use recoon_ops::{Credentials, DockerCompose, DockerEvents, GitCli, KeyDir};
use recoon_persist::SqliteKv;
use recoon_schema::Schema;
use recoon_store::Store;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "recoon", version, about = "GitOps reconciliation for docker compose projects")]
struct Args {
    /// SQLite file holding repositories and projects
    #[arg(long, env = "RECOON_DATABASE_FILE", default_value = "./.data/recoon.db")]
    database_file: PathBuf,

    /// Root directory for git checkouts
    #[arg(long, env = "RECOON_GIT_DIR", default_value = "./.data/repos/")]
    git_dir: PathBuf,

    #[arg(long, env = "RECOON_EVENT_CAPACITY", default_value_t = 100)]
    event_capacity: usize,

    /// Directory holding id_recoon and id_recoon.pub
    #[arg(long, env = "RECOON_KEY_DIR", default_value = "./.data/")]
    key_dir: PathBuf,

    /// Config repository URL; empty disables the config-repo syncer
    #[arg(long, env = "RECOON_CONFIG_REPO_URL", default_value = "")]
    config_repo_url: String,

    #[arg(long, env = "RECOON_CONFIG_REPO_BRANCH", default_value = "main")]
    config_repo_branch: String,

    #[arg(long, env = "RECOON_CONFIG_REPO_INTERVAL_SECS", default_value_t = 10)]
    config_repo_interval_secs: u64,

    /// Seconds between puller cycles
    #[arg(long, env = "RECOON_APP_REPO_INTERVAL_SECS", default_value_t = 5)]
    app_repo_interval_secs: u64,

    #[arg(long, env = "RECOON_PULL_TIMEOUT_SECS", default_value_t = 60)]
    pull_timeout_secs: u64,

    #[arg(long, env = "RECOON_WATCHER_CAPACITY", default_value_t = 50)]
    watcher_capacity: usize,

    #[arg(long, env = "RECOON_WATCHER_SEND_TIMEOUT_SECS", default_value_t = 5)]
    watcher_send_timeout_secs: u64,

    /// Minimum age of the last compose up before drift triggers another one
    #[arg(long, env = "RECOON_RESTART_BACKOFF_SECS", default_value_t = 30)]
    restart_backoff_secs: u64,

    /// Delay before resubscribing to docker events after the stream ends
    #[arg(long, env = "RECOON_RESUBSCRIBE_BACKOFF_SECS", default_value_t = 2)]
    resubscribe_backoff_secs: u64,

    /// Handler attempts per event; running out stops the controller and the process
    #[arg(long, env = "RECOON_RETRY_ATTEMPTS", default_value_t = 5)]
    retry_attempts: u32,

    #[arg(long, env = "RECOON_RETRY_BACKOFF_SECS", default_value_t = 5)]
    retry_backoff_secs: u64,

    #[arg(long, env = "RECOON_UI_HOST", default_value = "localhost")]
    ui_host: String,

    #[arg(long, env = "RECOON_UI_PORT", default_value_t = 3680)]
    ui_port: u16,

    /// Prometheus exporter address (host:port); unset disables it
    #[arg(long, env = "RECOON_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            store: StoreConfig { database_file: self.database_file, git_dir: self.git_dir, event_capacity: self.event_capacity },
            ssh: SshConfig { key_dir: self.key_dir },
            config_repo: ConfigRepoConfig {
                clone_url: self.config_repo_url,
                branch: self.config_repo_branch,
                interval: Duration::from_secs(self.config_repo_interval_secs),
            },
            app_repo: AppRepoConfig {
                interval: Duration::from_secs(self.app_repo_interval_secs),
                pull_timeout: Duration::from_secs(self.pull_timeout_secs),
            },
            watcher: WatcherConfig {
                capacity: self.watcher_capacity,
                send_timeout: Duration::from_secs(self.watcher_send_timeout_secs),
            },
            containers: ContainerConfig {
                restart_backoff: Duration::from_secs(self.restart_backoff_secs),
                resubscribe_backoff: Duration::from_secs(self.resubscribe_backoff_secs),
            },
            retry: RetryConfig { attempts: self.retry_attempts, backoff: Duration::from_secs(self.retry_backoff_secs) },
            ui: UiConfig { host: self.ui_host, port: self.ui_port },
        }
    }
}

fn init_tracing() {
    let env = std::env::var("RECOON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(sock) = addr else { return };
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    match builder.with_http_listener(sock).install() {
        Ok(()) => info!(addr = %sock, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

fn load_credentials(key_dir: &std::path::Path) -> Option<Credentials> {
    match KeyDir::new(key_dir).load() {
        Ok(creds) => {
            info!(public_key = %creds.public_key, "ssh: register this key as a deploy key");
            Some(creds)
        }
        Err(e) => {
            warn!(dir = %key_dir.display(), error = %format!("{e:#}"), "ssh: no usable key pair, git runs without credentials");
            None
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "signal: SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        r = tokio::signal::ctrl_c() => r.context("listening for ctrl-c")?,
        _ = term => {}
    }
    info!("signal: shutting down");
    cancel.cancel();
    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let creds = load_credentials(&cfg.ssh.key_dir);

    let kv = SqliteKv::open(&cfg.store.database_file)?;
    let (store, events) = Store::open(kv, Schema::builtin(), cfg.store.event_capacity)?;
    for kind in ObjectKind::ALL {
        store.ensure_partition(kind).with_context(|| format!("partition {kind}"))?;
    }
    std::fs::create_dir_all(&cfg.store.git_dir)
        .with_context(|| format!("creating {}", cfg.store.git_dir.display()))?;

    let watcher = Arc::new(Watcher::new(events, &cfg.watcher));
    let compose = Arc::new(DockerCompose::default());
    let collab = Collaborators {
        git: Arc::new(GitCli::new(&cfg.store.git_dir, creds)),
        compose: compose.clone(),
        events: Arc::new(DockerEvents::default()),
    };
    let (trigger_tx, trigger_rx) = mpsc::channel(1);

    let cancel = CancellationToken::new();
    let mut runner = Runner::new(cancel.clone());
    recoon_controller::register(&mut runner, watcher, store.clone(), collab, &cfg, trigger_rx)?;

    let addr = cfg.ui.addr();
    let state = ApiState { store, compose, trigger: trigger_tx };
    runner.add_fn("api", move |cancel| async move { recoon_api::serve(&addr, state, cancel).await });
    runner.add_fn("signals", shutdown_signal);

    info!(db = %cfg.store.database_file.display(), git_dir = %cfg.store.git_dir.display(), "recoon: starting");
    runner.start_all();
    runner.wait().await
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_tracing();
    let args = Args::parse();
    init_metrics(args.metrics_addr);
    if let Err(e) = run(args.into_config()).await {
        error!(error = %format!("{e:#}"), "recoon: exited with error");
        eprintln!("recoon error: {e:#}");
        std::process::exit(1);
    }
}
