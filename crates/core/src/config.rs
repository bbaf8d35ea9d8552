//! Process configuration, built once at startup and passed into constructors.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_file: PathBuf,
    /// Root directory for git checkouts.
    pub git_dir: PathBuf,
    /// Capacity of the store's outbound event channel.
    pub event_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub key_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ConfigRepoConfig {
    /// Empty disables the config-repo syncer.
    pub clone_url: String,
    pub branch: String,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct AppRepoConfig {
    pub interval: Duration,
    pub pull_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub capacity: usize,
    pub send_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Minimum gap between restarts of one project for the same commit.
    pub restart_backoff: Duration,
    /// Wait before resubscribing to a lost container event stream.
    pub resubscribe_backoff: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub attempts: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub host: String,
    pub port: u16,
}

impl UiConfig {
    pub fn addr(&self) -> String { format!("{}:{}", self.host, self.port) }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub ssh: SshConfig,
    pub config_repo: ConfigRepoConfig,
    pub app_repo: AppRepoConfig,
    pub watcher: WatcherConfig,
    pub containers: ContainerConfig,
    pub retry: RetryConfig,
    pub ui: UiConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { database_file: PathBuf::from("./.data/recoon.db"), git_dir: PathBuf::from("./.data/repos/"), event_capacity: 100 }
    }
}

impl Default for SshConfig {
    fn default() -> Self { Self { key_dir: PathBuf::from("./.data/") } }
}

impl Default for ConfigRepoConfig {
    fn default() -> Self { Self { clone_url: String::new(), branch: "main".into(), interval: Duration::from_secs(10) } }
}

impl Default for AppRepoConfig {
    fn default() -> Self { Self { interval: Duration::from_secs(5), pull_timeout: Duration::from_secs(60) } }
}

impl Default for WatcherConfig {
    fn default() -> Self { Self { capacity: 50, send_timeout: Duration::from_secs(5) } }
}

impl Default for ContainerConfig {
    fn default() -> Self { Self { restart_backoff: Duration::from_secs(30), resubscribe_backoff: Duration::from_secs(2) } }
}

impl Default for RetryConfig {
    fn default() -> Self { Self { attempts: 5, backoff: Duration::from_secs(5) } }
}

impl Default for UiConfig {
    fn default() -> Self { Self { host: "localhost".into(), port: 3680 } }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            ssh: SshConfig::default(),
            config_repo: ConfigRepoConfig::default(),
            app_repo: AppRepoConfig::default(),
            watcher: WatcherConfig::default(),
            containers: ContainerConfig::default(),
            retry: RetryConfig::default(),
            ui: UiConfig::default(),
        }
    }
}
