//! Recoon hub: store event fan-out, retry wrapper and task supervision.

#![forbid(unsafe_code)]

pub mod retry;
pub mod runner;
pub mod watcher;

pub use retry::{consume, consume_with_backlog, keep_retrying, RetryError};
pub use runner::{FnTask, Runner, Task};
pub use watcher::Watcher;
pub use tokio_util::sync::CancellationToken;
