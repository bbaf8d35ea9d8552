//! Fail-fast supervision of the process's long-running tasks.
//!
//! All tasks share one cancellation token. A task that fails, panics, or
//! returns before cancellation cancels every other task; `wait` reports it.

use std::future::Future;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[async_trait]
pub trait Task: Send + 'static {
    fn name(&self) -> &str;

    /// Must return promptly once `cancel` fires.
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()>;
}

/// Adapter turning a closure into a [`Task`].
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnTask<F>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self { Self { name: name.into(), f } }
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn name(&self) -> &str { &self.name }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()> {
        let FnTask { f, .. } = *self;
        f(cancel).await
    }
}

pub struct Runner {
    cancel: CancellationToken,
    pending: Vec<Box<dyn Task>>,
    set: JoinSet<(String, Result<()>)>,
}

impl Runner {
    pub fn new(cancel: CancellationToken) -> Self { Self { cancel, pending: Vec::new(), set: JoinSet::new() } }

    pub fn cancel_token(&self) -> CancellationToken { self.cancel.clone() }

    pub fn add(&mut self, task: impl Task) { self.pending.push(Box::new(task)); }

    pub fn add_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add(FnTask::new(name, f));
    }

    pub fn start_all(&mut self) {
        for task in self.pending.drain(..) {
            let name = task.name().to_string();
            let cancel = self.cancel.clone();
            info!(task = %name, "runner: starting");
            self.set.spawn(async move {
                let res = task.run(cancel.clone()).await;
                let res = match res {
                    Ok(()) if !cancel.is_cancelled() => Err(anyhow!("exited unexpectedly")),
                    other => other,
                };
                if let Err(e) = &res {
                    error!(task = %name, error = %format!("{e:#}"), "runner: task failed, cancelling all");
                    cancel.cancel();
                }
                (name, res)
            });
        }
    }

    /// Wait for every started task. Returns the first failure, if any.
    pub async fn wait(mut self) -> Result<()> {
        let mut first: Option<anyhow::Error> = None;
        while let Some(joined) = self.set.join_next().await {
            let (name, res) = match joined {
                Ok(v) => v,
                Err(e) => {
                    self.cancel.cancel();
                    ("<panicked>".to_string(), Err(anyhow!("task join: {e}")))
                }
            };
            match res {
                Ok(()) => info!(task = %name, "runner: stopped"),
                Err(e) => {
                    if first.is_none() {
                        first = Some(e.context(format!("task {name}")));
                    }
                }
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn until_cancelled(cancel: CancellationToken) -> Result<()> {
        cancel.cancelled().await;
        Ok(())
    }

    #[tokio::test]
    async fn clean_shutdown_on_external_cancel() {
        let cancel = CancellationToken::new();
        let mut r = Runner::new(cancel.clone());
        r.add_fn("a", until_cancelled);
        r.add_fn("b", until_cancelled);
        r.start_all();
        cancel.cancel();
        r.wait().await.expect("clean");
    }

    #[tokio::test]
    async fn failure_cancels_siblings() {
        let cancel = CancellationToken::new();
        let mut r = Runner::new(cancel.clone());
        r.add_fn("steady", until_cancelled);
        r.add_fn("broken", |_c| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(anyhow!("boom"))
        });
        r.start_all();
        let err = r.wait().await.expect_err("failed");
        assert!(format!("{err:#}").contains("task broken"));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn early_return_is_fatal() {
        let cancel = CancellationToken::new();
        let mut r = Runner::new(cancel.clone());
        r.add_fn("steady", until_cancelled);
        r.add_fn("quitter", |_c| async { Ok(()) });
        r.start_all();
        let err = r.wait().await.expect_err("unexpected exit");
        assert!(format!("{err:#}").contains("exited unexpectedly"));
    }
}
