//! Bounded synchronous retry of one event against one handler.

use std::collections::VecDeque;
use std::future::Future;

use metrics::counter;
use recoon_core::config::RetryConfig;
use recoon_core::Event;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("cancelled")]
    Cancelled,
    #[error("giving up after {attempts} attempts: {last:#}")]
    Exhausted { attempts: u32, last: anyhow::Error },
}

/// Invoke `handler` with a fresh copy of `event` until it succeeds, the
/// attempts run out, or `cancel` fires. The backoff wait is interruptible.
pub async fn keep_retrying<F, Fut>(
    cancel: &CancellationToken,
    policy: RetryConfig,
    event: &Event,
    mut handler: F,
) -> Result<(), RetryError>
where
    F: FnMut(Event) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        let err = match handler(event.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        counter!("retry_attempts_total", 1u64);
        if attempt == attempts {
            counter!("retry_exhausted_total", 1u64);
            return Err(RetryError::Exhausted { attempts, last: err });
        }
        warn!(attempt, of = attempts, object = %event.object.namespace_name(), error = %format!("{err:#}"), "retry: handler failed");
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(policy.backoff) => {}
        }
    }
    Err(RetryError::Cancelled)
}

/// Controller main loop: feed every event from `rx` through [`keep_retrying`].
/// Returns `Ok` on cancellation or when the subscription closes; exhaustion is an error.
pub async fn consume<F, Fut>(
    name: &str,
    cancel: &CancellationToken,
    policy: RetryConfig,
    rx: &mut mpsc::Receiver<Event>,
    handler: F,
) -> anyhow::Result<()>
where
    F: FnMut(Event) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    consume_with_backlog(name, cancel, policy, Vec::new(), rx, handler).await
}

/// [`consume`] with a queue of events handled only while `rx` has nothing
/// ready, so the subscription is never left to fill up behind the backlog.
pub async fn consume_with_backlog<F, Fut>(
    name: &str,
    cancel: &CancellationToken,
    policy: RetryConfig,
    backlog: Vec<Event>,
    rx: &mut mpsc::Receiver<Event>,
    mut handler: F,
) -> anyhow::Result<()>
where
    F: FnMut(Event) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut backlog = VecDeque::from(backlog);
    loop {
        let ready = match rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(TryRecvError::Empty) => backlog.pop_front(),
            Err(TryRecvError::Disconnected) => None,
        };
        let ev = match ready {
            Some(ev) => ev,
            None => tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = rx.recv() => match next {
                    Some(ev) => ev,
                    None => {
                        debug!(controller = name, pending = backlog.len(), "subscription closed");
                        return Ok(());
                    }
                }
            },
        };
        match keep_retrying(cancel, policy, &ev, &mut handler).await {
            Ok(()) => {}
            Err(RetryError::Cancelled) => return Ok(()),
            Err(e) => {
                error!(controller = name, kind = %ev.kind, object = %ev.object.namespace_name(), "{e}");
                return Err(anyhow::Error::new(e).context(format!("{name}: event {} {}", ev.kind, ev.object.namespace_name())));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recoon_core::{Object, Repository};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn ev() -> Event { Event::add(Object::Repository(Repository::default())) }

    fn policy(attempts: u32) -> RetryConfig { RetryConfig { attempts, backoff: Duration::from_millis(5) } }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let res = keep_retrying(&CancellationToken::new(), policy(5), &ev(), move |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 { anyhow::bail!("transient") }
                Ok(())
            }
        })
        .await;
        assert!(res.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn each_attempt_gets_a_pristine_copy() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = seen.clone();
        let res = keep_retrying(&CancellationToken::new(), policy(3), &ev(), move |mut e| {
            let s = s.clone();
            async move {
                if let Object::Repository(r) = &mut e.object {
                    s.lock().expect("lock").push(r.metadata.name.clone());
                    r.metadata.name = "mutated".into();
                }
                anyhow::bail!("always")
            }
        })
        .await;
        assert!(matches!(res, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(*seen.lock().expect("lock"), vec![String::new(), String::new(), String::new()]);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let slow = RetryConfig { attempts: 5, backoff: Duration::from_secs(3600) };
        let started = std::time::Instant::now();
        let res = keep_retrying(&cancel, slow, &ev(), move |_| {
            let c = c.clone();
            async move {
                c.cancel();
                anyhow::bail!("fail")
            }
        })
        .await;
        assert!(matches!(res, Err(RetryError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn consume_stops_on_exhaustion_and_on_close() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(ev()).await.expect("send");
        let err = consume("test", &CancellationToken::new(), policy(2), &mut rx, |_| async { anyhow::bail!("nope") })
            .await
            .expect_err("fatal");
        assert!(format!("{err:#}").contains("giving up after 2 attempts"));

        tx.send(ev()).await.expect("send");
        drop(tx);
        let handled = AtomicU32::new(0);
        consume("test", &CancellationToken::new(), policy(2), &mut rx, |_| {
            handled.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .expect("closed");
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    fn named(name: &str) -> Event {
        let mut r = Repository::default();
        r.metadata.name = name.into();
        Event::add(Object::Repository(r))
    }

    #[tokio::test]
    async fn live_events_go_before_the_backlog() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(named("live")).await.expect("send");
        let seen = std::sync::Mutex::new(Vec::new());
        let cancel = CancellationToken::new();
        let backlog = vec![named("old-1"), named("old-2")];
        consume_with_backlog("test", &cancel, policy(2), backlog, &mut rx, |e| {
            let mut seen = seen.lock().expect("lock");
            seen.push(e.object.namespace_name().name);
            if seen.len() == 3 {
                cancel.cancel();
            }
            async { Ok(()) }
        })
        .await
        .expect("cancelled");
        assert_eq!(*seen.lock().expect("lock"), vec!["live", "old-1", "old-2"]);
    }
}
