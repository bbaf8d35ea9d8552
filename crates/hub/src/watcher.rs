//! Fan-out of store events to filtered subscriptions.
//!
//! Each event is sent to all matching subscribers concurrently, every send
//! bounded by `send_timeout`. A subscriber that stays full past the timeout
//! loses that one event (logged and counted); the others are unaffected.
//! Per-subscriber order follows store commit order.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use metrics::counter;
use recoon_core::config::WatcherConfig;
use recoon_core::{Event, VersionKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
    /// Empty receives everything.
    filter: Vec<VersionKind>,
}

impl Subscriber {
    fn matches(&self, vk: &VersionKind) -> bool { self.filter.is_empty() || self.filter.contains(vk) }
}

#[derive(Default)]
struct Subs {
    list: Vec<Subscriber>,
    next_id: u64,
    closed: bool,
}

pub struct Watcher {
    subs: Mutex<Subs>,
    input: Mutex<Option<mpsc::Receiver<Event>>>,
    capacity: usize,
    send_timeout: Duration,
}

impl Watcher {
    pub fn new(input: mpsc::Receiver<Event>, cfg: &WatcherConfig) -> Self {
        Self {
            subs: Mutex::new(Subs::default()),
            input: Mutex::new(Some(input)),
            capacity: cfg.capacity.max(1),
            send_timeout: cfg.send_timeout,
        }
    }

    /// Register a subscription for the given kinds. After shutdown the returned channel is already closed.
    pub fn watch(&self, kinds: &[VersionKind]) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let Ok(mut subs) = self.subs.lock() else {
            warn!("watcher: subscription lock poisoned");
            return rx;
        };
        if subs.closed {
            return rx;
        }
        let id = subs.next_id;
        subs.next_id += 1;
        subs.list.push(Subscriber { id, tx, filter: kinds.to_vec() });
        debug!(id, kinds = ?kinds, "watcher: subscribed");
        rx
    }

    pub fn subscriber_count(&self) -> usize { self.subs.lock().map(|s| s.list.len()).unwrap_or(0) }

    /// Consume store events until cancelled or the store side closes.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut input = self
            .input
            .lock()
            .map_err(|_| anyhow!("watcher input lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("watcher already running"))?;
        info!(subscribers = self.subscriber_count(), "watcher: started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = input.recv() => match next {
                    Some(ev) => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = self.fan_out(ev) => {}
                        }
                    }
                    None => {
                        debug!("watcher: store event channel closed");
                        break;
                    }
                }
            }
        }
        self.unsubscribe_all();
        info!("watcher: stopped");
        Ok(())
    }

    async fn fan_out(&self, ev: Event) {
        let vk = ev.object.version_kind();
        let targets: Vec<(u64, mpsc::Sender<Event>)> = match self.subs.lock() {
            Ok(subs) => subs.list.iter().filter(|s| s.matches(&vk)).map(|s| (s.id, s.tx.clone())).collect(),
            Err(_) => return,
        };
        if targets.is_empty() {
            return;
        }
        let timeout = self.send_timeout;
        let sends = targets.into_iter().map(|(id, tx)| {
            let copy = ev.clone();
            async move { (id, tokio::time::timeout(timeout, tx.send(copy)).await) }
        });
        let mut gone = Vec::new();
        for (id, res) in join_all(sends).await {
            match res {
                Ok(Ok(())) => counter!("watcher_fanout_total", 1u64),
                Ok(Err(_)) => gone.push(id),
                Err(_) => {
                    counter!("watcher_dropped_total", 1u64);
                    warn!(id, vk = %vk, object = %ev.object.namespace_name(), kind = %ev.kind, "watcher: subscriber full, event dropped");
                }
            }
        }
        if !gone.is_empty() {
            if let Ok(mut subs) = self.subs.lock() {
                subs.list.retain(|s| !gone.contains(&s.id));
            }
            debug!(count = gone.len(), "watcher: removed closed subscribers");
        }
    }

    fn unsubscribe_all(&self) {
        if let Ok(mut subs) = self.subs.lock() {
            // Dropping the senders closes every subscriber channel.
            subs.list.clear();
            subs.closed = true;
        }
    }
}
