//! Recoon Ops: external collaborators of the reconciliation engine.
//! Production implementations shell out to `git` and `docker`; `mock` holds
//! recording in-memory doubles for tests and frontends.

#![forbid(unsafe_code)]

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub mod cmd;
pub mod compose;
pub mod credentials;
pub mod events;
pub mod git;
pub mod mock;

pub use compose::{ComposeOps, ContainerSummary, DockerCompose, LogLine, COMPOSE_PROJECT_LABEL};
pub use credentials::{Credentials, KeyDir};
pub use events::{ContainerEvent, ContainerEvents, DockerEvents};
pub use git::{checkout_name, repository_name, GitCheckout, GitCli, GitClient};

/// Cancellation handle for an in-flight stream. Dropping it also cancels.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

/// Result of starting a streaming operation.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// Internal: split a byte stream into lines, parse each, and forward the
/// parsed items in order. Unparseable lines are skipped. Flushes the last
/// partial line on end.
async fn pump_lines<S, E, T, P>(stream: S, tx: mpsc::Sender<T>, mut cancel_rx: oneshot::Receiver<()>, ctx: &str, parse: P)
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
    P: Fn(&str) -> Option<T>,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    let mut lines: Vec<String> = Vec::new();
    'outer: loop {
        tokio::select! {
            _ = &mut cancel_rx => { info!(ctx = %ctx, "line pump cancelled"); return; }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1); // drop '\n'
                            if let Ok(s) = std::str::from_utf8(&line) { lines.push(s.to_string()); }
                        }
                    }
                    Some(Err(e)) => { warn!(ctx = %ctx, error = %e, "line stream error"); break 'outer; }
                    None => break 'outer,
                }
            }
        }
        for line in lines.drain(..) {
            let Some(item) = parse(&line) else {
                debug!(ctx = %ctx, line = %line, "line pump: skipped unparseable line");
                continue;
            };
            tokio::select! {
                _ = &mut cancel_rx => { info!(ctx = %ctx, "line pump cancelled"); return; }
                sent = tx.send(item) => if sent.is_err() { break 'outer; }
            }
        }
    }
    if !buf.is_empty() {
        if let Some(item) = std::str::from_utf8(&buf).ok().and_then(|s| parse(s)) {
            let _ = tx.try_send(item);
        }
    }
    info!(ctx = %ctx, "line pump ended");
}
