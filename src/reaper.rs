//! Reclamation of finished connection workers.
//!
//! The listener hands every spawned worker's record to the reaper and forgets
//! about it. The reaper task awaits each worker exactly once, logs how it
//! ended, and keeps running totals. It never blocks the listener or a worker:
//! records arrive over an unbounded channel and completions are collected as
//! they happen.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Handle to a spawned connection worker.
#[derive(Debug)]
pub struct WorkerRecord {
    id: u64,
    peer: SocketAddr,
    handle: JoinHandle<io::Result<()>>,
}

impl WorkerRecord {
    pub fn new(id: u64, peer: SocketAddr, handle: JoinHandle<io::Result<()>>) -> Self {
        Self { id, peer, handle }
    }
}

/// Totals reported when the reaper stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaperStats {
    /// Workers reclaimed, however they ended.
    pub reaped: u64,
    /// Workers that returned an I/O error or were cancelled.
    pub failed: u64,
    /// Workers that panicked.
    pub panicked: u64,
}

impl ReaperStats {
    fn record(&mut self, id: u64, peer: SocketAddr, outcome: Result<io::Result<()>, JoinError>) {
        self.reaped += 1;
        match outcome {
            Ok(Ok(())) => debug!(worker = id, peer = %peer, "Worker reaped"),
            Ok(Err(e)) => {
                self.failed += 1;
                debug!(worker = id, peer = %peer, error = %e, "Worker ended with I/O error");
            }
            Err(e) if e.is_panic() => {
                self.panicked += 1;
                warn!(worker = id, peer = %peer, "Worker panicked");
            }
            Err(e) => {
                self.failed += 1;
                debug!(worker = id, peer = %peer, error = %e, "Worker cancelled");
            }
        }
    }
}

type Completion = (u64, SocketAddr, Result<io::Result<()>, JoinError>);

/// Sending side of the reaper; dropping it lets the reaper drain and stop.
pub struct Reaper {
    records: mpsc::UnboundedSender<WorkerRecord>,
}

/// The running reaper task.
pub struct ReaperTask {
    task: JoinHandle<ReaperStats>,
    cancel: oneshot::Sender<()>,
}

impl Reaper {
    /// Spawn the reaper task.
    ///
    /// Once the `Reaper` is dropped, the task finishes after every tracked
    /// worker has been reclaimed; see [`ReaperTask::drain`].
    pub fn start() -> (Self, ReaperTask) {
        let (records, rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(reap_loop(rx, cancel_rx));
        (Self { records }, ReaperTask { task, cancel })
    }

    /// Hand a worker over for reclamation.
    pub fn track(&self, record: WorkerRecord) {
        if let Err(mpsc::error::SendError(record)) = self.records.send(record) {
            // The task still runs to completion; only its outcome goes unlogged.
            warn!(worker = record.id, peer = %record.peer, "Reaper gone, detaching worker");
        }
    }
}

impl ReaperTask {
    /// Wait for the reaper to reclaim every worker.
    ///
    /// Workers still running after `grace` are cancelled and counted as
    /// failed. Call this after the `Reaper` has been dropped.
    pub async fn drain(self, grace: Duration) -> Result<ReaperStats, JoinError> {
        let ReaperTask { mut task, cancel } = self;

        if let Ok(stats) = tokio::time::timeout(grace, &mut task).await {
            return stats;
        }

        warn!(grace_ms = grace.as_millis() as u64, "Workers still running, cancelling them");
        let _ = cancel.send(());
        task.await
    }
}

async fn reap_loop(
    mut rx: mpsc::UnboundedReceiver<WorkerRecord>,
    mut cancel: oneshot::Receiver<()>,
) -> ReaperStats {
    let mut stats = ReaperStats::default();
    let mut pending: JoinSet<Completion> = JoinSet::new();
    let mut running: HashMap<u64, AbortHandle> = HashMap::new();
    let mut open = true;
    let mut listening = true;
    let mut cancelled = false;

    loop {
        tokio::select! {
            record = rx.recv(), if open => match record {
                Some(WorkerRecord { id, peer, handle }) => {
                    if cancelled {
                        handle.abort();
                    } else {
                        running.insert(id, handle.abort_handle());
                    }
                    pending.spawn(async move { (id, peer, handle.await) });
                }
                None => open = false,
            },
            result = &mut cancel, if listening && (open || !pending.is_empty()) => {
                listening = false;
                // A dropped sender means nobody asked for cancellation.
                if result.is_ok() {
                    cancelled = true;
                    for (_, handle) in running.drain() {
                        handle.abort();
                    }
                }
            }
            Some(done) = pending.join_next(), if !pending.is_empty() => {
                collect(&mut stats, &mut running, done);
                // Several workers may have finished together.
                while let Some(done) = pending.try_join_next() {
                    collect(&mut stats, &mut running, done);
                }
            }
            else => break,
        }
    }

    debug!(
        reaped = stats.reaped,
        failed = stats.failed,
        panicked = stats.panicked,
        "Reaper stopped"
    );
    stats
}

fn collect(
    stats: &mut ReaperStats,
    running: &mut HashMap<u64, AbortHandle>,
    done: Result<Completion, JoinError>,
) {
    match done {
        Ok((id, peer, outcome)) => {
            running.remove(&id);
            stats.record(id, peer, outcome);
        }
        Err(e) => warn!(error = %e, "Reaper wait task failed"),
    }
}
