use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventError, EventSource, EventStream, LedgerEvent};
use crate::job::JobStat;
use crate::store::{JobStatStore, TxStatStore};

/// Listener notifications forwarded to whoever drives the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerSignal {
    /// Nothing arrived for a whole idle window and every handler has finished
    Idle,
    /// The event stream ended; no further confirmations will be applied
    Disconnected(String),
}

/// Applies commit and rejection events to the job stores.
#[derive(Clone)]
pub struct ConfirmationListener {
    store: Arc<JobStatStore>,
    confirmed: Arc<TxStatStore>,
    idle_timeout: Duration,
}

impl ConfirmationListener {
    pub fn new(
        store: Arc<JobStatStore>,
        confirmed: Arc<TxStatStore>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            confirmed,
            idle_timeout,
        }
    }

    /// Subscribe and listen on a background task.
    ///
    /// The returned receiver resolves once the subscription is established or
    /// has failed. No `Idle` is sent before `dispatched` is cancelled, and the
    /// first one comes a full idle window after it.
    pub fn spawn(
        self,
        source: Arc<dyn EventSource>,
        signals: mpsc::UnboundedSender<RunnerSignal>,
        dispatched: CancellationToken,
        shutdown: CancellationToken,
    ) -> (JoinHandle<()>, oneshot::Receiver<Result<(), EventError>>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let events = match source.subscribe().await {
                Ok(events) => {
                    let _ = ready_tx.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            self.run(events, signals, dispatched, shutdown).await;
        });
        (handle, ready_rx)
    }

    pub async fn run(
        self,
        mut events: EventStream,
        signals: mpsc::UnboundedSender<RunnerSignal>,
        dispatched: CancellationToken,
        shutdown: CancellationToken,
    ) {
        let mut handlers = JoinSet::new();
        let mut armed = dispatched.is_cancelled();
        let idle = sleep(self.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Block listener shutting down");
                    break;
                }
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        idle.as_mut().reset(Instant::now() + self.idle_timeout);
                        let listener = self.clone();
                        handlers.spawn(async move { listener.apply(event) });
                    }
                    Some(Err(e)) if !e.is_fatal() => {
                        warn!("Skipping undecodable event: {}", e);
                    }
                    other => {
                        let reason = match other {
                            Some(Err(e)) => e.to_string(),
                            _ => EventError::Closed.to_string(),
                        };
                        error!("Block listener disconnected: {}", reason);
                        drain(&mut handlers).await;
                        let _ = signals.send(RunnerSignal::Disconnected(reason));
                        return;
                    }
                },
                Some(res) = handlers.join_next(), if !handlers.is_empty() => {
                    report_handler(res);
                }
                _ = dispatched.cancelled(), if !armed => {
                    // quiet time during dispatch does not count
                    armed = true;
                    idle.as_mut().reset(Instant::now() + self.idle_timeout);
                }
                _ = &mut idle, if armed => {
                    drain(&mut handlers).await;
                    info!("No event received for {:?}", self.idle_timeout);
                    if signals.send(RunnerSignal::Idle).is_err() {
                        debug!("Nobody is waiting for the idle signal");
                    }
                    idle.as_mut().reset(Instant::now() + self.idle_timeout);
                }
            }
        }

        drain(&mut handlers).await;
    }

    fn apply(&self, event: LedgerEvent) {
        match event {
            LedgerEvent::Committed {
                tx_ids,
                commit_time,
            } => {
                for tx_id in tx_ids {
                    debug!("{} was written to ledger", tx_id);
                    self.confirm(&tx_id, |stat| stat.committed(commit_time));
                }
            }
            LedgerEvent::Rejected { tx_id, message } => {
                debug!("{} was rejected: {}", tx_id, message);
                let at: DateTime<Utc> = Utc::now();
                self.confirm(&tx_id, |stat| stat.rejected(at, message));
            }
        }
    }

    fn confirm<F>(&self, tx_id: &str, update: F)
    where
        F: FnOnce(&JobStat) -> JobStat,
    {
        let updated = self
            .store
            .replace_by_tx_id(tx_id, |stat| (!stat.is_done).then(|| update(stat)));

        match updated {
            Some(stat) => self.confirmed.set(stat),
            None => debug!("no pending jobstat for {}", tx_id),
        }
    }
}

async fn drain(handlers: &mut JoinSet<()>) {
    while let Some(res) = handlers.join_next().await {
        report_handler(res);
    }
}

fn report_handler(res: Result<(), JoinError>) {
    if let Err(e) = res {
        warn!("Event handler failed: {}", e);
    }
}
