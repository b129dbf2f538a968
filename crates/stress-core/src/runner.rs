use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ChaincodeClient;
use crate::config::RunnerConfig;
use crate::events::{EventError, EventSource};
use crate::job::Job;
use crate::listener::{ConfirmationListener, RunnerSignal};
use crate::stats::{RunSummary, RunWindow, StatsCollector};
use crate::store::{JobStatStore, TxStatStore};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to subscribe to block events: {0}")]
    Subscribe(#[source] EventError),
    #[error("block listener exited before subscribing")]
    ListenerGone,
}

/// Dispatches jobs under a concurrency budget and correlates them with
/// ledger confirmations.
pub struct JobRunner {
    name: String,
    config: RunnerConfig,
    client: Arc<dyn ChaincodeClient>,
    events: Arc<dyn EventSource>,
    states: Arc<JobStatStore>,
    tx_stats: Arc<TxStatStore>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    stop: CancellationToken,
    dispatched: CancellationToken,
    listener_shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
    window: Mutex<RunWindow>,
    signal_tx: Mutex<Option<mpsc::UnboundedSender<RunnerSignal>>>,
    signal_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RunnerSignal>>,
}

impl JobRunner {
    pub fn new(
        config: RunnerConfig,
        client: Arc<dyn ChaincodeClient>,
        events: Arc<dyn EventSource>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            name: config.name.clone(),
            config,
            client,
            events,
            states: Arc::new(JobStatStore::new()),
            tx_stats: Arc::new(TxStatStore::new()),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stop: CancellationToken::new(),
            dispatched: CancellationToken::new(),
            listener_shutdown: CancellationToken::new(),
            listener: Mutex::new(None),
            window: Mutex::new(RunWindow::default()),
            signal_tx: Mutex::new(Some(signal_tx)),
            signal_rx: tokio::sync::Mutex::new(signal_rx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn states(&self) -> &JobStatStore {
        &self.states
    }

    pub fn tx_stats(&self) -> &TxStatStore {
        &self.tx_stats
    }

    pub fn window(&self) -> RunWindow {
        *lock(&self.window)
    }

    /// Run every job from `jobs` until the channel closes or [`stop`] is
    /// called, then wait for all started jobs to record their results.
    ///
    /// Only the first call does anything; later calls return immediately.
    /// Fails only when the event subscription cannot be established.
    ///
    /// [`stop`]: JobRunner::stop
    pub async fn execute(&self, mut jobs: mpsc::Receiver<Job>) -> Result<(), RunnerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Runner {} has already executed", self.name);
            return Ok(());
        }

        self.start_listener().await?;

        // Give the event subscription time to settle before submitting
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = sleep(self.config.warm_up()) => {}
        }

        lock(&self.window).start = Some(Utc::now());
        let concurrency = self.config.concurrency();
        info!(
            "Runner {} started with {} jobs in flight at most",
            self.name, concurrency
        );

        let budget = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        let mut received = 0u64;

        loop {
            // Reap finished jobs
            while let Some(res) = tasks.try_join_next() {
                report_job(res);
            }

            // Acquire budget, then pull the next job
            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    info!("Stopping job runner {}", self.name);
                    break;
                }
                permit = budget.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    info!("Stopping job runner {}", self.name);
                    break;
                }
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => {
                        info!("Job channel closed after {} jobs", received);
                        break;
                    }
                },
            };

            received += 1;
            debug!("Receive new job: {}", job.name);

            // Execute in background; the permit is released once the result is stored
            let client = self.client.clone();
            let states = self.states.clone();
            tasks.spawn(async move {
                let stat = job.execute(client.as_ref()).await;
                debug!("{} has done", stat.name);
                states.set(stat);
                drop(permit);
            });
        }

        // Wait for in-flight jobs
        if !tasks.is_empty() {
            info!("Waiting for {} in-flight jobs to complete...", tasks.len());
        }
        while let Some(res) = tasks.join_next().await {
            report_job(res);
        }

        lock(&self.window).stop = Some(Utc::now());
        // Idle window starts counting from here
        self.dispatched.cancel();
        info!(
            "Runner {} drained: {} jobs received, {} results recorded",
            self.name,
            received,
            self.states.len()
        );
        Ok(())
    }

    async fn start_listener(&self) -> Result<(), RunnerError> {
        let Some(signals) = lock(&self.signal_tx).take() else {
            return Err(RunnerError::ListenerGone);
        };

        let listener = ConfirmationListener::new(
            self.states.clone(),
            self.tx_stats.clone(),
            self.config.idle_timeout(),
        );
        let (handle, ready) = listener.spawn(
            self.events.clone(),
            signals,
            self.dispatched.clone(),
            self.listener_shutdown.clone(),
        );
        *lock(&self.listener) = Some(handle);

        match ready.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RunnerError::Subscribe(e)),
            Err(_) => Err(RunnerError::ListenerGone),
        }
    }

    /// Stop taking new jobs. Jobs already started still run to completion.
    pub fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            warn!("Runner {} has been stopped", self.name);
            return;
        }
        self.stop.cancel();
    }

    /// Next listener signal; `None` once the listener has exited and every
    /// signal has been read.
    pub async fn next_signal(&self) -> Option<RunnerSignal> {
        self.signal_rx.lock().await.recv().await
    }

    /// Stop the block listener and wait for its pending event handlers.
    pub async fn shutdown(&self) {
        self.listener_shutdown.cancel();
        let handle = lock(&self.listener).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Block listener task failed: {}", e);
            }
        }
    }

    pub fn collect_stats(&self, failed_sample_size: usize) -> RunSummary {
        StatsCollector::new(failed_sample_size).collect(
            &self.name,
            &self.states,
            &self.tx_stats,
            self.window(),
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn report_job(res: Result<(), JoinError>) {
    if let Err(e) = res {
        warn!("Job task failed: {}", e);
    }
}
