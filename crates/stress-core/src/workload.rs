use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::WorkloadConfig;
use crate::job::{ChaincodeCommand, Job};

/// Produces the input job stream from a workload description.
#[derive(Debug, Clone)]
pub struct Workload {
    config: WorkloadConfig,
}

impl Workload {
    pub fn new(config: WorkloadConfig) -> Self {
        Self { config }
    }

    pub fn indices(&self) -> RangeInclusive<u64> {
        if self.config.count == 0 {
            return 1..=0;
        }
        let first = self.config.offset.saturating_add(1);
        let last = self.config.offset.saturating_add(self.config.count);
        first..=last
    }

    pub fn job(&self, i: u64) -> Job {
        let target = &self.config.target;
        let command = ChaincodeCommand {
            url: target.url.clone(),
            chaincode_id: target.chaincode_id.clone(),
            args: self.config.args.iter().map(|a| render(a, i)).collect(),
            is_invoke: target.is_invoke,
        };
        Job::new(format!("{}_{}", self.config.job_prefix, i), command)
    }

    /// Feed every job into a bounded channel, paced by `tps` when set.
    ///
    /// The channel closes once the workload is exhausted. The task resolves
    /// to the number of jobs handed over.
    pub fn spawn_feeder(self, capacity: usize) -> (mpsc::Receiver<Job>, JoinHandle<u64>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = self.config.tps.filter(|tps| *tps > 0).map(|tps| {
                let period = Duration::from_micros((1_000_000 / tps).max(1));
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            let mut fed = 0u64;
            for i in self.indices() {
                if let Some(ticker) = ticker.as_mut() {
                    ticker.tick().await;
                }
                if tx.send(self.job(i)).await.is_err() {
                    debug!("Job receiver dropped after {} jobs", fed);
                    break;
                }
                fed += 1;
            }
            info!("Fed {} jobs", fed);
            fed
        });

        (rx, handle)
    }
}

fn render(template: &str, i: u64) -> String {
    template.replace("{i}", &i.to_string())
}
