use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobStat;
use crate::store::{JobStatStore, TxStatStore};

const NANOS_PER_MS: f64 = 1_000_000.0;

/// Start/stop of one dispatch, used for throughput figures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindow {
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
}

impl RunWindow {
    pub fn elapsed_ms(&self) -> Option<f64> {
        let nanos = (self.stop? - self.start?).num_nanoseconds()?;
        (nanos > 0).then(|| nanos as f64 / NANOS_PER_MS)
    }
}

/// Running min/max/sum over positive samples only.
#[derive(Debug, Clone, Default)]
struct CostTracker {
    samples: u64,
    total_nanos: i128,
    min_nanos: Option<i64>,
    max_nanos: Option<i64>,
}

impl CostTracker {
    fn record(&mut self, from: DateTime<Utc>, to: DateTime<Utc>) {
        let Some(nanos) = (to - from).num_nanoseconds() else {
            return;
        };
        if nanos <= 0 {
            return;
        }
        self.samples += 1;
        self.total_nanos += nanos as i128;
        self.min_nanos = Some(self.min_nanos.map_or(nanos, |m| m.min(nanos)));
        self.max_nanos = Some(self.max_nanos.map_or(nanos, |m| m.max(nanos)));
    }

    /// `divisor` is the population the average is taken over, not the
    /// sample count.
    fn summary(&self, divisor: u64) -> CostSummary {
        let avg_ms =
            (divisor > 0).then(|| self.total_nanos as f64 / divisor as f64 / NANOS_PER_MS);
        CostSummary {
            samples: self.samples,
            min_ms: self.min_nanos.map(|n| n as f64 / NANOS_PER_MS),
            avg_ms,
            max_ms: self.max_nanos.map(|n| n as f64 / NANOS_PER_MS),
        }
    }
}

/// Latency figures in milliseconds; `None` means no data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub samples: u64,
    pub min_ms: Option<f64>,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The submit call itself failed
    Transport,
    /// The ledger explicitly rejected the transaction
    Rejected,
    /// No commit or rejection arrived before the run went idle
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub name: String,
    pub tx_id: String,
    pub kind: FailureKind,
    pub error: String,
}

/// Single pass over the job store; never mutates it.
pub struct StatsCollector {
    failed_sample_size: usize,
    job_count: u64,
    finished: u64,
    success: u64,
    failed: u64,
    unconfirmed: u64,
    rejected: u64,
    transport_errors: u64,
    execution: CostTracker,
    confirmation: CostTracker,
    failed_samples: Vec<FailedJob>,
}

impl StatsCollector {
    pub fn new(failed_sample_size: usize) -> Self {
        Self {
            failed_sample_size,
            job_count: 0,
            finished: 0,
            success: 0,
            failed: 0,
            unconfirmed: 0,
            rejected: 0,
            transport_errors: 0,
            execution: CostTracker::default(),
            confirmation: CostTracker::default(),
            failed_samples: Vec::new(),
        }
    }

    pub fn collect(
        mut self,
        name: &str,
        store: &JobStatStore,
        confirmed: &TxStatStore,
        window: RunWindow,
    ) -> RunSummary {
        for stat in store.snapshot() {
            let tx_stat = if stat.has_tx() {
                confirmed.get(&stat.tx_id)
            } else {
                None
            };
            self.record(&stat, tx_stat.as_ref());
        }
        self.summary(name, window)
    }

    pub fn record(&mut self, stat: &JobStat, tx_stat: Option<&JobStat>) {
        self.job_count += 1;
        self.finished += 1;
        self.execution.record(stat.submit_time, stat.executed_time);

        if !stat.has_tx() {
            if stat.is_success {
                self.success += 1;
            } else {
                self.transport_errors += 1;
                self.fail(stat, FailureKind::Transport, &stat.error_msg);
            }
            return;
        }

        match tx_stat {
            None => {
                self.unconfirmed += 1;
                self.fail(stat, FailureKind::Unconfirmed, &stat.error_msg);
            }
            Some(tx) if tx.is_success => {
                self.success += 1;
                if let Some(confirmed_time) = tx.confirmed_time {
                    self.confirmation.record(stat.executed_time, confirmed_time);
                }
            }
            Some(tx) => {
                self.rejected += 1;
                self.fail(stat, FailureKind::Rejected, &tx.error_msg);
            }
        }
    }

    fn fail(&mut self, stat: &JobStat, kind: FailureKind, error: &str) {
        self.failed += 1;
        if self.failed_samples.len() < self.failed_sample_size {
            self.failed_samples.push(FailedJob {
                name: stat.name.clone(),
                tx_id: stat.tx_id.clone(),
                kind,
                error: error.to_string(),
            });
        }
    }

    pub fn summary(&self, name: &str, window: RunWindow) -> RunSummary {
        let total_time_ms = window.elapsed_ms();
        let per_sec = |count: u64| total_time_ms.map(|ms| count as f64 * 1000.0 / ms);

        RunSummary {
            name: name.to_string(),
            started_at: window.start,
            stopped_at: window.stop,
            total_time_ms,
            job_count: self.job_count,
            finished_count: self.finished,
            success_count: self.success,
            failed_count: self.failed,
            unconfirmed_count: self.unconfirmed,
            rejected_count: self.rejected,
            transport_error_count: self.transport_errors,
            jobs_per_sec: per_sec(self.job_count),
            successes_per_sec: per_sec(self.success),
            execution: self.execution.summary(self.job_count),
            confirmation: self.confirmation.summary(self.success),
            failed_samples: self.failed_samples.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub total_time_ms: Option<f64>,
    pub job_count: u64,
    /// Always `success_count + failed_count`
    pub finished_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub unconfirmed_count: u64,
    pub rejected_count: u64,
    pub transport_error_count: u64,
    pub jobs_per_sec: Option<f64>,
    pub successes_per_sec: Option<f64>,
    pub execution: CostSummary,
    pub confirmation: CostSummary,
    pub failed_samples: Vec<FailedJob>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn stat(name: &str, tx_id: &str, exec_ms: i64) -> JobStat {
        JobStat {
            job_id: format!("id-{}", name),
            name: name.to_string(),
            tx_id: tx_id.to_string(),
            submit_time: t0(),
            executed_time: t0() + Duration::milliseconds(exec_ms),
            confirmed_time: None,
            is_success: tx_id.is_empty(),
            is_done: tx_id.is_empty(),
            error_msg: String::new(),
        }
    }

    fn window(ms: i64) -> RunWindow {
        RunWindow {
            start: Some(t0()),
            stop: Some(t0() + Duration::milliseconds(ms)),
        }
    }

    #[test]
    fn test_read_only_jobs_all_succeed() {
        let store = JobStatStore::new();
        for (i, ms) in [10, 20, 30].into_iter().enumerate() {
            store.set(stat(&format!("query_{}", i), "", ms));
        }

        let summary =
            StatsCollector::new(10).collect("q", &store, &TxStatStore::new(), window(2000));

        assert_eq!(summary.job_count, 3);
        assert_eq!(summary.success_count, 3);
        assert_eq!(summary.failed_count, 0);
        assert_eq!(summary.finished_count, 3);
        assert_eq!(summary.execution.min_ms, Some(10.0));
        assert_eq!(summary.execution.max_ms, Some(30.0));
        assert_eq!(summary.execution.avg_ms, Some(20.0));
        assert_eq!(summary.jobs_per_sec, Some(1.5));
        assert_eq!(summary.confirmation.avg_ms, None);
        assert_eq!(summary.confirmation.samples, 0);
    }

    #[test]
    fn test_confirmation_outcomes_are_classified() {
        let store = JobStatStore::new();
        let confirmed = TxStatStore::new();

        let committed = stat("commit", "T1", 10);
        store.set(committed.clone());
        confirmed.set(committed.committed(committed.executed_time + Duration::milliseconds(500)));

        let rejected = stat("reject", "T2", 10);
        store.set(rejected.clone());
        confirmed.set(rejected.rejected(t0(), "insufficient funds"));

        store.set(stat("silent", "T3", 10));

        let mut broken = stat("broken", "", 10);
        broken.is_success = false;
        broken.error_msg = "connection refused".to_string();
        store.set(broken);

        let summary = StatsCollector::new(10).collect("mixed", &store, &confirmed, window(1000));

        assert_eq!(summary.job_count, 4);
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.failed_count, 3);
        assert_eq!(
            summary.success_count + summary.failed_count,
            summary.finished_count
        );
        assert!(summary.finished_count <= summary.job_count);
        assert_eq!(summary.unconfirmed_count, 1);
        assert_eq!(summary.rejected_count, 1);
        assert_eq!(summary.transport_error_count, 1);
        assert_eq!(summary.confirmation.min_ms, Some(500.0));
        assert_eq!(summary.confirmation.avg_ms, Some(500.0));

        let by_name = |name: &str| {
            summary
                .failed_samples
                .iter()
                .find(|f| f.name == name)
                .cloned()
                .unwrap()
        };
        assert_eq!(by_name("reject").kind, FailureKind::Rejected);
        assert_eq!(by_name("reject").error, "insufficient funds");
        assert_eq!(by_name("silent").kind, FailureKind::Unconfirmed);
        assert_eq!(by_name("silent").error, "");
        assert_eq!(by_name("broken").kind, FailureKind::Transport);
        assert_eq!(by_name("broken").error, "connection refused");
    }

    #[test]
    fn test_min_is_first_positive_sample_then_smaller_ones() {
        let mut collector = StatsCollector::new(0);
        collector.record(&stat("a", "", 0), None);
        collector.record(&stat("b", "", 50), None);
        collector.record(&stat("c", "", 10), None);
        collector.record(&stat("d", "", 30), None);

        let summary = collector.summary("min", RunWindow::default());
        // the zero-cost sample is skipped rather than pinning min at 0
        assert_eq!(summary.execution.samples, 3);
        assert_eq!(summary.execution.min_ms, Some(10.0));
        assert_eq!(summary.execution.max_ms, Some(50.0));
        assert_eq!(summary.execution.avg_ms, Some(22.5));
    }

    #[test]
    fn test_negative_costs_are_ignored() {
        let mut collector = StatsCollector::new(0);
        collector.record(&stat("skewed", "", -5), None);

        let summary = collector.summary("skew", RunWindow::default());
        assert_eq!(summary.execution.samples, 0);
        assert_eq!(summary.execution.min_ms, None);
        assert_eq!(summary.execution.avg_ms, Some(0.0));
    }

    #[test]
    fn test_empty_run_reports_no_data() {
        let summary = StatsCollector::new(10).collect(
            "empty",
            &JobStatStore::new(),
            &TxStatStore::new(),
            RunWindow::default(),
        );

        assert_eq!(summary.job_count, 0);
        assert_eq!(summary.execution.avg_ms, None);
        assert_eq!(summary.confirmation.avg_ms, None);
        assert_eq!(summary.total_time_ms, None);
        assert_eq!(summary.jobs_per_sec, None);
    }

    #[test]
    fn test_failed_samples_are_bounded() {
        let store = JobStatStore::new();
        for i in 0..25 {
            store.set(stat(&format!("invoke_{}", i), &format!("T{}", i), 5));
        }

        let summary =
            StatsCollector::new(10).collect("bounded", &store, &TxStatStore::new(), window(100));

        assert_eq!(summary.failed_count, 25);
        assert_eq!(summary.failed_samples.len(), 10);
    }
}
