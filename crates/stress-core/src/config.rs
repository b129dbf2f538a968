use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MAX_IN_FLIGHT: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerConfig,
    pub events: EventsConfig,
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.workload.target.url).with_context(|| {
            format!("Invalid workload.target.url: {}", self.workload.target.url)
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!("workload.target.url must be http:// or https:// (got {})", url);
        }
        if url.host_str().is_none() {
            anyhow::bail!("workload.target.url must include a host (got {})", url);
        }
        if self.events.addr.trim().is_empty() {
            anyhow::bail!("events.addr must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Runner name used in logs and result file names
    #[serde(default = "default_runner_name")]
    pub name: String,
    /// Maximum concurrently executing jobs; 0 means the default of 10
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
    /// Delay between subscribing to events and submitting the first job
    #[serde(default = "default_warm_up_ms")]
    pub warm_up_ms: u64,
    /// Quiescence window after which the event stream is considered drained
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Per-request timeout of the submit transport
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl RunnerConfig {
    pub fn concurrency(&self) -> usize {
        if self.max_in_flight == 0 {
            DEFAULT_MAX_IN_FLIGHT as usize
        } else {
            self.max_in_flight as usize
        }
    }

    pub fn warm_up(&self) -> Duration {
        Duration::from_millis(self.warm_up_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: default_runner_name(),
            max_in_flight: default_max_in_flight(),
            warm_up_ms: default_warm_up_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_runner_name() -> String {
    "stress_runner".to_string()
}

fn default_max_in_flight() -> u32 {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_warm_up_ms() -> u64 {
    2_000
}

fn default_idle_timeout_ms() -> u64 {
    20_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Event server address, e.g. "127.0.0.1:7053"
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Chaincode endpoint, e.g. "http://localhost:7050/chaincode"
    pub url: String,
    pub chaincode_id: String,
    /// `true` submits state-mutating invokes, `false` read-only queries
    #[serde(default)]
    pub is_invoke: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Jobs are named `<job_prefix>_<i>`
    pub job_prefix: String,
    pub count: u64,
    /// First job index is `offset + 1`
    #[serde(default)]
    pub offset: u64,
    pub target: TargetConfig,
    /// Argument templates; `{i}` is replaced by the job index
    #[serde(default)]
    pub args: Vec<String>,
    /// Optional feed rate in jobs per second
    #[serde(default)]
    pub tps: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_failed_sample_size")]
    pub failed_sample_size: usize,
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            failed_sample_size: default_failed_sample_size(),
            results_dir: default_results_dir(),
        }
    }
}

fn default_failed_sample_size() -> usize {
    10
}

fn default_results_dir() -> String {
    "results".to_string()
}
