//! Simulation metrics.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

/// Outcome counters and latency samples of a run.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Transfers submitted.
    pub total_transfers: u64,
    /// Transfers committed.
    pub successful_transfers: u64,
    /// Transfers that returned an error.
    pub failed_transfers: u64,
    /// Transfers whose outcome differed from the plan.
    pub unexpected_outcomes: u64,
    /// Latency samples (microseconds).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

/// Serializable view of the metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_transfers: u64,
    pub successful_transfers: u64,
    pub failed_transfers: u64,
    pub unexpected_outcomes: u64,
    pub success_rate: f64,
    pub average_latency_us: u64,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
    pub throughput_per_sec: f64,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_transfers: 0,
            successful_transfers: 0,
            failed_transfers: 0,
            unexpected_outcomes: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a committed transfer.
    pub fn record_success(&mut self, latency: Duration) {
        self.total_transfers += 1;
        self.successful_transfers += 1;
        self.record_latency(latency);
    }

    /// Record a failed transfer.
    pub fn record_failure(&mut self, latency: Duration) {
        self.total_transfers += 1;
        self.failed_transfers += 1;
        self.record_latency(latency);
    }

    /// Record a transfer that committed when it should have failed, or the
    /// reverse.
    pub fn record_unexpected(&mut self) {
        self.unexpected_outcomes += 1;
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples
            .push_back(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX));
    }

    /// Get average latency in microseconds.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p50 latency.
    pub fn p50_latency_us(&self) -> u64 {
        self.percentile_latency(50)
    }

    /// Get p99 latency.
    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get success rate.
    pub fn success_rate(&self) -> f64 {
        if self.total_transfers == 0 {
            return 0.0;
        }

        self.successful_transfers as f64 / self.total_transfers as f64
    }

    /// Get throughput (transfers per second).
    pub fn throughput(&self, elapsed: Duration) -> f64 {
        if elapsed.is_zero() {
            return 0.0;
        }

        self.total_transfers as f64 / elapsed.as_secs_f64()
    }

    /// Summarize for reporting.
    pub fn summary(&self, elapsed: Duration) -> MetricsSummary {
        MetricsSummary {
            total_transfers: self.total_transfers,
            successful_transfers: self.successful_transfers,
            failed_transfers: self.failed_transfers,
            unexpected_outcomes: self.unexpected_outcomes,
            success_rate: self.success_rate(),
            average_latency_us: self.average_latency_us(),
            p50_latency_us: self.p50_latency_us(),
            p99_latency_us: self.p99_latency_us(),
            throughput_per_sec: self.throughput(elapsed),
        }
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
