use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::StatsConfig;
use crate::core::{StatsSnapshot, Transaction, TxStatus};

/// Hard cap on `stats.max_samples`.
const MAX_WINDOW_SAMPLES: usize = 1_000_000;

struct Sample {
    hash: String,
    observed_at: DateTime<Utc>,
    gas_price: Decimal,
    value: Decimal,
    status: TxStatus,
    tracked: bool,
    threats: u64,
}

/// Running sums over the samples currently in the window.
#[derive(Default)]
struct WindowState {
    samples: VecDeque<Sample>,
    newest: Option<DateTime<Utc>>,
    gas_sum: Decimal,
    value_sum: Decimal,
    pending: u64,
    tracked_activity: u64,
    threats: u64,
    total_ingested: u64,
    rejected: u64,
    tracked_contracts: u64,
}

impl WindowState {
    fn push(&mut self, sample: Sample) {
        // Quantities are bounded at normalization; saturation never kicks in
        // for windows up to MAX_WINDOW_SAMPLES.
        self.gas_sum = self.gas_sum.saturating_add(sample.gas_price);
        self.value_sum = self.value_sum.saturating_add(sample.value);
        if sample.status == TxStatus::Pending {
            self.pending += 1;
        }
        if sample.tracked {
            self.tracked_activity += 1;
        }
        self.threats += sample.threats;
        self.samples.push_back(sample);
    }

    fn pop_front(&mut self) {
        let Some(sample) = self.samples.pop_front() else {
            return;
        };
        self.gas_sum = self.gas_sum.saturating_sub(sample.gas_price);
        self.value_sum = self.value_sum.saturating_sub(sample.value);
        if sample.status == TxStatus::Pending {
            self.pending = self.pending.saturating_sub(1);
        }
        if sample.tracked {
            self.tracked_activity = self.tracked_activity.saturating_sub(1);
        }
        self.threats = self.threats.saturating_sub(sample.threats);
    }
}

/// Rolling aggregate metrics over a sliding time window.
///
/// The window is anchored at the newest observed timestamp and also capped by
/// sample count. Samples are evicted in arrival order.
pub struct StatsAggregator {
    window: Duration,
    max_samples: usize,
    state: Mutex<WindowState>,
}

impl StatsAggregator {
    pub fn new(config: &StatsConfig) -> Self {
        Self {
            window: Duration::seconds(config.window_secs.max(1)),
            max_samples: config.max_samples.clamp(1, MAX_WINDOW_SAMPLES),
            state: Mutex::new(WindowState::default()),
        }
    }

    /// Fold one newly accepted transaction into the window.
    pub fn update(&self, tx: &Transaction, tracked: bool, threats: usize) -> StatsSnapshot {
        let mut state = self.state.lock();
        state.total_ingested += 1;

        let newest = match state.newest {
            Some(prev) if prev >= tx.observed_at => prev,
            _ => tx.observed_at,
        };
        state.newest = Some(newest);
        let cutoff = newest - self.window;

        if tx.observed_at >= cutoff {
            state.push(Sample {
                hash: tx.hash.clone(),
                observed_at: tx.observed_at,
                gas_price: tx.gas_price,
                value: tx.value,
                status: tx.status,
                tracked,
                threats: threats as u64,
            });
        } else {
            debug!(hash = %tx.hash, "Transaction older than stats window, counted but not sampled");
        }

        while state.samples.len() > self.max_samples
            || state.samples.front().is_some_and(|s| s.observed_at < cutoff)
        {
            state.pop_front();
        }

        self.build(&state)
    }

    /// Apply a status transition to a windowed sample, if still present.
    pub fn record_status_change(&self, hash: &str, previous: TxStatus, current: TxStatus) {
        let mut state = self.state.lock();
        let Some(sample) = state.samples.iter_mut().rev().find(|s| s.hash == hash) else {
            return;
        };
        if sample.status != previous {
            return;
        }
        sample.status = current;
        let was_pending = previous == TxStatus::Pending;
        let is_pending = current == TxStatus::Pending;
        if was_pending && !is_pending {
            state.pending = state.pending.saturating_sub(1);
        } else if !was_pending && is_pending {
            state.pending += 1;
        }
    }

    pub fn record_rejected(&self) {
        self.state.lock().rejected += 1;
    }

    pub fn set_tracked_contracts(&self, count: usize) {
        self.state.lock().tracked_contracts = count as u64;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.build(&self.state.lock())
    }

    fn build(&self, state: &WindowState) -> StatsSnapshot {
        let n = state.samples.len();
        let (window_start, window_end) = match state.newest {
            Some(newest) => {
                let start = state
                    .samples
                    .front()
                    .map(|s| s.observed_at.min(newest))
                    .unwrap_or(newest);
                (start.max(newest - self.window), newest)
            }
            None => {
                let now = Utc::now();
                (now, now)
            }
        };
        let avg_gas_price = if n == 0 {
            Decimal::ZERO
        } else {
            (state.gas_sum / Decimal::from(n)).normalize()
        };

        StatsSnapshot {
            pending_count: state.pending,
            avg_gas_price,
            total_value_observed: state.value_sum.normalize(),
            tracked_contract_count: state.tracked_contracts,
            threats_detected_count: state.threats,
            window_start,
            window_end,
            sample_count: n as u64,
            tracked_activity_count: state.tracked_activity,
            total_ingested: state.total_ingested,
            rejected_count: state.rejected,
            dropped_events: 0,
        }
    }
}
