use chrono::Duration;

use super::context::{ActivityEntry, AddressActivity};
use super::score::{mean_stddev, median, ramp, rank, to_f64};
use crate::config::HeuristicConfig;
use crate::core::{ThreatType, TrackedContract, Transaction, TxStatus};

/// Everything a heuristic may look at besides the transaction itself.
pub struct HeuristicContext<'a> {
    pub contract: &'a TrackedContract,
    /// Prior transactions to the contract, excluding the one under evaluation.
    pub activity: &'a AddressActivity,
    pub config: &'a HeuristicConfig,
}

/// Raw output of a heuristic before weighting.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    /// Unweighted confidence, nominally 0-100.
    pub confidence: f64,
    pub description: String,
}

/// A stateless rule scoring one transaction for one threat category.
///
/// Implementations must not mutate anything; they only read the
/// transaction and the context.
pub trait Heuristic {
    fn threat_type(&self) -> ThreatType;
    fn name(&self) -> &str {
        self.threat_type().as_str()
    }
    fn evaluate(&self, tx: &Transaction, ctx: &HeuristicContext<'_>) -> Option<Finding>;
}

/// Return all default heuristics.
pub fn default_heuristics() -> Vec<Box<dyn Heuristic + Send + Sync>> {
    vec![
        Box::new(FrontRunHeuristic),
        Box::new(SandwichHeuristic),
        Box::new(SuspiciousVolumeHeuristic),
        Box::new(GasManipulationHeuristic),
        Box::new(ReentrancyHeuristic),
        Box::new(HoneypotHeuristic),
    ]
}

/// Coarse semantic class of a decoded method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Withdraw,
    Deposit,
    Other,
}

impl MethodKind {
    /// `None` when the method was never decoded to a name.
    pub fn classify(method: &str) -> Option<Self> {
        let m = method.trim().to_ascii_lowercase();
        if m.is_empty() || m.starts_with("0x") {
            return None;
        }
        const WITHDRAW: &[&str] = &["withdraw", "redeem", "claim", "sell", "unstake", "exit", "swapexacttokensforeth"];
        const DEPOSIT: &[&str] = &["deposit", "mint", "buy", "stake", "swapexactethfortokens", "swapethforexacttokens"];
        if WITHDRAW.iter().any(|p| m.starts_with(p)) {
            Some(MethodKind::Withdraw)
        } else if DEPOSIT.iter().any(|p| m.starts_with(p)) {
            Some(MethodKind::Deposit)
        } else {
            Some(MethodKind::Other)
        }
    }
}

fn entry_kind(entry: &ActivityEntry) -> Option<MethodKind> {
    entry.method.as_deref().and_then(MethodKind::classify)
}

// --- Individual Heuristics ---

/// Outbids a competing pending transaction to the same method.
struct FrontRunHeuristic;
impl Heuristic for FrontRunHeuristic {
    fn threat_type(&self) -> ThreatType {
        ThreatType::FrontRun
    }

    fn evaluate(&self, tx: &Transaction, ctx: &HeuristicContext<'_>) -> Option<Finding> {
        let cfg = ctx.config;
        let since = tx.observed_at - Duration::milliseconds(cfg.front_run_window_ms);
        let window: Vec<&ActivityEntry> = ctx.activity.between(since, tx.observed_at).collect();
        if window.len() < cfg.front_run_min_samples.max(1) {
            return None;
        }

        let gas = to_f64(tx.gas_price);
        let prices: Vec<f64> = window.iter().map(|e| e.gas_price).collect();
        let market = median(&prices);
        if gas <= market || rank(&prices, gas) < cfg.front_run_percentile {
            return None;
        }

        let victim = window
            .iter()
            .rev()
            .find(|e| e.from != tx.from && e.same_method(tx.method.as_deref()) && e.gas_price < gas)?;

        let premium = if market > 0.0 { gas / market } else { 10.0 };
        let gap_ms = (tx.observed_at - victim.observed_at).num_milliseconds();
        Some(Finding {
            confidence: ramp(premium, 1.0, 3.0, 45.0, 95.0),
            description: format!(
                "gas price {gas} is {premium:.1}x the recent median {market} and outbids {} on the same method {gap_ms}ms later",
                victim.hash
            ),
        })
    }
}

/// Back-run completing a bracket around an earlier victim.
struct SandwichHeuristic;
impl Heuristic for SandwichHeuristic {
    fn threat_type(&self) -> ThreatType {
        ThreatType::Sandwich
    }

    fn evaluate(&self, tx: &Transaction, ctx: &HeuristicContext<'_>) -> Option<Finding> {
        let since = tx.observed_at - Duration::milliseconds(ctx.config.sandwich_window_ms);
        let window: Vec<&ActivityEntry> = ctx.activity.between(since, tx.observed_at).collect();
        if window.len() < 2 {
            return None;
        }

        let gas = to_f64(tx.gas_price);
        let market = median(&window.iter().map(|e| e.gas_price).collect::<Vec<_>>());
        if gas >= market {
            return None;
        }

        let mut best: Option<(f64, &ActivityEntry, &ActivityEntry)> = None;
        for (j, victim) in window.iter().enumerate().rev() {
            if victim.from == tx.from {
                continue;
            }
            for front in window[..j].iter().rev() {
                if front.from == victim.from || front.gas_price <= market || front.gas_price <= victim.gas_price {
                    continue;
                }
                let same_attacker = front.from == tx.from;
                let same_method = front.same_method(victim.method.as_deref())
                    && victim.same_method(tx.method.as_deref());
                if !same_attacker && !same_method {
                    continue;
                }
                let mut confidence: f64 = if same_attacker { 70.0 } else { 50.0 };
                if same_method {
                    confidence += 15.0;
                }
                if best.as_ref().is_none_or(|(c, _, _)| confidence > *c) {
                    best = Some((confidence, *front, *victim));
                }
            }
        }

        let (confidence, front, victim) = best?;
        Some(Finding {
            confidence,
            description: format!(
                "{} (gas {}) and this tx (gas {gas}) bracket victim {} (gas {}) around market {market}",
                front.hash, front.gas_price, victim.hash, victim.gas_price
            ),
        })
    }
}

/// Value far above the contract's rolling mean.
struct SuspiciousVolumeHeuristic;
impl Heuristic for SuspiciousVolumeHeuristic {
    fn threat_type(&self) -> ThreatType {
        ThreatType::SuspiciousVolume
    }

    fn evaluate(&self, tx: &Transaction, ctx: &HeuristicContext<'_>) -> Option<Finding> {
        let cfg = ctx.config;
        let values: Vec<f64> = ctx.activity.entries().iter().map(|e| e.value).collect();
        if values.len() < cfg.volume_min_samples.max(2) {
            return None;
        }
        let value = to_f64(tx.value);
        let (mean, sd) = mean_stddev(&values);
        // Floor the deviation so a perfectly flat history does not make every
        // slightly larger value an outlier.
        let sd = sd.max(mean.abs() * 0.01).max(f64::EPSILON);
        let z = (value - mean) / sd;
        if z <= cfg.volume_stddev_threshold {
            return None;
        }
        let threshold = cfg.volume_stddev_threshold;
        Some(Finding {
            confidence: ramp(z, threshold, threshold * 3.0, 50.0, 95.0),
            description: format!(
                "value {value} is {z:.1} standard deviations above the rolling mean {mean:.4} over {} txs",
                values.len()
            ),
        })
    }
}

/// Gas price far above the recent median for the same address.
struct GasManipulationHeuristic;
impl Heuristic for GasManipulationHeuristic {
    fn threat_type(&self) -> ThreatType {
        ThreatType::GasManipulation
    }

    fn evaluate(&self, tx: &Transaction, ctx: &HeuristicContext<'_>) -> Option<Finding> {
        const SAMPLE: usize = 50;
        let cfg = ctx.config;
        let prices: Vec<f64> = ctx.activity.latest(SAMPLE).map(|e| e.gas_price).collect();
        if prices.len() < cfg.gas_min_samples.max(1) {
            return None;
        }
        let market = median(&prices);
        if market <= 0.0 {
            return None;
        }
        let gas = to_f64(tx.gas_price);
        let ratio = gas / market;
        if ratio < cfg.gas_multiple {
            return None;
        }
        Some(Finding {
            confidence: ramp(ratio, cfg.gas_multiple, cfg.gas_multiple * 3.0, 50.0, 95.0),
            description: format!("gas price {gas} is {ratio:.1}x the median {market} of the last {} txs", prices.len()),
        })
    }
}

/// Same sender hammering a withdraw-like method.
struct ReentrancyHeuristic;
impl Heuristic for ReentrancyHeuristic {
    fn threat_type(&self) -> ThreatType {
        ThreatType::Reentrancy
    }

    fn evaluate(&self, tx: &Transaction, ctx: &HeuristicContext<'_>) -> Option<Finding> {
        let method = tx.method.as_deref()?;
        if MethodKind::classify(method)? != MethodKind::Withdraw {
            return None;
        }
        let cfg = ctx.config;
        let since = tx.observed_at - Duration::milliseconds(cfg.reentrancy_window_ms);
        let repeats = 1 + ctx
            .activity
            .between(since, tx.observed_at)
            .filter(|e| e.from == tx.from && e.same_method(Some(method)))
            .count();
        let min = cfg.reentrancy_min_repeats.max(2);
        if repeats < min {
            return None;
        }
        Some(Finding {
            confidence: ramp(repeats as f64, min as f64, (min * 3) as f64, 60.0, 95.0),
            description: format!(
                "{} called {method} {repeats} times within {}ms",
                tx.from, cfg.reentrancy_window_ms
            ),
        })
    }
}

/// Deposits keep flowing in while withdrawals from others fail.
struct HoneypotHeuristic;
impl Heuristic for HoneypotHeuristic {
    fn threat_type(&self) -> ThreatType {
        ThreatType::Honeypot
    }

    fn evaluate(&self, tx: &Transaction, ctx: &HeuristicContext<'_>) -> Option<Finding> {
        let method = tx.method.as_deref()?;
        if MethodKind::classify(method)? != MethodKind::Deposit || tx.value.is_zero() {
            return None;
        }

        let withdrawals: Vec<&ActivityEntry> = ctx
            .activity
            .entries()
            .iter()
            .filter(|e| entry_kind(e) == Some(MethodKind::Withdraw))
            .collect();
        if withdrawals.iter().any(|e| e.status == TxStatus::Confirmed) {
            return None;
        }
        let mut failed_senders: Vec<&str> = withdrawals
            .iter()
            .filter(|e| e.status == TxStatus::Failed)
            .map(|e| e.from.as_str())
            .collect();
        failed_senders.sort_unstable();
        failed_senders.dedup();

        let min = ctx.config.honeypot_min_failed.max(1);
        let distinct = failed_senders.len();
        if distinct < min {
            return None;
        }
        Some(Finding {
            confidence: ramp(distinct as f64, min as f64, (min * 3) as f64, 60.0, 95.0),
            description: format!(
                "{method} with value {} while {distinct} distinct senders failed to withdraw and none succeeded",
                tx.value
            ),
        })
    }
}
