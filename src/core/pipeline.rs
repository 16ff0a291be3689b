use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Duration;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::mempool::{Observation, RecentTransactions};
use crate::core::tx::{RawTransaction, normalize, normalize_address, normalize_bytes};
use crate::core::{StatsSnapshot, ThreatDetection, TrackedContract, Transaction, TxStatus};
use crate::dispatch::Dispatcher;
use crate::error::{EngineError, Result};
use crate::registry::{AddOutcome, ContractRegistry};
use crate::signals::HeuristicEngine;
use crate::signals::context::AddressActivity;
use crate::stats::StatsAggregator;

/// Bounded most-recent-N store of detections.
#[derive(Debug)]
pub struct DetectionLog {
    entries: VecDeque<ThreatDetection>,
    capacity: usize,
}

impl DetectionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, detection: ThreatDetection) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(detection);
    }

    /// Up to `limit` detections, most recent first.
    pub fn recent(&self, limit: usize) -> Vec<ThreatDetection> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    /// All retained detections, oldest first.
    pub fn all(&self) -> Vec<ThreatDetection> {
        self.entries.iter().cloned().collect()
    }

}

/// What happened to one raw payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestResult {
    /// `false` when the payload was rejected as malformed.
    pub accepted: bool,
    /// The transaction was addressed to a tracked contract.
    pub tracked: bool,
    pub detections: Vec<ThreatDetection>,
}

impl IngestResult {
    fn rejected() -> Self {
        Self::default()
    }
}

/// Shared engine state and the per-transaction processing steps.
///
/// Safe to call from several shard tasks at once as long as all payloads
/// for one address go through the same shard.
pub struct Ingestor {
    registry: ContractRegistry,
    heuristics: HeuristicEngine,
    stats: StatsAggregator,
    dispatcher: Dispatcher,
    recent: Mutex<RecentTransactions>,
    detections: Mutex<DetectionLog>,
    activity: DashMap<String, AddressActivity>,
    activity_window: usize,
    processed: AtomicU64,
}

impl Ingestor {
    pub fn new(config: &Config) -> Self {
        Self::with_dispatcher(config, Dispatcher::new(config.dispatcher.subscriber_capacity))
    }

    pub fn with_dispatcher(config: &Config, dispatcher: Dispatcher) -> Self {
        Self::with_parts(config, dispatcher, HeuristicEngine::new(config.heuristics.clone()))
    }

    pub fn with_parts(config: &Config, dispatcher: Dispatcher, heuristics: HeuristicEngine) -> Self {
        Self {
            registry: ContractRegistry::new(Duration::seconds(config.heuristics.threat_decay_secs)),
            heuristics,
            stats: StatsAggregator::new(&config.stats),
            dispatcher,
            recent: Mutex::new(RecentTransactions::new(config.engine.recent_tx_capacity)),
            detections: Mutex::new(DetectionLog::new(config.engine.detection_capacity)),
            activity: DashMap::new(),
            activity_window: config.heuristics.activity_window,
            processed: AtomicU64::new(0),
        }
    }

    /// Normalize and apply one raw payload.
    ///
    /// Only `Fatal` errors are returned; malformed payloads are counted and
    /// reported through `accepted = false`.
    pub fn ingest(&self, raw: &RawTransaction) -> Result<IngestResult> {
        self.apply_normalized(normalize(raw))
    }

    pub fn ingest_bytes(&self, raw: &[u8]) -> Result<IngestResult> {
        self.apply_normalized(normalize_bytes(raw))
    }

    /// Count a payload rejected before it reached a shard.
    pub fn reject(&self, reason: &str) {
        debug!("Rejected payload: {reason}");
        self.stats.record_rejected();
    }

    fn apply_normalized(&self, normalized: Result<Transaction>) -> Result<IngestResult> {
        match normalized {
            Ok(tx) => self.apply(tx),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.reject(&e.to_string());
                Ok(IngestResult::rejected())
            }
        }
    }

    /// Deduplication only covers hashes still held in the recent buffer
    /// (`engine.recent_tx_capacity`). A hash seen again after eviction is
    /// processed as new and counted again against its contract.
    fn apply(&self, tx: Transaction) -> Result<IngestResult> {
        let observation = self.recent.lock().observe(&tx);
        match observation {
            Observation::New => self.apply_new(tx),
            Observation::StatusChanged { previous, current } => {
                self.apply_status_change(previous, current);
                Ok(IngestResult {
                    accepted: true,
                    tracked: false,
                    detections: Vec::new(),
                })
            }
            Observation::Unchanged => {
                debug!(hash = %tx.hash, "Duplicate transaction ignored");
                Ok(IngestResult {
                    accepted: true,
                    tracked: false,
                    detections: Vec::new(),
                })
            }
        }
    }

    fn apply_status_change(&self, previous: TxStatus, current: Transaction) {
        let mut tracked = false;
        if let Some(to) = current.to.as_deref() {
            if let Some(mut activity) = self.activity.get_mut(to) {
                activity.update_status(&current.hash, current.status);
            }
            tracked = self.registry.contains(to);
        }
        self.stats.record_status_change(&current.hash, previous, current.status);
        debug!(hash = %current.hash, from = previous.as_str(), to = current.status.as_str(), "Status changed");

        self.dispatcher.publish_transaction(&current, tracked);
        self.dispatcher.publish_stats(&self.snapshot());
    }

    fn apply_new(&self, tx: Transaction) -> Result<IngestResult> {
        let contract = tx.to.as_deref().and_then(|to| self.registry.get(to));

        let (tracked, detections) = match (contract, tx.to.as_deref()) {
            (Some(contract), Some(to)) => self.evaluate_tracked(&tx, &contract, to)?,
            _ => (false, Vec::new()),
        };

        let evicted = self.recent.lock().insert(tx.clone());
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted transactions from recent buffer");
        }

        let mut snapshot = self.stats.update(&tx, tracked, detections.len());
        snapshot.dropped_events = self.dispatcher.dropped_total();

        if !detections.is_empty() {
            let mut log = self.detections.lock();
            for detection in &detections {
                log.push(detection.clone());
            }
        }

        self.dispatcher.publish_transaction(&tx, tracked);
        for detection in &detections {
            info!(
                contract = %detection.contract_address,
                threat = detection.threat_type.as_str(),
                severity = detection.severity.as_str(),
                confidence = detection.confidence,
                tx = %detection.tx_hash,
                "Threat detected"
            );
            self.dispatcher.publish_detection(detection, tx.method.as_deref());
        }
        self.dispatcher.publish_stats(&snapshot);

        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if processed % 1000 == 0 {
            info!("Pipeline processed {processed} txs, {} tracked contracts", self.registry.len());
        }

        Ok(IngestResult {
            accepted: true,
            tracked,
            detections,
        })
    }

    /// Run heuristics and update counters for a transaction to a tracked
    /// contract, all under the address's activity lock.
    fn evaluate_tracked(
        &self,
        tx: &Transaction,
        contract: &TrackedContract,
        to: &str,
    ) -> Result<(bool, Vec<ThreatDetection>)> {
        let mut activity = self
            .activity
            .entry(to.to_string())
            .or_insert_with(|| AddressActivity::new(self.activity_window));

        let detections = self.heuristics.evaluate(tx, Some(contract), &activity);

        match self.registry.record_activity(to, tx.observed_at) {
            Ok(_) => {}
            Err(EngineError::NotFound(_)) => {
                drop(activity);
                self.activity.remove(to);
                if !detections.is_empty() {
                    debug!(contract = to, count = detections.len(), "Contract untracked mid-flight, discarding detections");
                }
                return Ok((false, Vec::new()));
            }
            Err(e) => {
                warn!(contract = to, "Registry update failed: {e}");
                return Err(e);
            }
        }

        if !detections.is_empty() {
            let severities: Vec<_> = detections.iter().map(|d| d.severity).collect();
            self.registry.note_detections(to, tx.observed_at, &severities);
        }
        activity.push(tx);
        Ok((true, detections))
    }

    // --- Control operations ---

    pub fn track(&self, address: &str, label: Option<String>) -> Result<AddOutcome> {
        let outcome = self.registry.add(address, label)?;
        self.stats.set_tracked_contracts(self.registry.len());
        Ok(outcome)
    }

    pub fn untrack(&self, address: &str) -> bool {
        let removed = self.registry.remove(address);
        if removed {
            if let Ok(address) = normalize_address(address) {
                self.activity.remove(&address);
            }
            self.stats.set_tracked_contracts(self.registry.len());
        }
        removed
    }

    /// Seed registry and detection log from persisted state.
    pub fn restore(&self, contracts: Vec<TrackedContract>, detections: Vec<ThreatDetection>) {
        let restored = self.registry.restore(contracts);
        let mut log = self.detections.lock();
        let count = detections.len();
        for detection in detections {
            log.push(detection);
        }
        drop(log);
        self.stats.set_tracked_contracts(self.registry.len());
        info!("Restored {restored} tracked contracts and {count} detections");
    }

    pub fn contract(&self, address: &str) -> Option<TrackedContract> {
        self.registry.get(address)
    }

    pub fn contracts(&self) -> Vec<TrackedContract> {
        self.registry.list()
    }

    pub fn recent_detections(&self, limit: usize) -> Vec<ThreatDetection> {
        self.detections.lock().recent(limit)
    }

    pub fn all_detections(&self) -> Vec<ThreatDetection> {
        self.detections.lock().all()
    }

    pub fn transaction(&self, hash: &str) -> Option<Transaction> {
        self.recent.lock().get(&hash.to_ascii_lowercase()).cloned()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.dropped_events = self.dispatcher.dropped_total();
        snapshot
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Event, Severity, ThreatType};
    use crate::dispatch::SubscriptionFilter;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::time::Instant;

    fn raw(hash: &str, to: &str, gas: u64, value: u64, at_ms: i64) -> RawTransaction {
        serde_json::from_value(json!({
            "hash": hash,
            "from": format!("0xf{}", &hash[2..]),
            "to": to,
            "gasPrice": gas.to_string(),
            "value": value.to_string(),
            "gas": 21000,
            "observedAt": at_ms,
        }))
        .unwrap()
    }

    fn ingestor() -> Ingestor {
        Ingestor::new(&Config::default())
    }

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn counter_increments_once_per_transaction() {
        let ing = ingestor();
        ing.track("0xabc", None).unwrap();
        for i in 1..=3 {
            let r = ing.ingest(&raw(&format!("0x0{i}"), "0xabc", 10, 1, T0 + i)).unwrap();
            assert!(r.accepted && r.tracked);
        }
        assert_eq!(ing.contract("0xabc").unwrap().transaction_count, 3);

        // Re-observation with a new status is not a new transaction.
        let mut mined = raw("0x01", "0xabc", 10, 1, T0 + 1);
        mined.status = Some("confirmed".into());
        ing.ingest(&mined).unwrap();
        ing.ingest(&raw("0x02", "0xabc", 10, 1, T0 + 2)).unwrap();

        assert_eq!(ing.contract("0xabc").unwrap().transaction_count, 3);
        assert_eq!(ing.transaction("0x01").unwrap().status, TxStatus::Confirmed);
        let snap = ing.snapshot();
        assert_eq!(snap.total_ingested, 3);
        assert_eq!(snap.pending_count, 2);
    }

    #[test]
    fn untracked_transactions_produce_no_detections() {
        let ing = ingestor();
        for i in 1..=5 {
            let r = ing.ingest(&raw(&format!("0x0{i}"), "0xdead", 10, 1, T0 + i)).unwrap();
            assert!(r.detections.is_empty());
            assert!(!r.tracked);
        }
        let r = ing.ingest(&raw("0xff", "0xdead", 5000, 1_000_000, T0 + 10)).unwrap();
        assert!(r.detections.is_empty());
        assert!(ing.recent_detections(10).is_empty());
    }

    #[test]
    fn track_and_detect_front_run() {
        let ing = ingestor();
        let mut sub = ing.dispatcher().subscribe(SubscriptionFilter::default()).unwrap();
        ing.track("0xABC", Some("target".into())).unwrap();

        ing.ingest(&raw("0x01", "0xABC", 20, 10, T0)).unwrap();
        ing.ingest(&raw("0x02", "0xABC", 25, 10, T0 + 100)).unwrap();
        let r = ing.ingest(&raw("0x03", "0xABC", 500, 1000, T0 + 200)).unwrap();

        let front_run = r
            .detections
            .iter()
            .find(|d| d.threat_type == ThreatType::FrontRun)
            .expect("front run");
        assert_eq!(front_run.contract_address, "0xabc");
        assert_ne!(front_run.severity, Severity::Low);
        assert_eq!(front_run.tx_hash, "0x03");

        let contract = ing.contract("0xabc").unwrap();
        assert!(contract.threat_level > Severity::Low);
        assert_eq!(ing.snapshot().threats_detected_count as usize, r.detections.len());

        let mut saw_detection = false;
        while let Some(event) = sub.try_recv() {
            if let Event::ThreatDetection(d) = event {
                saw_detection |= d.id == "0x03:front_run";
            }
        }
        assert!(saw_detection);
    }

    #[test]
    fn untrack_keeps_history() {
        let ing = ingestor();
        ing.track("0xdef", None).unwrap();
        ing.ingest(&raw("0x01", "0xdef", 20, 10, T0)).unwrap();
        ing.ingest(&raw("0x02", "0xdef", 25, 10, T0 + 100)).unwrap();
        let r = ing.ingest(&raw("0x03", "0xdef", 500, 10, T0 + 200)).unwrap();
        assert!(!r.detections.is_empty());
        let before = ing.recent_detections(50);

        assert!(ing.untrack("0xDEF"));
        ing.ingest(&raw("0x04", "0xdef", 20, 10, T0 + 300)).unwrap();
        ing.ingest(&raw("0x05", "0xdef", 25, 10, T0 + 400)).unwrap();
        let r = ing.ingest(&raw("0x06", "0xdef", 900, 10, T0 + 500)).unwrap();
        assert!(r.detections.is_empty());
        assert_eq!(ing.recent_detections(50), before);
        assert!(ing.contract("0xdef").is_none());
    }

    #[test]
    fn malformed_payload_is_quarantined() {
        let ing = ingestor();
        let mut sub = ing.dispatcher().subscribe(SubscriptionFilter::default()).unwrap();
        let mut missing_hash = raw("0x01", "0xabc", 10, 1, T0);
        missing_hash.hash = None;

        let r = ing.ingest(&missing_hash).unwrap();
        assert!(!r.accepted);
        assert_eq!(ing.snapshot().rejected_count, 1);
        assert!(sub.try_recv().is_none());

        let r = ing.ingest_bytes(b"{not json").unwrap();
        assert!(!r.accepted);
        assert_eq!(ing.snapshot().rejected_count, 2);
        assert_eq!(ing.snapshot().total_ingested, 0);
    }

    #[test]
    fn hostile_payloads_leave_no_partial_state() {
        let ing = ingestor();
        ing.track("0xabc", None).unwrap();

        let r = ing
            .ingest_bytes(r#"{"hash":"0x01","from":"0x02","to":"0xabc","input":"0xaaaaaaa€"}"#.as_bytes())
            .unwrap();
        assert!(!r.accepted);

        let mut big = raw("0x02", "0xabc", 10, 1, T0);
        big.value = Some(json!("100000000000000000000"));
        assert!(ing.ingest(&big).unwrap().accepted);
        big.hash = Some("0x03".into());
        assert!(ing.ingest(&big).unwrap().accepted);

        big.hash = Some("0x04".into());
        big.value = Some(json!("79228162514264337593543950335"));
        assert!(!ing.ingest(&big).unwrap().accepted);

        let snap = ing.snapshot();
        assert_eq!(ing.contract("0xabc").unwrap().transaction_count, 2);
        assert_eq!(snap.total_ingested, 2);
        assert_eq!(snap.rejected_count, 2);
        assert_eq!(snap.tracked_activity_count, 2);
    }

    #[test]
    fn evicted_hash_is_counted_again() {
        let mut config = Config::default();
        config.engine.recent_tx_capacity = 2;
        let ing = Ingestor::new(&config);
        ing.track("0xabc", None).unwrap();
        for hash in ["0x01", "0x02", "0x03", "0x01"] {
            ing.ingest(&raw(hash, "0xabc", 10, 1, T0)).unwrap();
        }
        assert_eq!(ing.contract("0xabc").unwrap().transaction_count, 4);
        // Still buffered, so a repeat is a no-op.
        ing.ingest(&raw("0x01", "0xabc", 10, 1, T0)).unwrap();
        assert_eq!(ing.contract("0xabc").unwrap().transaction_count, 4);
    }

    #[test]
    fn stats_average_over_three() {
        let ing = ingestor();
        for (i, gas) in [10, 20, 30].into_iter().enumerate() {
            ing.ingest(&raw(&format!("0x0{i}"), "0xabc", gas, 1, T0 + i as i64)).unwrap();
        }
        assert_eq!(ing.snapshot().avg_gas_price, Decimal::from(20));
    }

    #[test]
    fn stalled_subscriber_does_not_slow_ingestion() {
        let config = Config::default();
        let baseline = Ingestor::new(&config);
        let loaded = Ingestor::new(&config);
        let stalled = loaded.dispatcher().subscribe(SubscriptionFilter::default()).unwrap();
        let n = 5_000;

        let run = |ing: &Ingestor| {
            let started = Instant::now();
            for i in 0..n {
                ing.ingest(&raw(&format!("0x{i:x}"), "0xabc", 10, 1, T0 + i as i64)).unwrap();
            }
            started.elapsed()
        };
        let base = run(&baseline);
        let with_stalled = run(&loaded);

        assert_eq!(loaded.snapshot().total_ingested, n as u64);
        // Two events per tx (transaction + stats) into a queue of 1000.
        assert_eq!(stalled.dropped(), 2 * n as u64 - 1_000);
        assert!(
            with_stalled < base * 5 + std::time::Duration::from_millis(500),
            "baseline {base:?}, with stalled subscriber {with_stalled:?}"
        );
    }

    #[test]
    fn detection_log_is_bounded() {
        let mut log = DetectionLog::new(2);
        for i in 0..3 {
            log.push(ThreatDetection {
                id: format!("0x{i}:honeypot"),
                contract_address: "0xabc".into(),
                threat_type: ThreatType::Honeypot,
                severity: Severity::High,
                confidence: 70,
                tx_hash: format!("0x{i}"),
                description: String::new(),
                detected_at: chrono::Utc::now(),
            });
        }
        assert_eq!(log.all().len(), 2);
        let recent = log.recent(10);
        assert_eq!(recent[0].id, "0x2:honeypot");
        assert_eq!(recent[1].id, "0x1:honeypot");
    }
}
