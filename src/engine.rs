use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::pipeline::Ingestor;
use crate::core::tx::RawTransaction;
use crate::core::{StatsSnapshot, ThreatDetection, TrackedContract};
use crate::db::{PersistedState, StateRepository};
use crate::dispatch::{Subscription, SubscriptionFilter};
use crate::error::{EngineError, Result};
use crate::registry::AddOutcome;

/// Liveness of one shard actor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardStatus {
    pub id: usize,
    pub running: bool,
    pub halted_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    /// `ok`, `degraded` (a shard halted) or `stopped`.
    pub status: &'static str,
    pub shards: Vec<ShardStatus>,
    pub subscribers: usize,
    pub tracked_contracts: usize,
}

#[derive(Default)]
struct ShardState {
    running: AtomicBool,
    halted: Mutex<Option<String>>,
}

/// Routes raw payloads to shard queues.
struct Router {
    senders: RwLock<Option<Vec<mpsc::Sender<RawTransaction>>>>,
}

impl Router {
    fn sender_for(&self, raw: &RawTransaction) -> Option<mpsc::Sender<RawTransaction>> {
        let senders = self.senders.read();
        let senders = senders.as_ref()?;
        Some(senders[shard_index(raw, senders.len())].clone())
    }
}

/// All payloads touching one address land in the same shard.
fn shard_index(raw: &RawTransaction, shards: usize) -> usize {
    let key = raw
        .to
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or(raw.hash.as_deref())
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Producer side of the engine. Cheap to clone.
///
/// Pushing is fire-and-forget: rejected payloads only show up in the
/// rejected counter. The async variants wait for shard queue capacity.
#[derive(Clone)]
pub struct FeedHandle {
    router: Arc<Router>,
    ingestor: Arc<Ingestor>,
}

impl FeedHandle {
    pub async fn push_raw(&self, raw: RawTransaction) {
        let Some(sender) = self.router.sender_for(&raw) else {
            self.ingestor.reject("engine stopped");
            return;
        };
        if sender.send(raw).await.is_err() {
            self.ingestor.reject("shard unavailable");
        }
    }

    /// For producers running on plain threads. Must not be called from
    /// within an async context.
    pub fn push_raw_blocking(&self, raw: RawTransaction) {
        let Some(sender) = self.router.sender_for(&raw) else {
            self.ingestor.reject("engine stopped");
            return;
        };
        if sender.blocking_send(raw).is_err() {
            self.ingestor.reject("shard unavailable");
        }
    }

    pub async fn push_bytes(&self, payload: &[u8]) {
        if let Some(raw) = self.parse(payload) {
            self.push_raw(raw).await;
        }
    }

    pub fn push_bytes_blocking(&self, payload: &[u8]) {
        if let Some(raw) = self.parse(payload) {
            self.push_raw_blocking(raw);
        }
    }

    fn parse(&self, payload: &[u8]) -> Option<RawTransaction> {
        match serde_json::from_slice(payload) {
            Ok(raw) => Some(raw),
            Err(e) => {
                self.ingestor.reject(&format!("invalid JSON: {e}"));
                None
            }
        }
    }
}

/// The monitoring engine: owns registry, stats, dispatcher and the shard
/// actors feeding them.
pub struct Engine {
    config: Config,
    ingestor: Arc<Ingestor>,
    router: Arc<Router>,
    shards: Vec<Arc<ShardState>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    repository: Option<Box<dyn StateRepository>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let shard_count = config.engine.shards.max(1);
        Self {
            ingestor: Arc::new(Ingestor::new(&config)),
            router: Arc::new(Router {
                senders: RwLock::new(None),
            }),
            shards: (0..shard_count).map(|_| Arc::new(ShardState::default())).collect(),
            handles: Mutex::new(Vec::new()),
            repository: None,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            config,
        }
    }

    pub fn with_repository(mut self, repository: Box<dyn StateRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Restore persisted state and spawn the shard actors.
    ///
    /// Must run inside a tokio runtime.
    pub fn start(&self) -> Result<FeedHandle> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::Fatal("engine already stopped".into()));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(self.feed());
        }

        if let Some(repo) = &self.repository {
            let state = repo.load()?;
            self.ingestor.restore(state.contracts, state.detections);
        }

        let capacity = self.config.engine.shard_queue_capacity.max(1);
        let mut senders = Vec::with_capacity(self.shards.len());
        let mut handles = self.handles.lock();
        for (id, state) in self.shards.iter().enumerate() {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            state.running.store(true, Ordering::Release);
            handles.push(tokio::spawn(run_shard(id, rx, self.ingestor.clone(), state.clone())));
        }
        drop(handles);
        *self.router.senders.write() = Some(senders);

        info!(shards = self.shards.len(), queue = capacity, "Engine started");
        Ok(self.feed())
    }

    pub fn feed(&self) -> FeedHandle {
        FeedHandle {
            router: self.router.clone(),
            ingestor: self.ingestor.clone(),
        }
    }

    /// Close intake, drain shards, close the dispatcher and persist state.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Engine stopping, draining shard queues...");
        self.router.senders.write().take();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Shard task failed: {e}");
            }
        }
        self.ingestor.dispatcher().close();

        if let Some(repo) = &self.repository {
            let state = PersistedState {
                contracts: self.ingestor.contracts(),
                detections: self.ingestor.all_detections(),
            };
            repo.save(&state)?;
            info!(
                contracts = state.contracts.len(),
                detections = state.detections.len(),
                "Engine state saved"
            );
        }
        info!("Engine stopped");
        Ok(())
    }

    // --- Control operations ---

    pub fn track(&self, address: &str, label: Option<String>) -> Result<AddOutcome> {
        self.ingestor.track(address, label)
    }

    pub fn untrack(&self, address: &str) -> bool {
        self.ingestor.untrack(address)
    }

    pub fn contract(&self, address: &str) -> Option<TrackedContract> {
        self.ingestor.contract(address)
    }

    pub fn contracts(&self) -> Vec<TrackedContract> {
        self.ingestor.contracts()
    }

    pub fn detections(&self, limit: usize) -> Vec<ThreatDetection> {
        self.ingestor.recent_detections(limit)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ingestor.snapshot()
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription> {
        self.ingestor.dispatcher().subscribe(filter)
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn health(&self) -> Health {
        let shards: Vec<ShardStatus> = self
            .shards
            .iter()
            .enumerate()
            .map(|(id, s)| ShardStatus {
                id,
                running: s.running.load(Ordering::Acquire),
                halted_reason: s.halted.lock().clone(),
            })
            .collect();
        let status = if shards.iter().any(|s| s.halted_reason.is_some()) {
            "degraded"
        } else if self.stopped.load(Ordering::Acquire) {
            "stopped"
        } else {
            "ok"
        };
        Health {
            status,
            shards,
            subscribers: self.ingestor.dispatcher().subscriber_count(),
            tracked_contracts: self.ingestor.contracts().len(),
        }
    }
}

/// Apply one payload, reporting a panic as `Fatal` so the shard halts
/// through the normal path instead of unwinding the task.
fn ingest_guarded(ingestor: &Ingestor, raw: &RawTransaction) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(|| ingestor.ingest(raw))) {
        Ok(result) => result.map(|_| ()),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            Err(EngineError::Fatal(format!("panic while ingesting: {message}")))
        }
    }
}

async fn run_shard(
    id: usize,
    mut rx: mpsc::Receiver<RawTransaction>,
    ingestor: Arc<Ingestor>,
    state: Arc<ShardState>,
) {
    debug!(shard = id, "Shard started");
    while let Some(raw) = rx.recv().await {
        if let Err(e) = ingest_guarded(&ingestor, &raw) {
            error!(shard = id, "Shard halted: {e}");
            *state.halted.lock() = Some(e.to_string());
            break;
        }
    }
    rx.close();
    let mut abandoned = 0usize;
    while rx.try_recv().is_ok() {
        abandoned += 1;
    }
    if abandoned > 0 {
        warn!(shard = id, abandoned, "Shard exited with queued payloads");
        for _ in 0..abandoned {
            ingestor.reject("shard halted");
        }
    }
    state.running.store(false, Ordering::Release);
    debug!(shard = id, "Shard exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Event, Severity, ThreatType, Transaction};
    use crate::db::SqliteRepository;
    use crate::dispatch::Dispatcher;
    use crate::signals::HeuristicEngine;
    use crate::signals::rules::{Finding, Heuristic, HeuristicContext};
    use serde_json::json;

    const T0: i64 = 1_700_000_000_000;

    fn raw(hash: &str, to: &str, gas: u64, at_ms: i64) -> RawTransaction {
        serde_json::from_value(json!({
            "hash": hash,
            "from": format!("0xf{}", &hash[2..]),
            "to": to,
            "gasPrice": gas.to_string(),
            "value": "1",
            "observedAt": at_ms,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn pushes_are_applied_before_stop_returns() {
        let engine = Engine::new(Config::default());
        let feed = engine.start().unwrap();
        engine.track("0xABC", None).unwrap();

        feed.push_raw(raw("0x01", "0xabc", 20, T0)).await;
        feed.push_raw(raw("0x02", "0xabc", 25, T0 + 100)).await;
        feed.push_raw(raw("0x03", "0xabc", 500, T0 + 200)).await;
        engine.stop().await.unwrap();

        assert_eq!(engine.contract("0xabc").unwrap().transaction_count, 3);
        let detections = engine.detections(50);
        assert!(detections.iter().any(|d| d.threat_type == ThreatType::FrontRun
            && d.severity != Severity::Low
            && d.contract_address == "0xabc"));
        assert_eq!(engine.health().status, "stopped");
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let engine = Engine::new(Config::default());
        let feed = engine.start().unwrap();
        let mut sub = engine.subscribe(SubscriptionFilter::default()).unwrap();

        feed.push_bytes(br#"{"hash":"0x01","from":"0xf01","to":"0xabc","gasPrice":"10","value":"1"}"#)
            .await;
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::Transaction(ref t) if t.hash == "0x01"));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_json_and_post_stop_pushes_are_rejected() {
        let engine = Engine::new(Config::default());
        let feed = engine.start().unwrap();
        feed.push_bytes(b"not json").await;
        engine.stop().await.unwrap();
        feed.push_raw(raw("0x01", "0xabc", 10, T0)).await;

        let stats = engine.stats();
        assert_eq!(stats.rejected_count, 2);
        assert_eq!(stats.total_ingested, 0);
    }

    #[tokio::test]
    async fn fatal_error_halts_shard_and_degrades_health() {
        let engine = Engine::new(Config {
            engine: crate::config::EngineConfig {
                shards: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        engine.ingestor().restore(
            vec![TrackedContract {
                address: "0xabc".into(),
                label: None,
                added_at: chrono::Utc::now(),
                transaction_count: u64::MAX,
                last_activity_at: None,
                threat_level: Severity::Low,
                position: 0,
                recent_threats: Default::default(),
            }],
            vec![],
        );
        let feed = engine.start().unwrap();
        feed.push_raw(raw("0x01", "0xabc", 10, T0)).await;

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while engine.health().shards[0].running && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let health = engine.health();
        assert_eq!(health.status, "degraded");
        assert!(!health.shards[0].running);
        assert!(health.shards[0].halted_reason.as_deref().unwrap().contains("overflow"));
        assert_eq!(engine.contract("0xabc").unwrap().transaction_count, u64::MAX);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txsentry.db");

        let engine = Engine::new(Config::default())
            .with_repository(Box::new(SqliteRepository::open(&path).unwrap()));
        let feed = engine.start().unwrap();
        engine.track("0x02", Some("pool".into())).unwrap();
        engine.track("0x01", None).unwrap();
        feed.push_raw(raw("0x0a", "0x01", 20, T0)).await;
        engine.stop().await.unwrap();

        let restarted = Engine::new(Config::default())
            .with_repository(Box::new(SqliteRepository::open(&path).unwrap()));
        restarted.start().unwrap();
        let contracts = restarted.contracts();
        assert_eq!(contracts.len(), 2);
        assert_eq!(contracts[0].address, "0x02");
        assert_eq!(contracts[0].label.as_deref(), Some("pool"));
        assert_eq!(contracts[1].transaction_count, 1);
        assert_eq!(restarted.stats().tracked_contract_count, 2);
        restarted.stop().await.unwrap();
    }

    struct Exploding;

    impl Heuristic for Exploding {
        fn threat_type(&self) -> ThreatType {
            ThreatType::Honeypot
        }

        fn evaluate(&self, _tx: &Transaction, _ctx: &HeuristicContext<'_>) -> Option<Finding> {
            panic!("heuristic exploded")
        }
    }

    fn exploding_ingestor(config: &Config) -> Arc<Ingestor> {
        let rules: Vec<Box<dyn Heuristic + Send + Sync>> = vec![Box::new(Exploding)];
        let heuristics = HeuristicEngine::with_heuristics(config.heuristics.clone(), rules);
        Arc::new(Ingestor::with_parts(
            config,
            Dispatcher::new(config.dispatcher.subscriber_capacity),
            heuristics,
        ))
    }

    #[tokio::test]
    async fn panicking_ingest_halts_shard() {
        let config = Config::default();
        let ingestor = exploding_ingestor(&config);
        ingestor.track("0xabc", None).unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(raw("0x01", "0xabc", 10, T0)).await.unwrap();
        tx.send(raw("0x02", "0xabc", 10, T0 + 1)).await.unwrap();
        drop(tx);

        let state = Arc::new(ShardState::default());
        state.running.store(true, Ordering::Release);
        run_shard(0, rx, ingestor.clone(), state.clone()).await;

        assert!(!state.running.load(Ordering::Acquire));
        let reason = state.halted.lock().clone().unwrap();
        assert!(reason.contains("heuristic exploded"), "{reason}");
        let stats = ingestor.snapshot();
        assert_eq!(stats.rejected_count, 1);
        assert_eq!(stats.total_ingested, 0);
    }

    #[tokio::test]
    async fn panicking_payload_degrades_health() {
        let config = Config {
            engine: crate::config::EngineConfig {
                shards: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut engine = Engine::new(config.clone());
        engine.ingestor = exploding_ingestor(&config);
        let feed = engine.start().unwrap();
        engine.track("0xabc", None).unwrap();

        feed.push_raw(raw("0x01", "0xabc", 10, T0)).await;
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while engine.health().shards[0].running && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let health = engine.health();
        assert_eq!(health.status, "degraded");
        assert!(!health.shards[0].running);

        // The halted shard no longer accepts work; later pushes are counted.
        feed.push_raw(raw("0x02", "0xdef", 10, T0 + 1)).await;
        assert_eq!(engine.stats().rejected_count, 1);
        engine.stop().await.unwrap();
    }

    #[test]
    fn routing_is_stable_per_address() {
        let a = raw("0x01", "0xABC", 1, T0);
        let b = raw("0x02", "0xabc", 1, T0);
        assert_eq!(shard_index(&a, 8), shard_index(&b, 8));
        let mut creation = raw("0x03", "0xabc", 1, T0);
        creation.to = None;
        assert!(shard_index(&creation, 8) < 8);
    }
}
