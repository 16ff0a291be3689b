use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::core::tx::normalize_address;
use crate::core::{Severity, ThreatLevel, TrackedContract};
use crate::error::{EngineError, Result};

/// Detection severities remembered per contract for threat-level derivation.
const MAX_RECENT_THREATS: usize = 32;

/// Result of a track request.
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub contract: TrackedContract,
    /// `false` when the address was already tracked.
    pub created: bool,
}

/// In-memory registry of tracked contract addresses.
///
/// Backed by a sharded map: operations on distinct addresses do not contend,
/// mutations of one address are serialized by its entry lock.
pub struct ContractRegistry {
    contracts: DashMap<String, TrackedContract>,
    next_position: AtomicU64,
    threat_decay: Duration,
}

impl ContractRegistry {
    pub fn new(threat_decay: Duration) -> Self {
        Self {
            contracts: DashMap::new(),
            next_position: AtomicU64::new(0),
            threat_decay,
        }
    }

    /// Track an address. Tracking an already tracked address returns the
    /// existing record untouched.
    pub fn add(&self, address: &str, label: Option<String>) -> Result<AddOutcome> {
        let address = normalize_address(address)?;
        match self.contracts.entry(address) {
            Entry::Occupied(existing) => Ok(AddOutcome {
                contract: existing.get().clone(),
                created: false,
            }),
            Entry::Vacant(slot) => {
                let contract = TrackedContract {
                    address: slot.key().clone(),
                    label: label.filter(|l| !l.trim().is_empty()),
                    added_at: Utc::now(),
                    transaction_count: 0,
                    last_activity_at: None,
                    threat_level: Severity::Low,
                    position: self.next_position.fetch_add(1, Ordering::Relaxed),
                    recent_threats: Default::default(),
                };
                info!(address = %contract.address, label = ?contract.label, "Tracking contract");
                slot.insert(contract.clone());
                Ok(AddOutcome {
                    contract,
                    created: true,
                })
            }
        }
    }

    /// Stop tracking an address. Returns whether it was tracked.
    pub fn remove(&self, address: &str) -> bool {
        let Ok(address) = normalize_address(address) else {
            return false;
        };
        let removed = self.contracts.remove(&address).is_some();
        if removed {
            info!(address = %address, "Untracked contract");
        }
        removed
    }

    pub fn get(&self, address: &str) -> Option<TrackedContract> {
        let address = normalize_address(address).ok()?;
        self.contracts.get(&address).map(|c| c.clone())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.contracts.contains_key(address)
    }

    /// All tracked contracts in insertion order.
    pub fn list(&self) -> Vec<TrackedContract> {
        let mut contracts: Vec<TrackedContract> =
            self.contracts.iter().map(|c| c.value().clone()).collect();
        contracts.sort_by_key(|c| c.position);
        contracts
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Count one transaction against a tracked address.
    ///
    /// `NotFound` is expected when the address was untracked mid-stream and
    /// must be treated as non-fatal by callers.
    pub fn record_activity(&self, address: &str, observed_at: DateTime<Utc>) -> Result<TrackedContract> {
        let mut entry = self
            .contracts
            .get_mut(address)
            .ok_or_else(|| EngineError::NotFound(address.to_string()))?;

        let next = entry.transaction_count.checked_add(1).ok_or_else(|| {
            EngineError::Fatal(format!("transaction counter overflow for {address}"))
        })?;
        entry.transaction_count = next;
        entry.last_activity_at = Some(match entry.last_activity_at {
            Some(prev) if prev > observed_at => prev,
            _ => observed_at,
        });
        self.refresh_threat_level(&mut entry, observed_at);
        Ok(entry.clone())
    }

    /// Fold detection severities into the contract's derived threat level.
    pub fn note_detections(
        &self,
        address: &str,
        at: DateTime<Utc>,
        severities: &[Severity],
    ) -> Option<ThreatLevel> {
        let mut entry = self.contracts.get_mut(address)?;
        for severity in severities {
            entry.recent_threats.push_back((at, *severity));
            if entry.recent_threats.len() > MAX_RECENT_THREATS {
                entry.recent_threats.pop_front();
            }
        }
        self.refresh_threat_level(&mut entry, at);
        Some(entry.threat_level)
    }

    fn refresh_threat_level(&self, contract: &mut TrackedContract, now: DateTime<Utc>) {
        let cutoff = now - self.threat_decay;
        contract.recent_threats.retain(|(at, _)| *at >= cutoff);
        contract.threat_level = contract
            .recent_threats
            .iter()
            .map(|(_, s)| *s)
            .max()
            .unwrap_or(Severity::Low);
    }

    /// Seed the registry from persisted state. Existing entries win.
    pub fn restore(&self, contracts: Vec<TrackedContract>) -> usize {
        let mut restored = 0;
        for mut contract in contracts {
            if contract.threat_level > Severity::Low {
                let at = contract.last_activity_at.unwrap_or(contract.added_at);
                contract.recent_threats.push_back((at, contract.threat_level));
            }
            self.next_position
                .fetch_max(contract.position + 1, Ordering::Relaxed);
            if let Entry::Vacant(slot) = self.contracts.entry(contract.address.clone()) {
                slot.insert(contract);
                restored += 1;
            }
        }
        restored
    }
}
