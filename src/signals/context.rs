use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::score::to_f64;
use crate::core::{Transaction, TxStatus};

/// A prior transaction to a tracked address, as seen by the heuristics.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEntry {
    pub hash: String,
    pub from: String,
    pub gas_price: f64,
    pub value: f64,
    pub method: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub status: TxStatus,
}

impl ActivityEntry {
    pub fn same_method(&self, method: Option<&str>) -> bool {
        match (self.method.as_deref(), method) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// Bounded, arrival-ordered window of transactions to one tracked address.
#[derive(Debug, Clone)]
pub struct AddressActivity {
    entries: VecDeque<ActivityEntry>,
    capacity: usize,
}

impl AddressActivity {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, tx: &Transaction) {
        self.entries.push_back(ActivityEntry {
            hash: tx.hash.clone(),
            from: tx.from.clone(),
            gas_price: to_f64(tx.gas_price),
            value: to_f64(tx.value),
            method: tx.method.clone(),
            observed_at: tx.observed_at,
            status: tx.status,
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Apply a status transition to a windowed entry, if still present.
    pub fn update_status(&mut self, hash: &str, status: TxStatus) -> bool {
        match self.entries.iter_mut().rev().find(|e| e.hash == hash) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Entries observed in `[since, until]`, in arrival order.
    pub fn between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> impl Iterator<Item = &ActivityEntry> {
        self.entries
            .iter()
            .filter(move |e| e.observed_at >= since && e.observed_at <= until)
    }

    /// Most recent `n` entries, in arrival order.
    pub fn latest(&self, n: usize) -> impl Iterator<Item = &ActivityEntry> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

    pub fn entries(&self) -> &VecDeque<ActivityEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
