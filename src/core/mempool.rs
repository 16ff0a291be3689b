use std::collections::{HashMap, VecDeque};

use super::{Transaction, TxStatus};

/// Outcome of offering a transaction to the recent-window buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// First sighting of this hash.
    New,
    /// Known hash whose status moved on; the buffer entry was updated.
    StatusChanged { previous: TxStatus, current: Transaction },
    /// Known hash with nothing new to apply.
    Unchanged,
}

/// Bounded buffer of recently observed transactions, keyed by hash.
///
/// Oldest entries are evicted once `capacity` is exceeded.
#[derive(Debug)]
pub struct RecentTransactions {
    entries: HashMap<String, Transaction>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentTransactions {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Classify a transaction against the buffer without inserting new hashes.
    ///
    /// Status transitions on known hashes are applied in place.
    pub fn observe(&mut self, tx: &Transaction) -> Observation {
        let Some(entry) = self.entries.get_mut(&tx.hash) else {
            return Observation::New;
        };
        if !entry.status.can_transition_to(tx.status) {
            return Observation::Unchanged;
        }
        let previous = entry.status;
        entry.status = tx.status;
        Observation::StatusChanged {
            previous,
            current: entry.clone(),
        }
    }

    /// Insert a new transaction, evicting the oldest entries past capacity.
    /// Returns the evicted transactions.
    pub fn insert(&mut self, tx: Transaction) -> Vec<Transaction> {
        self.order.push_back(tx.hash.clone());
        if let Some(replaced) = self.entries.insert(tx.hash.clone(), tx) {
            self.order.retain(|h| h != &replaced.hash);
            self.order.push_back(replaced.hash);
        }

        let mut evicted = Vec::new();
        while self.order.len() > self.capacity {
            let Some(hash) = self.order.pop_front() else { break };
            if let Some(old) = self.entries.remove(&hash) {
                evicted.push(old);
            }
        }
        evicted
    }

    pub fn get(&self, hash: &str) -> Option<&Transaction> {
        self.entries.get(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn tx(hash: &str, status: TxStatus) -> Transaction {
        Transaction {
            hash: hash.to_string(),
            from: "0xf00".into(),
            to: Some("0xabc".into()),
            value: Decimal::ONE,
            gas_price: Decimal::TEN,
            gas_limit: 21_000,
            method: None,
            observed_at: Utc::now(),
            status,
        }
    }

    #[test]
    fn new_hash_is_new() {
        let mut buf = RecentTransactions::new(10);
        assert_eq!(buf.observe(&tx("0x01", TxStatus::Pending)), Observation::New);
        buf.insert(tx("0x01", TxStatus::Pending));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn reobservation_updates_status_in_place() {
        let mut buf = RecentTransactions::new(10);
        buf.insert(tx("0x01", TxStatus::Pending));

        match buf.observe(&tx("0x01", TxStatus::Confirmed)) {
            Observation::StatusChanged { previous, current } => {
                assert_eq!(previous, TxStatus::Pending);
                assert_eq!(current.status, TxStatus::Confirmed);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.get("0x01").unwrap().status, TxStatus::Confirmed);
    }

    #[test]
    fn final_status_is_sticky() {
        let mut buf = RecentTransactions::new(10);
        buf.insert(tx("0x01", TxStatus::Pending));
        buf.observe(&tx("0x01", TxStatus::Failed));
        assert_eq!(buf.observe(&tx("0x01", TxStatus::Confirmed)), Observation::Unchanged);
        assert_eq!(buf.observe(&tx("0x01", TxStatus::Pending)), Observation::Unchanged);
        assert_eq!(buf.get("0x01").unwrap().status, TxStatus::Failed);
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut buf = RecentTransactions::new(2);
        buf.insert(tx("0x01", TxStatus::Pending));
        buf.insert(tx("0x02", TxStatus::Pending));
        let evicted = buf.insert(tx("0x03", TxStatus::Pending));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].hash, "0x01");
        assert!(buf.get("0x01").is_none());
        assert_eq!(buf.len(), 2);
    }
}
