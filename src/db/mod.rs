pub mod schema;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, Row};

use crate::core::{Severity, ThreatDetection, ThreatType, TrackedContract};
use crate::error::{EngineError, Result};

/// Engine state carried across restarts.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    /// Tracked contracts in insertion order.
    pub contracts: Vec<TrackedContract>,
    /// Retained detections, oldest first.
    pub detections: Vec<ThreatDetection>,
}

/// Storage for engine state, used only at start and stop.
pub trait StateRepository: Send + Sync {
    fn load(&self) -> Result<PersistedState>;
    fn save(&self, state: &PersistedState) -> Result<()>;
}

pub struct Database {
    conn: Connection,
}

/// Thread-safe SQLite repository.
#[derive(Clone)]
pub struct SqliteRepository {
    inner: Arc<Mutex<Database>>,
}

impl SqliteRepository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Fatal(format!("cannot create {}: {e}", parent.display())))?;
        }
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }
}

impl StateRepository for SqliteRepository {
    fn load(&self) -> Result<PersistedState> {
        let db = self.inner.lock();
        Ok(PersistedState {
            contracts: db.contracts()?,
            detections: db.detections()?,
        })
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        let db = self.inner.lock();
        db.replace_all(state)?;
        Ok(())
    }
}

impl Database {
    pub fn open(path: &Path) -> std::result::Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Replace stored state with `state` in a single transaction.
    pub fn replace_all(&self, state: &PersistedState) -> std::result::Result<(), rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM tracked_contracts", [])?;
        tx.execute("DELETE FROM detections", [])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO tracked_contracts (address, label, added_at, transaction_count, last_activity_at, threat_level, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for c in &state.contracts {
                stmt.execute(rusqlite::params![
                    c.address,
                    c.label,
                    c.added_at.to_rfc3339(),
                    c.transaction_count as i64,
                    c.last_activity_at.map(|t| t.to_rfc3339()),
                    c.threat_level.as_str(),
                    c.position as i64,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO detections (id, contract_address, threat_type, severity, confidence, tx_hash, description, detected_at, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (seq, d) in state.detections.iter().enumerate() {
                stmt.execute(rusqlite::params![
                    d.id,
                    d.contract_address,
                    d.threat_type.as_str(),
                    d.severity.as_str(),
                    d.confidence,
                    d.tx_hash,
                    d.description,
                    d.detected_at.to_rfc3339(),
                    seq as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn contracts(&self) -> std::result::Result<Vec<TrackedContract>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT address, label, added_at, transaction_count, last_activity_at, threat_level, position
             FROM tracked_contracts ORDER BY position ASC",
        )?;
        let rows = stmt.query_map([], Self::row_to_contract)?;
        rows.collect()
    }

    pub fn detections(&self) -> std::result::Result<Vec<ThreatDetection>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT id, contract_address, threat_type, severity, confidence, tx_hash, description, detected_at
             FROM detections ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], Self::row_to_detection)?;
        rows.collect()
    }

    fn row_to_contract(row: &Row) -> rusqlite::Result<TrackedContract> {
        let last_activity: Option<String> = row.get(4)?;
        Ok(TrackedContract {
            address: row.get(0)?,
            label: row.get(1)?,
            added_at: parse_time(2, &row.get::<_, String>(2)?)?,
            transaction_count: row.get::<_, i64>(3)? as u64,
            last_activity_at: last_activity.as_deref().map(|t| parse_time(4, t)).transpose()?,
            threat_level: parse_text::<Severity>(5, &row.get::<_, String>(5)?)?,
            position: row.get::<_, i64>(6)? as u64,
            recent_threats: Default::default(),
        })
    }

    fn row_to_detection(row: &Row) -> rusqlite::Result<ThreatDetection> {
        Ok(ThreatDetection {
            id: row.get(0)?,
            contract_address: row.get(1)?,
            threat_type: parse_text::<ThreatType>(2, &row.get::<_, String>(2)?)?,
            severity: parse_text::<Severity>(3, &row.get::<_, String>(3)?)?,
            confidence: row.get(4)?,
            tx_hash: row.get(5)?,
            description: row.get(6)?,
            detected_at: parse_time(7, &row.get::<_, String>(7)?)?,
        })
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn parse_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {s:?}: {e}")))
}

fn parse_text<T: FromStr<Err = String>>(idx: usize, s: &str) -> rusqlite::Result<T> {
    T::from_str(s).map_err(|e| conversion_error(idx, e))
}
