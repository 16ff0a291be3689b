pub mod mempool;
pub mod pipeline;
pub mod tx;

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::AlertThresholds;

/// Lifecycle status of an observed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    /// Only pending transactions may change status, and only to a final one.
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        self == TxStatus::Pending && next != TxStatus::Pending
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
        }
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TxStatus::Pending),
            "confirmed" | "mined" => Ok(TxStatus::Confirmed),
            "failed" | "reverted" => Ok(TxStatus::Failed),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}

/// A transaction observed from the network, in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    /// `None` for contract creation.
    pub to: Option<String>,
    /// Native currency units.
    pub value: Decimal,
    pub gas_price: Decimal,
    pub gas_limit: u64,
    /// Decoded method name, or the raw 4-byte selector when unknown.
    pub method: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub status: TxStatus,
}

/// Severity of a detection; also used as a contract's threat level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

pub type ThreatLevel = Severity;

impl Severity {
    pub fn from_confidence(confidence: u8, thresholds: &AlertThresholds) -> Self {
        if confidence >= thresholds.critical {
            Severity::Critical
        } else if confidence >= thresholds.high {
            Severity::High
        } else if confidence >= thresholds.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity {other:?}")),
        }
    }
}

/// Threat category a heuristic detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    Reentrancy,
    FrontRun,
    Sandwich,
    Honeypot,
    SuspiciousVolume,
    GasManipulation,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::Reentrancy => "reentrancy",
            ThreatType::FrontRun => "front_run",
            ThreatType::Sandwich => "sandwich",
            ThreatType::Honeypot => "honeypot",
            ThreatType::SuspiciousVolume => "suspicious_volume",
            ThreatType::GasManipulation => "gas_manipulation",
        }
    }
}

impl FromStr for ThreatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reentrancy" => Ok(ThreatType::Reentrancy),
            "front_run" => Ok(ThreatType::FrontRun),
            "sandwich" => Ok(ThreatType::Sandwich),
            "honeypot" => Ok(ThreatType::Honeypot),
            "suspicious_volume" => Ok(ThreatType::SuspiciousVolume),
            "gas_manipulation" => Ok(ThreatType::GasManipulation),
            other => Err(format!("unknown threat type {other:?}")),
        }
    }
}

/// An address registered for focused monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedContract {
    pub address: String,
    pub label: Option<String>,
    pub added_at: DateTime<Utc>,
    pub transaction_count: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub threat_level: ThreatLevel,
    /// Insertion order within the registry.
    #[serde(skip)]
    pub position: u64,
    /// Recent detection severities feeding `threat_level`.
    #[serde(skip)]
    pub recent_threats: VecDeque<(DateTime<Utc>, Severity)>,
}

/// A finding correlating one transaction with one tracked contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatDetection {
    pub id: String,
    pub contract_address: String,
    pub threat_type: ThreatType,
    pub severity: Severity,
    /// 0-100
    pub confidence: u8,
    pub tx_hash: String,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

/// Rolling aggregate view over the stats window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub pending_count: u64,
    pub avg_gas_price: Decimal,
    pub total_value_observed: Decimal,
    pub tracked_contract_count: u64,
    pub threats_detected_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub sample_count: u64,
    pub tracked_activity_count: u64,
    pub total_ingested: u64,
    pub rejected_count: u64,
    pub dropped_events: u64,
}

/// Messages delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    Transaction(Transaction),
    ThreatDetection(ThreatDetection),
    Stats(StatsSnapshot),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_from_confidence_uses_thresholds() {
        let t = AlertThresholds::default();
        assert_eq!(Severity::from_confidence(95, &t), Severity::Critical);
        assert_eq!(Severity::from_confidence(80, &t), Severity::Critical);
        assert_eq!(Severity::from_confidence(60, &t), Severity::High);
        assert_eq!(Severity::from_confidence(45, &t), Severity::Medium);
        assert_eq!(Severity::from_confidence(10, &t), Severity::Low);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!("HIGH".parse::<Severity>(), Ok(Severity::High));
        assert!("extreme".parse::<Severity>().is_err());
    }

    #[test]
    fn status_transitions() {
        assert!(TxStatus::Pending.can_transition_to(TxStatus::Confirmed));
        assert!(TxStatus::Pending.can_transition_to(TxStatus::Failed));
        assert!(!TxStatus::Pending.can_transition_to(TxStatus::Pending));
        assert!(!TxStatus::Confirmed.can_transition_to(TxStatus::Failed));
        assert!(!TxStatus::Failed.can_transition_to(TxStatus::Confirmed));
    }

    #[test]
    fn event_serializes_tagged() {
        let event = Event::ThreatDetection(ThreatDetection {
            id: "0x01:front_run".into(),
            contract_address: "0xabc".into(),
            threat_type: ThreatType::FrontRun,
            severity: Severity::High,
            confidence: 70,
            tx_hash: "0x01".into(),
            description: "test".into(),
            detected_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "threat_detection");
        assert_eq!(json["data"]["threatType"], "front_run");
        assert_eq!(json["data"]["severity"], "high");
        assert_eq!(json["data"]["contractAddress"], "0xabc");
    }
}
