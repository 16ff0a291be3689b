pub mod context;
pub mod rules;
pub mod score;

use chrono::Utc;

use crate::config::HeuristicConfig;
use crate::core::{Severity, ThreatDetection, TrackedContract, Transaction};
use context::AddressActivity;
use rules::{Heuristic, HeuristicContext};

/// The heuristic engine runs every enabled heuristic against a transaction
/// to a tracked contract and turns findings into detections.
pub struct HeuristicEngine {
    heuristics: Vec<Box<dyn Heuristic + Send + Sync>>,
    config: HeuristicConfig,
}

impl HeuristicEngine {
    pub fn new(config: HeuristicConfig) -> Self {
        Self::with_heuristics(config, rules::default_heuristics())
    }

    pub fn with_heuristics(
        config: HeuristicConfig,
        heuristics: Vec<Box<dyn Heuristic + Send + Sync>>,
    ) -> Self {
        Self { heuristics, config }
    }

    pub fn config(&self) -> &HeuristicConfig {
        &self.config
    }

    fn weight(&self, name: &str) -> f64 {
        self.config.weights.get(name).copied().unwrap_or(1.0)
    }

    /// Evaluate `tx` against `contract`, given the contract's prior activity.
    ///
    /// Returns nothing when the contract is unknown or the transaction is not
    /// addressed to it. At most one detection per threat type.
    pub fn evaluate(
        &self,
        tx: &Transaction,
        contract: Option<&TrackedContract>,
        activity: &AddressActivity,
    ) -> Vec<ThreatDetection> {
        let Some(contract) = contract else {
            return Vec::new();
        };
        if tx.to.as_deref() != Some(contract.address.as_str()) {
            return Vec::new();
        }

        let ctx = HeuristicContext {
            contract,
            activity,
            config: &self.config,
        };
        let detected_at = Utc::now();

        self.heuristics
            .iter()
            .filter_map(|heuristic| {
                let weight = self.weight(heuristic.name());
                if weight <= 0.0 {
                    return None;
                }
                let finding = heuristic.evaluate(tx, &ctx)?;
                let confidence = score::weighted_confidence(finding.confidence, weight);
                let threat_type = heuristic.threat_type();
                Some(ThreatDetection {
                    id: format!("{}:{}", tx.hash, threat_type.as_str()),
                    contract_address: contract.address.clone(),
                    threat_type,
                    severity: Severity::from_confidence(confidence, &self.config.alert_thresholds),
                    confidence,
                    tx_hash: tx.hash.clone(),
                    description: finding.description,
                    detected_at,
                })
            })
            .collect()
    }
}
