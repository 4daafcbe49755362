//! Chamber capability contract.
//!
//! A chamber is an analytics module that observes platform events in every
//! mode and may influence decisions only while ACTIVE. Mode transitions are
//! registry-mediated; a chamber never flips its own mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::events::PlatformEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChamberMode {
    Offline,
    Passive,
    Backtest,
    Active,
}

impl ChamberMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChamberMode::Offline => "OFFLINE",
            ChamberMode::Passive => "PASSIVE",
            ChamberMode::Backtest => "BACKTEST",
            ChamberMode::Active => "ACTIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChamberHealth {
    Healthy,
    Degraded,
    Offline,
}

/// Point-in-time snapshot, recomputed on demand.
#[derive(Debug, Clone, Serialize)]
pub struct ChamberStatus {
    pub mode: ChamberMode,
    pub events_received: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub health: ChamberHealth,
    pub last_backtest_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub events_replayed: u64,
    /// 0-100.
    pub score: f64,
    pub improvement_pct: f64,
    pub passed: bool,
    pub summary: String,
}

impl BacktestResult {
    /// The defined short-circuit for thin windows: a chamber must refuse to
    /// claim a score on too little data.
    pub fn insufficient_data(
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        found: u64,
        required: usize,
    ) -> Self {
        Self {
            from,
            to,
            events_replayed: found,
            score: 0.0,
            improvement_pct: 0.0,
            passed: false,
            summary: format!(
                "insufficient data: {} samples in window, {} required",
                found, required
            ),
        }
    }
}

/// Time-boxed, confidence-scored suggestion an ACTIVE chamber may emit.
/// Lives only in the registry cache; never persisted outside the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct ChamberInfluence {
    pub chamber_id: String,
    pub influence_type: String,
    pub payload: Value,
    /// 0-1.
    pub confidence: f64,
    pub ttl_seconds: u64,
}

#[async_trait]
pub trait Chamber: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    /// Event types this chamber wants from the bus.
    fn event_types(&self) -> Vec<&'static str>;

    /// Minimum windowed sample size below which `run_backtest` must return
    /// the insufficient-data result.
    fn min_backtest_samples(&self) -> usize;

    /// Accumulate telemetry (every mode) and, only when `mode` is ACTIVE,
    /// optionally return an influence. PASSIVE is provably inert: the return
    /// value must be `None` in every non-ACTIVE mode.
    async fn on_event(&self, event: &PlatformEvent, mode: ChamberMode) -> Option<ChamberInfluence>;

    fn status(&self) -> ChamberStatus;

    /// Pure with respect to stored telemetry, except for recording its own
    /// last score.
    fn run_backtest(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> BacktestResult;

    fn on_mode_change(&self, previous: ChamberMode, next: ChamberMode);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_wire_names() {
        assert_eq!(ChamberMode::Passive.as_str(), "PASSIVE");
        assert_eq!(
            serde_json::to_value(ChamberMode::Active).unwrap(),
            serde_json::json!("ACTIVE")
        );
    }

    #[test]
    fn test_insufficient_data_short_circuit() {
        let now = Utc::now();
        let result = BacktestResult::insufficient_data(now, now, 3, 10);
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
        assert!(result.summary.contains("3 samples"));
        assert!(result.summary.contains("10 required"));
    }
}
