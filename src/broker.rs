//! Reference chamber: VRAM brokering.
//!
//! Observes memory demand (jobs requesting VRAM) and supply (providers
//! staking VRAM at an asking price), matches each demand to the cheapest
//! eligible supply, and scores a backtest window by how much of the realized
//! spend the staked market would have saved. When ACTIVE it emits time-boxed
//! reroute suggestions for demands where projected savings clear a
//! materiality bar.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::chamber::{
    BacktestResult, Chamber, ChamberHealth, ChamberInfluence, ChamberMode, ChamberStatus,
};
use crate::events::{EventKind, PlatformEvent};
use crate::logging::{log, obj, v_str, Domain, Level};

pub const INFLUENCE_TYPE_REROUTE: &str = "memory.reroute";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Below this many demand records in the window, a backtest refuses to
    /// produce a score.
    pub min_demand_records: usize,
    /// Projected savings (percent) a suggestion must clear to be emitted.
    pub materiality_pct: f64,
    pub influence_ttl_secs: u64,
    /// The chamber's own pass bar for backtests.
    pub pass_score: f64,
    /// Silence longer than this marks the chamber OFFLINE to health checks.
    pub stale_after_secs: i64,
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        Self {
            min_demand_records: std::env::var("MIN_DEMAND_RECORDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            materiality_pct: std::env::var("MATERIALITY_PCT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5.0),
            influence_ttl_secs: std::env::var("INFLUENCE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            pass_score: std::env::var("BROKER_PASS_SCORE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(70.0),
            stale_after_secs: std::env::var("BROKER_STALE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
        }
    }
}

#[derive(Debug, Clone)]
struct DemandRecord {
    job_id: String,
    requested_vram_gb: f64,
    duration_hours: f64,
    estimated_cost: f64,
    ts: DateTime<Utc>,
    completed: bool,
    actual_cost: Option<f64>,
}

#[derive(Debug, Clone)]
struct SupplyRecord {
    stake_id: String,
    provider_id: String,
    vram_gb: f64,
    price_per_gb_hour: f64,
    released: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    demands: Vec<DemandRecord>,
    supplies: Vec<SupplyRecord>,
    events_received: u64,
    last_event_at: Option<DateTime<Utc>>,
    activated_at: Option<DateTime<Utc>>,
    mode: Option<ChamberMode>,
    last_backtest_score: Option<f64>,
}

pub struct MemoryBrokerChamber {
    id: String,
    config: BrokerConfig,
    state: Mutex<BrokerState>,
}

impl MemoryBrokerChamber {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            id: "memory-broker".to_string(),
            config,
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Cheapest unreleased supply with enough VRAM; total cost for the
    /// demand's size and duration.
    fn cheapest_eligible(
        supplies: &[SupplyRecord],
        vram_gb: f64,
        duration_hours: f64,
    ) -> Option<(SupplyRecord, f64)> {
        supplies
            .iter()
            .filter(|s| !s.released && s.vram_gb >= vram_gb)
            .map(|s| {
                let cost = s.price_per_gb_hour * vram_gb * duration_hours;
                (s.clone(), cost)
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    fn suggestion(
        &self,
        state: &BrokerState,
        job_id: &str,
        vram_gb: f64,
        duration_hours: f64,
        estimated_cost: f64,
    ) -> Option<ChamberInfluence> {
        if estimated_cost <= 0.0 {
            return None;
        }
        let (supply, staked_cost) =
            Self::cheapest_eligible(&state.supplies, vram_gb, duration_hours)?;
        let savings_pct = (estimated_cost - staked_cost) / estimated_cost * 100.0;
        if savings_pct <= self.config.materiality_pct {
            return None;
        }
        // Confidence scales with savings, capped below certainty.
        let confidence = (0.5 + savings_pct / 100.0).min(0.95);
        Some(ChamberInfluence {
            chamber_id: self.id.clone(),
            influence_type: INFLUENCE_TYPE_REROUTE.to_string(),
            payload: json!({
                "job_id": job_id,
                "stake_id": supply.stake_id,
                "provider_id": supply.provider_id,
                "staked_cost": staked_cost,
                "estimated_cost": estimated_cost,
                "projected_savings_pct": savings_pct,
            }),
            confidence,
            ttl_seconds: self.config.influence_ttl_secs,
        })
    }

    fn record_demand(
        state: &mut BrokerState,
        job_id: &str,
        vram_gb: f64,
        duration_hours: f64,
        estimated_cost: f64,
        ts: DateTime<Utc>,
    ) {
        if state.demands.iter().any(|d| d.job_id == job_id) {
            return;
        }
        state.demands.push(DemandRecord {
            job_id: job_id.to_string(),
            requested_vram_gb: vram_gb,
            duration_hours,
            estimated_cost,
            ts,
            completed: false,
            actual_cost: None,
        });
    }
}

#[async_trait]
impl Chamber for MemoryBrokerChamber {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "VRAM brokering"
    }

    fn event_types(&self) -> Vec<&'static str> {
        vec![
            "memory.staked",
            "memory.requested",
            "memory.released",
            "job.created",
            "job.completed",
            "job.failed",
        ]
    }

    fn min_backtest_samples(&self) -> usize {
        self.config.min_demand_records
    }

    async fn on_event(
        &self,
        event: &PlatformEvent,
        mode: ChamberMode,
    ) -> Option<ChamberInfluence> {
        let mut state = self.state.lock().ok()?;
        state.events_received += 1;
        state.last_event_at = Some(event.timestamp);

        let mut influence = None;
        match &event.kind {
            EventKind::MemoryStaked {
                stake_id,
                provider_id,
                vram_gb,
                price_per_gb_hour,
            } => {
                state.supplies.push(SupplyRecord {
                    stake_id: stake_id.clone(),
                    provider_id: provider_id.clone(),
                    vram_gb: *vram_gb,
                    price_per_gb_hour: *price_per_gb_hour,
                    released: false,
                });
            }
            EventKind::MemoryReleased { stake_id, .. } => {
                for supply in state.supplies.iter_mut() {
                    if &supply.stake_id == stake_id {
                        supply.released = true;
                    }
                }
            }
            EventKind::MemoryRequested {
                job_id,
                vram_gb,
                duration_hours,
                estimated_cost,
                ..
            } => {
                Self::record_demand(
                    &mut state,
                    job_id,
                    *vram_gb,
                    *duration_hours,
                    *estimated_cost,
                    event.timestamp,
                );
                if mode == ChamberMode::Active {
                    influence =
                        self.suggestion(&state, job_id, *vram_gb, *duration_hours, *estimated_cost);
                }
            }
            EventKind::JobCreated {
                job_id,
                requested_vram_gb,
                duration_hours,
                estimated_cost,
                ..
            } => {
                Self::record_demand(
                    &mut state,
                    job_id,
                    *requested_vram_gb,
                    *duration_hours,
                    *estimated_cost,
                    event.timestamp,
                );
                if mode == ChamberMode::Active {
                    influence = self.suggestion(
                        &state,
                        job_id,
                        *requested_vram_gb,
                        *duration_hours,
                        *estimated_cost,
                    );
                }
            }
            EventKind::JobCompleted {
                job_id, actual_cost, ..
            } => {
                for demand in state.demands.iter_mut() {
                    if &demand.job_id == job_id {
                        demand.completed = true;
                        demand.actual_cost = Some(*actual_cost);
                    }
                }
            }
            EventKind::JobFailed { job_id, .. } => {
                // Stays in the match denominator; failed jobs drag the
                // completion rate down.
                for demand in state.demands.iter_mut() {
                    if &demand.job_id == job_id {
                        demand.completed = false;
                        demand.actual_cost = None;
                    }
                }
            }
            _ => {}
        }

        // Only ACTIVE chambers speak, no matter what was computed above.
        if mode == ChamberMode::Active {
            influence
        } else {
            None
        }
    }

    fn status(&self) -> ChamberStatus {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let health = match state.last_event_at {
            None => ChamberHealth::Degraded,
            Some(last) => {
                if (Utc::now() - last).num_seconds() > self.config.stale_after_secs {
                    ChamberHealth::Offline
                } else {
                    ChamberHealth::Healthy
                }
            }
        };
        ChamberStatus {
            mode: state.mode.unwrap_or(ChamberMode::Offline),
            events_received: state.events_received,
            last_event_at: state.last_event_at,
            activated_at: state.activated_at,
            health,
            last_backtest_score: state.last_backtest_score,
        }
    }

    fn run_backtest(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> BacktestResult {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window: Vec<DemandRecord> = state
            .demands
            .iter()
            .filter(|d| d.ts >= from && d.ts <= to)
            .cloned()
            .collect();
        if window.len() < self.config.min_demand_records {
            state.last_backtest_score = Some(0.0);
            return BacktestResult::insufficient_data(
                from,
                to,
                window.len() as u64,
                self.config.min_demand_records,
            );
        }

        let mut matched = 0u64;
        let mut realized = 0u64;
        let mut improvement_sum = 0.0;
        for demand in &window {
            let Some((_, staked_cost)) = Self::cheapest_eligible(
                &state.supplies,
                demand.requested_vram_gb,
                demand.duration_hours,
            ) else {
                continue;
            };
            matched += 1;
            if let Some(actual) = demand.actual_cost {
                if demand.completed && actual > 0.0 {
                    realized += 1;
                    improvement_sum += (actual - staked_cost) / actual * 100.0;
                }
            }
        }

        let improvement_pct = if realized > 0 {
            improvement_sum / realized as f64
        } else {
            0.0
        };
        let completion_rate = if matched > 0 {
            realized as f64 / matched as f64
        } else {
            0.0
        };
        let score = (improvement_pct * completion_rate).clamp(0.0, 100.0);
        let passed = score >= self.config.pass_score;
        state.last_backtest_score = Some(score);

        BacktestResult {
            from,
            to,
            events_replayed: window.len() as u64,
            score,
            improvement_pct,
            passed,
            summary: format!(
                "{} demands, {} matched, {} realized, improvement {:.1}%, completion {:.0}%",
                window.len(),
                matched,
                realized,
                improvement_pct,
                completion_rate * 100.0
            ),
        }
    }

    fn on_mode_change(&self, previous: ChamberMode, next: ChamberMode) {
        if let Ok(mut state) = self.state.lock() {
            state.mode = Some(next);
            if next == ChamberMode::Active {
                state.activated_at = Some(Utc::now());
            } else if previous == ChamberMode::Active {
                state.activated_at = None;
            }
        }
        log(
            Level::Info,
            Domain::Chamber,
            "mode_change",
            obj(&[
                ("chamber_id", v_str(&self.id)),
                ("from", v_str(previous.as_str())),
                ("to", v_str(next.as_str())),
            ]),
        );
    }
}
