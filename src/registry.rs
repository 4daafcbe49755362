//! Chamber registry: docking, lifecycle, influence cache, health.
//!
//! One registry-owned lock serializes dock/undock, mode flips, and cache
//! mutations. Event delivery to docked chambers stays concurrent; the
//! per-chamber bus adapter reads the authoritative mode under the lock right
//! before invoking the chamber, and re-checks it before caching an
//! influence, so nothing dispatched after a mode flip can observe the old
//! mode.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::{EventBus, EventHandler, SubscriptionHandle};
use crate::chamber::{BacktestResult, Chamber, ChamberHealth, ChamberInfluence, ChamberMode, ChamberStatus};
use crate::events::PlatformEvent;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Platform-wide promotion bar, enforced on top of each chamber's own
    /// pass/fail judgment.
    pub backtest_threshold: f64,
    pub max_backtest_window_hours: i64,
    pub health_interval_secs: u64,
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        Self {
            backtest_threshold: std::env::var("BACKTEST_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(70.0),
            max_backtest_window_hours: std::env::var("MAX_BACKTEST_WINDOW_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(720),
            health_interval_secs: std::env::var("HEALTH_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

struct Docked {
    chamber: Arc<dyn Chamber>,
    mode: ChamberMode,
    handle: SubscriptionHandle,
}

struct CachedInfluence {
    influence: ChamberInfluence,
    cached_at: DateTime<Utc>,
}

impl CachedInfluence {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.cached_at + Duration::seconds(self.influence.ttl_seconds as i64)
    }
}

#[derive(Default)]
struct RegistryInner {
    docked: HashMap<String, Docked>,
    influences: HashMap<String, Vec<CachedInfluence>>,
}

pub struct ChamberRegistry {
    bus: Arc<EventBus>,
    config: RegistryConfig,
    inner: Mutex<RegistryInner>,
}

/// Bus-facing adapter for one docked chamber.
struct ChamberAdapter {
    registry: std::sync::Weak<ChamberRegistry>,
    chamber_id: String,
}

#[async_trait]
impl EventHandler for ChamberAdapter {
    async fn handle(&self, event: PlatformEvent) -> Result<()> {
        if let Some(registry) = self.registry.upgrade() {
            registry.dispatch(&self.chamber_id, event).await;
        }
        Ok(())
    }
}

impl ChamberRegistry {
    pub fn new(bus: Arc<EventBus>, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            inner: Mutex::new(RegistryInner::default()),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Attach a chamber: subscribe it to its declared event types and start
    /// it PASSIVE. Returns false if the id is already docked.
    pub async fn dock(self: &Arc<Self>, chamber: Arc<dyn Chamber>) -> bool {
        let id = chamber.id().to_string();
        {
            let inner = self.inner.lock().await;
            if inner.docked.contains_key(&id) {
                return false;
            }
        }

        let adapter = Arc::new(ChamberAdapter {
            registry: Arc::downgrade(self),
            chamber_id: id.clone(),
        });
        let types = chamber.event_types();
        let handle = self.bus.subscribe(&id, &types, adapter).await;

        let mut inner = self.inner.lock().await;
        if inner.docked.contains_key(&id) {
            // Lost a dock race for the same id; detach the extra subscription.
            drop(inner);
            handle.unsubscribe().await;
            return false;
        }
        inner.docked.insert(
            id.clone(),
            Docked {
                chamber: chamber.clone(),
                mode: ChamberMode::Passive,
                handle,
            },
        );
        chamber.on_mode_change(ChamberMode::Offline, ChamberMode::Passive);
        drop(inner);

        log(
            Level::Info,
            Domain::Registry,
            "docked",
            obj(&[("chamber_id", v_str(&id)), ("name", v_str(chamber.name()))]),
        );
        true
    }

    /// Detach a chamber. Unknown id is a benign no-op returning false:
    /// "already gone" is not an error for a detach.
    pub async fn undock(&self, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner.influences.remove(id);
            inner.docked.remove(id)
        };
        let Some(docked) = removed else {
            return false;
        };
        docked.handle.unsubscribe().await;
        docked.chamber.on_mode_change(docked.mode, ChamberMode::Offline);
        log(
            Level::Info,
            Domain::Registry,
            "undocked",
            obj(&[("chamber_id", v_str(id)), ("prev_mode", v_str(docked.mode.as_str()))]),
        );
        true
    }

    /// The only sanctioned mode flip. The flip and the chamber callback both
    /// happen under the registry lock, so no dispatch that starts after this
    /// call can read the old mode.
    pub async fn set_mode(&self, id: &str, mode: ChamberMode) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(docked) = inner.docked.get_mut(id) else {
            bail!("chamber {} is not docked", id);
        };
        let previous = docked.mode;
        if previous == mode {
            return Ok(());
        }
        docked.mode = mode;
        let chamber = docked.chamber.clone();
        if previous == ChamberMode::Active {
            // Demotion makes cached influences unreachable immediately.
            inner.influences.remove(id);
        }
        chamber.on_mode_change(previous, mode);
        drop(inner);

        log(
            Level::Info,
            Domain::Registry,
            "mode_changed",
            obj(&[
                ("chamber_id", v_str(id)),
                ("from", v_str(previous.as_str())),
                ("to", v_str(mode.as_str())),
            ]),
        );
        Ok(())
    }

    /// Run the chamber's backtest and promote to ACTIVE only if the chamber
    /// passed its own bar AND the score clears the registry threshold. A
    /// failing result leaves the mode untouched and is returned for
    /// visibility.
    pub async fn run_backtest_and_activate(
        &self,
        id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BacktestResult> {
        let now = Utc::now();
        if to > now {
            bail!("backtest window may not end in the future");
        }
        if from >= to {
            bail!("backtest window is empty");
        }
        if to - from > Duration::hours(self.config.max_backtest_window_hours) {
            bail!(
                "backtest window exceeds {} hours",
                self.config.max_backtest_window_hours
            );
        }

        let chamber = {
            let inner = self.inner.lock().await;
            let Some(docked) = inner.docked.get(id) else {
                bail!("chamber {} is not docked", id);
            };
            docked.chamber.clone()
        };

        let result = chamber.run_backtest(from, to);
        let promoted = result.passed && result.score >= self.config.backtest_threshold;
        if promoted {
            self.set_mode(id, ChamberMode::Active).await?;
        }
        log(
            Level::Info,
            Domain::Registry,
            "backtest_completed",
            obj(&[
                ("chamber_id", v_str(id)),
                ("score", v_num(result.score)),
                ("passed", serde_json::json!(result.passed)),
                ("promoted", serde_json::json!(promoted)),
                ("threshold", v_num(self.config.backtest_threshold)),
            ]),
        );
        Ok(result)
    }

    async fn dispatch(&self, chamber_id: &str, event: PlatformEvent) {
        let (chamber, mode) = {
            let inner = self.inner.lock().await;
            let Some(docked) = inner.docked.get(chamber_id) else {
                // Undocked while the event was in flight.
                return;
            };
            (docked.chamber.clone(), docked.mode)
        };

        let influence = chamber.on_event(&event, mode).await;
        let Some(influence) = influence else {
            return;
        };

        let mut inner = self.inner.lock().await;
        let still_active = inner
            .docked
            .get(chamber_id)
            .map(|d| d.mode == ChamberMode::Active)
            .unwrap_or(false);
        if !still_active {
            return;
        }
        inner
            .influences
            .entry(chamber_id.to_string())
            .or_default()
            .push(CachedInfluence {
                influence,
                cached_at: Utc::now(),
            });
    }

    pub async fn get_active_influences(
        &self,
        influence_type: Option<&str>,
    ) -> Vec<ChamberInfluence> {
        self.get_active_influences_at(influence_type, Utc::now()).await
    }

    /// Deterministic-clock variant used by replay tooling and tests.
    /// Expired entries are pruned as a side effect of the read.
    pub async fn get_active_influences_at(
        &self,
        influence_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<ChamberInfluence> {
        let mut inner = self.inner.lock().await;
        let mut out = Vec::new();
        let active: Vec<String> = inner
            .docked
            .iter()
            .filter(|(_, d)| d.mode == ChamberMode::Active)
            .map(|(id, _)| id.clone())
            .collect();
        for cached in inner.influences.values_mut() {
            cached.retain(|c| !c.expired(now));
        }
        for id in active {
            if let Some(cached) = inner.influences.get(&id) {
                for c in cached {
                    if influence_type.map_or(true, |t| c.influence.influence_type == t) {
                        out.push(c.influence.clone());
                    }
                }
            }
        }
        out.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }

    /// Demote any ACTIVE chamber whose own health report says OFFLINE: a
    /// chamber that stopped producing signal must stop influencing before it
    /// is formally fixed.
    pub async fn run_health_check(&self) {
        let snapshot: Vec<(String, Arc<dyn Chamber>, ChamberMode)> = {
            let inner = self.inner.lock().await;
            inner
                .docked
                .iter()
                .map(|(id, d)| (id.clone(), d.chamber.clone(), d.mode))
                .collect()
        };
        for (id, chamber, mode) in snapshot {
            if mode != ChamberMode::Active {
                continue;
            }
            if chamber.status().health == ChamberHealth::Offline {
                log(
                    Level::Warn,
                    Domain::Registry,
                    "health_demotion",
                    obj(&[("chamber_id", v_str(&id))]),
                );
                let _ = self.set_mode(&id, ChamberMode::Passive).await;
            }
        }
    }

    pub fn spawn_health_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = std::time::Duration::from_secs(self.config.health_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                registry.run_health_check().await;
            }
        })
    }

    /// Statuses with the registry's authoritative mode substituted in.
    pub async fn statuses(&self) -> Vec<(String, ChamberStatus)> {
        let snapshot: Vec<(String, Arc<dyn Chamber>, ChamberMode)> = {
            let inner = self.inner.lock().await;
            inner
                .docked
                .iter()
                .map(|(id, d)| (id.clone(), d.chamber.clone(), d.mode))
                .collect()
        };
        let mut out = Vec::with_capacity(snapshot.len());
        for (id, chamber, mode) in snapshot {
            let mut status = chamber.status();
            status.mode = mode;
            out.push((id, status));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn mode_of(&self, id: &str) -> Option<ChamberMode> {
        self.inner.lock().await.docked.get(id).map(|d| d.mode)
    }

    pub async fn docked_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().await.docked.keys().cloned().collect();
        ids.sort();
        ids
    }
}
