//! Threshold watcher: polls chamber telemetry volume and asks the registry
//! to backtest-and-promote once a chamber has seen enough events.
//!
//! A failing backtest is retried on every subsequent tick; a passing one
//! marks the chamber promoted in session memory so later ticks skip it.
//! Errors from a single chamber are caught per-chamber, the same bulkhead
//! discipline as the bus.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::chamber::ChamberMode;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::registry::ChamberRegistry;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub interval_secs: u64,
    pub default_min_events: u64,
    pub default_window_hours: i64,
}

impl WatcherConfig {
    pub fn from_env() -> Self {
        Self {
            interval_secs: std::env::var("WATCHER_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            default_min_events: std::env::var("WATCHER_MIN_EVENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            default_window_hours: std::env::var("WATCHER_WINDOW_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
        }
    }
}

pub struct ThresholdWatcher {
    registry: Arc<ChamberRegistry>,
    config: WatcherConfig,
    min_events: HashMap<String, u64>,
    window_hours: HashMap<String, i64>,
    promoted: Mutex<HashSet<String>>,
}

impl ThresholdWatcher {
    pub fn new(registry: Arc<ChamberRegistry>, config: WatcherConfig) -> Self {
        Self {
            registry,
            config,
            min_events: HashMap::new(),
            window_hours: HashMap::new(),
            promoted: Mutex::new(HashSet::new()),
        }
    }

    /// Per-chamber override of the event-volume bar.
    pub fn with_min_events(mut self, chamber_id: &str, min_events: u64) -> Self {
        self.min_events.insert(chamber_id.to_string(), min_events);
        self
    }

    /// Per-chamber override of the trailing backtest window.
    pub fn with_window_hours(mut self, chamber_id: &str, hours: i64) -> Self {
        self.window_hours.insert(chamber_id.to_string(), hours);
        self
    }

    fn min_events_for(&self, chamber_id: &str) -> u64 {
        *self
            .min_events
            .get(chamber_id)
            .unwrap_or(&self.config.default_min_events)
    }

    fn window_hours_for(&self, chamber_id: &str) -> i64 {
        *self
            .window_hours
            .get(chamber_id)
            .unwrap_or(&self.config.default_window_hours)
    }

    pub async fn tick(&self) {
        for (id, status) in self.registry.statuses().await {
            if status.mode == ChamberMode::Active {
                continue;
            }
            if self.promoted.lock().await.contains(&id) {
                continue;
            }
            let min_events = self.min_events_for(&id);
            if status.events_received < min_events {
                log(
                    Level::Trace,
                    Domain::Watcher,
                    "below_threshold",
                    obj(&[
                        ("chamber_id", v_str(&id)),
                        ("events_received", v_num(status.events_received as f64)),
                        ("min_events", v_num(min_events as f64)),
                    ]),
                );
                continue;
            }

            let to = Utc::now();
            let from = to - Duration::hours(self.window_hours_for(&id));
            match self.registry.run_backtest_and_activate(&id, from, to).await {
                Ok(result) => {
                    if self.registry.mode_of(&id).await == Some(ChamberMode::Active) {
                        self.promoted.lock().await.insert(id.clone());
                        log(
                            Level::Info,
                            Domain::Watcher,
                            "promoted",
                            obj(&[("chamber_id", v_str(&id)), ("score", v_num(result.score))]),
                        );
                    } else {
                        // Not an error: retried on the next tick, forever.
                        log(
                            Level::Info,
                            Domain::Watcher,
                            "promotion_deferred",
                            obj(&[
                                ("chamber_id", v_str(&id)),
                                ("score", v_num(result.score)),
                                ("summary", v_str(&result.summary)),
                            ]),
                        );
                    }
                }
                Err(err) => {
                    // Per-chamber bulkhead: the scan always finishes.
                    log(
                        Level::Warn,
                        Domain::Watcher,
                        "backtest_error",
                        obj(&[("chamber_id", v_str(&id)), ("error", v_str(&err.to_string()))]),
                    );
                }
            }
        }
    }

    /// Out-of-band immediate check, e.g. after a bulk data load.
    pub async fn nudge(&self) {
        log(Level::Debug, Domain::Watcher, "nudge", obj(&[]));
        self.tick().await;
    }

    /// Clear the suppression flag so an undock/redock cycle gets a fresh
    /// promotion attempt.
    pub async fn reset_promotion(&self, chamber_id: &str) {
        self.promoted.lock().await.remove(chamber_id);
    }

    pub async fn is_promoted(&self, chamber_id: &str) -> bool {
        self.promoted.lock().await.contains(chamber_id)
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let period = std::time::Duration::from_secs(self.config.interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::registry::RegistryConfig;

    fn test_watcher() -> ThresholdWatcher {
        let registry = ChamberRegistry::new(
            EventBus::new(),
            RegistryConfig {
                backtest_threshold: 70.0,
                max_backtest_window_hours: 720,
                health_interval_secs: 30,
            },
        );
        ThresholdWatcher::new(
            registry,
            WatcherConfig {
                interval_secs: 60,
                default_min_events: 20,
                default_window_hours: 24,
            },
        )
    }

    #[test]
    fn test_per_chamber_overrides() {
        let watcher = test_watcher()
            .with_min_events("broker", 5)
            .with_window_hours("broker", 48);
        assert_eq!(watcher.min_events_for("broker"), 5);
        assert_eq!(watcher.min_events_for("other"), 20);
        assert_eq!(watcher.window_hours_for("broker"), 48);
        assert_eq!(watcher.window_hours_for("other"), 24);
    }

    #[tokio::test]
    async fn test_promotion_memory_reset() {
        let watcher = test_watcher();
        watcher.promoted.lock().await.insert("broker".to_string());
        assert!(watcher.is_promoted("broker").await);
        watcher.reset_promotion("broker").await;
        assert!(!watcher.is_promoted("broker").await);
    }
}
