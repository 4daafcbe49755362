//! Typed publish/subscribe hub.
//!
//! `publish` fans an event out to every matching subscription, one spawned
//! task per handler, and settles them all. A failing or panicking handler is
//! counted and logged; it can never reach the publisher or the other
//! handlers. Publish is best-effort by contract: callers observe failures
//! through [`BusStats`], never through a returned error.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::RwLock;

use crate::events::PlatformEvent;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: PlatformEvent) -> anyhow::Result<()>;
}

struct Subscription {
    subscriber_id: String,
    /// None subscribes to every event type (the ledger's wildcard).
    event_types: Option<HashSet<String>>,
    handler: Arc<dyn EventHandler>,
}

impl Subscription {
    fn matches(&self, event_type: &str) -> bool {
        match &self.event_types {
            None => true,
            Some(set) => set.contains(event_type),
        }
    }
}

/// Monotonic delivery counters for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
}

pub struct EventBus {
    subscriptions: RwLock<HashMap<u64, Subscription>>,
    next_sub_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Detach capability returned by `subscribe`. Dropping the handle does not
/// unsubscribe; detaching is always explicit.
pub struct SubscriptionHandle {
    id: u64,
    bus: Arc<EventBus>,
}

impl SubscriptionHandle {
    pub async fn unsubscribe(&self) {
        self.bus.subscriptions.write().await.remove(&self.id);
    }
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_sub_id: AtomicU64::new(0),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub async fn subscribe(
        self: &Arc<Self>,
        subscriber_id: &str,
        event_types: &[&str],
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let types: HashSet<String> = event_types.iter().map(|t| t.to_string()).collect();
        self.attach(subscriber_id, Some(types), handler).await
    }

    /// Wildcard subscription; the ledger records everything through this.
    pub async fn subscribe_all(
        self: &Arc<Self>,
        subscriber_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        self.attach(subscriber_id, None, handler).await
    }

    async fn attach(
        self: &Arc<Self>,
        subscriber_id: &str,
        event_types: Option<HashSet<String>>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.write().await.insert(
            id,
            Subscription {
                subscriber_id: subscriber_id.to_string(),
                event_types,
                handler,
            },
        );
        log(
            Level::Debug,
            Domain::Bus,
            "subscribed",
            obj(&[("subscriber_id", v_str(subscriber_id)), ("sub_id", v_num(id as f64))]),
        );
        SubscriptionHandle {
            id,
            bus: Arc::clone(self),
        }
    }

    /// Fan the event out to every live matching subscription and settle all
    /// of them. Delivery order across handlers is unspecified.
    pub async fn publish(self: &Arc<Self>, event: PlatformEvent) {
        self.published.fetch_add(1, Ordering::SeqCst);

        let matching: Vec<(String, Arc<dyn EventHandler>)> = {
            let subs = self.subscriptions.read().await;
            subs.values()
                .filter(|s| s.matches(event.event_type()))
                .map(|s| (s.subscriber_id.clone(), s.handler.clone()))
                .collect()
        };

        let mut tasks = Vec::with_capacity(matching.len());
        for (subscriber_id, handler) in matching {
            let bus = Arc::clone(self);
            let ev = event.clone();
            tasks.push(tokio::spawn(async move {
                match handler.handle(ev).await {
                    Ok(()) => {
                        bus.delivered.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => {
                        bus.dropped.fetch_add(1, Ordering::SeqCst);
                        log(
                            Level::Warn,
                            Domain::Bus,
                            "handler_failed",
                            obj(&[
                                ("subscriber_id", v_str(&subscriber_id)),
                                ("error", v_str(&err.to_string())),
                            ]),
                        );
                    }
                }
            }));
        }

        for joined in join_all(tasks).await {
            // A panicking handler surfaces here as a JoinError.
            if let Err(err) = joined {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                log(
                    Level::Error,
                    Domain::Bus,
                    "handler_panicked",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.published.load(Ordering::SeqCst),
            events_delivered: self.delivered.load(Ordering::SeqCst),
            events_dropped: self.dropped.load(Ordering::SeqCst),
        }
    }

    pub async fn subscriber_ids(&self) -> Vec<String> {
        let subs = self.subscriptions.read().await;
        let mut ids: Vec<String> = subs
            .values()
            .map(|s| s.subscriber_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        ids
    }
}
