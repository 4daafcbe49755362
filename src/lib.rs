//! gridpulse: telemetry-and-trust substrate for a GPU marketplace.
//!
//! A typed event bus with per-handler fault isolation, an append-only
//! hash-chained ledger behind a single-writer lock, a registry of pluggable
//! chamber analytics modules whose lifecycle is gated by backtest scores,
//! and a threshold watcher that promotes chambers once they have seen
//! enough data.

pub mod broker;
pub mod bus;
pub mod chamber;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod registry;
pub mod watcher;
