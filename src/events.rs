//! Platform event taxonomy.
//!
//! Event types are stable `domain.action` strings. The set is closed and
//! additive: new variants may be appended, new fields must be optional, and
//! neither names nor fields are ever repurposed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "auth.login")]
    AuthLogin {
        user_id: String,
        method: String,
        success: bool,
    },
    #[serde(rename = "job.created")]
    JobCreated {
        job_id: String,
        user_id: String,
        requested_vram_gb: f64,
        duration_hours: f64,
        estimated_cost: f64,
    },
    #[serde(rename = "job.completed")]
    JobCompleted {
        job_id: String,
        user_id: String,
        gpu_id: String,
        actual_cost: f64,
        runtime_hours: f64,
    },
    #[serde(rename = "job.failed")]
    JobFailed {
        job_id: String,
        user_id: String,
        reason: String,
    },
    #[serde(rename = "gpu.registered")]
    GpuRegistered {
        gpu_id: String,
        provider_id: String,
        model: String,
        vram_gb: f64,
    },
    #[serde(rename = "gpu.status_changed")]
    GpuStatusChanged {
        gpu_id: String,
        provider_id: String,
        status: String,
    },
    #[serde(rename = "memory.staked")]
    MemoryStaked {
        stake_id: String,
        provider_id: String,
        vram_gb: f64,
        price_per_gb_hour: f64,
    },
    #[serde(rename = "memory.requested")]
    MemoryRequested {
        request_id: String,
        job_id: String,
        user_id: String,
        vram_gb: f64,
        duration_hours: f64,
        estimated_cost: f64,
    },
    #[serde(rename = "memory.released")]
    MemoryReleased {
        stake_id: String,
        provider_id: String,
    },
    #[serde(rename = "arbitrage.calculated")]
    ArbitrageCalculated {
        user_id: String,
        venue: String,
        spread_pct: f64,
    },
    #[serde(rename = "network.route_calculated")]
    NetworkRouteCalculated {
        route_id: String,
        hops: u32,
        latency_ms: f64,
    },
    #[serde(rename = "energy.consumed")]
    EnergyConsumed {
        gpu_id: String,
        provider_id: String,
        kwh: f64,
    },
    #[serde(rename = "security.alert")]
    SecurityAlert {
        subject_id: String,
        threat_score: f64,
        detail: String,
    },
    #[serde(rename = "provenance.recorded")]
    ProvenanceRecorded {
        artifact_id: String,
        job_id: String,
        digest: String,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::AuthLogin { .. } => "auth.login",
            EventKind::JobCreated { .. } => "job.created",
            EventKind::JobCompleted { .. } => "job.completed",
            EventKind::JobFailed { .. } => "job.failed",
            EventKind::GpuRegistered { .. } => "gpu.registered",
            EventKind::GpuStatusChanged { .. } => "gpu.status_changed",
            EventKind::MemoryStaked { .. } => "memory.staked",
            EventKind::MemoryRequested { .. } => "memory.requested",
            EventKind::MemoryReleased { .. } => "memory.released",
            EventKind::ArbitrageCalculated { .. } => "arbitrage.calculated",
            EventKind::NetworkRouteCalculated { .. } => "network.route_calculated",
            EventKind::EnergyConsumed { .. } => "energy.consumed",
            EventKind::SecurityAlert { .. } => "security.alert",
            EventKind::ProvenanceRecorded { .. } => "provenance.recorded",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            EventKind::SecurityAlert { threat_score, .. } => {
                if *threat_score >= 0.8 {
                    Severity::Critical
                } else {
                    Severity::Warning
                }
            }
            EventKind::JobFailed { .. } => Severity::Warning,
            EventKind::AuthLogin { success: false, .. } => Severity::Warning,
            _ => Severity::Info,
        }
    }

    /// Acting entity, for ledger subject columns.
    pub fn subject_id(&self) -> Option<String> {
        match self {
            EventKind::AuthLogin { user_id, .. }
            | EventKind::JobCreated { user_id, .. }
            | EventKind::JobCompleted { user_id, .. }
            | EventKind::JobFailed { user_id, .. }
            | EventKind::MemoryRequested { user_id, .. }
            | EventKind::ArbitrageCalculated { user_id, .. } => Some(user_id.clone()),
            EventKind::GpuRegistered { provider_id, .. }
            | EventKind::GpuStatusChanged { provider_id, .. }
            | EventKind::MemoryStaked { provider_id, .. }
            | EventKind::MemoryReleased { provider_id, .. }
            | EventKind::EnergyConsumed { provider_id, .. } => Some(provider_id.clone()),
            EventKind::SecurityAlert { subject_id, .. } => Some(subject_id.clone()),
            EventKind::NetworkRouteCalculated { .. } => None,
            EventKind::ProvenanceRecorded { .. } => None,
        }
    }

    /// Acted-on entity, for ledger target columns.
    pub fn target_id(&self) -> Option<String> {
        match self {
            EventKind::JobCreated { job_id, .. }
            | EventKind::JobCompleted { job_id, .. }
            | EventKind::JobFailed { job_id, .. }
            | EventKind::MemoryRequested { job_id, .. }
            | EventKind::ProvenanceRecorded { job_id, .. } => Some(job_id.clone()),
            EventKind::GpuRegistered { gpu_id, .. }
            | EventKind::GpuStatusChanged { gpu_id, .. }
            | EventKind::EnergyConsumed { gpu_id, .. } => Some(gpu_id.clone()),
            EventKind::MemoryStaked { stake_id, .. }
            | EventKind::MemoryReleased { stake_id, .. } => Some(stake_id.clone()),
            EventKind::NetworkRouteCalculated { route_id, .. } => Some(route_id.clone()),
            _ => None,
        }
    }
}

/// Envelope shared by every event on the bus. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEvent {
    pub event_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl PlatformEvent {
    pub fn new(source: &str, kind: EventKind) -> Self {
        let event_id = format!("EVT-{}", Uuid::new_v4());
        Self {
            correlation_id: event_id.clone(),
            event_id,
            timestamp: Utc::now(),
            source: source.to_string(),
            kind,
        }
    }

    /// Same envelope, but grouped under an existing causal chain.
    pub fn with_correlation(source: &str, correlation_id: &str, kind: EventKind) -> Self {
        Self {
            event_id: format!("EVT-{}", Uuid::new_v4()),
            correlation_id: correlation_id.to_string(),
            timestamp: Utc::now(),
            source: source.to_string(),
            kind,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn subject_id(&self) -> Option<String> {
        self.kind.subject_id()
    }

    pub fn target_id(&self) -> Option<String> {
        self.kind.target_id()
    }

    /// Full canonical JSON, hashed into ledger entries.
    pub fn payload_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
