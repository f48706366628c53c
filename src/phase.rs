//! # Connection Phase Module
//!
//! The device manager's state machine vocabulary: the phases, the edges
//! allowed between them, and the `DeviceState` snapshot viewers get to see.
//!
//! ```text
//! Idle            → Scanning | Connecting | MockFallback
//! Scanning        → Connecting | MockFallback
//! Connecting      → Connected | Disconnected
//! Connected       → Disconnected
//! Disconnected    → Reconnecting(1)
//! Reconnecting(n) → Reconnecting(n+1) | Connected | MockFallback
//! MockFallback    → Scanning | Connecting
//! ```
//!
//! Every phase except `Idle` may also drop to `Idle` on an explicit disconnect.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ConnectionPhase {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    MockFallback,
}

impl ConnectionPhase {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Scanning => "scanning",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Reconnecting { .. } => "reconnecting",
            ConnectionPhase::MockFallback => "mock_fallback",
        }
    }

    /// Whether `self → next` is one of the enumerated edges
    pub fn can_transition_to(&self, next: &ConnectionPhase) -> bool {
        use ConnectionPhase::*;

        match (self, next) {
            (Idle, Scanning | Connecting | MockFallback) => true,
            (Scanning, Connecting | MockFallback | Idle) => true,
            (Connecting, Connected | Disconnected | Idle) => true,
            (Connected, Disconnected | Idle) => true,
            (Disconnected, Reconnecting { attempt: 1 } | Idle) => true,
            (Reconnecting { attempt }, Reconnecting { attempt: next }) => *next == attempt + 1,
            (Reconnecting { .. }, Connected | MockFallback | Idle) => true,
            (MockFallback, Scanning | Connecting | Idle) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionPhase::Reconnecting { attempt } => {
                write!(f, "reconnecting (attempt {})", attempt)
            }
            other => f.write_str(other.label()),
        }
    }
}

/// Read-only snapshot of the device manager's view of the link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    #[serde(flatten)]
    pub phase: ConnectionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sample_at: Option<i64>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            address: None,
            rssi: None,
            last_sample_at: None,
        }
    }
}
