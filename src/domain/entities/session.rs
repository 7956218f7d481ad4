use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one tenant's bot session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Connecting,
    Streaming,
    Signaling,
    Errored,
}

impl SessionState {
    /// Whether the session still holds (or is acquiring) market data and exchange resources.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Streaming | SessionState::Signaling
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Errored)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Stopped => "stopped",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Signaling => "signaling",
            SessionState::Errored => "errored",
        };
        write!(f, "{}", name)
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub candles_processed: u64,
    pub partial_candles_dropped: u64,
    pub signals_seen: u64,
    pub signals_suppressed: u64,
    pub trades_dispatched: u64,
    pub trades_failed: u64,
}

/// Status surfaced to the tenant under `sessions/{tenant}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusRecord {
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionStatusRecord {
    pub fn new(state: SessionState, message: Option<String>) -> Self {
        Self {
            state,
            message,
            updated_at: Utc::now(),
        }
    }
}
