//! # Core Type Definitions
//!
//! Identifiers shared across the supervisor crates and the payloads raised on
//! the [`EventSystem`](crate::EventSystem).
//!
//! ## Event names
//!
//! | Name | Payload |
//! |---|---|
//! | `server.start` | [`ServerStartedEvent`] |
//! | `server.restart` | [`ServerRestartedEvent`] |
//! | `server.stop` | [`ServerStoppedEvent`] |
//! | `server.close` | [`ServerClosedEvent`] |
//! | `server.error` | [`ServerErrorEvent`] |
//! | `network.chat` / `network.join` / `network.leave` | [`NetworkChatEvent`], [`NetworkJoinEvent`], [`NetworkLeaveEvent`] |
//! | `defer.start` | [`DeferStartEvent`] |
//! | `defer.cancel` | [`DeferCancelEvent`] |
//! | `scenario.complete` | [`ScenarioCompleteEvent`] |

use crate::NamedEvent;
use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Stable identity of one logical server slot.
///
/// Each id maps to exactly one directory of persisted resources and to at
/// most one running game server at a time.
///
/// # Examples
///
/// ```rust
/// use event_system::ServerId;
///
/// let id = ServerId::new(3).unwrap();
/// assert_eq!(id.to_string(), "s3");
/// assert!(ServerId::new(0).is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub u32);

impl ServerId {
    /// Creates a server id, rejecting zero.
    pub fn new(id: u32) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl std::str::FromStr for ServerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('s').unwrap_or(s);
        digits
            .parse::<u32>()
            .ok()
            .and_then(ServerId::new)
            .ok_or_else(|| format!("invalid server id: {s}"))
    }
}

/// Progress of the scenario a game server is currently running, as reported
/// by the in-game adapter plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ScenarioProgress {
    #[default]
    InProgress,
    Completed,
    Failed,
}

impl ScenarioProgress {
    /// Whether the scenario has reached a final outcome.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScenarioProgress::InProgress)
    }
}

// ============================================================================
// Lifecycle Events
// ============================================================================

/// A game server was launched on an explicit scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStartedEvent {
    pub server_id: ServerId,
    pub scenario: String,
    pub timestamp: u64,
}

/// A game server was relaunched from one of its autosaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRestartedEvent {
    pub server_id: ServerId,
    pub autosave_index: usize,
    pub scenario: String,
    pub timestamp: u64,
}

/// A stop was requested. `stopped` is false when nothing was running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStoppedEvent {
    pub server_id: ServerId,
    pub stopped: bool,
    pub timestamp: u64,
}

/// The game server process exited, for whatever reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerClosedEvent {
    pub server_id: ServerId,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerErrorEvent {
    pub server_id: ServerId,
    pub message: String,
    pub timestamp: u64,
}

// ============================================================================
// Network Events (forwarded from the adapter plugin)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkChatEvent {
    pub server_id: ServerId,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkJoinEvent {
    pub server_id: ServerId,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkLeaveEvent {
    pub server_id: ServerId,
    pub payload: serde_json::Value,
}

// ============================================================================
// Deferred Start and Scenario Events
// ============================================================================

/// Countdown notice for a pending deferred start, raised once per whole minute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferStartEvent {
    pub server_id: ServerId,
    pub scenario: String,
    pub remaining_minutes: u64,
    pub timestamp: u64,
}

/// A pending deferred start was cancelled before it launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferCancelEvent {
    pub server_id: ServerId,
    pub scenario: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioCompleteEvent {
    pub server_id: ServerId,
    pub scenario: String,
    pub status: ScenarioProgress,
    pub timestamp: u64,
}

impl NamedEvent for ServerStartedEvent {
    const NAME: &'static str = "server.start";
}

impl NamedEvent for ServerRestartedEvent {
    const NAME: &'static str = "server.restart";
}

impl NamedEvent for ServerStoppedEvent {
    const NAME: &'static str = "server.stop";
}

impl NamedEvent for ServerClosedEvent {
    const NAME: &'static str = "server.close";
}

impl NamedEvent for ServerErrorEvent {
    const NAME: &'static str = "server.error";
}

impl NamedEvent for NetworkChatEvent {
    const NAME: &'static str = "network.chat";
}

impl NamedEvent for NetworkJoinEvent {
    const NAME: &'static str = "network.join";
}

impl NamedEvent for NetworkLeaveEvent {
    const NAME: &'static str = "network.leave";
}

impl NamedEvent for DeferStartEvent {
    const NAME: &'static str = "defer.start";
}

impl NamedEvent for DeferCancelEvent {
    const NAME: &'static str = "defer.cancel";
}

impl NamedEvent for ScenarioCompleteEvent {
    const NAME: &'static str = "scenario.complete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id_parsing() {
        assert_eq!("s12".parse::<ServerId>().unwrap(), ServerId(12));
        assert_eq!("7".parse::<ServerId>().unwrap(), ServerId(7));
        assert!("s0".parse::<ServerId>().is_err());
        assert!("park".parse::<ServerId>().is_err());
    }

    #[test]
    fn test_scenario_progress_wire_names() {
        let parsed: ScenarioProgress = serde_json::from_str("\"inProgress\"").unwrap();
        assert_eq!(parsed, ScenarioProgress::InProgress);
        assert!(!parsed.is_terminal());
        assert!(ScenarioProgress::Failed.is_terminal());
        assert_eq!(
            serde_json::to_string(&ScenarioProgress::Completed).unwrap(),
            "\"completed\""
        );
    }
}
