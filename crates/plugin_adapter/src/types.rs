//! Action names and typed payloads of the adapter plugin

use event_system::ScenarioProgress;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action names understood by the adapter plugin.
pub mod actions {
    /// Broadcast an in-game chat message.
    pub const CHAT: &str = "chat";
    /// Roster of connected players.
    pub const PLAYER_LIST: &str = "player.list";
    /// Write a save; responds with its base filename.
    pub const SAVE: &str = "save";
    /// Capture the live view; responds with the image filename.
    pub const SCREENSHOT: &str = "screenshot";
    /// Current scenario name, details, file and status.
    pub const SCENARIO: &str = "scenario";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
}

/// Response of the `scenario` action, also pushed as a `scenario` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub status: ScenarioProgress,
}

/// Unsolicited event pushed by the plugin (`name_e_payload`).
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterEvent {
    pub name: String,
    pub payload: Value,
}

/// Reads a payload that carries a plain name, whatever JSON type the codec
/// decoded it as (a save named `2024` arrives as a number).
pub fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
