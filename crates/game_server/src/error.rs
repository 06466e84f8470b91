//! Error types for the game server supervisor

use crate::flags::OperationKind;
use event_system::ServerId;
use plugin_adapter::AdapterError;
use resource_store::StorageError;
use std::{io::Error as IoError, path::PathBuf, time::Duration};
use thiserror::Error;

/// Failures of the scenario catalog.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Unsupported scenario file extension: {0}")]
    UnsupportedExtension(PathBuf),

    #[error("No scenario matches '{0}'")]
    NotFound(String),

    #[error("No autosave at index {index} (found {available})")]
    NoAutosave { index: usize, available: usize },

    #[error("Failed to read scenario directory {0}: {1}")]
    Io(PathBuf, IoError),
}

/// Failures spawning or supervising the external executable.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Port {0} is out of range (must be above 1024 and below 65536)")]
    InvalidPort(u32),

    #[error("Failed to spawn {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: IoError,
    },

    #[error("Game server output is not captured")]
    MissingOutput,

    #[error("Game server not ready after {timeout:?}; still waiting for {missing:?}")]
    ReadinessTimeout {
        timeout: Duration,
        missing: Vec<String>,
    },

    #[error("Game server exited before becoming ready; still waiting for {missing:?}")]
    ExitedBeforeReady { missing: Vec<String> },

    #[error("Adapter connection failed: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Screenshot renderer exited with {0}")]
    ScreenshotFailed(String),

    #[error("Screenshot renderer did not finish within {0:?}")]
    ScreenshotTimeout(Duration),

    #[error("Screenshot renderer produced no file at {0}")]
    ScreenshotMissing(PathBuf),

    #[error("Failed to prepare {0}: {1}")]
    Io(PathBuf, IoError),
}

/// Failures surfaced by the [`ServerController`](crate::ServerController).
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Another operation of the same kind is already in flight.
    #[error("Server {server_id} is busy with '{operation}'")]
    Busy {
        server_id: ServerId,
        operation: OperationKind,
    },

    #[error("Server {0} is not running")]
    NotRunning(ServerId),

    #[error("Server {0} has no adapter connection")]
    PluginUnavailable(ServerId),

    #[error("Scenario queue of server {0} is disabled")]
    QueueDisabled(ServerId),

    #[error("Scenario queue of server {server_id} is full ({max_size} entries)")]
    QueueFull { server_id: ServerId, max_size: usize },

    #[error("Scenario queue of server {0} has no launchable entry")]
    QueueEmpty(ServerId),

    #[error("Scenario queue of server {server_id} has no entry at index {index}")]
    QueueIndex { server_id: ServerId, index: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Scenario(#[from] ScenarioError),
}

impl ControllerError {
    /// Admission conflicts render differently from real failures.
    pub fn is_busy(&self) -> bool {
        matches!(self, ControllerError::Busy { .. })
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
