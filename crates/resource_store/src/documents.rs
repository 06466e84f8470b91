//! Persisted per-server documents
//!
//! Each server id owns a directory `s<id>/` holding one JSON document per
//! concern. Documents load tolerantly: a missing file, a missing field or an
//! unknown field all fall back to the documented defaults.

use crate::directory::ResourceDirectory;
use crate::error::StorageResult;
use crate::path_lock::PathLockRegistry;
use event_system::{current_timestamp, ServerId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STARTUP_OPTIONS_FILE: &str = "startup.json";
pub const PLUGIN_OPTIONS_FILE: &str = "plugin.json";
pub const STATUS_FILE: &str = "status.json";
pub const QUEUE_FILE: &str = "queue.json";

/// User-data directory handed to the game executable.
pub const DATA_DIR: &str = "data";
/// Rendered screenshots produced by the supervisor.
pub const SCREENSHOTS_DIR: &str = "screenshots";

// ============================================================================
// Documents
// ============================================================================

/// Options the game executable is launched with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartupOptions {
    /// Game port; stored wide so out-of-range values survive loading and can
    /// be rejected at launch.
    pub port: u32,
    pub password: Option<String>,
    pub headless: bool,
    pub verbose: bool,
    pub auto_finalize: bool,
    pub keep_score: bool,
    /// Delay applied to deferred starts, in minutes.
    pub defer_minutes: u64,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self {
            port: 11753,
            password: None,
            headless: true,
            verbose: false,
            auto_finalize: true,
            keep_score: true,
            defer_minutes: 5,
        }
    }
}

/// Control-channel settings for one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginOptions {
    pub enabled: bool,
    pub port: u32,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 35711,
        }
    }
}

/// FIFO of scenario names awaiting launch. `max_size == 0` disables queueing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerQueue {
    pub scenarios: Vec<String>,
    pub max_size: usize,
}

/// Why a scenario could not be appended to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRejection {
    Disabled,
    Full { max_size: usize },
}

impl ServerQueue {
    pub fn is_enabled(&self) -> bool {
        self.max_size > 0
    }

    pub fn is_full(&self) -> bool {
        self.scenarios.len() >= self.max_size
    }

    /// Appends a scenario name, returning the new length.
    pub fn try_push(&mut self, name: impl Into<String>) -> Result<usize, QueueRejection> {
        if !self.is_enabled() {
            return Err(QueueRejection::Disabled);
        }
        if self.is_full() {
            return Err(QueueRejection::Full {
                max_size: self.max_size,
            });
        }
        self.scenarios.push(name.into());
        Ok(self.scenarios.len())
    }
}

/// Snapshot of what a server is running.
///
/// `initiated_scenario` is what the supervisor launched; `current_scenario`
/// is what the game last reported, which differs after an in-game load.
/// `is_current_scenario_completed` is `None` on every fresh launch and becomes
/// `Some(true)` once a completion signal arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerStatus {
    pub initiated_scenario: Option<String>,
    pub current_scenario: Option<String>,
    pub previous_scenario: Option<String>,
    pub is_current_scenario_completed: Option<bool>,
    pub last_startup: Option<u64>,
}

impl ServerStatus {
    /// Resets the snapshot for a fresh launch of `scenario`, carrying the
    /// previously running scenario forward.
    pub fn begin_run(&mut self, scenario: &str) {
        self.previous_scenario = self
            .current_scenario
            .take()
            .or_else(|| self.initiated_scenario.clone());
        self.initiated_scenario = Some(scenario.to_string());
        self.current_scenario = Some(scenario.to_string());
        self.is_current_scenario_completed = None;
        self.last_startup = Some(current_timestamp());
    }

    pub fn is_completed(&self) -> bool {
        self.is_current_scenario_completed == Some(true)
    }
}

// ============================================================================
// Server Resources
// ============================================================================

/// Typed access to the documents of one server id.
#[derive(Debug)]
pub struct ServerResources {
    server_id: ServerId,
    dir: ResourceDirectory,
}

impl ServerResources {
    /// Opens `<servers_root>/s<id>/`, creating it on first use.
    pub async fn open(
        registry: &PathLockRegistry,
        servers_root: impl AsRef<Path>,
        server_id: ServerId,
    ) -> StorageResult<Self> {
        let dir =
            ResourceDirectory::open(registry, servers_root.as_ref().join(server_id.to_string()))
                .await?;
        Ok(Self { server_id, dir })
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn directory(&self) -> &ResourceDirectory {
        &self.dir
    }

    pub fn root(&self) -> &Path {
        self.dir.root()
    }

    /// User-data directory for the executable, created on demand.
    pub async fn data_dir(&self) -> StorageResult<PathBuf> {
        self.dir.ensure_dir(DATA_DIR).await
    }

    pub async fn screenshots_dir(&self) -> StorageResult<PathBuf> {
        self.dir.ensure_dir(SCREENSHOTS_DIR).await
    }

    pub async fn startup_options(&self) -> StorageResult<StartupOptions> {
        self.dir.read_json(STARTUP_OPTIONS_FILE).await
    }

    pub async fn update_startup_options<F, R>(&self, mutate: F) -> StorageResult<R>
    where
        F: FnOnce(&mut StartupOptions) -> R,
    {
        self.dir.update_json(STARTUP_OPTIONS_FILE, mutate).await
    }

    pub async fn plugin_options(&self) -> StorageResult<PluginOptions> {
        self.dir.read_json(PLUGIN_OPTIONS_FILE).await
    }

    pub async fn update_plugin_options<F, R>(&self, mutate: F) -> StorageResult<R>
    where
        F: FnOnce(&mut PluginOptions) -> R,
    {
        self.dir.update_json(PLUGIN_OPTIONS_FILE, mutate).await
    }

    pub async fn status(&self) -> StorageResult<ServerStatus> {
        self.dir.read_json(STATUS_FILE).await
    }

    pub async fn update_status<F, R>(&self, mutate: F) -> StorageResult<R>
    where
        F: FnOnce(&mut ServerStatus) -> R,
    {
        self.dir.update_json(STATUS_FILE, mutate).await
    }

    pub async fn queue(&self) -> StorageResult<ServerQueue> {
        self.dir.read_json(QUEUE_FILE).await
    }

    pub async fn update_queue<F, R>(&self, mutate: F) -> StorageResult<R>
    where
        F: FnOnce(&mut ServerQueue) -> R,
    {
        self.dir.update_json(QUEUE_FILE, mutate).await
    }

    /// Queue mutation that may be refused without writing anything.
    pub async fn try_update_queue<F, R, E>(&self, mutate: F) -> Result<R, E>
    where
        F: FnOnce(&mut ServerQueue) -> Result<R, E>,
        E: From<crate::StorageError>,
    {
        self.dir.try_update_json(QUEUE_FILE, mutate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tolerant_loading() {
        let startup: StartupOptions =
            serde_json::from_str(r#"{"port": 12000, "someFutureField": true}"#).unwrap();
        assert_eq!(startup.port, 12000);
        assert!(startup.headless);
        assert_eq!(startup.defer_minutes, 5);

        let status: ServerStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.is_current_scenario_completed, None);
    }

    #[test]
    fn test_queue_capacity_rules() {
        let mut queue = ServerQueue::default();
        assert_eq!(queue.try_push("a"), Err(QueueRejection::Disabled));

        queue.max_size = 2;
        assert_eq!(queue.try_push("a"), Ok(1));
        assert_eq!(queue.try_push("b"), Ok(2));
        assert_eq!(queue.try_push("c"), Err(QueueRejection::Full { max_size: 2 }));
        assert_eq!(queue.scenarios, vec!["a", "b"]);
    }

    #[test]
    fn test_begin_run_carries_previous() {
        let mut status = ServerStatus::default();
        status.begin_run("first.park");
        assert_eq!(status.previous_scenario, None);

        status.current_scenario = Some("loaded-in-game.park".to_string());
        status.is_current_scenario_completed = Some(true);
        status.begin_run("second.park");

        assert_eq!(status.previous_scenario.as_deref(), Some("loaded-in-game.park"));
        assert_eq!(status.initiated_scenario.as_deref(), Some("second.park"));
        assert_eq!(status.current_scenario.as_deref(), Some("second.park"));
        assert_eq!(status.is_current_scenario_completed, None);
        assert!(status.last_startup.is_some());
    }

    #[tokio::test]
    async fn test_server_resources_layout() {
        let temp = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();
        let resources = ServerResources::open(&registry, temp.path(), ServerId(4))
            .await
            .unwrap();

        assert!(resources.root().ends_with("s4"));
        let data = resources.data_dir().await.unwrap();
        assert!(data.is_dir());

        resources
            .update_plugin_options(|p| {
                p.enabled = true;
                p.port = 40000;
            })
            .await
            .unwrap();
        let plugin = resources.plugin_options().await.unwrap();
        assert!(plugin.enabled);
        assert_eq!(plugin.port, 40000);

        let raw = tokio::fs::read_to_string(resources.root().join(PLUGIN_OPTIONS_FILE))
            .await
            .unwrap();
        assert!(raw.contains("\"enabled\": true"));
    }
}
