//! Configuration management for the supervisor daemon.
//!
//! Loads the TOML configuration file, applies command line overrides,
//! validates the result and converts it into the [`SupervisorConfig`]
//! consumed by the controller.

use crate::cli::CliArgs;
use anyhow::{anyhow, bail, Result};
use event_system::ServerId;
use game_server::SupervisorConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application configuration loaded from the TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub game: GameSettings,
    pub timeouts: TimeoutSettings,
    pub controller: ControllerSettings,
    pub logging: LoggingSettings,
}

/// Locations of the executable and of every directory the supervisor owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSettings {
    /// Path to the external game executable
    pub executable: PathBuf,
    /// Directory holding launchable scenarios
    pub scenarios_dir: PathBuf,
    /// Directory holding one `s<id>/` resource directory per server
    pub servers_root: PathBuf,
    /// Directory holding the scenario metadata catalog
    pub catalog_dir: PathBuf,
}

/// Deadlines in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub readiness_ms: u64,
    pub screenshot_ms: u64,
    pub action_ms: u64,
    pub long_action_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Scenario poll interval while no push events arrive (0 disables polling)
    pub scenario_poll_interval_ms: u64,
    /// Resolution of the deferred-start countdown
    pub defer_tick_ms: u64,
    /// Host the adapter plugins listen on
    pub adapter_host: String,
    pub headless_screenshot_via_save: bool,
    /// Servers started from their queue on boot
    pub autostart: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for GameSettings {
    fn default() -> Self {
        let defaults = SupervisorConfig::default();
        Self {
            executable: defaults.executable,
            scenarios_dir: defaults.scenarios_dir,
            servers_root: defaults.servers_root,
            catalog_dir: defaults.catalog_dir,
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            readiness_ms: 30_000,
            screenshot_ms: 30_000,
            action_ms: 10_000,
            long_action_ms: 120_000,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            scenario_poll_interval_ms: 15_000,
            defer_tick_ms: 1_000,
            adapter_host: "127.0.0.1".to_string(),
            headless_screenshot_via_save: true,
            autostart: Vec::new(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration file is written at
    /// `path` and the defaults are returned.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path).await?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = AppConfig::default();
            tokio::fs::write(path, toml::to_string_pretty(&config)?).await?;
            info!("📝 Created default configuration file: {}", path.display());
            Ok(config)
        }
    }

    /// Applies command line overrides on top of the file values.
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(executable) = &args.executable {
            self.game.executable = executable.clone();
        }
        if let Some(servers_root) = &args.servers_root {
            self.game.servers_root = servers_root.clone();
        }
        if let Some(level) = args.requested_log_level() {
            self.logging.level = level;
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        let paths = [
            ("game.executable", &self.game.executable),
            ("game.scenarios_dir", &self.game.scenarios_dir),
            ("game.servers_root", &self.game.servers_root),
            ("game.catalog_dir", &self.game.catalog_dir),
        ];
        for (key, path) in paths {
            if path.as_os_str().is_empty() {
                bail!("{key} cannot be empty");
            }
        }

        let timeouts = [
            ("timeouts.readiness_ms", self.timeouts.readiness_ms),
            ("timeouts.screenshot_ms", self.timeouts.screenshot_ms),
            ("timeouts.action_ms", self.timeouts.action_ms),
            ("timeouts.long_action_ms", self.timeouts.long_action_ms),
            ("controller.defer_tick_ms", self.controller.defer_tick_ms),
        ];
        for (key, value) in timeouts {
            if value == 0 {
                bail!("{key} must be greater than zero");
            }
        }

        self.adapter_host()?;
        self.autostart_servers()?;

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!(
                "Invalid log level: {}. Must be one of: {VALID_LOG_LEVELS:?}",
                self.logging.level
            );
        }
        Ok(())
    }

    /// Servers to start from their queue on boot.
    pub fn autostart_servers(&self) -> Result<Vec<ServerId>> {
        self.controller
            .autostart
            .iter()
            .map(|&id| ServerId::new(id).ok_or_else(|| anyhow!("Invalid server id in autostart: {id}")))
            .collect()
    }

    fn adapter_host(&self) -> Result<IpAddr> {
        self.controller
            .adapter_host
            .parse()
            .map_err(|e| anyhow!("Invalid adapter host {}: {e}", self.controller.adapter_host))
    }

    /// Converts into the configuration consumed by the controller.
    pub fn to_supervisor_config(&self) -> Result<SupervisorConfig> {
        let poll = self.controller.scenario_poll_interval_ms;
        Ok(SupervisorConfig {
            executable: self.game.executable.clone(),
            scenarios_dir: self.game.scenarios_dir.clone(),
            servers_root: self.game.servers_root.clone(),
            catalog_dir: self.game.catalog_dir.clone(),
            readiness_timeout: Duration::from_millis(self.timeouts.readiness_ms),
            screenshot_timeout: Duration::from_millis(self.timeouts.screenshot_ms),
            action_timeout: Duration::from_millis(self.timeouts.action_ms),
            long_action_timeout: Duration::from_millis(self.timeouts.long_action_ms),
            scenario_poll_interval: (poll > 0).then(|| Duration::from_millis(poll)),
            defer_tick: Duration::from_millis(self.controller.defer_tick_ms),
            adapter_host: self.adapter_host()?,
            headless_screenshot_via_save: self.controller.headless_screenshot_via_save,
            ..SupervisorConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.game.executable, PathBuf::from("openrct2"));
        assert_eq!(config.timeouts.readiness_ms, 30_000);
        assert_eq!(config.timeouts.long_action_ms, 120_000);
        assert_eq!(config.controller.scenario_poll_interval_ms, 15_000);
        assert_eq!(config.controller.adapter_host, "127.0.0.1");
        assert!(config.controller.autostart.is_empty());
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file_creates_it() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("supervisor.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(path.exists());

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.timeouts.action_ms, config.timeouts.action_ms);
    }

    #[tokio::test]
    async fn test_load_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("supervisor.toml");
        tokio::fs::write(
            &path,
            r#"
[game]
executable = "/opt/park/bin/game"

[controller]
scenario_poll_interval_ms = 0
autostart = [1, 3]
"#,
        )
        .await
        .unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.game.executable, PathBuf::from("/opt/park/bin/game"));
        assert_eq!(config.game.servers_root, PathBuf::from("servers"));
        assert_eq!(config.timeouts.readiness_ms, 30_000);
        assert_eq!(
            config.autostart_servers().unwrap(),
            vec![ServerId(1), ServerId(3)]
        );

        let supervisor = config.to_supervisor_config().unwrap();
        assert_eq!(supervisor.scenario_poll_interval, None);
        assert_eq!(supervisor.defer_tick, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_load_invalid_toml_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        tokio::fs::write(&path, "[game\nexecutable =").await.unwrap();
        assert!(AppConfig::load_from_file(&path).await.is_err());
    }

    #[test]
    fn test_to_supervisor_config_conversion() {
        let mut config = AppConfig::default();
        config.timeouts.action_ms = 2_500;
        config.controller.adapter_host = "10.0.0.7".to_string();
        config.controller.headless_screenshot_via_save = false;

        let supervisor = config.to_supervisor_config().unwrap();
        assert_eq!(supervisor.action_timeout, Duration::from_millis(2_500));
        assert_eq!(supervisor.scenario_poll_interval, Some(Duration::from_secs(15)));
        assert_eq!(supervisor.adapter_host, "10.0.0.7".parse::<IpAddr>().unwrap());
        assert!(!supervisor.headless_screenshot_via_save);
        assert_eq!(supervisor.defer_minute, Duration::from_secs(60));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::default();
        config.game.executable = PathBuf::new();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.timeouts.readiness_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.controller.adapter_host = "not-an-ip".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.controller.autostart = vec![2, 0];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_poll_interval_is_valid() {
        let mut config = AppConfig::default();
        config.controller.scenario_poll_interval_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = AppConfig::default();
        let args = CliArgs::parse_from([
            "park-supervisor",
            "--executable",
            "/usr/games/park",
            "--servers-root",
            "/srv/parks",
            "--json-logs",
            "--log-level",
            "trace",
        ]);
        config.apply_cli(&args);

        assert_eq!(config.game.executable, PathBuf::from("/usr/games/park"));
        assert_eq!(config.game.servers_root, PathBuf::from("/srv/parks"));
        assert_eq!(config.logging.level, "trace");
        assert!(config.logging.json_format);
        assert!(config.validate().is_ok());
    }
}
