//! Supervisor configuration types and defaults.
//!
//! The daemon builds a [`SupervisorConfig`] from its TOML file and command
//! line; tests build one directly.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration consumed by the process engine and the server controller.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the external game executable
    pub executable: PathBuf,

    /// Directory holding launchable scenarios and saves
    pub scenarios_dir: PathBuf,

    /// Directory holding one `s<id>/` resource directory per server
    pub servers_root: PathBuf,

    /// Directory holding the scenario metadata catalog
    pub catalog_dir: PathBuf,

    /// How long a launch may take to print every readiness marker
    pub readiness_timeout: Duration,

    /// How long a one-shot screenshot render may run
    pub screenshot_timeout: Duration,

    /// Default deadline for control-channel calls
    pub action_timeout: Duration,

    /// Deadline for slow control-channel calls (save, screenshot)
    pub long_action_timeout: Duration,

    /// Interval of the scenario poll used while no push events arrive;
    /// `None` disables polling
    pub scenario_poll_interval: Option<Duration>,

    /// Resolution of the deferred-start countdown
    pub defer_tick: Duration,

    /// Length of one countdown minute
    pub defer_minute: Duration,

    /// Host the adapter plugins listen on
    pub adapter_host: IpAddr,

    /// Render headless screenshots from a fresh save instead of asking the
    /// plugin for its own (stale) view
    pub headless_screenshot_via_save: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("openrct2"),
            scenarios_dir: PathBuf::from("scenarios"),
            servers_root: PathBuf::from("servers"),
            catalog_dir: PathBuf::from("catalog"),
            readiness_timeout: Duration::from_secs(30),
            screenshot_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(10),
            long_action_timeout: Duration::from_secs(120),
            scenario_poll_interval: Some(Duration::from_secs(15)),
            defer_tick: Duration::from_secs(1),
            defer_minute: Duration::from_secs(60),
            adapter_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            headless_screenshot_via_save: true,
        }
    }
}
