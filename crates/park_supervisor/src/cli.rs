//! Command-line interface of the supervisor daemon.

use clap::Parser;
use std::path::PathBuf;

/// Command line arguments. Values given here override the configuration file.
#[derive(Parser, Debug, Clone)]
#[command(name = "park-supervisor")]
#[command(about = "Supervises park game server instances")]
#[command(version)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long = "config", value_name = "FILE", default_value = "supervisor.toml")]
    pub config_path: PathBuf,

    /// Path to the game executable
    #[arg(long, value_name = "PATH")]
    pub executable: Option<PathBuf>,

    /// Directory holding one resource directory per server
    #[arg(long, value_name = "DIR")]
    pub servers_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    /// Shorthand for `--log-level debug`
    #[arg(short, long)]
    pub debug: bool,
}

impl CliArgs {
    /// Log level requested on the command line, if any. An explicit level
    /// wins over `--debug`.
    pub fn requested_log_level(&self) -> Option<String> {
        match (&self.log_level, self.debug) {
            (Some(level), _) => Some(level.clone()),
            (None, true) => Some("debug".to_string()),
            (None, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::parse_from(["park-supervisor"]);
        assert_eq!(args.config_path, PathBuf::from("supervisor.toml"));
        assert!(args.executable.is_none());
        assert!(!args.json_logs);
        assert_eq!(args.requested_log_level(), None);
    }

    #[test]
    fn test_overrides() {
        let args = CliArgs::parse_from([
            "park-supervisor",
            "-c",
            "/etc/park.toml",
            "--executable",
            "/opt/game/bin",
            "--servers-root",
            "/srv/parks",
            "--json-logs",
            "-d",
        ]);
        assert_eq!(args.config_path, PathBuf::from("/etc/park.toml"));
        assert_eq!(args.executable, Some(PathBuf::from("/opt/game/bin")));
        assert_eq!(args.servers_root, Some(PathBuf::from("/srv/parks")));
        assert!(args.json_logs);
        assert_eq!(args.requested_log_level().as_deref(), Some("debug"));
    }

    #[test]
    fn test_explicit_level_beats_debug_flag() {
        let args = CliArgs::parse_from(["park-supervisor", "-d", "-l", "warn"]);
        assert_eq!(args.requested_log_level().as_deref(), Some("warn"));
    }
}
