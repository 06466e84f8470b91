//! Process engine
//!
//! Spawns the external game executable in host mode, waits for it to report
//! readiness, optionally connects to its adapter plugin and wraps everything
//! in a [`GameServerHandle`]. Also drives the one-shot screenshot renderer.

use crate::config::SupervisorConfig;
use crate::error::ProcessError;
use crate::handle::{GameServerHandle, HandleSettings};
use crate::readiness::{MarkerReadiness, ReadinessDetector};
use crate::scenario::ScenarioFile;
use event_system::ServerId;
use plugin_adapter::AdapterClient;
use resource_store::{PluginOptions, StartupOptions};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs as tokio_fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Accepts ports above the reserved range and representable as `u16`.
pub fn validate_port(port: u32) -> Result<u16, ProcessError> {
    if port <= 1024 || port >= 65536 {
        return Err(ProcessError::InvalidPort(port));
    }
    u16::try_from(port).map_err(|_| ProcessError::InvalidPort(port))
}

/// Arguments for hosting `scenario`:
/// `host <scenario> --user-data-path <dir> --port <port> [--password <pw>] [--headless] [--verbose]`
pub fn host_arguments(
    scenario: &ScenarioFile,
    data_dir: &Path,
    startup: &StartupOptions,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "host".into(),
        scenario.path().into(),
        "--user-data-path".into(),
        data_dir.into(),
        "--port".into(),
        startup.port.to_string().into(),
    ];
    if let Some(password) = startup.password.as_deref().filter(|p| !p.is_empty()) {
        args.push("--password".into());
        args.push(password.into());
    }
    if startup.headless {
        args.push("--headless".into());
    }
    if startup.verbose {
        args.push("--verbose".into());
    }
    args
}

/// Arguments for rendering `scenario` to `output`:
/// `screenshot <scenario> <output.png> giant 2 0`
pub fn screenshot_arguments(scenario: &ScenarioFile, output: &Path) -> Vec<OsString> {
    vec![
        "screenshot".into(),
        scenario.path().into(),
        output.into(),
        "giant".into(),
        "2".into(),
        "0".into(),
    ]
}

#[derive(Debug, Clone)]
pub struct ProcessEngine {
    config: Arc<SupervisorConfig>,
}

impl ProcessEngine {
    pub fn new(config: Arc<SupervisorConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launches a game server and returns its handle once it is ready.
    ///
    /// # Arguments
    ///
    /// * `server_id` - Server slot being launched
    /// * `data_dir` - User-data directory passed to the executable
    /// * `scenario` - Launch target
    /// * `startup` - Port, password and display flags
    /// * `plugin` - Whether (and where) to connect to the adapter plugin
    ///
    /// # Returns
    ///
    /// The running handle. On readiness timeout, early exit or adapter
    /// connection failure the process is killed before the error is returned.
    pub async fn create_game_server_instance(
        &self,
        server_id: ServerId,
        data_dir: &Path,
        scenario: ScenarioFile,
        startup: &StartupOptions,
        plugin: &PluginOptions,
    ) -> Result<GameServerHandle, ProcessError> {
        validate_port(startup.port)?;
        let adapter_port = if plugin.enabled {
            Some(validate_port(plugin.port)?)
        } else {
            None
        };

        let args = host_arguments(&scenario, data_dir, startup);
        info!(
            "🚀 Launching game server {} on {} (port {})",
            server_id, scenario, startup.port
        );

        let mut child = Command::new(&self.config.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                executable: self.config.executable.clone(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_output(
                BufReader::new(stderr).lines(),
                format!("{server_id}/stderr"),
            ));
        }
        let stdout = child.stdout.take().ok_or(ProcessError::MissingOutput)?;
        let mut lines = BufReader::new(stdout).lines();

        let mut detector = MarkerReadiness::for_server(server_id, startup.port, plugin.enabled);
        if let Err(e) = self
            .await_readiness(server_id, &mut lines, &mut detector)
            .await
        {
            error!("❌ Game server {} failed to start: {}", server_id, e);
            kill(&mut child).await;
            return Err(e);
        }
        tokio::spawn(relay_output(lines, format!("{server_id}/stdout")));
        info!("✅ Game server {} is ready", server_id);

        let adapter = match adapter_port {
            Some(port) => {
                let addr = SocketAddr::new(self.config.adapter_host, port);
                match AdapterClient::connect(addr).await {
                    Ok(client) => Some(Arc::new(client)),
                    Err(e) => {
                        error!("❌ Adapter of game server {} unreachable: {}", server_id, e);
                        kill(&mut child).await;
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };

        Ok(GameServerHandle::start(
            server_id,
            scenario,
            data_dir.to_path_buf(),
            startup.headless,
            child,
            adapter,
            HandleSettings {
                poll_interval: self.config.scenario_poll_interval,
                action_timeout: self.config.action_timeout,
            },
        ))
    }

    async fn await_readiness<R>(
        &self,
        server_id: ServerId,
        lines: &mut Lines<BufReader<R>>,
        detector: &mut MarkerReadiness,
    ) -> Result<(), ProcessError>
    where
        R: AsyncRead + Unpin,
    {
        let scan = async {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        debug!(server = %server_id, "{}", line);
                        if detector.observe(&line) {
                            return true;
                        }
                    }
                    Ok(None) => return false,
                    Err(e) => {
                        warn!("⚠️ Reading output of {} failed: {}", server_id, e);
                        return false;
                    }
                }
            }
        };

        let outcome = tokio::time::timeout(self.config.readiness_timeout, scan).await;
        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => Err(ProcessError::ExitedBeforeReady {
                missing: detector.missing(),
            }),
            Err(_) => Err(ProcessError::ReadinessTimeout {
                timeout: self.config.readiness_timeout,
                missing: detector.missing(),
            }),
        }
    }

    /// Renders a still image of `scenario` into `output_dir`.
    ///
    /// The file is named `<name>.png` (default: the scenario's display name);
    /// a stale file at that path is removed first.
    pub async fn create_scenario_screenshot(
        &self,
        scenario: &ScenarioFile,
        output_dir: &Path,
        name: Option<&str>,
    ) -> Result<PathBuf, ProcessError> {
        tokio_fs::create_dir_all(output_dir)
            .await
            .map_err(|e| ProcessError::Io(output_dir.to_path_buf(), e))?;
        let target = output_dir.join(format!("{}.png", name.unwrap_or(scenario.name())));
        match tokio_fs::remove_file(&target).await {
            Ok(()) => debug!("Removed stale screenshot {}", target.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ProcessError::Io(target, e)),
        }

        debug!("📸 Rendering {} to {}", scenario, target.display());
        let mut child = Command::new(&self.config.executable)
            .args(screenshot_arguments(scenario, &target))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                executable: self.config.executable.clone(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(relay_output(BufReader::new(stdout).lines(), "screenshot".to_string()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_output(BufReader::new(stderr).lines(), "screenshot".to_string()));
        }

        let status = match tokio::time::timeout(self.config.screenshot_timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(ProcessError::Io(target, e)),
            Err(_) => {
                kill(&mut child).await;
                return Err(ProcessError::ScreenshotTimeout(self.config.screenshot_timeout));
            }
        };
        if !status.success() {
            return Err(ProcessError::ScreenshotFailed(status.to_string()));
        }
        if !tokio_fs::try_exists(&target).await.unwrap_or(false) {
            return Err(ProcessError::ScreenshotMissing(target));
        }
        Ok(target)
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("⚠️ Failed to kill child process: {}", e);
    }
}

async fn relay_output<R>(mut lines: Lines<BufReader<R>>, source: String)
where
    R: AsyncRead + Unpin,
{
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(source = %source, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> ScenarioFile {
        ScenarioFile::from_path("/parks/scenario1.park").unwrap()
    }

    #[test]
    fn test_port_bounds() {
        assert!(validate_port(1024).is_err());
        assert_eq!(validate_port(1025).unwrap(), 1025);
        assert_eq!(validate_port(65535).unwrap(), 65535);
        assert!(matches!(validate_port(65536), Err(ProcessError::InvalidPort(65536))));
    }

    #[test]
    fn test_host_arguments() {
        let startup = StartupOptions {
            port: 12000,
            password: Some("secret".to_string()),
            headless: true,
            verbose: true,
            ..StartupOptions::default()
        };
        let args = host_arguments(&scenario(), Path::new("/srv/s1/data"), &startup);
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "host",
                "/parks/scenario1.park",
                "--user-data-path",
                "/srv/s1/data",
                "--port",
                "12000",
                "--password",
                "secret",
                "--headless",
                "--verbose"
            ]
        );

        let plain = StartupOptions {
            headless: false,
            ..StartupOptions::default()
        };
        let args = host_arguments(&scenario(), Path::new("/d"), &plain);
        assert_eq!(args.len(), 6);
    }

    #[test]
    fn test_screenshot_arguments() {
        let args = screenshot_arguments(&scenario(), Path::new("/out/scenario1.png"));
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["screenshot", "/parks/scenario1.park", "/out/scenario1.png", "giant", "2", "0"]
        );
    }

    #[tokio::test]
    async fn test_invalid_port_rejected_before_spawn() {
        let config = SupervisorConfig {
            executable: PathBuf::from("/nonexistent/game"),
            ..SupervisorConfig::default()
        };
        let engine = ProcessEngine::new(Arc::new(config));
        let startup = StartupOptions {
            port: 80,
            ..StartupOptions::default()
        };
        let result = engine
            .create_game_server_instance(
                ServerId(1),
                Path::new("/tmp"),
                scenario(),
                &startup,
                &PluginOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(ProcessError::InvalidPort(80))));
    }
}
