//! Game server runtime handle
//!
//! One [`GameServerHandle`] exists per running game server. It owns the
//! child process (through a watcher task), the optional adapter connection
//! and the tasks that turn adapter traffic into [`HandleSignal`]s. Only the
//! [`ProcessEngine`](crate::ProcessEngine) constructs handles.

use crate::scenario::ScenarioFile;
use event_system::ServerId;
use plugin_adapter::{AdapterClient, AdapterError, AdapterEvent, ScenarioReport};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Invoker id the supervisor uses for its own adapter calls.
pub const SUPERVISOR_INVOKER: u64 = 0;

/// Signals a handle raises towards the controller.
#[derive(Debug, Clone)]
pub enum HandleSignal {
    /// The process exited.
    Close {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    Chat(Value),
    Join(Value),
    Leave(Value),
    /// The reported scenario changed (pushed, or observed by polling).
    ScenarioUpdate(ScenarioReport),
}

/// Settings the engine passes to a new handle.
#[derive(Debug, Clone)]
pub(crate) struct HandleSettings {
    pub poll_interval: Option<Duration>,
    pub action_timeout: Duration,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct GameServerHandle {
    server_id: ServerId,
    scenario: ScenarioFile,
    data_dir: PathBuf,
    headless: bool,
    pid: Option<u32>,
    adapter: Option<Arc<AdapterClient>>,
    reported: Arc<RwLock<Option<ScenarioReport>>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<HandleSignal>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for GameServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameServerHandle")
            .field("server_id", &self.server_id)
            .field("scenario", &self.scenario.file_name())
            .field("pid", &self.pid)
            .field("adapter", &self.adapter.is_some())
            .finish()
    }
}

impl GameServerHandle {
    /// Takes ownership of a ready child process and starts the watcher,
    /// adapter event and scenario polling tasks.
    pub(crate) fn start(
        server_id: ServerId,
        scenario: ScenarioFile,
        data_dir: PathBuf,
        headless: bool,
        child: Child,
        adapter: Option<Arc<AdapterClient>>,
        settings: HandleSettings,
    ) -> Self {
        let pid = child.id();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let reported = Arc::new(RwLock::new(None));
        let push_seen = Arc::new(AtomicBool::new(false));

        let mut tasks = vec![tokio::spawn(watch_process(
            server_id,
            child,
            kill_rx,
            exited_tx,
            signal_tx.clone(),
        ))];

        if let Some(adapter) = &adapter {
            if let Some(events) = adapter.take_events() {
                tasks.push(tokio::spawn(forward_adapter_events(
                    server_id,
                    events,
                    reported.clone(),
                    push_seen.clone(),
                    signal_tx.clone(),
                )));
            }
            if let Some(interval) = settings.poll_interval {
                tasks.push(tokio::spawn(poll_scenario(
                    server_id,
                    adapter.clone(),
                    interval,
                    settings.action_timeout,
                    reported.clone(),
                    push_seen,
                    signal_tx,
                )));
            }
        }

        Self {
            server_id,
            scenario,
            data_dir,
            headless,
            pid,
            adapter,
            reported,
            kill_tx: Mutex::new(Some(kill_tx)),
            exited: exited_rx,
            signals: Mutex::new(Some(signal_rx)),
            tasks: Mutex::new(tasks),
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// The scenario this run was launched on.
    pub fn scenario(&self) -> &ScenarioFile {
        &self.scenario
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn is_headless(&self) -> bool {
        self.headless
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn adapter(&self) -> Option<&Arc<AdapterClient>> {
        self.adapter.as_ref().filter(|adapter| !adapter.is_closed())
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Last scenario state reported by the plugin, if any.
    pub fn reported_scenario(&self) -> Option<ScenarioReport> {
        self.reported
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Name of the scenario actually running: the reported file (or name)
    /// when the plugin has spoken, the launched file otherwise.
    pub fn current_scenario_name(&self) -> String {
        self.reported_scenario()
            .map(|report| report_scenario_name(&report))
            .unwrap_or_else(|| self.scenario.file_name())
    }

    /// Hands out the signal receiver. Only the first caller gets it.
    pub fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<HandleSignal>> {
        guard(&self.signals).take()
    }

    /// Hard-kills the process, waits for it to exit and tears down the
    /// adapter connection.
    pub async fn stop(&self) {
        if let Some(kill) = guard(&self.kill_tx).take() {
            let _ = kill.send(());
        }

        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;

        if let Some(adapter) = &self.adapter {
            adapter.close().await;
        }
        self.abort_tasks();
        info!("🛑 Stopped game server {} ({})", self.server_id, self.scenario);
    }

    fn abort_tasks(&self) {
        // The watcher has finished by now; the others may still be waiting.
        for task in guard(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Drop for GameServerHandle {
    fn drop(&mut self) {
        for task in guard(&self.tasks).iter() {
            if !task.is_finished() {
                task.abort();
            }
        }
    }
}

/// Scenario name recorded for a report: its file name when present.
pub fn report_scenario_name(report: &ScenarioReport) -> String {
    let filename = report.filename.trim();
    if filename.is_empty() {
        return report.name.clone();
    }
    Path::new(filename)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(filename)
        .to_string()
}

/// Stores `report` as the latest state. Returns whether name or status changed.
fn record_report(reported: &RwLock<Option<ScenarioReport>>, report: &ScenarioReport) -> bool {
    let mut current = reported
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let changed = match current.as_ref() {
        Some(previous) => {
            report_scenario_name(previous) != report_scenario_name(report)
                || previous.status != report.status
        }
        None => true,
    };
    *current = Some(report.clone());
    changed
}

async fn watch_process(
    server_id: ServerId,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    signals: mpsc::UnboundedSender<HandleSignal>,
) {
    // A dropped sender means the handle is gone; kill in that case too.
    let finished = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };
    let status = match finished {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                warn!("⚠️ Failed to kill game server {}: {}", server_id, e);
            }
            child.wait().await
        }
    };

    let (exit_code, signal) = match status {
        Ok(status) => (status.code(), exit_signal(&status)),
        Err(e) => {
            warn!("⚠️ Failed to reap game server {}: {}", server_id, e);
            (None, None)
        }
    };
    info!(
        "💤 Game server {} exited (code {:?}, signal {:?})",
        server_id, exit_code, signal
    );

    let _ = exited_tx.send(true);
    let _ = signals.send(HandleSignal::Close { exit_code, signal });
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

async fn forward_adapter_events(
    server_id: ServerId,
    mut events: mpsc::UnboundedReceiver<AdapterEvent>,
    reported: Arc<RwLock<Option<ScenarioReport>>>,
    push_seen: Arc<AtomicBool>,
    signals: mpsc::UnboundedSender<HandleSignal>,
) {
    while let Some(AdapterEvent { name, payload }) = events.recv().await {
        let signal = match name.as_str() {
            "chat" => HandleSignal::Chat(payload),
            "join" | "network.join" => HandleSignal::Join(payload),
            "leave" | "network.leave" => HandleSignal::Leave(payload),
            "scenario" => match serde_json::from_value::<ScenarioReport>(payload) {
                Ok(report) => {
                    push_seen.store(true, Ordering::SeqCst);
                    record_report(&reported, &report);
                    HandleSignal::ScenarioUpdate(report)
                }
                Err(e) => {
                    warn!("⚠️ Undecodable scenario event from {}: {}", server_id, e);
                    continue;
                }
            },
            other => {
                debug!("Ignoring adapter event '{}' from {}", other, server_id);
                continue;
            }
        };
        if signals.send(signal).is_err() {
            break;
        }
    }
}

async fn poll_scenario(
    server_id: ServerId,
    adapter: Arc<AdapterClient>,
    every: Duration,
    action_timeout: Duration,
    reported: Arc<RwLock<Option<ScenarioReport>>>,
    push_seen: Arc<AtomicBool>,
    signals: mpsc::UnboundedSender<HandleSignal>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if push_seen.load(Ordering::SeqCst) {
            debug!("Scenario events are pushed by {}; polling stops", server_id);
            break;
        }

        match adapter.scenario(SUPERVISOR_INVOKER, action_timeout).await {
            Ok(report) => {
                if push_seen.load(Ordering::SeqCst) {
                    break;
                }
                if record_report(&reported, &report)
                    && signals.send(HandleSignal::ScenarioUpdate(report)).is_err()
                {
                    break;
                }
            }
            Err(AdapterError::Closed) => break,
            Err(e) => debug!("Scenario poll of {} failed: {}", server_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_system::ScenarioProgress;

    fn report(name: &str, filename: &str, status: ScenarioProgress) -> ScenarioReport {
        ScenarioReport {
            name: name.to_string(),
            details: String::new(),
            filename: filename.to_string(),
            status,
        }
    }

    #[test]
    fn test_report_name_prefers_file_name() {
        let r = report("Forest Frontiers", "/data/scenario/Forest Frontiers.sc6", ScenarioProgress::InProgress);
        assert_eq!(report_scenario_name(&r), "Forest Frontiers.sc6");

        let r = report("Forest Frontiers", "", ScenarioProgress::InProgress);
        assert_eq!(report_scenario_name(&r), "Forest Frontiers");
    }

    #[test]
    fn test_record_report_detects_changes_only() {
        let reported = RwLock::new(None);
        let first = report("a", "a.park", ScenarioProgress::InProgress);

        assert!(record_report(&reported, &first));
        assert!(!record_report(&reported, &first));
        assert!(record_report(
            &reported,
            &report("a", "a.park", ScenarioProgress::Completed)
        ));
        assert!(record_report(
            &reported,
            &report("b", "b.park", ScenarioProgress::Completed)
        ));
    }
}
