//! Server controller
//!
//! The controller owns the live-instance table and the operation flag table
//! and exposes every lifecycle operation of a server id. A server's state is
//! derived from table entries rather than stored:
//!
//! * **Idle** - no handle, no flags
//! * **Starting** - `start` flag set
//! * **Running** - handle present
//! * **DeferredPending** - `start.defer` flag set (a handle may exist)
//! * **Busy** - `screenshot` or `save` flag set, orthogonal to the above
//!
//! Outbound events go to the shared [`EventSystem`]. Pass-through events
//! (network traffic) are forwarded as received; completion and queue
//! chaining are derived here first.

mod capture;
mod queue;

pub use capture::CaptureReport;

use crate::config::SupervisorConfig;
use crate::engine::ProcessEngine;
use crate::error::{ControllerError, ControllerResult};
use crate::flags::{DeferredStart, DeferredState, OperationFlag, OperationFlags, OperationKind};
use crate::handle::{report_scenario_name, GameServerHandle, HandleSignal, SUPERVISOR_INVOKER};
use crate::scenario::{is_autosave_name, nth_latest_autosave, ScenarioCatalog, ScenarioFile};
use dashmap::DashMap;
use futures::future::join_all;
use event_system::{
    current_timestamp, DeferCancelEvent, DeferStartEvent, EventSystem, NamedEvent, NetworkChatEvent,
    NetworkJoinEvent, NetworkLeaveEvent, ScenarioCompleteEvent, ScenarioProgress, ServerClosedEvent,
    ServerErrorEvent, ServerId, ServerRestartedEvent, ServerStartedEvent, ServerStoppedEvent,
};
use plugin_adapter::{PlayerEntry, RequestArg, ScenarioReport};
use resource_store::{
    PathLockRegistry, PluginOptions, ScenarioMetadataStore, ServerResources, ServerStatus,
    StartupOptions,
};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a start request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A deferred start was cancelled before it launched.
    Cancelled,
}

enum LaunchTarget {
    Scenario(ScenarioFile),
    Autosave(usize),
}

pub struct ServerController {
    config: Arc<SupervisorConfig>,
    engine: ProcessEngine,
    locks: PathLockRegistry,
    catalog: Arc<dyn ScenarioCatalog>,
    metadata: ScenarioMetadataStore,
    events: Arc<EventSystem>,
    servers: DashMap<ServerId, Arc<GameServerHandle>>,
    flags: OperationFlags,
    weak_self: Weak<ServerController>,
}

impl std::fmt::Debug for ServerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerController")
            .field("running", &self.running_servers())
            .finish()
    }
}

impl ServerController {
    /// Builds a controller.
    ///
    /// # Arguments
    ///
    /// * `config` - Paths, timeouts and polling settings
    /// * `locks` - Path lock registry shared with every other writer of the
    ///   server directories
    /// * `catalog` - Resolves scenario names to files
    /// * `events` - Bus that receives every lifecycle, network and scenario event
    pub async fn new(
        config: SupervisorConfig,
        locks: PathLockRegistry,
        catalog: Arc<dyn ScenarioCatalog>,
        events: Arc<EventSystem>,
    ) -> ControllerResult<Arc<Self>> {
        let config = Arc::new(config);
        let metadata = ScenarioMetadataStore::open(&locks, &config.catalog_dir).await?;
        let engine = ProcessEngine::new(config.clone());

        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            engine,
            locks,
            catalog,
            metadata,
            events,
            servers: DashMap::new(),
            flags: OperationFlags::new(),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventSystem> {
        &self.events
    }

    pub fn catalog(&self) -> &Arc<dyn ScenarioCatalog> {
        &self.catalog
    }

    pub fn metadata(&self) -> &ScenarioMetadataStore {
        &self.metadata
    }

    pub fn flags(&self) -> &OperationFlags {
        &self.flags
    }

    /// Opens the resource directory of `id`.
    pub async fn resources(&self, id: ServerId) -> ControllerResult<ServerResources> {
        Ok(ServerResources::open(&self.locks, &self.config.servers_root, id).await?)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn handle(&self, id: ServerId) -> Option<Arc<GameServerHandle>> {
        self.servers.get(&id).map(|entry| entry.value().clone())
    }

    pub fn is_running(&self, id: ServerId) -> bool {
        self.servers.contains_key(&id)
    }

    pub fn running_servers(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.servers.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Operations currently in flight for `id`.
    pub fn busy_operations(&self, id: ServerId) -> Vec<OperationKind> {
        self.flags.list_for(id).iter().map(|flag| flag.kind()).collect()
    }

    /// Scenario a pending deferred start will launch, if one is pending.
    pub fn pending_deferred_scenario(&self, id: ServerId) -> Option<String> {
        match self.flags.get(id, OperationKind::StartDefer) {
            Some(OperationFlag::StartDefer(deferred)) => Some(deferred.scenario),
            _ => None,
        }
    }

    pub async fn server_status(&self, id: ServerId) -> ControllerResult<ServerStatus> {
        Ok(self.resources(id).await?.status().await?)
    }

    pub async fn startup_options(&self, id: ServerId) -> ControllerResult<StartupOptions> {
        Ok(self.resources(id).await?.startup_options().await?)
    }

    pub async fn plugin_options(&self, id: ServerId) -> ControllerResult<PluginOptions> {
        Ok(self.resources(id).await?.plugin_options().await?)
    }

    /// Read-modify-write of the startup options inside one critical section.
    pub async fn update_startup_options<F>(&self, id: ServerId, mutate: F) -> ControllerResult<StartupOptions>
    where
        F: FnOnce(&mut StartupOptions),
    {
        let resources = self.resources(id).await?;
        Ok(resources
            .update_startup_options(|options| {
                mutate(options);
                options.clone()
            })
            .await?)
    }

    pub async fn update_plugin_options<F>(&self, id: ServerId, mutate: F) -> ControllerResult<PluginOptions>
    where
        F: FnOnce(&mut PluginOptions),
    {
        let resources = self.resources(id).await?;
        Ok(resources
            .update_plugin_options(|options| {
                mutate(options);
                options.clone()
            })
            .await?)
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Launches `scenario` on `id`, replacing whatever runs there.
    pub async fn start_game_server_on_scenario(
        &self,
        id: ServerId,
        scenario: ScenarioFile,
    ) -> ControllerResult<()> {
        self.admitted_start(id, LaunchTarget::Scenario(scenario)).await
    }

    /// Relaunches `id` from its `index`-th most recent autosave (0 = latest).
    pub async fn start_game_server_on_autosave(&self, id: ServerId, index: usize) -> ControllerResult<()> {
        self.admitted_start(id, LaunchTarget::Autosave(index)).await
    }

    async fn admitted_start(&self, id: ServerId, target: LaunchTarget) -> ControllerResult<()> {
        if !self.flags.try_set(id, OperationFlag::Start) {
            return Err(ControllerError::Busy {
                server_id: id,
                operation: OperationKind::Start,
            });
        }
        let result = self.launch(id, target).await;
        self.flags.delete(id, OperationKind::Start);
        result
    }

    async fn launch(&self, id: ServerId, target: LaunchTarget) -> ControllerResult<()> {
        self.cancel_deferred(id).await;
        if let Some((_, previous)) = self.servers.remove(&id) {
            info!("🔁 Replacing running game server {}", id);
            previous.stop().await;
        }

        let resources = self.resources(id).await?;
        let data_dir = resources.data_dir().await?;
        let (scenario, autosave_index) = match target {
            LaunchTarget::Scenario(scenario) => (scenario, None),
            LaunchTarget::Autosave(index) => (nth_latest_autosave(&data_dir, index).await?, Some(index)),
        };
        let startup = resources.startup_options().await?;
        let plugin = resources.plugin_options().await?;
        let name = scenario.file_name();

        if autosave_index.is_none() {
            self.metadata.record_play(&name).await?;
        }

        let handle = match self
            .engine
            .create_game_server_instance(id, &data_dir, scenario, &startup, &plugin)
            .await
        {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                self.publish(ServerErrorEvent {
                    server_id: id,
                    message: e.to_string(),
                    timestamp: current_timestamp(),
                })
                .await;
                return Err(e.into());
            }
        };

        let signals = handle.take_signals();
        self.servers.insert(id, handle.clone());
        resources.update_status(|status| status.begin_run(&name)).await?;
        if let Some(signals) = signals {
            self.watch_signals(id, &handle, signals);
        }

        match autosave_index {
            Some(autosave_index) => {
                info!("♻️ Game server {} restarted from autosave {}", id, name);
                self.publish(ServerRestartedEvent {
                    server_id: id,
                    autosave_index,
                    scenario: name,
                    timestamp: current_timestamp(),
                })
                .await;
            }
            None => {
                info!("🎢 Game server {} started on {}", id, name);
                self.publish(ServerStartedEvent {
                    server_id: id,
                    scenario: name,
                    timestamp: current_timestamp(),
                })
                .await;
            }
        }
        Ok(())
    }

    /// Launches `scenario` on `id` after the configured delay.
    ///
    /// Counts down at the configured tick, announcing every whole remaining
    /// minute on the bus and (best effort) in game chat. Cancellation through
    /// [`cancel_deferred_start`](Self::cancel_deferred_start), a stop or
    /// another start ends the countdown without launching.
    pub async fn start_game_server_on_scenario_deferred(
        &self,
        id: ServerId,
        scenario: ScenarioFile,
    ) -> ControllerResult<StartOutcome> {
        let session = Uuid::new_v4();
        let flag = OperationFlag::StartDefer(DeferredStart {
            session,
            scenario: scenario.file_name(),
            state: DeferredState::Pending,
        });
        if !self.flags.try_set(id, flag) {
            return Err(ControllerError::Busy {
                server_id: id,
                operation: OperationKind::StartDefer,
            });
        }

        let result = self.run_deferred(id, session, scenario).await;
        self.flags.remove_deferred_session(id, session);
        result
    }

    async fn run_deferred(
        &self,
        id: ServerId,
        session: Uuid,
        scenario: ScenarioFile,
    ) -> ControllerResult<StartOutcome> {
        let minutes = self.resources(id).await?.startup_options().await?.defer_minutes;
        let minute = self.config.defer_minute.max(Duration::from_millis(1));
        let delay = minute.saturating_mul(u32::try_from(minutes).unwrap_or(u32::MAX));
        let deadline = Instant::now() + delay;
        let name = scenario.file_name();
        let mut announced: Option<u64> = None;

        info!("⏳ Game server {} will start {} in {} minutes", id, name, minutes);

        loop {
            if !self.flags.is_deferred_session(id, session) {
                info!("🚫 Deferred start of {} on {} was cancelled", name, id);
                return Ok(StartOutcome::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let remaining = deadline - now;
            let remaining_minutes = ceil_units(remaining, minute);
            if remaining_minutes > 0 && announced != Some(remaining_minutes) {
                announced = Some(remaining_minutes);
                self.announce_deferred(id, &name, remaining_minutes).await;
            }

            tokio::time::sleep(self.config.defer_tick.min(remaining)).await;
        }

        if !self.flags.begin_deferred_launch(id, session) {
            info!("🚫 Deferred start of {} on {} was cancelled", name, id);
            return Ok(StartOutcome::Cancelled);
        }
        self.start_game_server_on_scenario(id, scenario).await?;
        Ok(StartOutcome::Started)
    }

    async fn announce_deferred(&self, id: ServerId, scenario: &str, remaining_minutes: u64) {
        self.publish(DeferStartEvent {
            server_id: id,
            scenario: scenario.to_string(),
            remaining_minutes,
            timestamp: current_timestamp(),
        })
        .await;

        let Some(adapter) = self.handle(id).and_then(|h| h.adapter().cloned()) else {
            return;
        };
        let unit = if remaining_minutes == 1 { "minute" } else { "minutes" };
        let message = format!("Server restarting in {remaining_minutes} {unit} with {scenario}");
        let timeout = self.config.action_timeout;
        tokio::spawn(async move {
            if let Err(e) = adapter.chat(SUPERVISOR_INVOKER, &message, timeout).await {
                warn!("⚠️ Countdown warning on {} failed: {}", id, e);
            }
        });
    }

    /// Cancels a pending deferred start of `id`. Returns whether one was
    /// cancelled; a deferred start that has begun launching is not.
    pub async fn cancel_deferred_start(&self, id: ServerId) -> bool {
        self.cancel_deferred(id).await.is_some()
    }

    async fn cancel_deferred(&self, id: ServerId) -> Option<DeferredStart> {
        let cancelled = self.flags.cancel_pending_deferred(id)?;
        info!("🚫 Cancelling deferred start of {} on {}", cancelled.scenario, id);
        self.publish(DeferCancelEvent {
            server_id: id,
            scenario: cancelled.scenario.clone(),
            timestamp: current_timestamp(),
        })
        .await;
        Some(cancelled)
    }

    // ========================================================================
    // Stop and completion
    // ========================================================================

    /// Cancels any deferred start, hard-kills the running instance and
    /// optionally emits a stop event. Returns whether anything was running.
    pub async fn stop_game_server(&self, id: ServerId, emit_event: bool) -> bool {
        self.cancel_deferred(id).await;
        let stopped = match self.servers.remove(&id) {
            Some((_, handle)) => {
                handle.stop().await;
                true
            }
            None => false,
        };

        if emit_event {
            self.publish(ServerStoppedEvent {
                server_id: id,
                stopped,
                timestamp: current_timestamp(),
            })
            .await;
        }
        stopped
    }

    /// Stops every running server and cancels every pending deferred start.
    pub async fn stop_all(&self) -> Vec<ServerId> {
        let mut ids = self.running_servers();
        for id in self.flags.servers_with(OperationKind::StartDefer) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids.sort();

        let results = join_all(ids.iter().map(|id| self.stop_game_server(*id, true))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, stopped)| stopped.then_some(id))
            .collect()
    }

    /// Marks the current run of `id` as completed.
    ///
    /// With an outcome, the launched scenario's metadata is credited only
    /// when the scenario actually running is the one that was launched.
    /// Returns false when nothing runs on `id`.
    pub async fn set_server_scenario_as_completed(
        &self,
        id: ServerId,
        outcome: Option<ScenarioProgress>,
    ) -> ControllerResult<bool> {
        let Some(handle) = self.handle(id) else {
            return Ok(false);
        };

        let launched = handle.scenario().file_name();
        let actual = handle.current_scenario_name();
        if let Some(outcome) = outcome.filter(|o| o.is_terminal()) {
            if actual == launched {
                self.metadata.record_outcome(&launched, outcome).await?;
            } else {
                info!(
                    "Not crediting {}: server {} is now running {}",
                    launched, id, actual
                );
            }
        }

        self.resources(id)
            .await?
            .update_status(|status| status.is_current_scenario_completed = Some(true))
            .await?;
        info!("🏁 Marked scenario on {} as completed", id);
        Ok(true)
    }

    // ========================================================================
    // Adapter plugin proxy
    // ========================================================================

    /// Forwards an action to the adapter of `id`. No retry.
    pub async fn execute_plugin_action(
        &self,
        id: ServerId,
        action: &str,
        invoker_id: u64,
        arg: Option<RequestArg>,
        timeout: Option<Duration>,
    ) -> ControllerResult<Value> {
        let handle = self.handle(id).ok_or(ControllerError::NotRunning(id))?;
        let adapter = handle
            .adapter()
            .cloned()
            .ok_or(ControllerError::PluginUnavailable(id))?;
        Ok(adapter
            .execute_action(action, invoker_id, arg, timeout.unwrap_or(self.config.action_timeout))
            .await?)
    }

    pub async fn player_list(&self, id: ServerId, invoker_id: u64) -> ControllerResult<Vec<PlayerEntry>> {
        let value = self
            .execute_plugin_action(id, plugin_adapter::actions::PLAYER_LIST, invoker_id, None, None)
            .await?;
        serde_json::from_value(value).map_err(|source| {
            plugin_adapter::AdapterError::UnexpectedPayload {
                action: plugin_adapter::actions::PLAYER_LIST.to_string(),
                source,
            }
            .into()
        })
    }

    pub async fn current_scenario(&self, id: ServerId, invoker_id: u64) -> ControllerResult<ScenarioReport> {
        let value = self
            .execute_plugin_action(id, plugin_adapter::actions::SCENARIO, invoker_id, None, None)
            .await?;
        serde_json::from_value(value).map_err(|source| {
            plugin_adapter::AdapterError::UnexpectedPayload {
                action: plugin_adapter::actions::SCENARIO.to_string(),
                source,
            }
            .into()
        })
    }

    // ========================================================================
    // Handle signals
    // ========================================================================

    fn watch_signals(
        &self,
        id: ServerId,
        handle: &Arc<GameServerHandle>,
        mut signals: mpsc::UnboundedReceiver<HandleSignal>,
    ) {
        let controller = self.weak_self.clone();
        let handle = Arc::downgrade(handle);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.handle_signal(id, &handle, signal).await;
            }
        });
    }

    async fn handle_signal(&self, id: ServerId, source: &Weak<GameServerHandle>, signal: HandleSignal) {
        match signal {
            HandleSignal::Close { exit_code, signal } => {
                let removed = self
                    .servers
                    .remove_if(&id, |_, live| std::ptr::eq(Arc::as_ptr(live), source.as_ptr()))
                    .is_some();
                if removed {
                    warn!("💥 Game server {} closed unexpectedly", id);
                }
                self.publish(ServerClosedEvent {
                    server_id: id,
                    exit_code,
                    signal,
                    timestamp: current_timestamp(),
                })
                .await;
            }
            HandleSignal::Chat(payload) => {
                self.publish(NetworkChatEvent { server_id: id, payload }).await;
            }
            HandleSignal::Join(payload) => {
                self.publish(NetworkJoinEvent { server_id: id, payload }).await;
            }
            HandleSignal::Leave(payload) => {
                self.publish(NetworkLeaveEvent { server_id: id, payload }).await;
            }
            HandleSignal::ScenarioUpdate(report) => {
                let Some(handle) = source.upgrade() else {
                    return;
                };
                if let Err(e) = self.on_scenario_update(id, &handle, report).await {
                    error!("❌ Failed to process scenario update of {}: {}", id, e);
                }
            }
        }
    }

    async fn on_scenario_update(
        &self,
        id: ServerId,
        handle: &Arc<GameServerHandle>,
        report: ScenarioReport,
    ) -> ControllerResult<()> {
        let is_live = self
            .handle(id)
            .is_some_and(|live| Arc::ptr_eq(&live, handle));
        if !is_live {
            return Ok(());
        }

        let name = report_scenario_name(&report);
        let resources = self.resources(id).await?;
        let transitioned = resources
            .update_status(|status| {
                if status.current_scenario.as_deref() != Some(name.as_str()) {
                    status.is_current_scenario_completed = None;
                }
                status.current_scenario = Some(name.clone());
                if report.status.is_terminal() && !status.is_completed() && !is_autosave_name(&name) {
                    status.is_current_scenario_completed = Some(true);
                    true
                } else {
                    false
                }
            })
            .await?;
        debug!("Scenario on {} is now {} ({:?})", id, name, report.status);
        if !transitioned {
            return Ok(());
        }

        let startup = resources.startup_options().await?;
        if startup.keep_score && name == handle.scenario().file_name() {
            self.metadata.record_outcome(&name, report.status).await?;
        }

        info!("🏆 Scenario {} on {} finished: {:?}", name, id, report.status);
        self.publish(ScenarioCompleteEvent {
            server_id: id,
            scenario: name,
            status: report.status,
            timestamp: current_timestamp(),
        })
        .await;

        if startup.auto_finalize {
            self.chain_from_queue(id);
        }
        Ok(())
    }

    /// Starts the next queued scenario in the background, deferred.
    fn chain_from_queue(&self, id: ServerId) {
        let Some(controller) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            match controller.start_game_server_from_queue(id, true).await {
                Ok(outcome) => debug!("Queue chaining on {} ended: {:?}", id, outcome),
                Err(ControllerError::QueueEmpty(_)) => debug!("Nothing queued on {}", id),
                Err(e) if e.is_busy() => debug!("Queue chaining on {} skipped: {}", id, e),
                Err(e) => error!("❌ Queue chaining on {} failed: {}", id, e),
            }
        });
    }

    async fn publish<T>(&self, event: T)
    where
        T: NamedEvent,
    {
        if let Err(e) = self.events.publish(&event).await {
            error!("❌ Failed to emit {}: {}", T::NAME, e);
        }
    }
}

/// Whole `unit`s in `remaining`, rounded up.
fn ceil_units(remaining: Duration, unit: Duration) -> u64 {
    let unit = unit.as_nanos().max(1);
    let units = remaining.as_nanos().div_ceil(unit);
    u64::try_from(units).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_units() {
        let minute = Duration::from_secs(60);
        assert_eq!(ceil_units(Duration::from_secs(300), minute), 5);
        assert_eq!(ceil_units(Duration::from_secs(299), minute), 5);
        assert_eq!(ceil_units(Duration::from_secs(240), minute), 4);
        assert_eq!(ceil_units(Duration::from_millis(1), minute), 1);
        assert_eq!(ceil_units(Duration::ZERO, minute), 0);
    }
}
