//! Park supervisor daemon
//!
//! Loads the configuration, builds the server controller, logs every event
//! it raises, starts the configured servers from their queues and stops
//! everything on SIGINT/SIGTERM.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use event_system::{
    create_event_system, DeferCancelEvent, DeferStartEvent, EventSystem, NetworkChatEvent,
    NetworkJoinEvent, NetworkLeaveEvent, ScenarioCompleteEvent, ServerClosedEvent,
    ServerErrorEvent, ServerRestartedEvent, ServerStartedEvent, ServerStoppedEvent,
};
use game_server::{ControllerError, DirectoryScenarioCatalog, ServerController};
use resource_store::PathLockRegistry;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cli::CliArgs;
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path)
        .await
        .with_context(|| format!("Failed to load {}", args.config_path.display()))?;
    config.apply_cli(&args);
    config
        .validate()
        .context("Configuration validation failed")?;

    logging::setup_logging(&config.logging)?;

    info!("🚀 Park supervisor v{}", env!("CARGO_PKG_VERSION"));
    info!("📂 Config: {}", args.config_path.display());
    info!("  🎮 Executable: {}", config.game.executable.display());
    info!("  🗺️ Scenarios: {}", config.game.scenarios_dir.display());
    info!("  🗄️ Servers root: {}", config.game.servers_root.display());

    let supervisor_config = config.to_supervisor_config()?;
    let events = create_event_system();
    register_event_logging(&events).await?;

    let catalog = Arc::new(DirectoryScenarioCatalog::new(
        supervisor_config.scenarios_dir.clone(),
    ));
    let controller =
        ServerController::new(supervisor_config, PathLockRegistry::new(), catalog, events.clone())
            .await
            .context("Failed to build the server controller")?;

    for id in config.autostart_servers()? {
        let controller = controller.clone();
        tokio::spawn(async move {
            match controller.start_game_server_from_queue(id, false).await {
                Ok(outcome) => info!("✅ Autostart of {} finished: {:?}", id, outcome),
                Err(ControllerError::QueueEmpty(_)) => {
                    warn!("⚠️ Autostart of {} skipped: nothing queued", id)
                }
                Err(e) => error!("❌ Autostart of {} failed: {}", id, e),
            }
        });
    }

    signals::wait_for_shutdown().await?;

    info!("🛑 Shutting down");
    let stopped = controller.stop_all().await;
    info!("✅ Stopped {} game server(s)", stopped.len());

    let stats = events.get_stats().await;
    info!(
        "📊 Events emitted: {} | Handlers: {}",
        stats.events_emitted, stats.total_handlers
    );
    Ok(())
}

/// Logs every event the controller raises.
async fn register_event_logging(events: &Arc<EventSystem>) -> Result<()> {
    events
        .subscribe(|e: ServerStartedEvent| {
            info!("🎢 [{}] started on {}", e.server_id, e.scenario);
            Ok(())
        })
        .await?;
    events
        .subscribe(|e: ServerRestartedEvent| {
            info!(
                "♻️ [{}] restarted from autosave #{} ({})",
                e.server_id, e.autosave_index, e.scenario
            );
            Ok(())
        })
        .await?;
    events
        .subscribe(|e: ServerStoppedEvent| {
            info!("🛑 [{}] stop requested (was running: {})", e.server_id, e.stopped);
            Ok(())
        })
        .await?;
    events
        .subscribe(|e: ServerClosedEvent| {
            info!(
                "💤 [{}] closed (code {:?}, signal {:?})",
                e.server_id, e.exit_code, e.signal
            );
            Ok(())
        })
        .await?;
    events
        .subscribe(|e: ServerErrorEvent| {
            error!("❌ [{}] {}", e.server_id, e.message);
            Ok(())
        })
        .await?;
    events
        .subscribe(|e: NetworkChatEvent| {
            info!("💬 [{}] {}", e.server_id, e.payload);
            Ok(())
        })
        .await?;
    events
        .subscribe(|e: NetworkJoinEvent| {
            info!("👋 [{}] joined: {}", e.server_id, e.payload);
            Ok(())
        })
        .await?;
    events
        .subscribe(|e: NetworkLeaveEvent| {
            info!("🚪 [{}] left: {}", e.server_id, e.payload);
            Ok(())
        })
        .await?;
    events
        .subscribe(|e: DeferStartEvent| {
            info!(
                "⏳ [{}] {} starts in {} minute(s)",
                e.server_id, e.scenario, e.remaining_minutes
            );
            Ok(())
        })
        .await?;
    events
        .subscribe(|e: DeferCancelEvent| {
            info!("🚫 [{}] deferred start of {} cancelled", e.server_id, e.scenario);
            Ok(())
        })
        .await?;
    events
        .subscribe(|e: ScenarioCompleteEvent| {
            info!("🏆 [{}] {} finished: {:?}", e.server_id, e.scenario, e.status);
            Ok(())
        })
        .await?;
    Ok(())
}
