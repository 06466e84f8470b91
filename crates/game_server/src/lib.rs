//! # Park Game Server Supervisor
//!
//! Supervises independent instances of an external park game executable,
//! each bound to a [`ServerId`](event_system::ServerId), through launch,
//! deferred and queued launches, shutdown and completion bookkeeping.
//!
//! ## Architecture
//!
//! * [`ServerController`] - per-id state machine over the live-instance table
//!   and the [`OperationFlags`] admission gate
//! * [`ProcessEngine`] - spawns the executable, waits for readiness, connects
//!   the adapter plugin, renders screenshots
//! * [`GameServerHandle`] - one running instance and its event sources
//! * [`ScenarioCatalog`] - name to file resolution and autosave discovery
//!
//! Persisted per-server documents live in `resource_store`; the control
//! channel lives in `plugin_adapter`; events are raised on an
//! `event_system::EventSystem`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use event_system::{create_event_system, ServerId};
//! use game_server::{DirectoryScenarioCatalog, ScenarioCatalog, ServerController, SupervisorConfig};
//! use resource_store::PathLockRegistry;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SupervisorConfig::default();
//! let catalog = Arc::new(DirectoryScenarioCatalog::new(&config.scenarios_dir));
//! let controller =
//!     ServerController::new(config, PathLockRegistry::new(), catalog.clone(), create_event_system())
//!         .await?;
//!
//! let scenario = catalog.resolve("Forest Frontiers").await?;
//! controller.start_game_server_on_scenario(ServerId(1), scenario).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod flags;
pub mod handle;
pub mod readiness;
pub mod scenario;

pub use config::SupervisorConfig;
pub use controller::{CaptureReport, ServerController, StartOutcome};
pub use engine::ProcessEngine;
pub use error::{ControllerError, ControllerResult, ProcessError, ScenarioError};
pub use flags::{DeferredStart, DeferredState, OperationFlag, OperationFlags, OperationKind};
pub use handle::{GameServerHandle, HandleSignal};
pub use readiness::{MarkerReadiness, ReadinessDetector};
pub use scenario::{
    is_autosave_name, list_autosaves, nth_latest_autosave, DirectoryScenarioCatalog,
    ScenarioCatalog, ScenarioFile,
};
