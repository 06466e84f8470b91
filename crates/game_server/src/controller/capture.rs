//! Screenshots and saves of a server's current scenario

use super::ServerController;
use crate::error::{ControllerError, ControllerResult, ScenarioError};
use crate::flags::{OperationFlag, OperationKind};
use crate::handle::{GameServerHandle, SUPERVISOR_INVOKER};
use crate::scenario::{find_plugin_save, nth_latest_autosave, ScenarioFile, SAVE_DIR, SCREENSHOT_DIR};
use event_system::ServerId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Where a capture ended up and whether it came from the live game.
///
/// `used_plugin == false` means the capture was made from an autosave and
/// may be stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub path: PathBuf,
    pub used_plugin: bool,
}

impl ServerController {
    /// Captures an image of the scenario running on `id`.
    ///
    /// Uses the adapter plugin when connected. Headless servers render from a
    /// fresh save instead, since their own view is not kept up to date.
    /// Without a plugin the latest autosave is rendered.
    pub async fn create_server_screenshot(&self, id: ServerId) -> ControllerResult<CaptureReport> {
        if !self.flags.try_set(id, OperationFlag::Screenshot) {
            return Err(ControllerError::Busy {
                server_id: id,
                operation: OperationKind::Screenshot,
            });
        }
        let result = self.capture_screenshot(id).await;
        self.flags.delete(id, OperationKind::Screenshot);
        result
    }

    /// Writes a save of the scenario running on `id`.
    ///
    /// Without a plugin, the latest autosave is reported instead.
    pub async fn create_current_scenario_save(&self, id: ServerId) -> ControllerResult<CaptureReport> {
        if !self.flags.try_set(id, OperationFlag::Save) {
            return Err(ControllerError::Busy {
                server_id: id,
                operation: OperationKind::Save,
            });
        }
        let result = self.capture_save(id).await;
        self.flags.delete(id, OperationKind::Save);
        result
    }

    async fn capture_screenshot(&self, id: ServerId) -> ControllerResult<CaptureReport> {
        let resources = self.resources(id).await?;
        let output_dir = resources.screenshots_dir().await?;
        let file_stem = id.to_string();
        let handle = self.handle(id);

        if let Some(handle) = &handle {
            if let Some(adapter) = handle.adapter() {
                if handle.is_headless() && self.config.headless_screenshot_via_save {
                    let save = self.plugin_save(handle).await?;
                    let path = self
                        .engine
                        .create_scenario_screenshot(&save, &output_dir, Some(&file_stem))
                        .await?;
                    info!("📸 Rendered screenshot of {} from a fresh save", id);
                    return Ok(CaptureReport {
                        path,
                        used_plugin: true,
                    });
                }

                let filename = adapter
                    .screenshot(SUPERVISOR_INVOKER, self.config.long_action_timeout)
                    .await?;
                let path = plugin_file(handle.data_dir(), SCREENSHOT_DIR, &filename);
                info!("📸 Plugin captured screenshot of {}", id);
                return Ok(CaptureReport {
                    path,
                    used_plugin: true,
                });
            }
        }

        let data_dir = resources.data_dir().await?;
        let source = self.fallback_source(&data_dir, handle.as_ref()).await?;
        let path = self
            .engine
            .create_scenario_screenshot(&source, &output_dir, Some(&file_stem))
            .await?;
        warn!("📸 Screenshot of {} rendered from {}; it may be stale", id, source);
        Ok(CaptureReport {
            path,
            used_plugin: false,
        })
    }

    async fn capture_save(&self, id: ServerId) -> ControllerResult<CaptureReport> {
        let handle = self.handle(id);
        if let Some(handle) = handle.as_ref().filter(|h| h.adapter().is_some()) {
            let save = self.plugin_save(handle).await?;
            info!("💾 Saved {} to {}", id, save.path().display());
            return Ok(CaptureReport {
                path: save.path().to_path_buf(),
                used_plugin: true,
            });
        }

        let data_dir = self.resources(id).await?.data_dir().await?;
        let autosave = nth_latest_autosave(&data_dir, 0).await?;
        warn!("💾 No live save for {}; using autosave {}", id, autosave);
        Ok(CaptureReport {
            path: autosave.path().to_path_buf(),
            used_plugin: false,
        })
    }

    /// Asks the plugin for a save and locates the written file.
    async fn plugin_save(&self, handle: &GameServerHandle) -> ControllerResult<ScenarioFile> {
        let adapter = handle
            .adapter()
            .ok_or(ControllerError::PluginUnavailable(handle.server_id()))?;
        let base_name = adapter
            .save(SUPERVISOR_INVOKER, self.config.long_action_timeout)
            .await?;
        match find_plugin_save(handle.data_dir(), &base_name).await {
            Some(save) => Ok(save),
            None => Err(ScenarioError::NotFound(
                plugin_file(handle.data_dir(), SAVE_DIR, &base_name)
                    .display()
                    .to_string(),
            )
            .into()),
        }
    }

    /// Latest autosave, or the launched scenario when none exists yet.
    async fn fallback_source(
        &self,
        data_dir: &Path,
        handle: Option<&Arc<GameServerHandle>>,
    ) -> ControllerResult<ScenarioFile> {
        match (nth_latest_autosave(data_dir, 0).await, handle) {
            (Ok(autosave), _) => Ok(autosave),
            (Err(ScenarioError::NoAutosave { .. }), Some(handle)) => Ok(handle.scenario().clone()),
            (Err(e), _) => Err(e.into()),
        }
    }
}

/// Path of a file the plugin reported, relative to its folder in the data dir.
fn plugin_file(data_dir: &Path, folder: &str, filename: &str) -> PathBuf {
    let reported = Path::new(filename);
    if reported.is_absolute() {
        reported.to_path_buf()
    } else {
        data_dir.join(folder).join(reported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_file_resolution() {
        let data = Path::new("/srv/s1/data");
        assert_eq!(
            plugin_file(data, SCREENSHOT_DIR, "shot.png"),
            PathBuf::from("/srv/s1/data/screenshot/shot.png")
        );
        assert_eq!(
            plugin_file(data, SCREENSHOT_DIR, "/tmp/shot.png"),
            PathBuf::from("/tmp/shot.png")
        );
    }
}
