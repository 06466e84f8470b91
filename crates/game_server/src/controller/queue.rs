//! Scenario queue operations

use super::{ServerController, StartOutcome};
use crate::error::{ControllerError, ControllerResult, ScenarioError};
use crate::flags::OperationKind;
use crate::scenario::ScenarioFile;
use event_system::ServerId;
use resource_store::{QueueRejection, ServerQueue};
use tracing::{info, warn};

impl ServerController {
    pub async fn queue(&self, id: ServerId) -> ControllerResult<ServerQueue> {
        Ok(self.resources(id).await?.queue().await?)
    }

    /// Sets the queue capacity; 0 disables queueing. Entries beyond the new
    /// capacity are kept until consumed.
    pub async fn set_queue_size(&self, id: ServerId, max_size: usize) -> ControllerResult<()> {
        self.resources(id)
            .await?
            .update_queue(|queue| queue.max_size = max_size)
            .await?;
        Ok(())
    }

    /// Appends `scenario` to the queue of `id` and returns the new length.
    ///
    /// When the current run is already completed, a deferred start from the
    /// queue is kicked off right away.
    pub async fn add_to_server_scenario_queue(
        &self,
        id: ServerId,
        scenario: &ScenarioFile,
    ) -> ControllerResult<usize> {
        let resources = self.resources(id).await?;
        let name = scenario.file_name();
        let length = resources
            .try_update_queue(|queue| {
                queue.try_push(name.clone()).map_err(|rejection| match rejection {
                    QueueRejection::Disabled => ControllerError::QueueDisabled(id),
                    QueueRejection::Full { max_size } => ControllerError::QueueFull {
                        server_id: id,
                        max_size,
                    },
                })
            })
            .await?;
        info!("📋 Queued {} on {} (position {})", name, id, length);

        if resources.status().await?.is_completed() {
            self.chain_from_queue(id);
        }
        Ok(length)
    }

    /// Removes the entry at `index` and returns its name.
    pub async fn remove_from_server_scenario_queue(
        &self,
        id: ServerId,
        index: usize,
    ) -> ControllerResult<String> {
        self.resources(id)
            .await?
            .try_update_queue(|queue| {
                if index < queue.scenarios.len() {
                    Ok(queue.scenarios.remove(index))
                } else {
                    Err(ControllerError::QueueIndex {
                        server_id: id,
                        index,
                    })
                }
            })
            .await
    }

    /// Empties the queue and returns how many entries were removed.
    pub async fn clear_server_scenario_queue(&self, id: ServerId) -> ControllerResult<usize> {
        Ok(self
            .resources(id)
            .await?
            .update_queue(|queue| {
                let removed = queue.scenarios.len();
                queue.scenarios.clear();
                removed
            })
            .await?)
    }

    /// Launches the first queued scenario that still resolves.
    ///
    /// Entries that no longer resolve are dropped and that pruning is
    /// persisted before the chosen entry is popped and persisted, both ahead
    /// of the launch. If the start is refused as busy, the chosen entry is
    /// put back at the front.
    pub async fn start_game_server_from_queue(
        &self,
        id: ServerId,
        defer: bool,
    ) -> ControllerResult<StartOutcome> {
        let gate = if defer {
            OperationKind::StartDefer
        } else {
            OperationKind::Start
        };
        if self.flags.has(id, gate) {
            return Err(ControllerError::Busy {
                server_id: id,
                operation: gate,
            });
        }

        let resources = self.resources(id).await?;
        let queued = resources.queue().await?.scenarios;

        let mut dropped = Vec::new();
        let mut chosen: Option<(String, ScenarioFile)> = None;
        for name in queued {
            match self.catalog.resolve(&name).await {
                Ok(scenario) => {
                    if chosen.is_none() {
                        chosen = Some((name, scenario));
                    }
                }
                Err(ScenarioError::NotFound(_)) | Err(ScenarioError::UnsupportedExtension(_)) => {
                    warn!("🗑️ Dropping unresolvable queue entry {} on {}", name, id);
                    dropped.push(name);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !dropped.is_empty() {
            resources
                .update_queue(|queue| queue.scenarios.retain(|name| !dropped.contains(name)))
                .await?;
        }

        let Some((entry, scenario)) = chosen else {
            return Err(ControllerError::QueueEmpty(id));
        };
        resources
            .update_queue(|queue| {
                if let Some(position) = queue.scenarios.iter().position(|name| *name == entry) {
                    queue.scenarios.remove(position);
                }
            })
            .await?;
        info!("📋 Dequeued {} on {}", entry, id);

        let result = if defer {
            self.start_game_server_on_scenario_deferred(id, scenario).await
        } else {
            self.start_game_server_on_scenario(id, scenario)
                .await
                .map(|()| StartOutcome::Started)
        };

        if matches!(&result, Err(e) if e.is_busy()) {
            resources
                .update_queue(|queue| queue.scenarios.insert(0, entry.clone()))
                .await?;
        }
        result
    }
}
