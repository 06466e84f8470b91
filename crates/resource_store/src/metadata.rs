//! Scenario metadata catalog
//!
//! Play, win and loss counters per scenario name, stored as a single JSON
//! document shared by every server id.

use crate::directory::ResourceDirectory;
use crate::error::StorageResult;
use crate::path_lock::PathLockRegistry;
use event_system::{current_timestamp, ScenarioProgress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScenarioMetadata {
    pub plays: u64,
    pub wins: u64,
    pub losses: u64,
    pub last_played: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct MetadataDocument {
    scenarios: BTreeMap<String, ScenarioMetadata>,
}

#[derive(Debug)]
pub struct ScenarioMetadataStore {
    dir: ResourceDirectory,
}

impl ScenarioMetadataStore {
    pub async fn open(registry: &PathLockRegistry, catalog_dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = ResourceDirectory::open(registry, catalog_dir).await?;
        Ok(Self { dir })
    }

    /// Counters for `scenario`; an unknown scenario has all counters at zero.
    pub async fn get(&self, scenario: &str) -> StorageResult<ScenarioMetadata> {
        let document: MetadataDocument = self.dir.read_json(METADATA_FILE).await?;
        Ok(document.scenarios.get(scenario).cloned().unwrap_or_default())
    }

    pub async fn all(&self) -> StorageResult<BTreeMap<String, ScenarioMetadata>> {
        let document: MetadataDocument = self.dir.read_json(METADATA_FILE).await?;
        Ok(document.scenarios)
    }

    /// Bumps the play counter and stamps the play time.
    pub async fn record_play(&self, scenario: &str) -> StorageResult<ScenarioMetadata> {
        let updated = self
            .dir
            .update_json(METADATA_FILE, |document: &mut MetadataDocument| {
                let entry = document.scenarios.entry(scenario.to_string()).or_default();
                entry.plays += 1;
                entry.last_played = Some(current_timestamp());
                entry.clone()
            })
            .await?;
        debug!("🎮 {} played {} times", scenario, updated.plays);
        Ok(updated)
    }

    /// Tallies a win for `Completed` or a loss for `Failed`.
    ///
    /// Returns `None` without writing when the outcome is not terminal.
    pub async fn record_outcome(
        &self,
        scenario: &str,
        outcome: ScenarioProgress,
    ) -> StorageResult<Option<ScenarioMetadata>> {
        if !outcome.is_terminal() {
            return Ok(None);
        }

        let updated = self
            .dir
            .update_json(METADATA_FILE, |document: &mut MetadataDocument| {
                let entry = document.scenarios.entry(scenario.to_string()).or_default();
                match outcome {
                    ScenarioProgress::Completed => entry.wins += 1,
                    ScenarioProgress::Failed => entry.losses += 1,
                    ScenarioProgress::InProgress => {}
                }
                entry.clone()
            })
            .await?;
        debug!(
            "🏁 {} now at {} wins / {} losses",
            scenario, updated.wins, updated.losses
        );
        Ok(Some(updated))
    }
}
