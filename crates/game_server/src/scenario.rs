//! Scenario catalog boundary
//!
//! A [`ScenarioFile`] is an immutable launch target. The controller resolves
//! names through a [`ScenarioCatalog`]; [`DirectoryScenarioCatalog`] is the
//! directory-backed implementation. Autosave helpers read the `save/autosave`
//! folder the game writes inside a server's user-data directory.

use crate::error::ScenarioError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs as tokio_fs;
use tracing::debug;

/// File extensions the game can open.
pub const SCENARIO_EXTENSIONS: [&str; 6] = ["park", "sv6", "sc6", "sv4", "sc4", "sea"];

/// Saves written through the adapter plugin, relative to the user-data dir.
pub const SAVE_DIR: &str = "save";
/// Autosaves written by the game, relative to the user-data dir.
pub const AUTOSAVE_DIR: &str = "save/autosave";
/// Screenshots written through the adapter plugin, relative to the user-data dir.
pub const SCREENSHOT_DIR: &str = "screenshot";

/// Whether a scenario name denotes an interrupted session rather than a
/// real scenario.
pub fn is_autosave_name(name: &str) -> bool {
    name.to_ascii_lowercase().starts_with("autosave")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScenarioFile {
    path: PathBuf,
    extension: String,
    name: String,
    file_name: String,
}

impl ScenarioFile {
    /// Wraps a path, validating its extension.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ScenarioError> {
        let path = path.into();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .filter(|ext| SCENARIO_EXTENSIONS.contains(&ext.as_str()))
            .ok_or_else(|| ScenarioError::UnsupportedExtension(path.clone()))?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .ok_or_else(|| ScenarioError::UnsupportedExtension(path.clone()))?;
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .map(str::to_string)
            .ok_or_else(|| ScenarioError::UnsupportedExtension(path.clone()))?;

        Ok(Self {
            path,
            extension,
            name,
            file_name,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lower-cased extension, used for validation only.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Display name (file stem).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File name as it is on disk; this is what status documents record.
    pub fn file_name(&self) -> String {
        self.file_name.clone()
    }

    pub fn is_autosave(&self) -> bool {
        is_autosave_name(&self.name)
    }

    fn matches(&self, query: &str) -> bool {
        let query = query.trim();
        self.name.eq_ignore_ascii_case(query) || self.file_name.eq_ignore_ascii_case(query)
    }
}

impl std::fmt::Display for ScenarioFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file_name())
    }
}

/// Lookup of launchable scenarios by name.
#[async_trait]
pub trait ScenarioCatalog: Send + Sync {
    /// Resolves a display name or file name to a scenario on disk.
    async fn resolve(&self, name: &str) -> Result<ScenarioFile, ScenarioError>;

    /// Every launchable scenario, sorted by display name.
    async fn list(&self) -> Result<Vec<ScenarioFile>, ScenarioError>;
}

/// Catalog over the files of one directory (not recursive).
#[derive(Debug, Clone)]
pub struct DirectoryScenarioCatalog {
    root: PathBuf,
}

impl DirectoryScenarioCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ScenarioCatalog for DirectoryScenarioCatalog {
    async fn resolve(&self, name: &str) -> Result<ScenarioFile, ScenarioError> {
        self.list()
            .await?
            .into_iter()
            .find(|scenario| scenario.matches(name))
            .ok_or_else(|| ScenarioError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<ScenarioFile>, ScenarioError> {
        let mut scenarios: Vec<ScenarioFile> = scan_dir(&self.root)
            .await?
            .into_iter()
            .map(|(scenario, _)| scenario)
            .collect();
        scenarios.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(scenarios)
    }
}

/// Launchable files of `dir` with their recency. A missing directory is empty.
async fn scan_dir(dir: &Path) -> Result<Vec<(ScenarioFile, SystemTime)>, ScenarioError> {
    let mut entries = match tokio_fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ScenarioError::Io(dir.to_path_buf(), e)),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ScenarioError::Io(dir.to_path_buf(), e))?
    {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(scenario) = ScenarioFile::from_path(entry.path()) else {
            continue;
        };
        let stamp = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((scenario, stamp));
    }
    Ok(found)
}

/// Autosaves under `data_dir`, most recent first.
pub async fn list_autosaves(data_dir: &Path) -> Result<Vec<ScenarioFile>, ScenarioError> {
    let mut autosaves = scan_dir(&data_dir.join(AUTOSAVE_DIR)).await?;
    autosaves.sort_by(|a, b| b.1.cmp(&a.1));
    debug!("Found {} autosaves in {}", autosaves.len(), data_dir.display());
    Ok(autosaves.into_iter().map(|(scenario, _)| scenario).collect())
}

/// The `index`-th most recent autosave; index 0 is the latest.
pub async fn nth_latest_autosave(data_dir: &Path, index: usize) -> Result<ScenarioFile, ScenarioError> {
    let autosaves = list_autosaves(data_dir).await?;
    let available = autosaves.len();
    autosaves
        .into_iter()
        .nth(index)
        .ok_or(ScenarioError::NoAutosave { index, available })
}

/// Locates a save written by the plugin from its base filename.
pub async fn find_plugin_save(data_dir: &Path, base_name: &str) -> Option<ScenarioFile> {
    let save_dir = data_dir.join(SAVE_DIR);
    for extension in SCENARIO_EXTENSIONS {
        let candidate = save_dir.join(format!("{base_name}.{extension}"));
        if tokio_fs::try_exists(&candidate).await.unwrap_or(false) {
            return ScenarioFile::from_path(candidate).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_from_path_validates_extension() {
        let scenario = ScenarioFile::from_path("/parks/Forest Frontiers.SC6").unwrap();
        assert_eq!(scenario.name(), "Forest Frontiers");
        assert_eq!(scenario.extension(), "sc6");
        assert_eq!(scenario.file_name(), "Forest Frontiers.SC6");
        assert_eq!(scenario.to_string(), "Forest Frontiers.SC6");

        assert!(matches!(
            ScenarioFile::from_path("/parks/readme.txt"),
            Err(ScenarioError::UnsupportedExtension(_))
        ));
        assert!(ScenarioFile::from_path("/parks/noext").is_err());
    }

    #[test]
    fn test_autosave_names() {
        assert!(is_autosave_name("autosave_2024-01-01"));
        assert!(is_autosave_name("AutoSave.park"));
        assert!(!is_autosave_name("scenario1.park"));
    }

    #[tokio::test]
    async fn test_directory_catalog_resolves_case_insensitively() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("Forest Frontiers.sc6"), b"").unwrap();
        std::fs::write(temp.path().join("scenario1.park"), b"").unwrap();
        std::fs::write(temp.path().join("notes.txt"), b"").unwrap();

        let catalog = DirectoryScenarioCatalog::new(temp.path());
        assert_eq!(catalog.list().await.unwrap().len(), 2);
        assert_eq!(
            catalog.resolve("forest frontiers").await.unwrap().file_name(),
            "Forest Frontiers.sc6"
        );
        assert_eq!(
            catalog.resolve("SCENARIO1.PARK").await.unwrap().name(),
            "scenario1"
        );
        assert!(matches!(
            catalog.resolve("missing").await,
            Err(ScenarioError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_autosaves_sorted_latest_first() {
        let temp = TempDir::new().unwrap();
        let autosave_dir = temp.path().join(AUTOSAVE_DIR);
        std::fs::create_dir_all(&autosave_dir).unwrap();

        for name in ["autosave_1.park", "autosave_2.park", "autosave_3.park"] {
            std::fs::write(autosave_dir.join(name), b"").unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }

        let autosaves = list_autosaves(temp.path()).await.unwrap();
        let names: Vec<_> = autosaves.iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["autosave_3", "autosave_2", "autosave_1"]);

        assert_eq!(
            nth_latest_autosave(temp.path(), 1).await.unwrap().name(),
            "autosave_2"
        );
        assert!(matches!(
            nth_latest_autosave(temp.path(), 5).await,
            Err(ScenarioError::NoAutosave { index: 5, available: 3 })
        ));
    }

    #[tokio::test]
    async fn test_missing_autosave_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(list_autosaves(temp.path()).await.unwrap().is_empty());
        assert!(find_plugin_save(temp.path(), "anything").await.is_none());
    }
}
