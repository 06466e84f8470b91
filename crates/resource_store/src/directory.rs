//! Managed resource directories
//!
//! A [`ResourceDirectory`] owns one subtree of the filesystem. Every read,
//! write, rename and delete it performs runs inside the path lock of the file
//! it touches, and every path is validated against the owned subtree before
//! any lock is taken.

use crate::error::{StorageError, StorageResult};
use crate::path_lock::{PathLockRegistry, RootRegistration};
use serde::{de::DeserializeOwned, Serialize};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

pub struct ResourceDirectory {
    root: PathBuf,
    registry: PathLockRegistry,
    _registration: RootRegistration,
}

impl std::fmt::Debug for ResourceDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDirectory")
            .field("root", &self.root)
            .finish()
    }
}

impl ResourceDirectory {
    /// Opens (and creates, if missing) a managed directory.
    ///
    /// The root is canonicalized so that every lock key is a resolved path.
    pub async fn open(registry: &PathLockRegistry, root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref();
        tokio_fs::create_dir_all(root)
            .await
            .map_err(|e| StorageError::DirectoryCreate(root.to_path_buf(), e))?;
        let root = tokio_fs::canonicalize(root)
            .await
            .map_err(|e| StorageError::DirectoryRead(root.to_path_buf(), e))?;

        let registration = registry.register_root(root.clone());
        debug!("Opened resource directory {}", root.display());

        Ok(Self {
            root,
            registry: registry.clone(),
            _registration: registration,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &PathLockRegistry {
        &self.registry
    }

    /// Resolves a path relative to the root and validates ownership.
    ///
    /// Absolute paths are accepted only when they fall inside the root.
    /// Parent-directory components are rejected outright.
    pub fn resolve(&self, path: impl AsRef<Path>) -> StorageResult<PathBuf> {
        let path = path.as_ref();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(StorageError::InvalidPath(path.to_path_buf()));
        }

        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(StorageError::OutsideRoot {
                path: resolved,
                root: self.root.clone(),
            });
        }

        if let Some(owner) = self.registry.foreign_owner(&self.root, &resolved) {
            return Err(StorageError::ForeignOwner {
                path: resolved,
                owner,
            });
        }

        Ok(resolved)
    }

    /// Creates a subdirectory inside the root and returns its absolute path.
    pub async fn ensure_dir(&self, path: impl AsRef<Path>) -> StorageResult<PathBuf> {
        let dir = self.resolve(path)?;
        tokio_fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::DirectoryCreate(dir.clone(), e))?;
        Ok(dir)
    }

    /// Reads a JSON document, returning its default when the file is absent.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn read_json<T>(&self, path: &str) -> StorageResult<T>
    where
        T: DeserializeOwned + Default,
    {
        let file = self.resolve(path)?;
        let lock = self.registry.acquire(file.clone());
        let _guard = lock.lock().await;
        read_document(&file).await
    }

    /// Replaces a JSON document atomically.
    #[instrument(skip(self, value), fields(root = %self.root.display()))]
    pub async fn write_json<T>(&self, path: &str, value: &T) -> StorageResult<()>
    where
        T: Serialize,
    {
        let file = self.resolve(path)?;
        let lock = self.registry.acquire(file.clone());
        let _guard = lock.lock().await;
        write_document(&file, value).await
    }

    /// Read-modify-write of a JSON document inside one critical section.
    pub async fn update_json<T, F, R>(&self, path: &str, mutate: F) -> StorageResult<R>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> R,
    {
        self.try_update_json(path, |doc: &mut T| Ok::<R, StorageError>(mutate(doc)))
            .await
    }

    /// Like [`update_json`](Self::update_json) but the mutation may refuse.
    ///
    /// When `mutate` returns an error nothing is written.
    pub async fn try_update_json<T, F, R, E>(&self, path: &str, mutate: F) -> Result<R, E>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> Result<R, E>,
        E: From<StorageError>,
    {
        let file = self.resolve(path)?;
        let lock = self.registry.acquire(file.clone());
        let _guard = lock.lock().await;

        let mut document: T = read_document(&file).await?;
        let result = mutate(&mut document)?;
        write_document(&file, &document).await?;
        Ok(result)
    }

    /// Deletes a file. Returns whether anything was removed.
    pub async fn remove(&self, path: impl AsRef<Path>) -> StorageResult<bool> {
        let file = self.resolve(path)?;
        let lock = self.registry.acquire(file.clone());
        let _guard = lock.lock().await;

        match tokio_fs::remove_file(&file).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::FileDelete(file, e)),
        }
    }

    /// Renames a file within the root.
    ///
    /// Both paths are validated first; the two locks are then taken in path
    /// order so that concurrent renames cannot deadlock.
    pub async fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> StorageResult<()> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;

        let (first, second) = if from <= to {
            (from.clone(), to.clone())
        } else {
            (to.clone(), from.clone())
        };
        let first_lock = self.registry.acquire(first);
        let second_lock = (from != to).then(|| self.registry.acquire(second));

        let _first_guard = first_lock.lock().await;
        let _second_guard = match &second_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        tokio_fs::rename(&from, &to)
            .await
            .map_err(|e| StorageError::FileRename(from, to, e))
    }

    pub async fn exists(&self, path: impl AsRef<Path>) -> StorageResult<bool> {
        let file = self.resolve(path)?;
        let lock = self.registry.acquire(file.clone());
        let _guard = lock.lock().await;
        Ok(tokio_fs::try_exists(&file).await.unwrap_or(false))
    }
}

async fn read_document<T>(file: &Path) -> StorageResult<T>
where
    T: DeserializeOwned + Default,
{
    match tokio_fs::read_to_string(file).await {
        Ok(contents) if contents.trim().is_empty() => Ok(T::default()),
        Ok(contents) => serde_json::from_str(&contents)
            .map_err(|e| StorageError::Deserialization(file.to_path_buf(), e)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(StorageError::FileRead(file.to_path_buf(), e)),
    }
}

async fn write_document<T>(file: &Path, value: &T) -> StorageResult<()>
where
    T: Serialize,
{
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| StorageError::Serialization(file.to_path_buf(), e))?;

    if let Some(parent) = file.parent() {
        tokio_fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::DirectoryCreate(parent.to_path_buf(), e))?;
    }

    let mut temp_name = file.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut handle = tokio_fs::File::create(&temp_path)
        .await
        .map_err(|e| StorageError::FileWrite(temp_path.clone(), e))?;
    handle
        .write_all(json.as_bytes())
        .await
        .map_err(|e| StorageError::FileWrite(temp_path.clone(), e))?;
    handle
        .sync_all()
        .await
        .map_err(|e| StorageError::FileWrite(temp_path.clone(), e))?;
    drop(handle);

    // Atomic rename
    tokio_fs::rename(&temp_path, file)
        .await
        .map_err(|e| StorageError::FileRename(temp_path, file.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        #[serde(default)]
        value: u32,
        #[serde(default)]
        history: Vec<String>,
    }

    #[tokio::test]
    async fn test_missing_document_reads_as_default() {
        let temp = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();
        let dir = ResourceDirectory::open(&registry, temp.path().join("s1"))
            .await
            .unwrap();

        let counter: Counter = dir.read_json("counter.json").await.unwrap();
        assert_eq!(counter, Counter::default());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();
        let dir = ResourceDirectory::open(&registry, temp.path()).await.unwrap();

        let counter = Counter {
            value: 4,
            history: vec!["a".to_string()],
        };
        dir.write_json("counter.json", &counter).await.unwrap();
        let loaded: Counter = dir.read_json("counter.json").await.unwrap();
        assert_eq!(loaded, counter);
        assert!(!dir.exists("counter.json.tmp").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_root() {
        let temp = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();
        let dir = ResourceDirectory::open(&registry, temp.path().join("s1"))
            .await
            .unwrap();

        assert!(matches!(
            dir.resolve("../s2/status.json"),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            dir.resolve("/etc/passwd"),
            Err(StorageError::OutsideRoot { .. })
        ));
        assert_eq!(registry.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_rejects_paths_owned_by_nested_directory() {
        let temp = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();
        let outer = ResourceDirectory::open(&registry, temp.path()).await.unwrap();
        let _inner = ResourceDirectory::open(&registry, temp.path().join("s1"))
            .await
            .unwrap();

        let err = outer
            .write_json("s1/status.json", &Counter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ForeignOwner { .. }));
    }

    #[tokio::test]
    async fn test_two_objects_on_same_root_share_locks() {
        let temp = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();
        let a = ResourceDirectory::open(&registry, temp.path()).await.unwrap();
        let b = ResourceDirectory::open(&registry, temp.path()).await.unwrap();

        // Same root is not a foreign owner.
        a.write_json("shared.json", &Counter::default()).await.unwrap();
        let loaded: Counter = b.read_json("shared.json").await.unwrap();
        assert_eq!(loaded.value, 0);

        let la = registry.acquire(a.resolve("shared.json").unwrap());
        let lb = registry.acquire(b.resolve("shared.json").unwrap());
        assert!(la.same_lock(&lb));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_never_lose_writes() {
        let temp = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();
        let dir = Arc::new(ResourceDirectory::open(&registry, temp.path()).await.unwrap());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let dir = dir.clone();
            tasks.push(tokio::spawn(async move {
                dir.update_json("counter.json", |c: &mut Counter| {
                    c.value += 1;
                    c.history.push(format!("writer-{i}"));
                })
                .await
                .unwrap();
            }));
        }
        futures::future::join_all(tasks).await;

        let counter: Counter = dir.read_json("counter.json").await.unwrap();
        assert_eq!(counter.value, 16);
        assert_eq!(counter.history.len(), 16);
        assert_eq!(registry.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_refused_update_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();
        let dir = ResourceDirectory::open(&registry, temp.path()).await.unwrap();

        let result: Result<(), StorageError> = dir
            .try_update_json("counter.json", |c: &mut Counter| {
                c.value = 99;
                Err(StorageError::InvalidPath(PathBuf::from("refused")))
            })
            .await;
        assert!(result.is_err());
        assert!(!dir.exists("counter.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_and_remove() {
        let temp = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();
        let dir = ResourceDirectory::open(&registry, temp.path()).await.unwrap();

        dir.write_json("a.json", &Counter::default()).await.unwrap();
        dir.rename("a.json", "b.json").await.unwrap();
        assert!(!dir.exists("a.json").await.unwrap());
        assert!(dir.remove("b.json").await.unwrap());
        assert!(!dir.remove("b.json").await.unwrap());
    }
}
