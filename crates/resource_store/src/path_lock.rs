//! Path Mutex Registry
//!
//! A table mapping a resolved filesystem path to a reference-counted
//! exclusive lock. The registry owns no data; it only serializes access.
//! Two callers that ask for the same path receive the same lock instance, so
//! distinct objects wrapping the same directory still serialize against each
//! other. An entry is dropped once its last handle is released.
//!
//! The registry also records which managed roots exist, so that a resource
//! directory can refuse paths that belong to a nested directory owned by a
//! different object.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Mutex as AsyncMutex;
use tracing::trace;

struct LockEntry {
    mutex: Arc<AsyncMutex<()>>,
    refs: usize,
}

#[derive(Default)]
struct RegistryInner {
    locks: Mutex<HashMap<PathBuf, LockEntry>>,
    roots: Mutex<HashMap<PathBuf, usize>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process-wide table of path locks.
///
/// Cloning is cheap and yields a handle to the same table. Tests construct
/// their own registry so they never share lock state.
#[derive(Clone, Default)]
pub struct PathLockRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for PathLockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathLockRegistry")
            .field("active_locks", &self.active_locks())
            .finish()
    }
}

impl PathLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock handle for `path`, creating the entry if needed.
    ///
    /// The handle is not yet locked; call [`PathLock::lock`] to enter the
    /// critical section. Dropping the handle releases its reference.
    pub fn acquire(&self, path: impl Into<PathBuf>) -> PathLock {
        let path = path.into();
        let mutex = {
            let mut locks = guard(&self.inner.locks);
            let entry = locks.entry(path.clone()).or_insert_with(|| LockEntry {
                mutex: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            entry.mutex.clone()
        };
        trace!("acquired lock handle for {}", path.display());

        PathLock {
            inner: self.inner.clone(),
            path,
            mutex,
        }
    }

    /// Number of paths that currently have at least one live handle.
    pub fn active_locks(&self) -> usize {
        guard(&self.inner.locks).len()
    }

    /// Number of live handles for `path`.
    pub fn ref_count(&self, path: &Path) -> usize {
        guard(&self.inner.locks)
            .get(path)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }

    pub(crate) fn register_root(&self, root: PathBuf) -> RootRegistration {
        *guard(&self.inner.roots).entry(root.clone()).or_insert(0) += 1;
        RootRegistration {
            inner: self.inner.clone(),
            root,
        }
    }

    /// Finds a registered root, other than `own_root`, that is nested inside
    /// `own_root` and contains `path`.
    pub(crate) fn foreign_owner(&self, own_root: &Path, path: &Path) -> Option<PathBuf> {
        guard(&self.inner.roots)
            .keys()
            .filter(|root| root.as_path() != own_root)
            .filter(|root| root.starts_with(own_root) && path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .cloned()
    }
}

/// A reference-counted handle on one path's lock.
pub struct PathLock {
    inner: Arc<RegistryInner>,
    path: PathBuf,
    mutex: Arc<AsyncMutex<()>>,
}

impl PathLock {
    /// Waits for exclusive access to the path.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.mutex.lock().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether two handles refer to the very same lock instance.
    pub fn same_lock(&self, other: &PathLock) -> bool {
        Arc::ptr_eq(&self.mutex, &other.mutex)
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        let mut locks = guard(&self.inner.locks);
        if let Some(entry) = locks.get_mut(&self.path) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                locks.remove(&self.path);
                trace!("released last lock handle for {}", self.path.display());
            }
        }
    }
}

/// Keeps a managed root registered for as long as its directory object lives.
pub(crate) struct RootRegistration {
    inner: Arc<RegistryInner>,
    root: PathBuf,
}

impl Drop for RootRegistration {
    fn drop(&mut self) {
        let mut roots = guard(&self.inner.roots);
        if let Some(count) = roots.get_mut(&self.root) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                roots.remove(&self.root);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_same_path_shares_lock_instance() {
        let registry = PathLockRegistry::new();
        let a = registry.acquire("/srv/parks/s1/status.json");
        let b = registry.acquire("/srv/parks/s1/status.json");
        let c = registry.acquire("/srv/parks/s1/queue.json");

        assert!(a.same_lock(&b));
        assert!(!a.same_lock(&c));
        assert_eq!(registry.ref_count(Path::new("/srv/parks/s1/status.json")), 2);
        assert_eq!(registry.active_locks(), 2);
    }

    #[test]
    fn test_entry_dropped_at_zero_refs() {
        let registry = PathLockRegistry::new();
        let path = Path::new("/srv/parks/s1/startup.json");
        {
            let _a = registry.acquire(path);
            let _b = registry.acquire(path);
            assert_eq!(registry.ref_count(path), 2);
        }
        assert_eq!(registry.ref_count(path), 0);
        assert_eq!(registry.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let registry = PathLockRegistry::new();
        let first = registry.acquire("/tmp/doc.json");
        let second = registry.acquire("/tmp/doc.json");

        let held = first.lock().await;
        let blocked = tokio::time::timeout(Duration::from_millis(50), second.lock()).await;
        assert!(blocked.is_err());

        drop(held);
        let acquired = tokio::time::timeout(Duration::from_millis(50), second.lock()).await;
        assert!(acquired.is_ok());
    }

    #[test]
    fn test_foreign_owner_detection() {
        let registry = PathLockRegistry::new();
        let _outer = registry.register_root(PathBuf::from("/srv/parks"));
        let _inner = registry.register_root(PathBuf::from("/srv/parks/s1"));

        let owner = registry.foreign_owner(
            Path::new("/srv/parks"),
            Path::new("/srv/parks/s1/status.json"),
        );
        assert_eq!(owner, Some(PathBuf::from("/srv/parks/s1")));

        let own = registry.foreign_owner(
            Path::new("/srv/parks/s1"),
            Path::new("/srv/parks/s1/status.json"),
        );
        assert!(own.is_none());
    }
}
