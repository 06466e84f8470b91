//! Resource Store - path-locked persistence for the park supervisor
//!
//! Provides:
//! - A process-wide [`PathLockRegistry`] of reference-counted per-path locks
//! - [`ResourceDirectory`], a managed subtree whose every file operation runs
//!   inside the lock of the file it touches
//! - Typed per-server documents (startup options, plugin options, status,
//!   scenario queue) through [`ServerResources`]
//! - The shared [`ScenarioMetadataStore`] of play/win/loss counters
//!
//! The registry is injected, never global: callers construct one and pass it
//! to every directory they open.

pub mod directory;
pub mod documents;
pub mod error;
pub mod metadata;
pub mod path_lock;

pub use directory::ResourceDirectory;
pub use documents::*;
pub use error::{StorageError, StorageResult};
pub use metadata::{ScenarioMetadata, ScenarioMetadataStore, METADATA_FILE};
pub use path_lock::{PathLock, PathLockRegistry};
