//! Error types for the resource store

use std::{io::Error as IoError, path::PathBuf};
use thiserror::Error;

/// Failures raised while validating or touching a persisted resource.
///
/// Validation variants (`OutsideRoot`, `ForeignOwner`, `InvalidPath`) are
/// raised before any lock is taken. I/O variants are raised from inside a
/// critical section; the lock is released as the guard unwinds.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create directory {0}: {1}")]
    DirectoryCreate(PathBuf, IoError),

    #[error("Failed to read directory {0}: {1}")]
    DirectoryRead(PathBuf, IoError),

    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, IoError),

    #[error("Failed to write to file {0}: {1}")]
    FileWrite(PathBuf, IoError),

    #[error("Failed to rename file from {0} to {1}: {2}")]
    FileRename(PathBuf, PathBuf, IoError),

    #[error("Failed to delete file {0}: {1}")]
    FileDelete(PathBuf, IoError),

    #[error("Failed to serialize document {0}: {1}")]
    Serialization(PathBuf, serde_json::Error),

    #[error("Failed to deserialize file {0}: {1}")]
    Deserialization(PathBuf, serde_json::Error),

    #[error("Path {path} is outside the managed root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("Path {path} is managed by another resource directory rooted at {owner}")]
    ForeignOwner { path: PathBuf, owner: PathBuf },

    #[error("Invalid resource path: {0}")]
    InvalidPath(PathBuf),
}

pub type StorageResult<T> = Result<T, StorageError>;
