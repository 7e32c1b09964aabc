//! Error types for dpool
//!
//! This module defines the error types surfaced by the pool repository and
//! the error contract of the namespace collaborator.

use crate::types::{ReplicaId, ReplicaIdError, ReplicaState};
use std::path::PathBuf;
use thiserror::Error;

/// Common result type for repository operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the namespace service
#[derive(Debug, Clone, Error)]
pub enum NamespaceError {
    /// The file no longer exists in the namespace
    #[error("file not found in namespace: {0}")]
    NotFound(ReplicaId),

    /// The namespace could not be reached
    #[error("namespace unavailable: {0}")]
    Unavailable(String),

    /// Any other namespace failure
    #[error("namespace error: {0}")]
    Other(String),
}

impl NamespaceError {
    /// Check if the namespace reported the file as gone
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Common error type for repository operations
#[derive(Debug, Error)]
pub enum Error {
    /// Disk or serialization failure; fatal to the call, not to the pool
    #[error("repository I/O error: {context}: {source}")]
    RepositoryIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// An entry with this id already exists; use `get` instead
    #[error("entry already exists: {0}")]
    DuplicateEntry(ReplicaId),

    #[error("directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("illegal state transition: {from} -> {to}")]
    IllegalTransition { from: ReplicaState, to: ReplicaState },

    #[error("invalid replica id: {0}")]
    InvalidReplicaId(#[from] ReplicaIdError),

    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Wrap an I/O failure with a description of what was being done
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::RepositoryIo {
            context: context.into(),
            source,
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Check if this error is a repository I/O failure
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::RepositoryIo { .. })
    }

    /// Check if this error means the file is gone from the namespace
    #[must_use]
    pub const fn is_namespace_not_found(&self) -> bool {
        matches!(self, Self::Namespace(NamespaceError::NotFound(_)))
    }
}
