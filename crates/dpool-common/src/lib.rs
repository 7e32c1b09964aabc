//! dpool Common - Shared types and utilities
//!
//! This crate provides the replica identifiers, lifecycle states, file
//! attributes, error definitions and configuration shared by the pool
//! repository and the tools built on top of it.

pub mod config;
pub mod error;
pub mod types;

pub use config::{RepositoryConfig, StickyConfig};
pub use error::{Error, NamespaceError, Result};
pub use types::*;
