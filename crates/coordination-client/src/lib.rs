// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Client side of the hierarchical coordination service.
//!
//! The service offers a tree of nodes addressed by `/`-separated paths, with atomic creation,
//! ephemeral nodes bound to a session, per-parent sequential suffixes and one-shot watches.
//! Watch notifications are delivered over `tokio::sync::oneshot` channels, so the service side
//! never runs caller code: whoever awaits the receiver owns the reaction.

use std::sync::Arc;

use async_trait::async_trait;

pub mod error;
pub mod handle;
pub mod logging;
pub mod memory;

pub use error::{CoordinationError, CoordinationResult};
pub use handle::{CoordinationHandle, HandleConfig, HandleMetrics};
pub use memory::{InMemoryEnsemble, InMemorySession};

#[cfg(test)]
#[path = "unit_tests/test_utils.rs"]
pub(crate) mod test_utils;

pub const PATH_SEPARATOR: char = '/';

/// Number of digits of the suffix appended to sequential nodes.
pub const SEQUENCE_DIGITS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchEvent {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    /// The session that registered the watch went away before anything happened.
    SessionClosed,
}

pub type WatchReceiver = tokio::sync::oneshot::Receiver<WatchEvent>;

/// One session against the coordination service.
///
/// Implementations are not required to support concurrent in-flight calls on one session;
/// [`CoordinationHandle`] serializes access.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    fn session_id(&self) -> u64;

    fn is_connected(&self) -> bool;

    /// Creates `path` and returns the path actually created, which differs from `path` for
    /// sequential nodes. The parent must exist.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode)
        -> CoordinationResult<String>;

    /// Same as [`CoordinationClient::create`], creating missing ancestors as empty persistent
    /// nodes first.
    async fn create_all(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordinationResult<String>;

    async fn get(&self, path: &str) -> CoordinationResult<Vec<u8>>;

    /// Node data together with its version. Versions are unique across the service, so a node
    /// that is deleted and created again never reports a version it had before.
    async fn get_with_version(&self, path: &str) -> CoordinationResult<(Vec<u8>, u64)>;

    async fn set(&self, path: &str, data: &[u8]) -> CoordinationResult;

    /// Sets the data only if the node is still at `version`, failing with `BadVersion` otherwise.
    async fn set_if_version(&self, path: &str, data: &[u8], version: u64) -> CoordinationResult;

    /// Deletes a leaf node. Fails with `NotEmpty` when the node still has children.
    async fn delete(&self, path: &str) -> CoordinationResult;

    /// Deletes a leaf node only if it is still at `version`, failing with `BadVersion` otherwise.
    async fn delete_if_version(&self, path: &str, version: u64) -> CoordinationResult;

    async fn exists(&self, path: &str) -> CoordinationResult<bool>;

    /// Names (not paths) of the children of `path`, in no particular order.
    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>>;

    /// Reports whether `path` exists and registers a one-shot watch which fires on the next
    /// creation, deletion or data change of that node.
    async fn exists_watch(&self, path: &str) -> CoordinationResult<(bool, WatchReceiver)>;

    /// Atomically adds `delta` to the integer stored at `path`, creating it at zero.
    /// Returns the previous and the new value.
    async fn increment(&self, path: &str, delta: i64) -> CoordinationResult<(i64, i64)>;

    /// Re-attaches this session after a connection loss.
    async fn restart(&self) -> CoordinationResult;

    /// Ends the session. Its ephemeral nodes are removed.
    async fn close(&self);
}

/// Builds brand new sessions. Used when an existing session cannot be restarted.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> CoordinationResult<Arc<dyn CoordinationClient>>;
}

pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with(PATH_SEPARATOR) {
        format!("{parent}{child}")
    } else {
        format!("{parent}{PATH_SEPARATOR}{child}")
    }
}

/// Parent of `path`, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind(PATH_SEPARATOR) {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of `path`.
pub fn node_name(path: &str) -> &str {
    path.rsplit(PATH_SEPARATOR).next().unwrap_or(path)
}

/// Validates the absolute path syntax accepted by the service.
pub fn validate_path(path: &str) -> CoordinationResult {
    let invalid = || CoordinationError::InvalidPath {
        path: path.to_owned(),
    };
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with(PATH_SEPARATOR) || path.ends_with(PATH_SEPARATOR) {
        return Err(invalid());
    }
    if path[1..].split(PATH_SEPARATOR).any(str::is_empty) {
        return Err(invalid());
    }
    Ok(())
}

/// Parses the sequence suffix of a sequential node name.
pub fn sequence_suffix(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_DIGITS {
        return None;
    }
    name[name.len() - SEQUENCE_DIGITS..].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(node_name("/a/b/tx0000000003"), "tx0000000003");
        assert_eq!(sequence_suffix("tx0000000003"), Some(3));
        assert_eq!(sequence_suffix("tx3"), None);
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/a/b").is_ok());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
    }
}
