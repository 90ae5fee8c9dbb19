// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

pub type CoordinationResult<T = ()> = Result<T, CoordinationError>;

/// Errors surfaced by a coordination service session.
///
/// The first group are definitive answers about the tree and are never worth retrying.
/// The rest describe the connection and may succeed on a later attempt.
#[derive(Eq, PartialEq, Clone, Debug, Error, Hash)]
pub enum CoordinationError {
    #[error("Node {path} does not exist")]
    NoNode { path: String },
    #[error("Node {path} already exists")]
    NodeExists { path: String },
    #[error("Node {path} has children")]
    NotEmpty { path: String },
    #[error("Invalid node path: {path:?}")]
    InvalidPath { path: String },
    #[error("Node {path} was modified since version {version}")]
    BadVersion { path: String, version: u64 },

    #[error("Connection to the coordination service was lost")]
    ConnectionLoss,
    #[error("Coordination session {session_id} expired")]
    SessionExpired { session_id: u64 },
    #[error("Coordination service operation timed out")]
    OperationTimeout,
    #[error("Coordination service is unavailable")]
    Unavailable,
    #[error("Coordination client is closed")]
    Closed,
}

impl CoordinationError {
    /// Connection level failures which a fresh attempt, possibly on a new session, may fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinationError::ConnectionLoss
                | CoordinationError::SessionExpired { .. }
                | CoordinationError::OperationTimeout
                | CoordinationError::Unavailable
                | CoordinationError::Closed
        )
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordinationError::NoNode { .. })
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, CoordinationError::NodeExists { .. })
    }

    pub fn is_not_empty(&self) -> bool {
        matches!(self, CoordinationError::NotEmpty { .. })
    }

    pub fn is_bad_version(&self) -> bool {
        matches!(self, CoordinationError::BadVersion { .. })
    }
}
