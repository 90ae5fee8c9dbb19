// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use coordination_client::CoordinationError;
use thiserror::Error;

use crate::keys::TxId;

#[macro_export]
macro_rules! fp_bail {
    ($e:expr) => {
        return Err($e)
    };
}

#[macro_export(local_inner_macros)]
macro_rules! fp_ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            fp_bail!($e);
        }
    };
}
pub(crate) use fp_ensure;

pub type CoordinatorResult<T = ()> = Result<T, CoordinatorError>;

/// Errors returned by the transaction coordinator and its lock primitives.
///
/// Business failures are returned as soon as they are detected and retrying the same call
/// will not change the outcome. `Internal` wraps a coordination service failure which
/// survived the handle's retries, and `Storage` a failure of the backing store.
#[derive(Eq, PartialEq, Clone, Debug, Error)]
pub enum CoordinatorError {
    #[error("Unable to allocate a transaction id for tenant {tenant}")]
    TransactionAllocation { tenant: String },

    #[error("Lock {path} is held by transaction {holder}")]
    AlreadyLocked { path: String, holder: TxId },

    #[error("Transaction {txid} would hold more than {max} entity groups")]
    TooManyGroups { txid: TxId, max: usize },

    #[error("Transaction {txid} is not cross-group and already holds another entity group")]
    CrossGroupNotAllowed { txid: TxId },

    #[error("Transaction {txid} is blacklisted")]
    TransactionBlacklisted { txid: TxId },

    #[error("Transaction {txid} is not valid")]
    TransactionInvalid { txid: TxId },

    #[error("Timed out waiting for entity group locks")]
    LockTimeout,

    #[error("Lock acquisition was cancelled")]
    Cancelled,

    #[error("Batch of transaction {txid} for tenant {tenant} is being resolved elsewhere")]
    BatchInProgress { tenant: String, txid: TxId },

    #[error("Lock {path} is not held")]
    LockNotHeld { path: String },

    #[error("Invalid entity key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Coordination service error: {0}")]
    Internal(#[from] CoordinationError),

    #[error("Backing store error: {reason}")]
    Storage { reason: String },
}

impl CoordinatorError {
    /// Failures which say nothing about the transaction itself; re-issuing the whole
    /// transaction attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinatorError::Internal(err) => err.is_transient(),
            CoordinatorError::LockTimeout
            | CoordinatorError::BatchInProgress { .. }
            | CoordinatorError::TransactionAllocation { .. } => true,
            _ => false,
        }
    }

    pub fn is_business_failure(&self) -> bool {
        matches!(
            self,
            CoordinatorError::AlreadyLocked { .. }
                | CoordinatorError::TooManyGroups { .. }
                | CoordinatorError::CrossGroupNotAllowed { .. }
                | CoordinatorError::TransactionBlacklisted { .. }
                | CoordinatorError::TransactionInvalid { .. }
        )
    }
}

impl From<anyhow::Error> for CoordinatorError {
    fn from(err: anyhow::Error) -> Self {
        CoordinatorError::Storage {
            reason: format!("{err:#}"),
        }
    }
}
