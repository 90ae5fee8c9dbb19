// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mutual exclusion over entity groups.
//!
//! Every entity group has one lock node under `locks/`. A single-path holder creates that node
//! with its txid as data. Ordered (cross-group) acquisitions use the same node as a namespace
//! with empty data and queue ephemeral sequential contenders below it. Each mode checks for
//! the other after writing its own node, so the two exclude each other.

use std::sync::Arc;

use coordination_client::{
    node_name, parent_path, sequence_suffix, CoordinationError, CoordinationHandle, CreateMode,
};
use tracing::{debug, warn};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::keys::TxId;
use crate::metrics::CoordinatorMetrics;
use crate::paths::{parse_txid_value, PathScheme, CONTENDER_MARKER};

mod ordered;

pub use ordered::AcquireOutcome;

/// Attempts of a single-path acquisition: the first one plus one retry after clearing a stale
/// or orphaned lock.
const SINGLE_PATH_ATTEMPTS: usize = 2;

/// Holder reported when a lock is taken but its owner could not be identified.
pub const UNKNOWN_HOLDER: TxId = 0;

pub struct GroupLock {
    handle: Arc<CoordinationHandle>,
    paths: PathScheme,
    metrics: Arc<CoordinatorMetrics>,
    max_lock_retries: u32,
}

impl GroupLock {
    pub fn new(
        handle: Arc<CoordinationHandle>,
        paths: PathScheme,
        metrics: Arc<CoordinatorMetrics>,
        max_lock_retries: u32,
    ) -> Self {
        Self {
            handle,
            paths,
            metrics,
            max_lock_retries,
        }
    }

    /// Non-blocking compare-and-create of `lock_path` on behalf of `txid`.
    ///
    /// Succeeds if the lock is free or already held by `txid`. A lock whose holder transaction
    /// no longer exists is cleared and the acquisition retried once.
    pub async fn acquire(&self, tenant: &str, txid: TxId, lock_path: &str) -> CoordinatorResult {
        let value = txid.to_string();
        let mut holder = UNKNOWN_HOLDER;
        for attempt in 0..SINGLE_PATH_ATTEMPTS {
            let last_attempt = attempt + 1 == SINGLE_PATH_ATTEMPTS;
            match self
                .handle
                .create(lock_path, value.as_bytes(), CreateMode::Persistent)
                .await
            {
                Ok(_) => {
                    self.metrics.locks_acquired.with_label_values(&["single"]).inc();
                    debug!(tenant, txid, lock_path, "acquired group lock");
                    return Ok(());
                }
                Err(CoordinationError::NodeExists { .. }) => {}
                Err(CoordinationError::NoNode { .. }) if !last_attempt => {
                    if let Some(parent) = parent_path(lock_path) {
                        self.handle.ensure_path(parent).await?;
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            let (data, version) = match self.handle.get_with_version(lock_path).await {
                Ok(read) => read,
                Err(CoordinationError::NoNode { .. }) => continue,
                Err(err) => return Err(err.into()),
            };

            match parse_txid_value(&String::from_utf8_lossy(&data)) {
                Some(current) if current == txid => return Ok(()),
                Some(current) => {
                    holder = current;
                    if last_attempt {
                        break;
                    }
                    let holder_path = self.paths.transaction(tenant, current);
                    if self.handle.exists(&holder_path).await? {
                        break;
                    }
                    warn!(
                        tenant,
                        txid,
                        lock_path,
                        holder = current,
                        "Clearing orphan lock of a transaction which no longer exists"
                    );
                    self.metrics.orphan_locks_cleared.inc();
                    self.clear_holder(lock_path, version).await?;
                }
                None => match self.first_contender(lock_path).await? {
                    Some(contender) => {
                        holder = contender;
                        break;
                    }
                    None if !last_attempt => {
                        debug!(lock_path, "removing empty lock namespace");
                        self.delete_quietly(lock_path).await?;
                    }
                    None => break,
                },
            }
        }

        self.metrics
            .lock_conflicts
            .with_label_values(&["already_locked"])
            .inc();
        Err(CoordinatorError::AlreadyLocked {
            path: lock_path.to_owned(),
            holder,
        })
    }

    /// Releases a single-path lock if it is still held by `txid`. Returns whether this call
    /// released it.
    pub async fn release(&self, txid: TxId, lock_path: &str) -> CoordinatorResult<bool> {
        let (data, version) = match self.handle.get_with_version(lock_path).await {
            Ok(read) => read,
            Err(CoordinationError::NoNode { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let data = String::from_utf8_lossy(&data);
        if parse_txid_value(&data) != Some(txid) {
            debug!(txid, lock_path, holder = %data, "lock is not held by this transaction");
            return Ok(false);
        }
        self.clear_holder(lock_path, version).await?;
        Ok(true)
    }

    /// Removes the holder of a single-path lock, provided the node is still at the `version`
    /// its holder was read at. When ordered contenders are queued below the node it cannot be
    /// deleted, so its data is cleared instead, which wakes them up.
    async fn clear_holder(&self, lock_path: &str, version: u64) -> CoordinatorResult {
        match self.handle.delete_if_version(lock_path, version).await {
            Ok(())
            | Err(CoordinationError::NoNode { .. })
            | Err(CoordinationError::BadVersion { .. }) => Ok(()),
            Err(CoordinationError::NotEmpty { .. }) => {
                match self.handle.set_if_version(lock_path, &[], version).await {
                    Ok(())
                    | Err(CoordinationError::NoNode { .. })
                    | Err(CoordinationError::BadVersion { .. }) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes a node, ignoring it being gone or having gained children meanwhile.
    async fn delete_quietly(&self, path: &str) -> CoordinatorResult {
        match self.handle.delete(path).await {
            Ok(())
            | Err(CoordinationError::NoNode { .. })
            | Err(CoordinationError::NotEmpty { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Txid of the contender at the head of an ordered lock namespace.
    async fn first_contender(&self, lock_path: &str) -> CoordinatorResult<Option<TxId>> {
        let contenders = match self.sorted_contenders(lock_path).await {
            Ok(contenders) => contenders,
            Err(CoordinatorError::Internal(CoordinationError::NoNode { .. })) => return Ok(None),
            Err(err) => return Err(err),
        };
        for contender in contenders {
            let path = coordination_client::join_path(lock_path, &contender);
            match self.handle.get_string(&path).await {
                Ok(data) => return Ok(Some(parse_txid_value(&data).unwrap_or(UNKNOWN_HOLDER))),
                Err(CoordinationError::NoNode { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    /// Contender names below `lock_path`, in queue order.
    async fn sorted_contenders(&self, lock_path: &str) -> CoordinatorResult<Vec<String>> {
        let mut contenders: Vec<String> = self
            .handle
            .children(lock_path)
            .await?
            .into_iter()
            .filter(|name| name.contains(CONTENDER_MARKER))
            .collect();
        contenders.sort_by_key(|name| sequence_suffix(name).unwrap_or(u64::MAX));
        Ok(contenders)
    }

    /// Releases a lock recorded in a transaction's lock list, whichever mode acquired it.
    pub async fn release_entry(&self, txid: TxId, entry: &str) -> CoordinatorResult {
        if node_name(entry).contains(CONTENDER_MARKER) {
            self.release_ordered(std::slice::from_ref(&entry.to_owned()))
                .await
        } else {
            self.release(txid, entry).await.map(|_| ())
        }
    }
}

#[cfg(test)]
#[path = "../unit_tests/group_lock_tests.rs"]
mod group_lock_tests;
