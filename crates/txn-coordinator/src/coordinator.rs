// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use coordination_client::{
    node_name, parent_path, CoordinationError, CoordinationHandle, CreateMode,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::CoordinatorConfig;
use crate::error::{fp_ensure, CoordinatorError, CoordinatorResult};
use crate::group_lock::GroupLock;
use crate::keys::{EntityKey, TxId};
use crate::metrics::CoordinatorMetrics;
use crate::paths::{
    decode_updated_key, encode_updated_key, is_transaction_node, join_lock_list, parse_txid,
    parse_txid_value, split_lock_list, PathScheme, CONTENDER_MARKER, TX_UPDATED_KEY_PREFIX,
};

/// Attempts at allocating a transaction id: a node numbered `0` is discarded once.
const ALLOCATION_ATTEMPTS: usize = 2;

pub(crate) fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

/// Lock namespace an entry of a lock list belongs to. Ordered acquisitions record their
/// contender node, single-path ones the namespace itself.
fn lock_group(entry: &str) -> &str {
    if node_name(entry).contains(CONTENDER_MARKER) {
        parent_path(entry).unwrap_or(entry)
    } else {
        entry
    }
}

/// Transaction ids, entity group locks, and the validity bookkeeping of every tenant.
///
/// Instances hold no transaction state of their own: everything lives in the coordination
/// tree, so any number of processes can serve the same tenants concurrently.
pub struct TransactionCoordinator {
    handle: Arc<CoordinationHandle>,
    paths: PathScheme,
    locks: GroupLock,
    config: CoordinatorConfig,
    metrics: Arc<CoordinatorMetrics>,
}

impl TransactionCoordinator {
    pub fn new(
        handle: Arc<CoordinationHandle>,
        config: CoordinatorConfig,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        let paths = PathScheme::new(config.root_path.clone());
        let locks = GroupLock::new(
            handle.clone(),
            paths.clone(),
            metrics.clone(),
            config.max_lock_retries,
        );
        Self {
            handle,
            paths,
            locks,
            config,
            metrics,
        }
    }

    pub fn paths(&self) -> &PathScheme {
        &self.paths
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn handle(&self) -> &Arc<CoordinationHandle> {
        &self.handle
    }

    pub(crate) fn metrics(&self) -> &Arc<CoordinatorMetrics> {
        &self.metrics
    }

    /// Allocates a new transaction id for `tenant`. Never returns `0`.
    #[instrument(level = "debug", skip(self))]
    pub async fn begin(&self, tenant: &str, is_xg: bool) -> CoordinatorResult<TxId> {
        let prefix = self.paths.transaction_prefix(tenant);
        let allocation_failed = |err: CoordinationError| {
            error!(tenant, "Unable to allocate a transaction id: {err}");
            CoordinatorError::TransactionAllocation {
                tenant: tenant.to_owned(),
            }
        };

        for _ in 0..ALLOCATION_ATTEMPTS {
            let created = self
                .create_transaction_node(tenant, &prefix)
                .await
                .map_err(allocation_failed)?;
            let txid = parse_txid(node_name(&created)).ok_or_else(|| {
                CoordinatorError::TransactionAllocation {
                    tenant: tenant.to_owned(),
                }
            })?;

            if txid == 0 {
                warn!(tenant, "Discarding transaction node with sequence 0");
                self.handle
                    .delete_if_exists(&created)
                    .await
                    .map_err(allocation_failed)?;
                continue;
            }

            if is_xg {
                self.handle
                    .create(&self.paths.xg(tenant, txid), &[], CreateMode::Persistent)
                    .await
                    .map_err(allocation_failed)?;
            }
            self.metrics.transactions_begun.inc();
            debug!(tenant, txid, is_xg, "began transaction");
            return Ok(txid);
        }

        Err(CoordinatorError::TransactionAllocation {
            tenant: tenant.to_owned(),
        })
    }

    /// Creates the next sequential transaction node below `prefix`. A create whose reply was
    /// lost may have made a node nobody refers to; it expires and is collected like any
    /// abandoned transaction.
    async fn create_transaction_node(
        &self,
        tenant: &str,
        prefix: &str,
    ) -> Result<String, CoordinationError> {
        let config = self.handle.config();
        let mut attempt = 0;
        let mut parent_ensured = false;
        loop {
            let timestamp = unix_time_secs().to_string();
            match self
                .handle
                .create_once(prefix, timestamp.as_bytes(), CreateMode::PersistentSequential)
                .await
            {
                Err(CoordinationError::NoNode { .. }) if !parent_ensured => {
                    if let Some(parent) = parent_path(prefix) {
                        self.handle.ensure_path(parent).await?;
                    }
                    parent_ensured = true;
                }
                Err(err) if err.is_transient() && attempt < config.operation_retries => {
                    warn!(tenant, attempt, "Retrying transaction allocation: {err}");
                    attempt += 1;
                    tokio::time::sleep(config.retry_delay).await;
                }
                result => return result,
            }
        }
    }

    /// Locks the entity group of `key` for `txid` without waiting.
    ///
    /// Holding the group already is a success. A non cross-group transaction cannot add a
    /// second group, and a cross-group one cannot exceed `max_groups_for_xg`.
    #[instrument(level = "debug", skip(self), fields(key = %key))]
    pub async fn acquire_lock(
        &self,
        tenant: &str,
        txid: TxId,
        key: &EntityKey,
    ) -> CoordinatorResult<bool> {
        self.check_transaction(tenant, txid).await?;

        let lock_path = self.paths.group_lock(tenant, key);
        let held = self.held_locks(tenant, txid).await?.unwrap_or_default();
        if held.iter().any(|entry| lock_group(entry) == lock_path) {
            return Ok(true);
        }
        if !held.is_empty() && !self.is_xg(tenant, txid).await? {
            self.metrics
                .lock_conflicts
                .with_label_values(&["cross_group"])
                .inc();
            return Err(CoordinatorError::CrossGroupNotAllowed { txid });
        }
        let max = self.config.max_groups_for_xg;
        fp_ensure!(held.len() < max, self.too_many_groups(txid));

        self.locks.acquire(tenant, txid, &lock_path).await?;

        let mut updated = held;
        updated.push(lock_path.clone());
        let recorded = async {
            fp_ensure!(updated.len() <= max, self.too_many_groups(txid));
            if self.is_blacklisted(tenant, txid).await? {
                return Err(CoordinatorError::TransactionBlacklisted { txid });
            }
            self.handle
                .update_node(
                    &self.paths.lock_list(tenant, txid),
                    join_lock_list(&updated).as_bytes(),
                )
                .await?;
            Ok::<_, CoordinatorError>(())
        }
        .await;

        if let Err(err) = recorded {
            if let Err(release_err) = self.locks.release(txid, &lock_path).await {
                error!(tenant, txid, %lock_path, "Failed to release lock: {release_err}");
            }
            return Err(err);
        }
        Ok(true)
    }

    fn too_many_groups(&self, txid: TxId) -> CoordinatorError {
        self.metrics
            .lock_conflicts
            .with_label_values(&["too_many_groups"])
            .inc();
        CoordinatorError::TooManyGroups {
            txid,
            max: self.config.max_groups_for_xg,
        }
    }

    /// Locks the entity groups of all `keys` together, waiting for them if needed, with the
    /// ordered protocol which cannot deadlock against other cross-group transactions.
    /// Returns the lock namespaces held afterwards.
    #[instrument(level = "debug", skip(self, keys, cancel), fields(keys = keys.len()))]
    pub async fn acquire_locks(
        &self,
        tenant: &str,
        txid: TxId,
        keys: &[EntityKey],
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> CoordinatorResult<Vec<String>> {
        self.check_transaction(tenant, txid).await?;

        let held = self.held_locks(tenant, txid).await?.unwrap_or_default();
        let held_groups: BTreeSet<String> = held
            .iter()
            .map(|entry| lock_group(entry).to_owned())
            .collect();
        let wanted: BTreeSet<String> = keys
            .iter()
            .map(|key| self.paths.group_lock(tenant, key))
            .collect();
        let missing: Vec<String> = wanted.difference(&held_groups).cloned().collect();
        let total = held_groups.len() + missing.len();
        if missing.is_empty() {
            return Ok(held_groups.into_iter().collect());
        }

        if total > 1 && !self.is_xg(tenant, txid).await? {
            self.metrics
                .lock_conflicts
                .with_label_values(&["cross_group"])
                .inc();
            return Err(CoordinatorError::CrossGroupNotAllowed { txid });
        }
        fp_ensure!(
            total <= self.config.max_groups_for_xg,
            self.too_many_groups(txid)
        );

        let timeout = timeout.unwrap_or_else(|| self.config.lock_timeout());
        let contenders = self
            .locks
            .acquire_ordered(txid, &missing, timeout, cancel)
            .await?;

        let mut updated = held;
        updated.extend(contenders.iter().cloned());
        let recorded = async {
            if self.is_blacklisted(tenant, txid).await? {
                return Err(CoordinatorError::TransactionBlacklisted { txid });
            }
            self.handle
                .update_node(
                    &self.paths.lock_list(tenant, txid),
                    join_lock_list(&updated).as_bytes(),
                )
                .await?;
            Ok::<_, CoordinatorError>(())
        }
        .await;
        if let Err(err) = recorded {
            if let Err(release_err) = self.locks.release_ordered(&contenders).await {
                error!(tenant, txid, "Failed to release contenders: {release_err}");
            }
            return Err(err);
        }

        Ok(held_groups.into_iter().chain(missing).collect())
    }

    /// Records that, should `txid` fail, `key` must be read at version `target`.
    #[instrument(level = "debug", skip(self), fields(key = %key))]
    pub async fn register_updated_key(
        &self,
        tenant: &str,
        txid: TxId,
        key: &EntityKey,
        target: TxId,
    ) -> CoordinatorResult {
        let valid_path = self.paths.valid_version(tenant, key);
        if self.handle.exists(&valid_path).await? {
            match self
                .handle
                .set(&valid_path, target.to_string().as_bytes())
                .await
            {
                Err(CoordinationError::NoNode { .. }) => {}
                result => return result.map_err(Into::into),
            }
        }

        fp_ensure!(
            self.handle
                .exists(&self.paths.transaction(tenant, txid))
                .await?,
            CoordinatorError::TransactionInvalid { txid }
        );
        // A retried create may append the same record twice, which reads back the same.
        match self
            .handle
            .create(
                &self.paths.updated_key_prefix(tenant, txid),
                encode_updated_key(key, target).as_bytes(),
                CreateMode::PersistentSequential,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(CoordinationError::NoNode { .. }) => {
                Err(CoordinatorError::TransactionInvalid { txid })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Version of `key` a reader must use when the newest write it found was made by
    /// `target`. `0` means no valid version exists.
    #[instrument(level = "debug", skip(self), fields(key = %key))]
    pub async fn get_valid_transaction_id(
        &self,
        tenant: &str,
        target: TxId,
        key: &EntityKey,
    ) -> CoordinatorResult<TxId> {
        if target == 0 {
            return Ok(0);
        }
        if self.is_blacklisted(tenant, target).await? {
            return Ok(self.valid_version(tenant, key).await?.unwrap_or(0));
        }
        if !self
            .handle
            .exists(&self.paths.transaction(tenant, target))
            .await?
        {
            return Ok(target);
        }

        let registered = match self.get_updated_key_list(tenant, target).await {
            Ok(registered) => registered,
            Err(CoordinatorError::TransactionInvalid { .. }) => return Ok(target),
            Err(err) => return Err(err),
        };
        if let Some((_, version)) = registered.iter().rev().find(|(k, _)| k == key) {
            return Ok(*version);
        }
        Ok(self.valid_version(tenant, key).await?.unwrap_or(target))
    }

    async fn valid_version(&self, tenant: &str, key: &EntityKey) -> CoordinatorResult<Option<TxId>> {
        match self
            .handle
            .get_string(&self.paths.valid_version(tenant, key))
            .await
        {
            Ok(value) => Ok(parse_txid_value(&value)),
            Err(CoordinationError::NoNode { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Commits `txid`: releases its locks and removes its bookkeeping. Returns whether it held
    /// any lock.
    #[instrument(level = "debug", skip(self))]
    pub async fn release_lock(&self, tenant: &str, txid: TxId) -> CoordinatorResult<bool> {
        self.check_transaction(tenant, txid).await?;

        let held = match self.held_locks(tenant, txid).await? {
            Some(held) => held,
            None => {
                if self.is_blacklisted(tenant, txid).await? {
                    return Err(CoordinatorError::TransactionBlacklisted { txid });
                }
                self.remove_transaction(tenant, txid).await?;
                return Ok(false);
            }
        };

        for entry in &held {
            self.locks.release_entry(txid, entry).await?;
        }
        self.remove_transaction(tenant, txid).await?;
        self.metrics.transactions_released.inc();
        debug!(tenant, txid, locks = held.len(), "released transaction");
        Ok(true)
    }

    async fn remove_transaction(&self, tenant: &str, txid: TxId) -> CoordinatorResult {
        self.handle
            .delete_if_exists(&self.paths.lock_list(tenant, txid))
            .await?;
        self.handle
            .delete_if_exists(&self.paths.xg(tenant, txid))
            .await?;
        self.handle
            .delete_recursive(&self.paths.transaction(tenant, txid))
            .await?;
        Ok(())
    }

    /// Invalidates `txid` for good: blacklists it, restores the previous valid version of
    /// every key it registered, releases its locks and removes it. Returns `false` when the
    /// transaction no longer exists.
    #[instrument(level = "debug", skip(self))]
    pub async fn notify_failed_transaction(
        &self,
        tenant: &str,
        txid: TxId,
    ) -> CoordinatorResult<bool> {
        let tx_path = self.paths.transaction(tenant, txid);
        if !self.handle.exists(&tx_path).await? {
            debug!(tenant, txid, "failed transaction is already gone");
            return Ok(false);
        }

        // Before anything else, so an owner finishing concurrently cannot commit.
        self.blacklist(tenant, txid).await?;

        let registered = match self.get_updated_key_list(tenant, txid).await {
            Ok(registered) => registered,
            Err(CoordinatorError::TransactionInvalid { .. }) => vec![],
            Err(err) => return Err(err),
        };
        for (key, previous) in registered {
            self.restore_valid_version(tenant, &key, previous).await?;
        }

        for entry in self.held_locks(tenant, txid).await?.unwrap_or_default() {
            if let Err(err) = self.locks.release_entry(txid, &entry).await {
                warn!(tenant, txid, %entry, "Unable to release lock of failed transaction: {err}");
            }
        }
        self.remove_transaction(tenant, txid).await?;
        self.metrics.transactions_invalidated.inc();
        info!(tenant, txid, "invalidated transaction");
        Ok(true)
    }

    async fn blacklist(&self, tenant: &str, txid: TxId) -> CoordinatorResult {
        match self
            .handle
            .create_all(
                &self.paths.blacklist(tenant, txid),
                unix_time_secs().to_string().as_bytes(),
                CreateMode::Persistent,
            )
            .await
        {
            Ok(_) | Err(CoordinationError::NodeExists { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Makes `version` the valid version of `key` unless a newer one is recorded.
    async fn restore_valid_version(
        &self,
        tenant: &str,
        key: &EntityKey,
        version: TxId,
    ) -> CoordinatorResult {
        let valid_path = self.paths.valid_version(tenant, key);
        match self.valid_version(tenant, key).await? {
            Some(current) if current >= version => Ok(()),
            Some(_) => Ok(self
                .handle
                .set(&valid_path, version.to_string().as_bytes())
                .await?),
            None => {
                self.handle
                    .update_node(&valid_path, version.to_string().as_bytes())
                    .await?;
                Ok(())
            }
        }
    }

    /// Sets the valid version of `key`, creating the entry if needed.
    pub async fn set_valid_version(
        &self,
        tenant: &str,
        key: &EntityKey,
        version: TxId,
    ) -> CoordinatorResult {
        self.handle
            .update_node(
                &self.paths.valid_version(tenant, key),
                version.to_string().as_bytes(),
            )
            .await?;
        Ok(())
    }

    pub async fn is_xg(&self, tenant: &str, txid: TxId) -> CoordinatorResult<bool> {
        Ok(self.handle.exists(&self.paths.xg(tenant, txid)).await?)
    }

    pub async fn is_blacklisted(&self, tenant: &str, txid: TxId) -> CoordinatorResult<bool> {
        Ok(self
            .handle
            .exists(&self.paths.blacklist(tenant, txid))
            .await?)
    }

    /// Fails unless `txid` exists and is not blacklisted.
    pub async fn check_transaction(&self, tenant: &str, txid: TxId) -> CoordinatorResult {
        fp_ensure!(
            !self.is_blacklisted(tenant, txid).await?,
            CoordinatorError::TransactionBlacklisted { txid }
        );
        fp_ensure!(
            self.handle
                .exists(&self.paths.transaction(tenant, txid))
                .await?,
            CoordinatorError::TransactionInvalid { txid }
        );
        Ok(())
    }

    /// Whether `txid` currently holds locks.
    pub async fn is_in_transaction(&self, tenant: &str, txid: TxId) -> CoordinatorResult<bool> {
        fp_ensure!(
            !self.is_blacklisted(tenant, txid).await?,
            CoordinatorError::TransactionBlacklisted { txid }
        );
        Ok(self
            .handle
            .exists(&self.paths.lock_list(tenant, txid))
            .await?)
    }

    /// Keys registered by `txid` with their versions, in registration order.
    pub async fn get_updated_key_list(
        &self,
        tenant: &str,
        txid: TxId,
    ) -> CoordinatorResult<Vec<(EntityKey, TxId)>> {
        let tx_path = self.paths.transaction(tenant, txid);
        let mut records: Vec<String> = match self.handle.children(&tx_path).await {
            Ok(children) => children
                .into_iter()
                .filter(|name| name.starts_with(TX_UPDATED_KEY_PREFIX))
                .collect(),
            Err(CoordinationError::NoNode { .. }) => {
                return Err(CoordinatorError::TransactionInvalid { txid })
            }
            Err(err) => return Err(err.into()),
        };
        records.sort();

        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            let path = coordination_client::join_path(&tx_path, &record);
            match self.handle.get_string(&path).await {
                Ok(value) => keys.push(decode_updated_key(&value)?),
                Err(CoordinationError::NoNode { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(keys)
    }

    /// Ids of every transaction of `tenant` still present, oldest first.
    pub async fn get_current_transactions(&self, tenant: &str) -> CoordinatorResult<Vec<TxId>> {
        let children = match self.handle.children(&self.paths.txid_root(tenant)).await {
            Ok(children) => children,
            Err(CoordinationError::NoNode { .. }) => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };
        let mut txids: Vec<TxId> = children
            .iter()
            .filter(|name| is_transaction_node(name))
            .filter_map(|name| parse_txid(name))
            .collect();
        txids.sort_unstable();
        Ok(txids)
    }

    /// Creation time of `txid` in seconds since the epoch, `None` if it is gone. A timestamp
    /// that cannot be read counts as the current time, so the transaction is never collected
    /// on its account.
    pub async fn transaction_start_time(
        &self,
        tenant: &str,
        txid: TxId,
    ) -> CoordinatorResult<Option<f64>> {
        match self
            .handle
            .get_string(&self.paths.transaction(tenant, txid))
            .await
        {
            Ok(value) => match value.trim().parse() {
                Ok(started) => Ok(Some(started)),
                Err(_) => {
                    warn!(
                        tenant,
                        txid,
                        %value,
                        "Unreadable transaction timestamp, treating it as now"
                    );
                    Ok(Some(unix_time_secs()))
                }
            },
            Err(CoordinationError::NoNode { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Entries of the lock list of `txid`, `None` if it has none.
    async fn held_locks(&self, tenant: &str, txid: TxId) -> CoordinatorResult<Option<Vec<String>>> {
        match self
            .handle
            .get_string(&self.paths.lock_list(tenant, txid))
            .await
        {
            Ok(value) => Ok(Some(split_lock_list(&value))),
            Err(CoordinationError::NoNode { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn increment_and_get_counter(
        &self,
        path: &str,
        delta: i64,
    ) -> CoordinatorResult<(i64, i64)> {
        Ok(self.handle.increment(path, delta).await?)
    }

    /// Takes a process wide singleton lock. Returns `false` if someone else holds it.
    pub async fn get_lock_with_path(&self, path: &str) -> CoordinatorResult<bool> {
        match self
            .handle
            .create(
                path,
                unix_time_secs().to_string().as_bytes(),
                CreateMode::Ephemeral,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(CoordinationError::NodeExists { .. }) => Ok(false),
            Err(CoordinationError::NoNode { .. }) => {
                error!(path, "Unable to create lock node");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn release_lock_with_path(&self, path: &str) -> CoordinatorResult {
        match self.handle.delete(path).await {
            Ok(()) => Ok(()),
            Err(CoordinationError::NoNode { .. }) => Err(CoordinatorError::LockNotHeld {
                path: path.to_owned(),
            }),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
#[path = "unit_tests/coordinator_tests.rs"]
mod coordinator_tests;
