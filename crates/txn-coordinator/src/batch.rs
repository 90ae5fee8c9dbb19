// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pending write batches in the backing store.
//!
//! A writer stores its mutations together with a status marker (`applied = false`), flips the
//! marker to `applied = true` with a compare-and-swap, and only then applies the mutations.
//! The garbage collector resolves batches of expired transactions through the same marker,
//! so at most one of them ever owns a batch.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::keys::{EntityKey, TxId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchMutation {
    pub key: EntityKey,
    pub old_value: Option<Vec<u8>>,
    /// `None` deletes the entity.
    pub new_value: Option<Vec<u8>>,
}

#[async_trait]
pub trait BatchStore: Send + Sync + 'static {
    /// Stores the mutations of `txid` with an unapplied status marker. Returns `false` if a
    /// marker already exists, i.e. the batch was claimed by someone else.
    async fn put_batch(
        &self,
        tenant: &str,
        txid: TxId,
        mutations: Vec<BatchMutation>,
    ) -> anyhow::Result<bool>;

    /// Compare-and-swap of the marker from unapplied to applied.
    async fn try_mark_applied(&self, tenant: &str, txid: TxId) -> anyhow::Result<bool>;

    /// `None` when there is no marker, otherwise whether the batch is applied.
    async fn batch_status(&self, tenant: &str, txid: TxId) -> anyhow::Result<Option<bool>>;

    /// Inserts an unapplied marker if none exists. Returns whether it was inserted.
    async fn claim_status_absent(&self, tenant: &str, txid: TxId) -> anyhow::Result<bool>;

    /// Deletes the marker if it is still unapplied. Returns whether it was deleted.
    async fn claim_unapplied(&self, tenant: &str, txid: TxId) -> anyhow::Result<bool>;

    async fn batch_mutations(&self, tenant: &str, txid: TxId)
        -> anyhow::Result<Vec<BatchMutation>>;

    /// Writes the new values at version `txid`. Applying twice has no further effect.
    async fn apply_mutations(
        &self,
        tenant: &str,
        txid: TxId,
        mutations: &[BatchMutation],
    ) -> anyhow::Result<()>;

    /// Removes the mutations and the marker of a resolved batch.
    async fn clean_up_batch(&self, tenant: &str, txid: TxId) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchResolution {
    /// The transaction never stored a batch. The claim marker is removed again, the
    /// transaction itself being blacklisted by the collector.
    NoBatch,
    /// An unapplied batch was dropped.
    Discarded,
    /// The batch was applied; its keys are now at the transaction's version.
    Applied { keys: Vec<EntityKey> },
}

/// Takes ownership of the pending batch of `txid` and settles it. Fails with
/// `BatchInProgress` when its writer, or another collector, owns it.
pub async fn resolve_batch(
    store: &dyn BatchStore,
    tenant: &str,
    txid: TxId,
) -> CoordinatorResult<BatchResolution> {
    let in_progress = || CoordinatorError::BatchInProgress {
        tenant: tenant.to_owned(),
        txid,
    };

    match store.batch_status(tenant, txid).await? {
        None => {
            if !store.claim_status_absent(tenant, txid).await? {
                return Err(in_progress());
            }
            store.clean_up_batch(tenant, txid).await?;
            debug!(tenant, txid, "no batch to resolve");
            Ok(BatchResolution::NoBatch)
        }
        Some(false) => {
            if !store.claim_unapplied(tenant, txid).await? {
                return Err(in_progress());
            }
            store.clean_up_batch(tenant, txid).await?;
            debug!(tenant, txid, "discarded unapplied batch");
            Ok(BatchResolution::Discarded)
        }
        Some(true) => {
            let mutations = store.batch_mutations(tenant, txid).await?;
            store.apply_mutations(tenant, txid, &mutations).await?;
            store.clean_up_batch(tenant, txid).await?;
            debug!(tenant, txid, count = mutations.len(), "re-applied batch");
            Ok(BatchResolution::Applied {
                keys: mutations.into_iter().map(|mutation| mutation.key).collect(),
            })
        }
    }
}

type BatchId = (String, TxId);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEntity {
    pub value: Option<Vec<u8>>,
    pub version: TxId,
}

#[derive(Default)]
struct StoreState {
    statuses: HashMap<BatchId, bool>,
    batches: HashMap<BatchId, Vec<BatchMutation>>,
    entities: HashMap<(String, EntityKey), StoredEntity>,
}

/// Backing store kept in memory, with an entity table the batches apply to.
#[derive(Default)]
pub struct InMemoryBatchStore {
    state: Mutex<StoreState>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, tenant: &str, key: &EntityKey) -> Option<StoredEntity> {
        self.state
            .lock()
            .entities
            .get(&(tenant.to_owned(), key.clone()))
            .cloned()
    }

    pub fn has_batch(&self, tenant: &str, txid: TxId) -> bool {
        self.state
            .lock()
            .batches
            .contains_key(&(tenant.to_owned(), txid))
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn put_batch(
        &self,
        tenant: &str,
        txid: TxId,
        mutations: Vec<BatchMutation>,
    ) -> anyhow::Result<bool> {
        let id = (tenant.to_owned(), txid);
        let mut state = self.state.lock();
        if state.statuses.contains_key(&id) {
            return Ok(false);
        }
        state.statuses.insert(id.clone(), false);
        state.batches.insert(id, mutations);
        Ok(true)
    }

    async fn try_mark_applied(&self, tenant: &str, txid: TxId) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        match state.statuses.get_mut(&(tenant.to_owned(), txid)) {
            Some(applied) if !*applied => {
                *applied = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn batch_status(&self, tenant: &str, txid: TxId) -> anyhow::Result<Option<bool>> {
        Ok(self
            .state
            .lock()
            .statuses
            .get(&(tenant.to_owned(), txid))
            .copied())
    }

    async fn claim_status_absent(&self, tenant: &str, txid: TxId) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let id = (tenant.to_owned(), txid);
        if state.statuses.contains_key(&id) {
            return Ok(false);
        }
        state.statuses.insert(id, false);
        Ok(true)
    }

    async fn claim_unapplied(&self, tenant: &str, txid: TxId) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let id = (tenant.to_owned(), txid);
        if state.statuses.get(&id) == Some(&false) {
            state.statuses.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn batch_mutations(
        &self,
        tenant: &str,
        txid: TxId,
    ) -> anyhow::Result<Vec<BatchMutation>> {
        Ok(self
            .state
            .lock()
            .batches
            .get(&(tenant.to_owned(), txid))
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_mutations(
        &self,
        tenant: &str,
        txid: TxId,
        mutations: &[BatchMutation],
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        for mutation in mutations {
            let entity = state
                .entities
                .entry((tenant.to_owned(), mutation.key.clone()))
                .or_insert(StoredEntity {
                    value: None,
                    version: 0,
                });
            if entity.version <= txid {
                entity.value = mutation.new_value.clone();
                entity.version = txid;
            }
        }
        Ok(())
    }

    async fn clean_up_batch(&self, tenant: &str, txid: TxId) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let id = (tenant.to_owned(), txid);
        state.batches.remove(&id);
        state.statuses.remove(&id);
        Ok(())
    }
}
