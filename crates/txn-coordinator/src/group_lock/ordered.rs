// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ordered acquisition of several entity groups at once.
//!
//! Each attempt queues one ephemeral sequential contender per group and waits until all of
//! them are at the head of their queue. While waiting on several groups, a contender that
//! finds an older transaction (smaller txid) queued ahead of it on a group it does not hold
//! yet backs off: it withdraws every contender, waits for that transaction to move, and starts
//! over. Of two transactions contending in opposite order exactly one is younger, so they can
//! never wait on each other.

use std::collections::BTreeSet;
use std::time::Duration;

use coordination_client::{join_path, parent_path, CoordinationError, CreateMode};
use futures::future::select_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::GroupLock;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::keys::TxId;
use crate::paths::{contender_prefix, is_contender_of, parse_txid_value};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// An older transaction is queued ahead; withdraw and retry once `wait_for` changes.
    MustRetry { wait_for: String },
    TimedOut,
    Cancelled,
}

/// Contender nodes created by one attempt.
struct Attempt {
    prefix: String,
    contenders: Vec<(String, String)>,
}

impl Attempt {
    fn new() -> Self {
        Self {
            prefix: contender_prefix(Uuid::new_v4()),
            contenders: vec![],
        }
    }

    fn contender_paths(&self) -> Vec<String> {
        self.contenders
            .iter()
            .map(|(_, contender)| contender.clone())
            .collect()
    }
}

enum QueuePosition {
    Head,
    Blocked(Blocked),
    /// Our contender is gone, most likely with an expired session.
    Missing,
}

/// What stands between a contender and the head of one queue.
struct Blocked {
    /// Node to watch: the immediate predecessor, or the namespace while a single-path
    /// holder owns it.
    wait_on: String,
    /// Earlier contenders of the queue.
    predecessors: Vec<String>,
}

impl GroupLock {
    /// Acquires every lock namespace in `lock_paths` together and returns the contender nodes
    /// now owned by `txid`. Fails with `LockTimeout` once `timeout` elapses or the attempt
    /// budget is spent, and with `Cancelled` when `cancel` fires. Nothing created by a failed
    /// call is left behind.
    #[instrument(level = "debug", skip_all, fields(txid = txid, groups = lock_paths.len()))]
    pub async fn acquire_ordered(
        &self,
        txid: TxId,
        lock_paths: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CoordinatorResult<Vec<String>> {
        let lock_paths: Vec<String> = lock_paths
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let started = Instant::now();
        let deadline = started + timeout;

        for restart in 0..=self.max_lock_retries {
            let mut attempt = Attempt::new();
            let outcome = self
                .try_acquire(txid, &lock_paths, &mut attempt, deadline, cancel)
                .await;

            let outcome = match outcome {
                Ok(AcquireOutcome::Acquired) => {
                    self.metrics
                        .locks_acquired
                        .with_label_values(&["ordered"])
                        .inc_by(lock_paths.len() as u64);
                    self.metrics
                        .lock_wait_latency
                        .observe(started.elapsed().as_secs_f64());
                    debug!(txid, restart, "acquired ordered locks");
                    return Ok(attempt.contender_paths());
                }
                Ok(outcome) => outcome,
                Err(err) => {
                    self.withdraw(&attempt).await;
                    return Err(err);
                }
            };

            self.withdraw(&attempt).await;
            match outcome {
                AcquireOutcome::MustRetry { wait_for } => {
                    info!(txid, %wait_for, restart, "yielding to an older transaction");
                    self.metrics.deadlock_yields.inc();
                    match self.wait_for_change(&wait_for, deadline, cancel).await? {
                        AcquireOutcome::TimedOut => break,
                        AcquireOutcome::Cancelled => return Err(self.cancelled()),
                        _ => {}
                    }
                }
                AcquireOutcome::Cancelled => return Err(self.cancelled()),
                _ => break,
            }
        }

        self.metrics
            .lock_conflicts
            .with_label_values(&["timeout"])
            .inc();
        Err(CoordinatorError::LockTimeout)
    }

    fn cancelled(&self) -> CoordinatorError {
        self.metrics
            .lock_conflicts
            .with_label_values(&["cancelled"])
            .inc();
        CoordinatorError::Cancelled
    }

    async fn try_acquire(
        &self,
        txid: TxId,
        lock_paths: &[String],
        attempt: &mut Attempt,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> CoordinatorResult<AcquireOutcome> {
        for lock_path in lock_paths {
            let contender = self.create_contender(txid, lock_path, &attempt.prefix).await?;
            attempt.contenders.push((lock_path.clone(), contender));
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(AcquireOutcome::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(AcquireOutcome::TimedOut);
            }

            let mut blocked = vec![];
            for (lock_path, contender) in &attempt.contenders {
                match self.queue_position(lock_path, &attempt.prefix).await? {
                    QueuePosition::Head => {}
                    QueuePosition::Blocked(state) => blocked.push(state),
                    QueuePosition::Missing => {
                        return Ok(AcquireOutcome::MustRetry {
                            wait_for: contender.clone(),
                        })
                    }
                }
            }
            if blocked.is_empty() {
                return Ok(AcquireOutcome::Acquired);
            }

            if lock_paths.len() > 1 {
                if let Some(older) = self.older_predecessor(txid, &blocked).await? {
                    return Ok(AcquireOutcome::MustRetry { wait_for: older });
                }
            }

            let mut watches = Vec::with_capacity(blocked.len());
            let mut changed = false;
            for state in &blocked {
                let (exists, watch) = self.handle.exists_watch(&state.wait_on).await?;
                if !exists {
                    changed = true;
                    break;
                }
                watches.push(watch);
            }
            if changed {
                continue;
            }

            tokio::select! {
                _ = select_all(watches) => {}
                _ = cancel.cancelled() => return Ok(AcquireOutcome::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Ok(AcquireOutcome::TimedOut),
            }
        }
    }

    /// Creates the contender of this attempt below `lock_path`. Each create is attempted once:
    /// after a transient failure the attempt prefix tells whether the lost create was applied,
    /// and only if it was not is the create issued again.
    async fn create_contender(
        &self,
        txid: TxId,
        lock_path: &str,
        prefix: &str,
    ) -> CoordinatorResult<String> {
        self.handle.ensure_path(lock_path).await?;
        let node = join_path(lock_path, prefix);
        let value = txid.to_string();
        let config = self.handle.config();
        let mut attempt = 0;
        loop {
            let err = match self
                .handle
                .create_once(&node, value.as_bytes(), CreateMode::EphemeralSequential)
                .await
            {
                Ok(contender) => return Ok(contender),
                Err(err) => err,
            };
            if err.is_transient() {
                if let Some(own) = self.find_own(lock_path, prefix).await? {
                    debug!(txid, %own, "contender created before the connection was lost");
                    return Ok(own);
                }
            }
            if attempt >= config.operation_retries {
                return Err(err.into());
            }
            attempt += 1;
            match err {
                // A single-path acquirer removed the namespace in between.
                CoordinationError::NoNode { .. } => self.handle.ensure_path(lock_path).await?,
                err if err.is_transient() => tokio::time::sleep(config.retry_delay).await,
                err => return Err(err.into()),
            }
        }
    }

    async fn find_own(&self, lock_path: &str, prefix: &str) -> CoordinatorResult<Option<String>> {
        Ok(self
            .sorted_contenders(lock_path)
            .await?
            .into_iter()
            .find(|name| is_contender_of(name, prefix))
            .map(|name| join_path(lock_path, &name)))
    }

    async fn queue_position(
        &self,
        lock_path: &str,
        prefix: &str,
    ) -> CoordinatorResult<QueuePosition> {
        let holder = match self.handle.get_string(lock_path).await {
            Ok(data) => parse_txid_value(&data),
            Err(CoordinationError::NoNode { .. }) => return Ok(QueuePosition::Missing),
            Err(err) => return Err(err.into()),
        };
        let queue = match self.sorted_contenders(lock_path).await {
            Ok(queue) => queue,
            Err(CoordinatorError::Internal(CoordinationError::NoNode { .. })) => {
                return Ok(QueuePosition::Missing)
            }
            Err(err) => return Err(err),
        };
        let Some(position) = queue.iter().position(|name| is_contender_of(name, prefix)) else {
            return Ok(QueuePosition::Missing);
        };

        let predecessors: Vec<String> = queue[..position]
            .iter()
            .map(|name| join_path(lock_path, name))
            .collect();
        let wait_on = match (holder, predecessors.last()) {
            (Some(_), _) => lock_path.to_owned(),
            (None, Some(previous)) => previous.clone(),
            (None, None) => return Ok(QueuePosition::Head),
        };
        Ok(QueuePosition::Blocked(Blocked {
            wait_on,
            predecessors,
        }))
    }

    /// First contender, among those queued ahead of us on groups we do not hold yet, that
    /// belongs to an older transaction.
    async fn older_predecessor(
        &self,
        txid: TxId,
        blocked: &[Blocked],
    ) -> CoordinatorResult<Option<String>> {
        for state in blocked {
            for predecessor in &state.predecessors {
                let data = match self.handle.get_string(predecessor).await {
                    Ok(data) => data,
                    Err(CoordinationError::NoNode { .. }) => continue,
                    Err(err) => return Err(err.into()),
                };
                match parse_txid_value(&data) {
                    Some(other) if other < txid => {
                        debug!(txid, other, %predecessor, "older transaction queued ahead");
                        return Ok(Some(predecessor.clone()));
                    }
                    Some(_) => {}
                    None => warn!(%predecessor, "contender without a transaction id"),
                }
            }
        }
        Ok(None)
    }

    /// Waits until `path` is removed or changes.
    async fn wait_for_change(
        &self,
        path: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> CoordinatorResult<AcquireOutcome> {
        let (exists, watch) = self.handle.exists_watch(path).await?;
        if !exists {
            return Ok(AcquireOutcome::Acquired);
        }
        tokio::select! {
            _ = watch => Ok(AcquireOutcome::Acquired),
            _ = cancel.cancelled() => Ok(AcquireOutcome::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Ok(AcquireOutcome::TimedOut),
        }
    }

    /// Best-effort removal of everything an attempt created.
    async fn withdraw(&self, attempt: &Attempt) {
        if let Err(err) = self.release_ordered(&attempt.contender_paths()).await {
            tracing::error!(prefix = %attempt.prefix, "Failed to withdraw lock contenders: {err}");
        }
    }

    /// Deletes contender nodes, then each namespace left empty and without a single-path
    /// holder. Nodes already gone are fine.
    pub async fn release_ordered(&self, contenders: &[String]) -> CoordinatorResult {
        for contender in contenders {
            self.handle.delete_if_exists(contender).await?;
            let Some(lock_path) = parent_path(contender) else {
                continue;
            };
            match self.handle.get_string(lock_path).await {
                Ok(data) if data.is_empty() => self.delete_quietly(lock_path).await?,
                Ok(_) | Err(CoordinationError::NoNode { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
