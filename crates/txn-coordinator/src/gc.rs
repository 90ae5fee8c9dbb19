// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Background collection of transactions abandoned by their owner.
//!
//! Per tenant and pass: skip unless the tenant's interval elapsed since `gclast_time`, take the
//! ephemeral `gclock`, then resolve the pending batch of every transaction older than the
//! maximum duration before invalidating it. A batch owned by someone else leaves its
//! transaction for the next pass.

use std::sync::Arc;

use coordination_client::{CoordinationError, CreateMode};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::batch::{resolve_batch, BatchResolution, BatchStore};
use crate::coordinator::{unix_time_secs, TransactionCoordinator};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::keys::TxId;
use crate::paths::decode_segment;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcPhase {
    Idle = 0,
    Scanning = 1,
    ResolvingBatch = 2,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TenantReport {
    pub collected: Vec<TxId>,
    /// Expired transactions whose batch was owned by someone else.
    pub in_progress: Vec<TxId>,
    pub applied_batches: usize,
    pub discarded_batches: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub tenants: Vec<(String, TenantReport)>,
    /// Tenants not due yet, or being collected by another process.
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

pub struct GarbageCollector {
    coordinator: Arc<TransactionCoordinator>,
    store: Arc<dyn BatchStore>,
    phase: Mutex<GcPhase>,
}

/// Running collector task. Dropping it stops the task as well.
pub struct GcHandle {
    cancel: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl GcHandle {
    pub async fn stop(self) {
        let _ = self.cancel.send(());
        if let Err(err) = self.join.await {
            error!("Garbage collector task failed: {err}");
        }
    }
}

impl GarbageCollector {
    pub fn new(coordinator: Arc<TransactionCoordinator>, store: Arc<dyn BatchStore>) -> Self {
        Self {
            coordinator,
            store,
            phase: Mutex::new(GcPhase::Idle),
        }
    }

    pub fn phase(&self) -> GcPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: GcPhase) {
        *self.phase.lock() = phase;
        self.coordinator.metrics().gc_phase.set(phase as i64);
    }

    /// Spawns the periodic collection. Wakes up at the shortest configured interval; each
    /// tenant is still only collected once its own interval elapsed.
    pub fn start(self: Arc<Self>) -> GcHandle {
        let (cancel, mut recv) = oneshot::channel();
        let period = self.coordinator.config().min_gc_interval();
        debug!(?period, "Starting transaction garbage collector");

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = self.run_once().await {
                            error!("Failed to collect transactions: {err}");
                        }
                    }
                    _ = &mut recv => break,
                }
            }
            info!("Transaction garbage collector stopped");
        });
        GcHandle { cancel, join }
    }

    pub async fn run_once(&self) -> CoordinatorResult<GcReport> {
        self.run_once_at(unix_time_secs()).await
    }

    /// One pass over every tenant, as if the clock read `now` (seconds since the epoch).
    pub async fn run_once_at(&self, now: f64) -> CoordinatorResult<GcReport> {
        let handle = self.coordinator.handle();
        let tenants = match handle.children(self.coordinator.paths().root()).await {
            Ok(children) => children,
            Err(CoordinationError::NoNode { .. }) => vec![],
            Err(err) => return Err(err.into()),
        };

        let mut report = GcReport::default();
        for encoded in tenants {
            let tenant = decode_segment(&encoded);
            match self.collect_tenant(&tenant, now).await {
                Ok(Some(tenant_report)) => report.tenants.push((tenant, tenant_report)),
                Ok(None) => report.skipped.push(tenant),
                Err(err) => {
                    error!(%tenant, "Failed to collect transactions: {err}");
                    report.failed.push(tenant);
                }
            }
        }
        self.set_phase(GcPhase::Idle);
        Ok(report)
    }

    /// Collects one tenant if it is due and no other process is collecting it.
    pub async fn collect_tenant(
        &self,
        tenant: &str,
        now: f64,
    ) -> CoordinatorResult<Option<TenantReport>> {
        let handle = self.coordinator.handle();
        let paths = self.coordinator.paths();

        let last_time_path = paths.gc_last_time(tenant);
        let last = match handle.get_string(&last_time_path).await {
            Ok(value) => value.trim().parse::<f64>().unwrap_or_default(),
            Err(CoordinationError::NoNode { .. }) => 0.0,
            Err(err) => return Err(err.into()),
        };
        let interval = self.coordinator.config().gc_interval(tenant).as_secs_f64();
        if now - last < interval {
            debug!(tenant, "garbage collection not due yet");
            return Ok(None);
        }

        let gc_lock = paths.gc_lock(tenant);
        match handle
            .create(&gc_lock, now.to_string().as_bytes(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) => {}
            Err(CoordinationError::NodeExists { .. }) => {
                debug!(tenant, "another process is collecting this tenant");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }

        let swept = self.sweep(tenant, now).await;
        self.set_phase(GcPhase::Idle);
        if let Err(err) = handle.delete_if_exists(&gc_lock).await {
            error!(tenant, "Failed to release the garbage collection lock: {err}");
        }
        let report = swept?;

        handle
            .update_node(&last_time_path, now.to_string().as_bytes())
            .await?;
        let metrics = self.coordinator.metrics();
        metrics.gc_passes.inc();
        if !report.collected.is_empty() {
            info!(
                tenant,
                collected = report.collected.len(),
                "collected expired transactions"
            );
        }
        Ok(Some(report))
    }

    async fn sweep(&self, tenant: &str, now: f64) -> CoordinatorResult<TenantReport> {
        let max_duration = self.coordinator.config().max_tx_duration().as_secs_f64();
        let metrics = self.coordinator.metrics();
        let mut report = TenantReport::default();

        self.set_phase(GcPhase::Scanning);
        for txid in self.coordinator.get_current_transactions(tenant).await? {
            let Some(started) = self.coordinator.transaction_start_time(tenant, txid).await?
            else {
                continue;
            };
            if now - started <= max_duration {
                continue;
            }

            self.set_phase(GcPhase::ResolvingBatch);
            let resolution = resolve_batch(self.store.as_ref(), tenant, txid).await;
            self.set_phase(GcPhase::Scanning);
            match resolution {
                Ok(BatchResolution::Applied { keys }) => {
                    for key in &keys {
                        self.coordinator
                            .set_valid_version(tenant, key, txid)
                            .await?;
                    }
                    metrics.gc_batches.with_label_values(&["applied"]).inc();
                    report.applied_batches += 1;
                }
                Ok(BatchResolution::Discarded) => {
                    metrics.gc_batches.with_label_values(&["discarded"]).inc();
                    report.discarded_batches += 1;
                }
                Ok(BatchResolution::NoBatch) => {}
                Err(CoordinatorError::BatchInProgress { .. }) => {
                    warn!(tenant, txid, "Batch is being resolved elsewhere, skipping");
                    metrics.gc_batches.with_label_values(&["in_progress"]).inc();
                    report.in_progress.push(txid);
                    continue;
                }
                Err(err) => return Err(err),
            }

            if self
                .coordinator
                .notify_failed_transaction(tenant, txid)
                .await?
            {
                metrics.gc_collected_transactions.inc();
                report.collected.push(txid);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
#[path = "unit_tests/gc_tests.rs"]
mod gc_tests;
