// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Histogram,
    IntCounter, IntCounterVec, IntGauge, Registry,
};

const LOCK_WAIT_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

pub struct CoordinatorMetrics {
    pub transactions_begun: IntCounter,
    pub transactions_released: IntCounter,
    pub transactions_invalidated: IntCounter,
    pub locks_acquired: IntCounterVec,
    pub lock_conflicts: IntCounterVec,
    pub orphan_locks_cleared: IntCounter,
    pub deadlock_yields: IntCounter,
    pub lock_wait_latency: Histogram,
    pub gc_passes: IntCounter,
    pub gc_collected_transactions: IntCounter,
    pub gc_batches: IntCounterVec,
    pub gc_phase: IntGauge,
}

impl CoordinatorMetrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        let this = Self {
            transactions_begun: register_int_counter_with_registry!(
                "txn_transactions_begun",
                "Transaction ids allocated",
                registry
            )
            .unwrap(),
            transactions_released: register_int_counter_with_registry!(
                "txn_transactions_released",
                "Transactions whose locks were released by their owner",
                registry
            )
            .unwrap(),
            transactions_invalidated: register_int_counter_with_registry!(
                "txn_transactions_invalidated",
                "Transactions blacklisted after a failure or expiry",
                registry
            )
            .unwrap(),
            locks_acquired: register_int_counter_vec_with_registry!(
                "txn_locks_acquired",
                "Entity group locks acquired, by acquisition mode",
                &["mode"],
                registry
            )
            .unwrap(),
            lock_conflicts: register_int_counter_vec_with_registry!(
                "txn_lock_conflicts",
                "Rejected lock requests, by reason",
                &["reason"],
                registry
            )
            .unwrap(),
            orphan_locks_cleared: register_int_counter_with_registry!(
                "txn_orphan_locks_cleared",
                "Locks removed because their holder transaction no longer exists",
                registry
            )
            .unwrap(),
            deadlock_yields: register_int_counter_with_registry!(
                "txn_deadlock_yields",
                "Ordered acquisitions restarted to let an older transaction through",
                registry
            )
            .unwrap(),
            lock_wait_latency: register_histogram_with_registry!(
                "txn_lock_wait_latency",
                "Time spent acquiring entity group locks, in seconds",
                LOCK_WAIT_BUCKETS.to_vec(),
                registry
            )
            .unwrap(),
            gc_passes: register_int_counter_with_registry!(
                "txn_gc_passes",
                "Completed garbage collection passes over a tenant",
                registry
            )
            .unwrap(),
            gc_collected_transactions: register_int_counter_with_registry!(
                "txn_gc_collected_transactions",
                "Expired transactions invalidated by the garbage collector",
                registry
            )
            .unwrap(),
            gc_batches: register_int_counter_vec_with_registry!(
                "txn_gc_batches",
                "Pending batches resolved by the garbage collector, by outcome",
                &["outcome"],
                registry
            )
            .unwrap(),
            gc_phase: register_int_gauge_with_registry!(
                "txn_gc_phase",
                "Current garbage collector phase (0 idle, 1 scanning, 2 resolving batch)",
                registry
            )
            .unwrap(),
        };
        Arc::new(this)
    }

    pub fn new_for_test() -> Arc<Self> {
        Self::new(&Registry::new())
    }
}
