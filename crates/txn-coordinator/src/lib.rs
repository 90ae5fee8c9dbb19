// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transactions and entity group locks of a multi-tenant datastore, coordinated through a
//! hierarchical coordination service.
//!
//! Datastore processes share no memory: transaction ids, locks, the blacklist of failed
//! transactions and the valid version of each key all live in the coordination tree, laid out
//! by [`paths::PathScheme`]. The [`gc::GarbageCollector`] is the only component which cleans
//! up after an owner that never finished.

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gc;
pub mod group_lock;
pub mod keys;
pub mod metrics;
pub mod paths;

pub use batch::{BatchMutation, BatchResolution, BatchStore, InMemoryBatchStore};
pub use config::CoordinatorConfig;
pub use coordinator::TransactionCoordinator;
pub use error::{CoordinatorError, CoordinatorResult};
pub use gc::{GarbageCollector, GcHandle, GcPhase, GcReport, TenantReport};
pub use group_lock::{AcquireOutcome, GroupLock};
pub use keys::{ElementId, EntityKey, PathElement, TxId};
pub use metrics::CoordinatorMetrics;
pub use paths::PathScheme;

#[cfg(test)]
#[path = "unit_tests/test_utils.rs"]
pub(crate) mod test_utils;
