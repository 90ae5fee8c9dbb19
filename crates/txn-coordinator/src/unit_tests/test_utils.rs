// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use coordination_client::{
    Connector, CoordinationClient, CoordinationError, CoordinationHandle, CoordinationResult,
    CreateMode, HandleMetrics, InMemoryEnsemble, InMemorySession, WatchReceiver,
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::{CoordinatorConfig, CoordinatorMetrics, EntityKey, TransactionCoordinator};

pub(crate) const TENANT: &str = "guestbook";

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        retry_delay_ms: 1,
        lock_timeout_ms: 2_000,
        ..Default::default()
    }
}

/// A coordinator with its own session, as a separate datastore process would have.
pub(crate) async fn new_coordinator(
    ensemble: &InMemoryEnsemble,
    config: CoordinatorConfig,
) -> Arc<TransactionCoordinator> {
    new_coordinator_with(Arc::new(ensemble.clone()), config).await
}

pub(crate) async fn new_coordinator_with(
    connector: Arc<dyn Connector>,
    config: CoordinatorConfig,
) -> Arc<TransactionCoordinator> {
    init_tracing();
    let handle =
        CoordinationHandle::new(connector, config.handle_config(), HandleMetrics::new_for_test())
            .await;
    Arc::new(TransactionCoordinator::new(
        Arc::new(handle),
        config,
        CoordinatorMetrics::new_for_test(),
    ))
}

pub(crate) fn key(raw: &str) -> EntityKey {
    raw.parse().unwrap()
}

/// Sessions on an in-memory ensemble whose next create in an armed mode is applied, after
/// which the reply is dropped and the caller sees `ConnectionLoss`.
pub(crate) struct LostReplyConnector {
    ensemble: InMemoryEnsemble,
    armed: Arc<Mutex<Option<CreateMode>>>,
}

impl LostReplyConnector {
    pub(crate) fn new(ensemble: &InMemoryEnsemble) -> Arc<Self> {
        Arc::new(Self {
            ensemble: ensemble.clone(),
            armed: Arc::new(Mutex::new(None)),
        })
    }

    pub(crate) fn lose_next_reply(&self, mode: CreateMode) {
        *self.armed.lock() = Some(mode);
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }
}

#[async_trait]
impl Connector for LostReplyConnector {
    async fn connect(&self) -> CoordinationResult<Arc<dyn CoordinationClient>> {
        Ok(Arc::new(LostReplySession {
            inner: self.ensemble.session()?,
            armed: self.armed.clone(),
        }))
    }
}

struct LostReplySession {
    inner: InMemorySession,
    armed: Arc<Mutex<Option<CreateMode>>>,
}

impl LostReplySession {
    fn take_armed(&self, mode: CreateMode) -> bool {
        let mut armed = self.armed.lock();
        if *armed == Some(mode) {
            *armed = None;
            return true;
        }
        false
    }
}

#[async_trait]
impl CoordinationClient for LostReplySession {
    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        let created = self.inner.create(path, data, mode).await?;
        if self.take_armed(mode) {
            return Err(CoordinationError::ConnectionLoss);
        }
        Ok(created)
    }

    async fn create_all(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        let created = self.inner.create_all(path, data, mode).await?;
        if self.take_armed(mode) {
            return Err(CoordinationError::ConnectionLoss);
        }
        Ok(created)
    }

    async fn get(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        self.inner.get(path).await
    }

    async fn get_with_version(&self, path: &str) -> CoordinationResult<(Vec<u8>, u64)> {
        self.inner.get_with_version(path).await
    }

    async fn set(&self, path: &str, data: &[u8]) -> CoordinationResult {
        self.inner.set(path, data).await
    }

    async fn set_if_version(&self, path: &str, data: &[u8], version: u64) -> CoordinationResult {
        self.inner.set_if_version(path, data, version).await
    }

    async fn delete(&self, path: &str) -> CoordinationResult {
        self.inner.delete(path).await
    }

    async fn delete_if_version(&self, path: &str, version: u64) -> CoordinationResult {
        self.inner.delete_if_version(path, version).await
    }

    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        self.inner.exists(path).await
    }

    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.inner.children(path).await
    }

    async fn exists_watch(&self, path: &str) -> CoordinationResult<(bool, WatchReceiver)> {
        self.inner.exists_watch(path).await
    }

    async fn increment(&self, path: &str, delta: i64) -> CoordinationResult<(i64, i64)> {
        self.inner.increment(path, delta).await
    }

    async fn restart(&self) -> CoordinationResult {
        self.inner.restart().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
