// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry, IntCounter,
    IntCounterVec, Registry,
};
use tracing::{debug, error, info, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::{fatal, join_path, Connector, CoordinationClient, CreateMode, WatchReceiver};

#[derive(Clone, Debug)]
pub struct HandleConfig {
    /// Attempts after the first one for an operation failing with a transient error.
    pub operation_retries: u32,
    pub retry_delay: Duration,
    /// Consecutive failed reconnections tolerated before the process is terminated.
    pub max_connection_failures: u32,
    /// Upper bound on a single call to the service.
    pub operation_timeout: Duration,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            operation_retries: 5,
            retry_delay: Duration::from_millis(500),
            max_connection_failures: 10,
            operation_timeout: Duration::from_secs(3),
        }
    }
}

pub struct HandleMetrics {
    pub reconnects: IntCounterVec,
    pub operation_retries: IntCounter,
}

impl HandleMetrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        let this = Self {
            reconnects: register_int_counter_vec_with_registry!(
                "coordination_reconnects",
                "Attempts to re-establish the coordination session, by outcome",
                &["outcome"],
                registry
            )
            .unwrap(),
            operation_retries: register_int_counter_with_registry!(
                "coordination_operation_retries",
                "Coordination operations retried after a transient failure",
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

struct Connection {
    client: Option<Arc<dyn CoordinationClient>>,
    failures: u32,
}

/// Shared access point to the coordination service.
///
/// Calls are serialized over a single session. Transient failures are retried with a fixed
/// delay, re-establishing the session in between. When the session cannot be re-established
/// `max_connection_failures` times in a row the process is terminated, since the locks this
/// node believes it holds can no longer be trusted.
pub struct CoordinationHandle {
    connector: Arc<dyn Connector>,
    connection: tokio::sync::Mutex<Connection>,
    config: HandleConfig,
    metrics: Arc<HandleMetrics>,
}

impl CoordinationHandle {
    pub async fn new(
        connector: Arc<dyn Connector>,
        config: HandleConfig,
        metrics: Arc<HandleMetrics>,
    ) -> Self {
        let client = match connector.connect().await {
            Ok(client) => Some(client),
            Err(err) => {
                warn!("Initial connection to the coordination service failed: {err}");
                None
            }
        };
        Self {
            connector,
            connection: tokio::sync::Mutex::new(Connection {
                client,
                failures: 0,
            }),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    pub async fn session_id(&self) -> Option<u64> {
        self.connection
            .lock()
            .await
            .client
            .as_ref()
            .map(|client| client.session_id())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .client
            .as_ref()
            .is_some_and(|client| client.is_connected())
    }

    /// Restarts the current session, or replaces it with a new one if it cannot be restarted.
    pub async fn reestablish_connection(&self) {
        let mut connection = self.connection.lock().await;
        self.reconnect_locked(&mut connection).await;
    }

    async fn reconnect_locked(&self, connection: &mut Connection) {
        if let Some(client) = connection.client.clone() {
            match client.restart().await {
                Ok(()) => {
                    self.metrics
                        .reconnects
                        .with_label_values(&["restarted"])
                        .inc();
                    connection.failures = 0;
                    debug!(session_id = client.session_id(), "coordination session restarted");
                    return;
                }
                Err(err) => {
                    info!("Unable to restart coordination session, opening a new one: {err}");
                    client.close().await;
                    connection.client = None;
                }
            }
        }

        match self.connector.connect().await {
            Ok(client) => {
                self.metrics.reconnects.with_label_values(&["rebuilt"]).inc();
                info!(
                    session_id = client.session_id(),
                    "opened new coordination session"
                );
                connection.client = Some(client);
                connection.failures = 0;
            }
            Err(err) => {
                self.metrics.reconnects.with_label_values(&["failed"]).inc();
                connection.failures += 1;
                error!(
                    failures = connection.failures,
                    "Failed to connect to the coordination service: {err}"
                );
                if connection.failures > self.config.max_connection_failures {
                    fatal!(
                        "Too many connection errors to the coordination service ({}). Aborting",
                        connection.failures
                    );
                }
            }
        }
    }

    async fn run<T, F, Fut>(&self, op: &'static str, path: &str, f: F) -> CoordinationResult<T>
    where
        F: Fn(Arc<dyn CoordinationClient>) -> Fut,
        Fut: Future<Output = CoordinationResult<T>>,
    {
        self.run_with_retries(op, path, self.config.operation_retries, f)
            .await
    }

    /// Runs `f`, retrying transient failures up to `retries` times. The session is
    /// re-established after every transient failure, including the last one.
    async fn run_with_retries<T, F, Fut>(
        &self,
        op: &'static str,
        path: &str,
        retries: u32,
        f: F,
    ) -> CoordinationResult<T>
    where
        F: Fn(Arc<dyn CoordinationClient>) -> Fut,
        Fut: Future<Output = CoordinationResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = {
                let mut connection = self.connection.lock().await;
                if connection.client.is_none() {
                    self.reconnect_locked(&mut connection).await;
                }
                match connection.client.clone() {
                    Some(client) => tokio::time::timeout(self.config.operation_timeout, f(client))
                        .await
                        .unwrap_or(Err(CoordinationError::OperationTimeout)),
                    None => Err(CoordinationError::Unavailable),
                }
            };

            match result {
                Err(err) if err.is_transient() => {
                    warn!(op, path, attempt, "Coordination operation failed: {err}");
                    self.reestablish_connection().await;
                    if attempt >= retries {
                        return Err(err);
                    }
                    attempt += 1;
                    self.metrics.operation_retries.inc();
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                result => return result,
            }
        }
    }

    pub async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<String> {
        self.run("create", path, |client| async move {
            client.create(path, data, mode).await
        })
        .await
    }

    /// Single attempt at a create. Sequential creates go through here: a create whose response
    /// was lost may still have been applied, and only the caller can tell which node is its own.
    pub async fn create_once(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        self.run_with_retries("create", path, 0, |client| async move {
            client.create(path, data, mode).await
        })
        .await
    }

    pub async fn create_all(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        self.run("create_all", path, |client| async move {
            client.create_all(path, data, mode).await
        })
        .await
    }

    pub async fn get(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        self.run("get", path, |client| async move { client.get(path).await })
            .await
    }

    pub async fn get_with_version(&self, path: &str) -> CoordinationResult<(Vec<u8>, u64)> {
        self.run("get", path, |client| async move {
            client.get_with_version(path).await
        })
        .await
    }

    /// Node data decoded as UTF-8.
    pub async fn get_string(&self, path: &str) -> CoordinationResult<String> {
        let data = self.get(path).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    pub async fn set(&self, path: &str, data: &[u8]) -> CoordinationResult {
        self.run("set", path, |client| async move { client.set(path, data).await })
            .await
    }

    pub async fn set_if_version(&self, path: &str, data: &[u8], version: u64) -> CoordinationResult {
        self.run("set", path, |client| async move {
            client.set_if_version(path, data, version).await
        })
        .await
    }

    pub async fn delete(&self, path: &str) -> CoordinationResult {
        self.run("delete", path, |client| async move { client.delete(path).await })
            .await
    }

    pub async fn delete_if_version(&self, path: &str, version: u64) -> CoordinationResult {
        self.run("delete", path, |client| async move {
            client.delete_if_version(path, version).await
        })
        .await
    }

    pub async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        self.run("exists", path, |client| async move { client.exists(path).await })
            .await
    }

    pub async fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.run("children", path, |client| async move {
            client.children(path).await
        })
        .await
    }

    pub async fn exists_watch(&self, path: &str) -> CoordinationResult<(bool, WatchReceiver)> {
        self.run("exists_watch", path, |client| async move {
            client.exists_watch(path).await
        })
        .await
    }

    pub async fn increment(&self, path: &str, delta: i64) -> CoordinationResult<(i64, i64)> {
        self.run("increment", path, |client| async move {
            client.increment(path, delta).await
        })
        .await
    }

    /// Creates `path` and its ancestors as empty persistent nodes if missing.
    pub async fn ensure_path(&self, path: &str) -> CoordinationResult {
        match self.create_all(path, &[], CreateMode::Persistent).await {
            Ok(_) | Err(CoordinationError::NodeExists { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Returns whether the node was deleted by this call.
    pub async fn delete_if_exists(&self, path: &str) -> CoordinationResult<bool> {
        match self.delete(path).await {
            Ok(()) => Ok(true),
            Err(CoordinationError::NoNode { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Sets the data of `path`, creating the node (and its ancestors) when missing.
    pub async fn update_node(&self, path: &str, data: &[u8]) -> CoordinationResult {
        match self.set(path, data).await {
            Err(CoordinationError::NoNode { .. }) => {
                match self.create_all(path, data, CreateMode::Persistent).await {
                    Ok(_) => Ok(()),
                    Err(CoordinationError::NodeExists { .. }) => self.set(path, data).await,
                    Err(err) => Err(err),
                }
            }
            result => result,
        }
    }

    /// Deletes `path` and everything below it. Nodes disappearing concurrently are ignored.
    pub async fn delete_recursive(&self, path: &str) -> CoordinationResult {
        let mut stack = vec![(path.to_owned(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                match self.delete(&node).await {
                    Ok(()) | Err(CoordinationError::NoNode { .. }) => {}
                    Err(CoordinationError::NotEmpty { .. }) => stack.push((node, false)),
                    Err(err) => return Err(err),
                }
                continue;
            }
            let children = match self.children(&node).await {
                Ok(children) => children,
                Err(CoordinationError::NoNode { .. }) => continue,
                Err(err) => return Err(err),
            };
            stack.push((node.clone(), true));
            stack.extend(
                children
                    .into_iter()
                    .map(|child| (join_path(&node, &child), false)),
            );
        }
        Ok(())
    }

    /// Every node below `path` with its data, depth first. Used for diagnostics.
    pub async fn dump_tree(&self, path: &str) -> CoordinationResult<Vec<(String, String)>> {
        let mut out = vec![];
        let mut stack = vec![path.to_owned()];
        while let Some(node) = stack.pop() {
            let data = match self.get_string(&node).await {
                Ok(data) => data,
                Err(CoordinationError::NoNode { .. }) => continue,
                Err(err) => return Err(err),
            };
            info!("{node} -> {data:?}");
            let mut children = match self.children(&node).await {
                Ok(children) => children,
                Err(CoordinationError::NoNode { .. }) => vec![],
                Err(err) => return Err(err),
            };
            children.sort_unstable_by(|a, b| b.cmp(a));
            stack.extend(children.iter().map(|child| join_path(&node, child)));
            out.push((node, data));
        }
        Ok(out)
    }

    pub async fn close(&self) {
        let mut connection = self.connection.lock().await;
        if let Some(client) = connection.client.take() {
            client.close().await;
        }
    }
}

#[cfg(test)]
#[path = "unit_tests/handle_tests.rs"]
mod handle_tests;
