// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process coordination service. Backs the test suites and single-node deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{CoordinationError, CoordinationResult};
use crate::{
    join_path, node_name, parent_path, validate_path, Connector, CoordinationClient, CreateMode,
    WatchEvent, WatchReceiver, SEQUENCE_DIGITS,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionStatus {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

#[derive(Debug, Default)]
struct Node {
    data: Vec<u8>,
    version: u64,
    ephemeral_owner: Option<u64>,
    next_sequence: u64,
    children: BTreeSet<String>,
}

struct Watch {
    session_id: u64,
    sender: oneshot::Sender<WatchEvent>,
}

struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<Watch>>,
    sessions: HashMap<u64, SessionStatus>,
    next_session_id: u64,
    /// Source of node versions, bumped on every create and set.
    next_version: u64,
    available: bool,
    pending_failures: usize,
}

impl EnsembleState {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_owned(), Node::default());
        Self {
            nodes,
            watches: HashMap::new(),
            sessions: HashMap::new(),
            next_session_id: 1,
            next_version: 1,
            available: true,
            pending_failures: 0,
        }
    }

    fn check_session(&mut self, session_id: u64) -> CoordinationResult {
        if !self.available {
            return Err(CoordinationError::Unavailable);
        }
        match self.sessions.get(&session_id) {
            Some(SessionStatus::Connected) => {}
            Some(SessionStatus::Disconnected) => return Err(CoordinationError::ConnectionLoss),
            Some(SessionStatus::Expired) => {
                return Err(CoordinationError::SessionExpired { session_id })
            }
            Some(SessionStatus::Closed) | None => return Err(CoordinationError::Closed),
        }
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(CoordinationError::ConnectionLoss);
        }
        Ok(())
    }

    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(watches) = self.watches.remove(path) {
            trace!(path, ?event, count = watches.len(), "firing watches");
            for watch in watches {
                let _ = watch.sender.send(event);
            }
        }
    }

    fn no_node(path: &str) -> CoordinationError {
        CoordinationError::NoNode {
            path: path.to_owned(),
        }
    }

    fn bump_version(&mut self) -> u64 {
        let version = self.next_version;
        self.next_version += 1;
        version
    }

    fn check_version(&self, path: &str, version: u64) -> CoordinationResult {
        let node = self.nodes.get(path).ok_or_else(|| Self::no_node(path))?;
        if node.version != version {
            return Err(CoordinationError::BadVersion {
                path: path.to_owned(),
                version,
            });
        }
        Ok(())
    }

    fn create(
        &mut self,
        session_id: u64,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        validate_path(path)?;
        let parent = parent_path(path).ok_or_else(|| CoordinationError::NodeExists {
            path: path.to_owned(),
        })?;
        let parent_node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| Self::no_node(parent))?;
        if parent_node.ephemeral_owner.is_some() {
            return Err(CoordinationError::InvalidPath {
                path: path.to_owned(),
            });
        }

        let full_path = if mode.is_sequential() {
            let seq = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{path}{seq:0width$}", width = SEQUENCE_DIGITS)
        } else {
            path.to_owned()
        };
        if self.nodes.contains_key(&full_path) {
            return Err(CoordinationError::NodeExists { path: full_path });
        }

        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node
                .children
                .insert(node_name(&full_path).to_owned());
        }
        let version = self.bump_version();
        self.nodes.insert(
            full_path.clone(),
            Node {
                data: data.to_vec(),
                version,
                ephemeral_owner: mode.is_ephemeral().then_some(session_id),
                ..Default::default()
            },
        );
        self.fire(&full_path, WatchEvent::NodeCreated);
        Ok(full_path)
    }

    fn create_all(
        &mut self,
        session_id: u64,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        validate_path(path)?;
        let mut missing = vec![];
        let mut current = parent_path(path);
        while let Some(ancestor) = current {
            if self.nodes.contains_key(ancestor) {
                break;
            }
            missing.push(ancestor.to_owned());
            current = parent_path(ancestor);
        }
        for ancestor in missing.iter().rev() {
            match self.create(session_id, ancestor, &[], CreateMode::Persistent) {
                Ok(_) | Err(CoordinationError::NodeExists { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        self.create(session_id, path, data, mode)
    }

    fn get(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        self.get_with_version(path).map(|(data, _)| data)
    }

    fn get_with_version(&self, path: &str) -> CoordinationResult<(Vec<u8>, u64)> {
        validate_path(path)?;
        self.nodes
            .get(path)
            .map(|node| (node.data.clone(), node.version))
            .ok_or_else(|| Self::no_node(path))
    }

    fn set(&mut self, path: &str, data: &[u8]) -> CoordinationResult {
        validate_path(path)?;
        let version = self.bump_version();
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| Self::no_node(path))?;
        node.data = data.to_vec();
        node.version = version;
        self.fire(path, WatchEvent::NodeDataChanged);
        Ok(())
    }

    fn set_if_version(&mut self, path: &str, data: &[u8], version: u64) -> CoordinationResult {
        validate_path(path)?;
        self.check_version(path, version)?;
        self.set(path, data)
    }

    fn delete(&mut self, path: &str) -> CoordinationResult {
        validate_path(path)?;
        let node = self.nodes.get(path).ok_or_else(|| Self::no_node(path))?;
        if path == "/" || !node.children.is_empty() {
            return Err(CoordinationError::NotEmpty {
                path: path.to_owned(),
            });
        }
        self.nodes.remove(path);
        if let Some(parent) = parent_path(path).and_then(|parent| self.nodes.get_mut(parent)) {
            parent.children.remove(node_name(path));
        }
        self.fire(path, WatchEvent::NodeDeleted);
        Ok(())
    }

    fn delete_if_version(&mut self, path: &str, version: u64) -> CoordinationResult {
        validate_path(path)?;
        self.check_version(path, version)?;
        self.delete(path)
    }

    fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        validate_path(path)?;
        self.nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .ok_or_else(|| Self::no_node(path))
    }

    fn watch(&mut self, session_id: u64, path: &str) -> CoordinationResult<(bool, WatchReceiver)> {
        validate_path(path)?;
        let (sender, receiver) = oneshot::channel();
        self.watches
            .entry(path.to_owned())
            .or_default()
            .push(Watch { session_id, sender });
        Ok((self.nodes.contains_key(path), receiver))
    }

    fn increment(&mut self, session_id: u64, path: &str, delta: i64) -> CoordinationResult<(i64, i64)> {
        if !self.nodes.contains_key(path) {
            self.create_all(session_id, path, b"0", CreateMode::Persistent)?;
        }
        let raw = self.get(path)?;
        let previous = std::str::from_utf8(&raw)
            .ok()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map_or(Ok(0), str::parse::<i64>)
            .map_err(|_| CoordinationError::InvalidPath {
                path: path.to_owned(),
            })?;
        let new = previous + delta;
        self.set(path, new.to_string().as_bytes())?;
        Ok((previous, new))
    }

    /// Ends a session: its ephemeral nodes are deleted and its pending watches notified.
    fn end_session(&mut self, session_id: u64, status: SessionStatus) {
        self.sessions.insert(session_id, status);
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            let _ = self.delete(&path);
        }
        for watches in self.watches.values_mut() {
            let (closed, kept): (Vec<_>, Vec<_>) = std::mem::take(watches)
                .into_iter()
                .partition(|watch| watch.session_id == session_id);
            *watches = kept;
            for watch in closed {
                let _ = watch.sender.send(WatchEvent::SessionClosed);
            }
        }
        self.watches.retain(|_, watches| !watches.is_empty());
    }
}

/// A shared in-memory tree. Every [`InMemorySession`] created from the same ensemble (or a
/// clone of it) sees the same nodes.
#[derive(Clone)]
pub struct InMemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl Default for InMemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEnsemble {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EnsembleState::new())),
        }
    }

    pub fn session(&self) -> CoordinationResult<InMemorySession> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(CoordinationError::Unavailable);
        }
        let id = state.next_session_id;
        state.next_session_id += 1;
        state.sessions.insert(id, SessionStatus::Connected);
        debug!(session_id = id, "opened in-memory coordination session");
        Ok(InMemorySession {
            id,
            state: self.state.clone(),
        })
    }

    /// Expires a session as the service would after a missed heartbeat.
    pub fn expire_session(&self, session_id: u64) {
        self.state
            .lock()
            .end_session(session_id, SessionStatus::Expired);
    }

    /// Drops the connection of a session without expiring it; `restart` recovers it.
    pub fn disconnect_session(&self, session_id: u64) {
        let mut state = self.state.lock();
        if let Some(status) = state.sessions.get_mut(&session_id) {
            if *status == SessionStatus::Connected {
                *status = SessionStatus::Disconnected;
            }
        }
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// The next `count` operations, on any session, fail with `ConnectionLoss`.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().pending_failures = count;
    }

    /// Overrides the next sequence number handed out under `parent`.
    pub fn set_next_sequence(&self, parent: &str, sequence: u64) -> CoordinationResult {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(parent)
            .ok_or_else(|| EnsembleState::no_node(parent))?;
        node.next_sequence = sequence;
        Ok(())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().nodes.get(path).map(|node| node.data.clone())
    }

    /// Every node below `path` (inclusive) with its data, in path order.
    pub fn dump(&self, path: &str) -> Vec<(String, String)> {
        let prefix = join_path(path, "");
        self.state
            .lock()
            .nodes
            .iter()
            .filter(|(node_path, _)| *node_path == path || node_path.starts_with(&prefix))
            .map(|(node_path, node)| {
                (
                    node_path.clone(),
                    String::from_utf8_lossy(&node.data).into_owned(),
                )
            })
            .collect()
    }
}

#[async_trait]
impl Connector for InMemoryEnsemble {
    async fn connect(&self) -> CoordinationResult<Arc<dyn CoordinationClient>> {
        Ok(Arc::new(self.session()?))
    }
}

pub struct InMemorySession {
    id: u64,
    state: Arc<Mutex<EnsembleState>>,
}

impl InMemorySession {
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut EnsembleState) -> CoordinationResult<T>,
    ) -> CoordinationResult<T> {
        let mut state = self.state.lock();
        state.check_session(self.id)?;
        f(&mut state)
    }
}

#[async_trait]
impl CoordinationClient for InMemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn is_connected(&self) -> bool {
        let state = self.state.lock();
        state.available && state.sessions.get(&self.id) == Some(&SessionStatus::Connected)
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        self.with_state(|state| state.create(self.id, path, data, mode))
    }

    async fn create_all(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        self.with_state(|state| state.create_all(self.id, path, data, mode))
    }

    async fn get(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        self.with_state(|state| state.get(path))
    }

    async fn get_with_version(&self, path: &str) -> CoordinationResult<(Vec<u8>, u64)> {
        self.with_state(|state| state.get_with_version(path))
    }

    async fn set(&self, path: &str, data: &[u8]) -> CoordinationResult {
        self.with_state(|state| state.set(path, data))
    }

    async fn set_if_version(&self, path: &str, data: &[u8], version: u64) -> CoordinationResult {
        self.with_state(|state| state.set_if_version(path, data, version))
    }

    async fn delete(&self, path: &str) -> CoordinationResult {
        self.with_state(|state| state.delete(path))
    }

    async fn delete_if_version(&self, path: &str, version: u64) -> CoordinationResult {
        self.with_state(|state| state.delete_if_version(path, version))
    }

    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        self.with_state(|state| {
            validate_path(path)?;
            Ok(state.nodes.contains_key(path))
        })
    }

    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.with_state(|state| state.children(path))
    }

    async fn exists_watch(&self, path: &str) -> CoordinationResult<(bool, WatchReceiver)> {
        self.with_state(|state| state.watch(self.id, path))
    }

    async fn increment(&self, path: &str, delta: i64) -> CoordinationResult<(i64, i64)> {
        self.with_state(|state| state.increment(self.id, path, delta))
    }

    async fn restart(&self) -> CoordinationResult {
        let mut state = self.state.lock();
        if !state.available {
            return Err(CoordinationError::Unavailable);
        }
        match state.sessions.get(&self.id).copied() {
            Some(SessionStatus::Connected) => Ok(()),
            Some(SessionStatus::Disconnected) => {
                state.sessions.insert(self.id, SessionStatus::Connected);
                debug!(session_id = self.id, "restarted coordination session");
                Ok(())
            }
            Some(SessionStatus::Expired) => Err(CoordinationError::SessionExpired {
                session_id: self.id,
            }),
            Some(SessionStatus::Closed) | None => Err(CoordinationError::Closed),
        }
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if state.sessions.get(&self.id) != Some(&SessionStatus::Closed) {
            state.end_session(self.id, SessionStatus::Closed);
            debug!(session_id = self.id, "closed coordination session");
        }
    }
}

#[cfg(test)]
#[path = "unit_tests/memory_tests.rs"]
mod memory_tests;
