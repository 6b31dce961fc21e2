//! Fan-out Registry (spec §4.6): `user_id -> (connection_id -> Connection)`.
//! Ownership belongs to the Lifecycle Manager; mutations are serialized
//! under a single registry lock, the same `Arc<RwLock<HashMap<..>>>`
//! registry shape used elsewhere in this codebase, generalized here to a
//! two-level map since one user may hold several live connections
//! (multi-device).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use gatehouse_protocol::Message;

use crate::connection::Connection;

#[derive(Default)]
pub struct FanoutRegistry {
    by_user: RwLock<HashMap<String, HashMap<String, Arc<Connection>>>>,
}

impl FanoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<Connection>) {
        let mut by_user = self.by_user.write().unwrap_or_else(|e| e.into_inner());
        by_user
            .entry(connection.user_id.clone())
            .or_default()
            .insert(connection.connection_id.clone(), connection);
    }

    /// Remove one connection. If the user's inner map becomes empty, the
    /// user entry itself is dropped (spec §4.1 unregistration path).
    pub fn unregister(&self, user_id: &str, connection_id: &str) {
        let mut by_user = self.by_user.write().unwrap_or_else(|e| e.into_inner());
        if let Some(inner) = by_user.get_mut(user_id) {
            inner.remove(connection_id);
            if inner.is_empty() {
                by_user.remove(user_id);
            }
        }
    }

    pub fn get(&self, user_id: &str, connection_id: &str) -> Option<Arc<Connection>> {
        let by_user = self.by_user.read().unwrap_or_else(|e| e.into_inner());
        by_user.get(user_id)?.get(connection_id).cloned()
    }

    /// Every live connection, snapshotted under the registry lock. Used by
    /// `Shutdown` to close every connection concurrently.
    pub fn all_connections(&self) -> Vec<Arc<Connection>> {
        let by_user = self.by_user.read().unwrap_or_else(|e| e.into_inner());
        by_user.values().flat_map(|inner| inner.values().cloned()).collect()
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let by_user = self.by_user.read().unwrap_or_else(|e| e.into_inner());
        by_user
            .get(user_id)
            .map(|inner| inner.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Broadcast to every live connection of `user_id` (spec §4.6): snapshot
    /// the inner map under the read lock, release it, then enqueue
    /// non-blockingly on each connection, logging drops.
    pub fn broadcast(&self, user_id: &str, message: &Message) {
        let connections = self.connections_for_user(user_id);
        for connection in connections {
            if !connection.try_enqueue(message.clone()) {
                tracing::warn!(
                    %user_id,
                    connection_id = %connection.connection_id,
                    "dropped broadcast message: send queue full or connection closing"
                );
            }
        }
    }
}
