//! Live client connections
//!
//! The manager owns one record per connection. Records are only touched by the
//! task handling that connection's traffic (via `DashMap` entry locks) and by
//! the lifecycle sweep.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::metrics;
use crate::{Result, SupervisorError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport io error: {0}")]
    Io(String),
}

/// Outbound half of a client connection
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send_text(&self, text: String) -> std::result::Result<(), TransportError>;
}

/// Transport backed by a bounded channel drained by a socket writer task.
/// A full channel applies backpressure, which the send timeout turns into a
/// failed send.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::Sender<String>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        Self { sender }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_text(&self, text: String) -> std::result::Result<(), TransportError> {
        self.sender
            .send(text)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[derive(Debug)]
struct ConnectionRecord {
    connection_id: String,
    user_id: String,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    alive: bool,
    messages_received: u64,
    messages_sent: u64,
    transport: Arc<dyn Transport>,
}

impl ConnectionRecord {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.connection_id.clone(),
            user_id: self.user_id.clone(),
            connected_at: self.connected_at,
            last_activity: self.last_activity,
            alive: self.alive,
            messages_received: self.messages_received,
            messages_sent: self.messages_sent,
        }
    }
}

/// Serializable view of a connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub alive: bool,
    pub messages_received: u64,
    pub messages_sent: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub alive_connections: usize,
    pub unique_users: usize,
    pub messages_received: u64,
    pub messages_sent: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<String, ConnectionRecord>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection after a successful handshake
    pub fn connect(&self, user_id: impl Into<String>, transport: Arc<dyn Transport>) -> String {
        let connection_id = format!("conn_{}", Uuid::new_v4().simple());
        let now = Utc::now();
        let user_id = user_id.into();

        self.connections.insert(
            connection_id.clone(),
            ConnectionRecord {
                connection_id: connection_id.clone(),
                user_id: user_id.clone(),
                connected_at: now,
                last_activity: now,
                alive: true,
                messages_received: 0,
                messages_sent: 0,
                transport,
            },
        );
        self.publish_gauge();

        tracing::info!(
            "[CONNECTIONS] {} connected for user {}",
            connection_id,
            user_id
        );
        connection_id
    }

    pub fn disconnect(&self, connection_id: &str) -> bool {
        let removed = self.connections.remove(connection_id).is_some();
        if removed {
            self.publish_gauge();
            tracing::info!("[CONNECTIONS] {} disconnected", connection_id);
        }
        removed
    }

    /// Flag a connection as dead so the next sweep removes it
    pub fn mark_dead(&self, connection_id: &str) {
        if let Some(mut record) = self.connections.get_mut(connection_id) {
            record.alive = false;
        }
    }

    /// Validate an inbound message's connection and record the activity.
    /// Returns the connection's user.
    pub fn begin_receive(&self, connection_id: &str) -> Result<String> {
        let mut record = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| SupervisorError::ConnectionNotFound(connection_id.to_string()))?;

        if !record.alive {
            return Err(SupervisorError::ConnectionDead(connection_id.to_string()));
        }

        record.last_activity = Utc::now();
        record.messages_received += 1;
        Ok(record.user_id.clone())
    }

    /// Push the connection's idle deadline forward
    pub fn refresh_deadline(&self, connection_id: &str) {
        if let Some(mut record) = self.connections.get_mut(connection_id) {
            record.last_activity = Utc::now();
        }
    }

    pub fn record_sent(&self, connection_id: &str) {
        if let Some(mut record) = self.connections.get_mut(connection_id) {
            record.messages_sent += 1;
            record.last_activity = Utc::now();
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections.get(connection_id).map(|record| record.info())
    }

    /// Transport of a live connection
    pub fn transport(&self, connection_id: &str) -> Result<Arc<dyn Transport>> {
        let record = self
            .connections
            .get(connection_id)
            .ok_or_else(|| SupervisorError::ConnectionNotFound(connection_id.to_string()))?;
        if !record.alive {
            return Err(SupervisorError::ConnectionDead(connection_id.to_string()));
        }
        Ok(record.transport.clone())
    }

    /// Ids of alive connections, optionally only those of one user
    pub fn connection_ids(&self, user_filter: Option<&str>) -> Vec<String> {
        self.connections
            .iter()
            .filter(|record| record.alive)
            .filter(|record| user_filter.map_or(true, |user| record.user_id == user))
            .map(|record| record.connection_id.clone())
            .collect()
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.connections.iter().map(|record| record.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Remove dead connections and those idle for longer than `timeout`
    pub fn sweep_expired(&self, timeout: Duration) -> Vec<String> {
        let cutoff = match chrono::Duration::from_std(timeout) {
            Ok(timeout) => Utc::now() - timeout,
            Err(_) => return Vec::new(),
        };

        let expired: Vec<String> = self
            .connections
            .iter()
            .filter(|record| !record.alive || record.last_activity < cutoff)
            .map(|record| record.connection_id.clone())
            .collect();

        for connection_id in &expired {
            self.connections.remove(connection_id);
            tracing::info!("[CONNECTIONS] Swept expired connection {}", connection_id);
        }

        if !expired.is_empty() {
            self.publish_gauge();
        }
        expired
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats::default();
        let mut users = std::collections::HashSet::new();

        for record in self.connections.iter() {
            stats.total_connections += 1;
            if record.alive {
                stats.alive_connections += 1;
            }
            users.insert(record.user_id.clone());
            stats.messages_received += record.messages_received;
            stats.messages_sent += record.messages_sent;
        }

        stats.unique_users = users.len();
        stats
    }

    fn publish_gauge(&self) {
        metrics::set_active_connections(self.connections.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Arc<dyn Transport> {
        let (transport, _rx) = ChannelTransport::channel(4);
        Arc::new(transport)
    }

    #[test]
    fn test_connect_and_validate() {
        let manager = ConnectionManager::new();
        let id = manager.connect("user-1", transport());

        assert_eq!(manager.begin_receive(&id).unwrap(), "user-1");
        assert_eq!(manager.get(&id).unwrap().messages_received, 1);

        assert!(matches!(
            manager.begin_receive("missing"),
            Err(SupervisorError::ConnectionNotFound(_))
        ));
    }

    #[test]
    fn test_dead_connection_is_rejected_then_swept() {
        let manager = ConnectionManager::new();
        let id = manager.connect("user-1", transport());
        manager.mark_dead(&id);

        assert!(matches!(
            manager.begin_receive(&id),
            Err(SupervisorError::ConnectionDead(_))
        ));
        assert!(manager.transport(&id).is_err());
        assert!(manager.connection_ids(None).is_empty());

        let swept = manager.sweep_expired(Duration::from_secs(300));
        assert_eq!(swept, vec![id]);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_connection_ids_filter_by_user() {
        let manager = ConnectionManager::new();
        manager.connect("alice", transport());
        manager.connect("alice", transport());
        manager.connect("bob", transport());

        assert_eq!(manager.connection_ids(Some("alice")).len(), 2);
        assert_eq!(manager.connection_ids(Some("bob")).len(), 1);
        assert_eq!(manager.connection_ids(None).len(), 3);

        let stats = manager.stats();
        assert_eq!(stats.unique_users, 2);
        assert_eq!(stats.alive_connections, 3);
    }

    #[tokio::test]
    async fn test_channel_transport_reports_closed() {
        let (transport, rx) = ChannelTransport::channel(1);
        drop(rx);
        assert_eq!(
            transport.send_text("hi".to_string()).await,
            Err(TransportError::Closed)
        );
    }
}
