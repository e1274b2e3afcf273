//! WebSocket subscription manager.
//!
//! Tracks active WebSocket connections and the models each one subscribes to,
//! and fans accepted mutations out to the subscribers of their model.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use ferry_engine::{ModelName, RemoteRecord};
use tokio::sync::mpsc;

use super::ServerMessage;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
    pub models: HashSet<ModelName>,
}

/// Manages active WebSocket connections and their subscriptions.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Index of connection IDs by subscribed model.
    by_model: DashMap<ModelName, HashSet<String>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                sender,
                models: HashSet::new(),
            },
        );

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    /// Unregister a connection and drop all its subscriptions.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            for model in &conn.models {
                self.remove_from_index(model, conn_id);
            }

            tracing::info!(
                conn_id = %conn_id,
                models = conn.models.len(),
                "WebSocket connection unregistered"
            );
        }
    }

    /// Subscribe a connection to a model. Returns false for unknown connections.
    pub fn subscribe(&self, conn_id: &str, model: &str) -> bool {
        let Some(mut conn) = self.connections.get_mut(conn_id) else {
            return false;
        };
        conn.models.insert(model.to_string());
        drop(conn);

        self.by_model
            .entry(model.to_string())
            .or_default()
            .insert(conn_id.to_string());

        tracing::debug!(conn_id = %conn_id, model = %model, "Subscribed");
        true
    }

    pub fn unsubscribe(&self, conn_id: &str, model: &str) {
        if let Some(mut conn) = self.connections.get_mut(conn_id) {
            conn.models.remove(model);
        }
        self.remove_from_index(model, conn_id);
    }

    fn remove_from_index(&self, model: &str, conn_id: &str) {
        if let Some(mut conn_ids) = self.by_model.get_mut(model) {
            conn_ids.remove(conn_id);
            // Clean up empty entries
            if conn_ids.is_empty() {
                drop(conn_ids);
                self.by_model.remove_if(model, |_, ids| ids.is_empty());
            }
        }
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Deliver an accepted mutation to every subscriber of its model.
    ///
    /// Returns the number of connections that received it.
    pub fn publish(&self, record: &RemoteRecord) -> usize {
        let model = &record.record.model;
        let Some(conn_ids) = self.by_model.get(model).map(|ids| ids.clone()) else {
            return 0;
        };

        let message = ServerMessage::Data {
            record: record.clone(),
        };
        let sent_count = conn_ids
            .iter()
            .filter(|id| self.send_to(id, message.clone()))
            .count();

        tracing::debug!(
            model = %model,
            id = %record.record.id,
            recipients = sent_count,
            "Published mutation to subscribers"
        );

        sent_count
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections subscribed to `model`.
    pub fn subscriber_count(&self, model: &str) -> usize {
        self.by_model.get(model).map_or(0, |ids| ids.len())
    }
}
