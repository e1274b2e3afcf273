//! WebSocket message protocol definitions.
//!
//! All messages are JSON objects tagged by `type`, using camelCase names.

use ferry_engine::{ModelName, RemoteRecord};
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Start receiving accepted mutations of one model.
    Subscribe { model: ModelName },

    Unsubscribe { model: ModelName },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// The subscription for `model` is live.
    SubscriptionAck { model: ModelName },

    /// An accepted mutation of a subscribed model.
    Data { record: RemoteRecord },

    /// Response to ping.
    Pong,

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<ModelName>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, model: Option<ModelName>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            model,
        }
    }
}
