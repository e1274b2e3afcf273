//! WebSocket support for live subscriptions.
//!
//! Clients connect to `/subscribe`, subscribe to models, and then receive every
//! mutation the server accepts for those models.

mod manager;
mod protocol;

pub use manager::SubscriptionManager;
pub use protocol::*;
