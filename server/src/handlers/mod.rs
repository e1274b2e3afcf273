//! Request handlers for sync operations.

mod mutate;
mod sync;
mod websocket;

pub use mutate::*;
pub use sync::*;
pub use websocket::*;
