//! WebSocket endpoint: subscribe/unsubscribe requests over one connection,
//! channel pushes delivered as `update` notifications

pub mod handler;
pub mod message;

pub use handler::ws_handler;
