//! ALOR quote feed adapter.
//!
//! - `client`: WebSocket transport driving the connection supervisor
//! - `reconnect`: backoff between connection attempts

pub mod client;
pub mod reconnect;

pub use client::{
    DEFAULT_CONNECT_TIMEOUT, QuoteStreamClient, StreamClientConfig, StreamClientError, WsSender, WsSink,
};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
