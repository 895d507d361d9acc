//! Configuration Module
//!
//! Configuration loading for the recorder.

mod settings;

pub use settings::{
    AccessToken, ConfigError, DEFAULT_WS_URL, FeedSettings, RecorderConfig, ServerSettings,
    StorageSettings, WebSocketSettings,
};
