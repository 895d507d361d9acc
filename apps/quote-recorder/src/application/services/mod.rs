//! Application Services
//!
//! - `pipeline`: decode → envelope → validate → persist for one message
//! - `subscription`: subscribe-on-open and the fixed-interval renewal ticker
//! - `supervisor`: the connection state machine that ties them together

pub mod pipeline;
pub mod subscription;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{IngestError, IngestStats, IngestStatsSnapshot, QuotePipeline};
pub use subscription::{
    GuidMode, RenewalHandle, SubscriptionController, SubscriptionError, SubscriptionRequest,
    SubscriptionSettings,
};
pub use supervisor::{
    ChannelEvent, ConnectionState, ConnectionStatus, ConnectionSupervisor, SupervisorError,
};
