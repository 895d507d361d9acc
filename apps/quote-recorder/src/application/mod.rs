//! Application Layer - Use cases and port definitions.
//!
//! The ingestion pipeline, the subscription controller and the connection
//! supervisor live here, written against the ports so they can be driven
//! without a live network or database.

/// Port interfaces for storage and the streaming channel.
pub mod ports;

/// Application services: pipeline, subscription renewal, supervision.
pub mod services;
