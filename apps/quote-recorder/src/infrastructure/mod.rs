//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the ports defined in the application layer,
//! plus process-level plumbing.

/// ALOR WebSocket quote feed adapter.
pub mod alor;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// SQLite quote storage.
pub mod storage;

/// Logging and OpenTelemetry tracing setup.
pub mod telemetry;
