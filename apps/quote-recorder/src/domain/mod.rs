//! Domain Layer - Core quote types and validation.
//!
//! Pure types with no I/O. Everything here can be exercised without a
//! network connection or a database.

/// Quote records and the validator that produces them.
pub mod quote;
