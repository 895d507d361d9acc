//! Quote Records
//!
//! The normalized unit of market data persisted by the recorder, and the
//! validator that turns the decoded `data` object of an inbound event into
//! one.
//!
//! # Validation Order
//!
//! 1. Every required field must be present (`MissingField`).
//! 2. No required field may be JSON `null` (`NullValue`).
//! 3. Each field must already carry the JSON type the column expects
//!    (`InvalidType`); values are copied as decoded, never parsed from text.
//! 4. The symbol must not be empty (`EmptySymbol`).
//!
//! Within each step the first offending field in [`REQUIRED_FIELDS`] order is
//! reported.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Types
// =============================================================================

/// Field names every quote event must carry, in column order.
pub const REQUIRED_FIELDS: [&str; 6] = ["symbol", "time", "bid", "ask", "last_price", "volume"];

/// A validated quote, ready to be appended to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    /// Instrument ticker.
    pub symbol: String,
    /// Exchange-supplied timestamp. The unit is whatever the venue sends.
    pub time: i64,
    /// Best bid price.
    pub bid: f64,
    /// Best ask price.
    pub ask: f64,
    /// Last traded price.
    pub last_price: f64,
    /// Traded volume.
    pub volume: i64,
}

/// Why a decoded event was not accepted as a quote.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectionReason {
    /// A required key is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A required key is present but null.
    #[error("required field `{0}` is null")]
    NullValue(&'static str),

    /// A required key holds a value of the wrong JSON type.
    #[error("field `{field}` must be {expected}")]
    InvalidType {
        /// Offending field.
        field: &'static str,
        /// Expected JSON type.
        expected: &'static str,
    },

    /// The symbol is an empty string.
    #[error("symbol is empty")]
    EmptySymbol,
}

impl RejectionReason {
    /// Short label used for metrics and structured logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "missing_field",
            Self::NullValue(_) => "null_value",
            Self::InvalidType { .. } => "invalid_type",
            Self::EmptySymbol => "empty_symbol",
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Validate the `data` object of a quote event.
///
/// # Errors
///
/// Returns the first [`RejectionReason`] found, see the module docs for the
/// order in which checks run.
pub fn validate(raw: &Map<String, Value>) -> Result<QuoteRecord, RejectionReason> {
    if let Some(field) = REQUIRED_FIELDS.iter().find(|f| !raw.contains_key(**f)) {
        return Err(RejectionReason::MissingField(*field));
    }

    if let Some(field) = REQUIRED_FIELDS
        .iter()
        .find(|f| raw.get(**f).is_some_and(Value::is_null))
    {
        return Err(RejectionReason::NullValue(*field));
    }

    let symbol = raw["symbol"]
        .as_str()
        .ok_or(RejectionReason::InvalidType {
            field: "symbol",
            expected: "a string",
        })?;
    let record = QuoteRecord {
        symbol: symbol.to_string(),
        time: integer(raw, "time")?,
        bid: real(raw, "bid")?,
        ask: real(raw, "ask")?,
        last_price: real(raw, "last_price")?,
        volume: integer(raw, "volume")?,
    };

    if record.symbol.is_empty() {
        return Err(RejectionReason::EmptySymbol);
    }
    Ok(record)
}

fn integer(raw: &Map<String, Value>, field: &'static str) -> Result<i64, RejectionReason> {
    raw[field].as_i64().ok_or(RejectionReason::InvalidType {
        field,
        expected: "an integer",
    })
}

fn real(raw: &Map<String, Value>, field: &'static str) -> Result<f64, RejectionReason> {
    raw[field].as_f64().ok_or(RejectionReason::InvalidType {
        field,
        expected: "a number",
    })
}

// =============================================================================
// Tests
// =============================================================================
