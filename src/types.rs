//! Re-exported types from external crates for convenience.
//!
//! These types appear in this crate's public API and are re-exported here
//! so users don't need to add these dependencies to their `Cargo.toml`.

/// Date and time types for inbound message timestamps.
pub use chrono::{DateTime, Utc};
/// Arbitrary precision decimal type for order quantities and prices.
pub use rust_decimal::Decimal;
/// Macro for creating [`Decimal`] literals at compile time.
///
/// # Example
/// ```
/// use dashlink::types::dec;
/// let quantity = dec!(2.5);
/// ```
pub use rust_decimal_macros::dec;
/// Secret string type that redacts its value in debug output, used for route tokens.
pub use secrecy::{ExposeSecret, SecretString};
/// JSON value type carried by event payloads and cached responses.
pub use serde_json::Value;
