//! Glue between the live connection and request call sites.
//!
//! A [`Feed`] turns connection events into refreshes of call sites and keeps symbol
//! subscriptions alive across reconnects.

pub mod feed;

pub use feed::Feed;
