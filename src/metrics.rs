//! Metric helpers for `streamwire`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate. With the
//! `metrics` feature disabled every helper compiles to a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking open broker connections.
pub const CONNECTIONS_ACTIVE: &str = "streamwire_connections_active";
/// Name of the counter tracking processed frames.
pub const FRAMES_PROCESSED: &str = "streamwire_frames_processed_total";
/// Name of the counter tracking messages handed to publish frames.
pub const MESSAGES_PUBLISHED: &str = "streamwire_messages_published_total";
/// Name of the counter tracking resolved publish confirmations.
pub const CONFIRMATIONS_RESOLVED: &str = "streamwire_confirmations_resolved_total";
/// Name of the counter tracking messages yielded to consumers.
pub const MESSAGES_DELIVERED: &str = "streamwire_messages_delivered_total";
/// Name of the counter tracking error occurrences.
pub const ERRORS_TOTAL: &str = "streamwire_errors_total";

/// Direction of frame processing.
#[derive(Clone, Copy)]
pub enum Direction {
    /// Inbound frames received from the broker.
    Inbound,
    /// Outbound frames sent to the broker.
    Outbound,
}

#[cfg(feature = "metrics")]
impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// How a tracked publishing id was resolved.
#[derive(Clone, Copy)]
pub enum ConfirmationOutcome {
    /// The broker confirmed the publishing id.
    Confirmed,
    /// The broker reported a per-id publish error.
    Errored,
}

#[cfg(feature = "metrics")]
impl ConfirmationOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ConfirmationOutcome::Confirmed => "confirmed",
            ConfirmationOutcome::Errored => "errored",
        }
    }
}

/// Increment the open connections gauge.
#[cfg(feature = "metrics")]
pub fn inc_connections() { gauge!(CONNECTIONS_ACTIVE).increment(1.0); }
#[cfg(not(feature = "metrics"))]
pub fn inc_connections() {}

/// Decrement the open connections gauge.
#[cfg(feature = "metrics")]
pub fn dec_connections() { gauge!(CONNECTIONS_ACTIVE).decrement(1.0); }
#[cfg(not(feature = "metrics"))]
pub fn dec_connections() {}

/// Record a processed frame for the given direction.
#[cfg(feature = "metrics")]
pub fn inc_frames(direction: Direction) {
    counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(1);
}
#[cfg(not(feature = "metrics"))]
pub fn inc_frames(_direction: Direction) {}

/// Record messages handed to a publish frame.
#[cfg(feature = "metrics")]
pub fn inc_published(count: u64) { counter!(MESSAGES_PUBLISHED).increment(count); }
#[cfg(not(feature = "metrics"))]
pub fn inc_published(_count: u64) {}

/// Record resolved confirmations with their outcome.
#[cfg(feature = "metrics")]
pub fn inc_confirmations(outcome: ConfirmationOutcome, count: u64) {
    counter!(CONFIRMATIONS_RESOLVED, "outcome" => outcome.as_str()).increment(count);
}
#[cfg(not(feature = "metrics"))]
pub fn inc_confirmations(_outcome: ConfirmationOutcome, _count: u64) {}

/// Record messages yielded to a consumer.
#[cfg(feature = "metrics")]
pub fn inc_delivered(count: u64) { counter!(MESSAGES_DELIVERED).increment(count); }
#[cfg(not(feature = "metrics"))]
pub fn inc_delivered(_count: u64) {}

/// Record an error occurrence.
#[cfg(feature = "metrics")]
pub fn inc_errors() { counter!(ERRORS_TOTAL).increment(1); }
#[cfg(not(feature = "metrics"))]
pub fn inc_errors() {}
