//! Client configuration and connect retry policy.
//!
//! Plain values consumed by the connection and client builders. Loading
//! these from files or the environment is left to the embedding
//! application.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_FRAME_MAX;

/// Default broker stream endpoint.
pub const DEFAULT_ENDPOINT: &str = "localhost:5552";

/// Default heartbeat interval requested during tune, in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u32 = 60;

/// Default correlated-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for one broker connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker address in `host:port` form.
    pub endpoint: String,
    /// SASL PLAIN username.
    pub username: String,
    /// SASL PLAIN password.
    pub password: String,
    /// Virtual host opened after authentication.
    pub virtual_host: String,
    /// Requested heartbeat interval in seconds; `0` disables heartbeats.
    pub heartbeat: u32,
    /// Requested maximum outbound frame size in bytes; `0` means unlimited.
    pub frame_max: u32,
    /// How long a correlated request may wait for its response.
    pub request_timeout: Duration,
    /// Properties announced in the peer-properties exchange.
    pub client_properties: Vec<(String, String)>,
    /// Retry policy for the initial dial.
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            virtual_host: "/".to_owned(),
            heartbeat: DEFAULT_HEARTBEAT_SECS,
            frame_max: DEFAULT_FRAME_MAX,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            client_properties: default_client_properties(),
            retry: RetryPolicy::None,
        }
    }
}

fn default_client_properties() -> Vec<(String, String)> {
    vec![
        ("product".to_owned(), "streamwire".to_owned()),
        ("version".to_owned(), env!("CARGO_PKG_VERSION").to_owned()),
        ("platform".to_owned(), "Rust".to_owned()),
    ]
}

/// Backoff applied when the initial dial fails.
///
/// Only the first connection is retried; an established connection that
/// later fails surfaces the failure to its dependents instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Fail on the first dial error.
    #[default]
    None,
    /// Retry with exponentially growing delays.
    ExponentialBackoff {
        /// Delay before the first redial.
        initial: Duration,
        /// Factor applied to the delay after each failed attempt.
        multiplier: u32,
        /// Upper bound for any single delay.
        max_delay: Duration,
        /// Total dial attempts, including the first.
        max_attempts: u32,
    },
}

impl RetryPolicy {
    /// Delays to sleep before each redial, in order.
    ///
    /// Empty for [`RetryPolicy::None`] and for a backoff allowing a single
    /// attempt.
    pub(crate) fn delays(self) -> Vec<Duration> {
        match self {
            Self::None => Vec::new(),
            Self::ExponentialBackoff {
                initial,
                multiplier,
                max_delay,
                max_attempts,
            } => {
                let redials = max_attempts.saturating_sub(1);
                let mut delays = Vec::new();
                let mut delay = initial;
                for _ in 0..redials {
                    delays.push(delay.min(max_delay));
                    delay = delay.saturating_mul(multiplier).min(max_delay);
                }
                delays
            }
        }
    }
}
