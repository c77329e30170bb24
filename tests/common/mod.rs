//! Shared utilities for integration tests.
//!
//! Provides a client factory with test-friendly timeouts and guards that
//! turn hung operations into failures instead of wedged test binaries.

#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{future::Future, time::Duration};

use streamwire::{StreamClient, StreamError};
use streamwire_testing::MockBroker;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Connect a client to `broker` with a short request timeout.
pub async fn connect(broker: &MockBroker) -> Result<StreamClient, StreamError> {
    StreamClient::builder()
        .endpoint(broker.endpoint())
        .request_timeout(Duration::from_secs(2))
        .connect()
        .await
}

/// Await `future` with a hard cap so a hung test fails loudly.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("operation did not complete in time")
}

/// Poll `probe` until it holds or five seconds pass.
pub async fn eventually(probe: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !probe() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
