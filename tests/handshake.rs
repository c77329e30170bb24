//! Integration tests for connection establishment outcomes.
//!
//! Each test scripts the mock broker's answers for one handshake step and
//! asserts the client surfaces the matching error, or, on success, the
//! negotiated connection state.

use std::time::Duration;

use streamwire::{
    StreamClient, StreamError,
    error::{AuthenticationError, HandshakeError},
};
use streamwire_testing::{BrokerScript, MockBroker, code};

mod common;
use common::{TestResult, connect, within};

#[tokio::test]
async fn a_successful_handshake_exposes_server_properties() -> TestResult {
    let broker = MockBroker::start(BrokerScript::default()).await;
    let client = within(connect(&broker)).await?;

    assert!(
        client
            .server_properties()
            .iter()
            .any(|(key, value)| key == "product" && value == "streamwire-mock"),
        "expected the mock's product property, got {:?}",
        client.server_properties()
    );
    assert_eq!(broker.connection_count(), 1);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn bad_credentials_fail_the_connect() {
    let broker = MockBroker::start(
        BrokerScript::default().auth_code(code::AUTHENTICATION_FAILURE),
    )
    .await;

    let result = within(connect(&broker)).await;
    assert!(matches!(
        result,
        Err(StreamError::Authentication(
            AuthenticationError::InvalidCredentials
        ))
    ));
}

#[tokio::test]
async fn loopback_restricted_accounts_are_reported_as_such() {
    let broker = MockBroker::start(
        BrokerScript::default().auth_code(code::AUTHENTICATION_FAILURE_LOOPBACK),
    )
    .await;

    let result = within(connect(&broker)).await;
    assert!(matches!(
        result,
        Err(StreamError::Authentication(AuthenticationError::LoopbackOnly))
    ));
}

#[tokio::test]
async fn virtual_host_refusal_names_the_virtual_host() {
    let broker = MockBroker::start(
        BrokerScript::default().open_code(code::VIRTUAL_HOST_ACCESS_FAILURE),
    )
    .await;

    let result = within(
        StreamClient::builder()
            .endpoint(broker.endpoint())
            .virtual_host("production")
            .request_timeout(Duration::from_secs(2))
            .connect(),
    )
    .await;
    assert!(matches!(
        result,
        Err(StreamError::Authentication(AuthenticationError::VirtualHost {
            virtual_host
        })) if virtual_host == "production"
    ));
}

#[tokio::test]
async fn a_broker_without_plain_support_is_rejected() {
    let broker = MockBroker::start(
        BrokerScript::default().mechanisms(vec![String::from("EXTERNAL")]),
    )
    .await;

    let result = within(connect(&broker)).await;
    assert!(matches!(
        result,
        Err(StreamError::Handshake(HandshakeError::MechanismNotSupported {
            offered
        })) if offered == ["EXTERNAL"]
    ));
}

#[tokio::test]
async fn an_unreachable_endpoint_fails_the_dial() {
    // Bind and immediately drop a listener so the port is free but closed.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("address").port();
    drop(listener);

    let result = within(
        StreamClient::builder()
            .endpoint(format!("localhost:{port}"))
            .connect(),
    )
    .await;
    assert!(result.is_err(), "dialling a closed port should fail");
}
