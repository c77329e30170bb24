//! Integration tests for publisher declaration, confirmation, and flow
//! control against the scripted broker.

use std::time::Duration;

use streamwire::{
    ConfirmationStatus, Message, StreamError, codec::ResponseCode,
};
use streamwire_testing::{BrokerScript, MockBroker, code};

mod common;
use common::{TestResult, connect, eventually, within};

#[tokio::test]
async fn published_messages_reach_the_broker_and_confirm() -> TestResult {
    let broker = MockBroker::start(BrokerScript::default().with_stream("orders")).await;
    let client = within(connect(&broker)).await?;
    let publisher = within(client.publisher("orders").build()).await?;

    let confirmation = within(publisher.send_with_confirm(Message::new("first order"))).await?;
    assert_eq!(confirmation.publishing_id, 1);
    assert_eq!(confirmation.status, ConfirmationStatus::Confirmed);

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].publishing_id, 1);
    assert_eq!(published[0].payload().as_ref(), b"first order");

    within(publisher.delete()).await?;
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn publishing_ids_count_up_from_one() -> TestResult {
    let broker = MockBroker::start(BrokerScript::default().with_stream("orders")).await;
    let client = within(connect(&broker)).await?;
    let publisher = within(client.publisher("orders").build()).await?;

    for expected in 1..=3 {
        let pending = within(publisher.send(Message::new("m"))).await?;
        assert_eq!(pending.publishing_id(), expected);
        within(pending).await?;
    }

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn a_named_publisher_resumes_after_the_stored_sequence() -> TestResult {
    let broker = MockBroker::start(
        BrokerScript::default()
            .with_stream("orders")
            .with_publisher_sequence("invoicer", "orders", 41),
    )
    .await;
    let client = within(connect(&broker)).await?;
    let publisher = within(client.publisher("orders").reference("invoicer").build()).await?;

    let confirmation = within(publisher.send_with_confirm(Message::new("resumed"))).await?;
    assert_eq!(confirmation.publishing_id, 42);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn broker_rejections_surface_with_their_code() -> TestResult {
    let broker = MockBroker::start(
        BrokerScript::default()
            .with_stream("orders")
            .publish_error(code::ACCESS_REFUSED),
    )
    .await;
    let client = within(connect(&broker)).await?;
    let publisher = within(client.publisher("orders").build()).await?;

    let confirmation = within(within(publisher.send(Message::new("denied"))).await?).await?;
    assert_eq!(
        confirmation.status,
        ConfirmationStatus::Rejected(ResponseCode::AccessRefused)
    );

    let result = within(publisher.send_with_confirm(Message::new("denied again"))).await;
    assert!(matches!(
        result,
        Err(StreamError::Publish {
            code: ResponseCode::AccessRefused,
            ..
        })
    ));

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn batches_confirm_message_by_message() -> TestResult {
    let broker = MockBroker::start(BrokerScript::default().with_stream("orders")).await;
    let client = within(connect(&broker)).await?;
    let publisher = within(client.publisher("orders").build()).await?;

    let handles = within(publisher.send_batch(vec![
        Message::new("a"),
        Message::new("b"),
        Message::new("c"),
    ]))
    .await?;
    assert_eq!(
        handles.iter().map(|h| h.publishing_id()).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    for handle in handles {
        let confirmation = within(handle).await?;
        assert_eq!(confirmation.status, ConfirmationStatus::Confirmed);
    }

    let payloads: Vec<_> = broker
        .published()
        .iter()
        .map(|message| message.payload())
        .collect();
    assert_eq!(payloads, vec!["a", "b", "c"]);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn a_batch_larger_than_the_cap_is_rejected_outright() -> TestResult {
    let broker = MockBroker::start(BrokerScript::default().with_stream("orders")).await;
    let client = within(connect(&broker)).await?;
    let publisher = within(client.publisher("orders").max_in_flight(2).build()).await?;

    let result = within(publisher.send_batch(vec![
        Message::new("a"),
        Message::new("b"),
        Message::new("c"),
    ]))
    .await;
    assert!(matches!(
        result,
        Err(StreamError::BatchTooLarge { len: 3, capacity: 2 })
    ));

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn the_in_flight_cap_suspends_send_until_confirmation() -> TestResult {
    let broker = MockBroker::start(BrokerScript::default().with_stream("orders")).await;
    let client = within(connect(&broker)).await?;
    let publisher = within(client.publisher("orders").max_in_flight(1).build()).await?;

    // Stop the broker answering so the first message never confirms.
    broker.mute();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let _unconfirmed = within(publisher.send(Message::new("occupies the slot"))).await?;
    eventually(|| publisher.outstanding() == 1).await;

    let second = tokio::time::timeout(
        Duration::from_millis(300),
        publisher.send(Message::new("must wait")),
    )
    .await;
    assert!(second.is_err(), "send should suspend at the in-flight cap");

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn declaring_on_a_missing_stream_fails() -> TestResult {
    let broker = MockBroker::start(BrokerScript::default()).await;
    let client = within(connect(&broker)).await?;

    let result = within(client.publisher("missing").build()).await;
    assert!(matches!(
        result,
        Err(StreamError::StreamNotFound { stream }) if stream == "missing"
    ));

    client.close().await;
    Ok(())
}
