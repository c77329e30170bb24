#![doc(html_root_url = "https://docs.rs/streamwire/latest")]
//! Client core for RabbitMQ's stream binary protocol.
//!
//! `streamwire` speaks the stream protocol over plain TCP: one
//! multiplexed [`connection::Connection`] per broker carries correlated
//! requests, publisher confirmations, and credit-driven chunk delivery.
//! The [`client::StreamClient`] façade layers stream lifecycle and
//! topology handling on top and hands out [`publisher::Publisher`] and
//! [`consumer::Consumer`] entities.
//!
//! ```no_run
//! use futures::StreamExt;
//! use streamwire::{StreamClient, StreamConfig, message::Message};
//!
//! # async fn demo() -> Result<(), streamwire::StreamError> {
//! let client = StreamClient::builder()
//!     .endpoint("localhost:5552")
//!     .credentials("guest", "guest")
//!     .connect()
//!     .await?;
//! client.create_stream("orders", StreamConfig::default()).await?;
//!
//! let publisher = client.publisher("orders").build().await?;
//! publisher.send_with_confirm(Message::new("order created")).await?;
//!
//! let mut consumer = client.consumer("orders").build().await?;
//! if let Some(delivery) = consumer.next().await {
//!     println!("offset {}", delivery?.offset);
//! }
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
mod correlation;
pub mod error;
pub mod message;
pub mod metrics;
pub mod offset;
pub mod publisher;

pub use client::{ByteCapacity, StreamClient, StreamClientBuilder, StreamConfig, StreamTopology};
pub use config::{ClientConfig, RetryPolicy};
pub use connection::Connection;
pub use consumer::{Consumer, ConsumerBuilder, CreditPolicy, Delivery};
pub use error::StreamError;
pub use message::Message;
pub use offset::OffsetSpecification;
pub use publisher::{
    Confirmation,
    ConfirmationStatus,
    PendingConfirmation,
    Publisher,
    PublisherBuilder,
};
