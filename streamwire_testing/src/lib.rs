//! Test support for `streamwire`: a scriptable mock broker speaking the
//! server side of the stream protocol over real TCP, chunk fabrication
//! helpers, and log-capture fixtures.
//!
//! The broker is wire-level and independent of the client's codec, so a
//! client bug cannot hide behind its own encoder. Scripts configure the
//! handshake outcome, the streams that exist, and the chunks to deliver;
//! a control handle drives pushes (deliveries, metadata updates, close)
//! while a test runs.
//!
//! ```rust,no_run
//! use streamwire_testing::{BrokerScript, MockBroker};
//!
//! # async fn example() {
//! let broker = MockBroker::start(BrokerScript::default().with_stream("orders")).await;
//! let endpoint = broker.endpoint();
//! // point a client at `endpoint` ...
//! # }
//! ```

mod broker;
mod chunk;
mod logging;
mod wire;

pub use broker::{BrokerScript, MockBroker, PublishedMessage, SubscriptionSeen, code};
pub use chunk::{ChunkBuilder, message_entry};
pub use logging::{LoggerHandle, logger};
