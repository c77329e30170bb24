//! Stream client façade: stream lifecycle, topology, and entity builders.
//!
//! A [`StreamClient`] owns one locator [`Connection`] used for stream
//! management and metadata queries. Publishers and consumers built
//! through the client resolve their stream's leader from (cached)
//! metadata and share the locator when the leader is the node already
//! dialled, otherwise they get a dedicated connection to the leader.
//! Metadata-update pushes from the broker invalidate the leader cache;
//! entities bound to the affected stream observe
//! [`StreamError::StreamUnavailable`] and reattach under the caller's
//! policy.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;

use crate::{
    codec::{Broker, Request, ResponseCode, ResponseKind},
    config::{ClientConfig, RetryPolicy},
    connection::Connection,
    consumer::ConsumerBuilder,
    error::StreamError,
    publisher::PublisherBuilder,
};

/// Handle on one broker (or cluster) for stream work.
///
/// Cloning is cheap and shares the locator connection and leader cache.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    locator: Connection,
    config: ClientConfig,
    leaders: Arc<DashMap<String, String>>,
}

/// Chained configuration for [`StreamClient::connect`].
#[derive(Clone, Debug, Default)]
pub struct StreamClientBuilder {
    config: ClientConfig,
}

impl StreamClientBuilder {
    /// Broker address in `host:port` form.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// SASL PLAIN credentials.
    #[must_use]
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.config.username = username.into();
        self.config.password = password.into();
        self
    }

    /// Virtual host opened after authentication.
    #[must_use]
    pub fn virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.config.virtual_host = virtual_host.into();
        self
    }

    /// Requested heartbeat interval in seconds; zero disables heartbeats.
    #[must_use]
    pub fn heartbeat(mut self, seconds: u32) -> Self {
        self.config.heartbeat = seconds;
        self
    }

    /// Requested maximum frame size in bytes; zero means unlimited.
    #[must_use]
    pub fn frame_max(mut self, bytes: u32) -> Self {
        self.config.frame_max = bytes;
        self
    }

    /// How long correlated requests wait before timing out.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Announce an extra property in the peer-properties exchange.
    #[must_use]
    pub fn client_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .client_properties
            .push((key.into(), value.into()));
        self
    }

    /// Backoff applied when the initial dial fails.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Dial the endpoint and perform the handshake.
    ///
    /// # Errors
    ///
    /// Fails when the broker is unreachable after the retry policy is
    /// exhausted, or when the handshake or authentication fails.
    pub async fn connect(self) -> Result<StreamClient, StreamError> {
        StreamClient::connect(self.config).await
    }
}

impl StreamClient {
    /// Start configuring a client.
    #[must_use]
    pub fn builder() -> StreamClientBuilder {
        StreamClientBuilder::default()
    }

    /// Connect with an explicit [`ClientConfig`].
    ///
    /// # Errors
    ///
    /// Fails when the dial, handshake, or authentication fails.
    pub async fn connect(config: ClientConfig) -> Result<Self, StreamError> {
        let locator = Connection::open(config.clone()).await?;
        let client = Self {
            inner: Arc::new(ClientInner {
                locator,
                config,
                leaders: Arc::new(DashMap::new()),
            }),
        };
        client.watch_topology();
        Ok(client)
    }

    /// Invalidate cached leaders as the broker announces topology changes.
    fn watch_topology(&self) {
        let Some(mut updates) = self.inner.locator.watch_metadata() else {
            return;
        };
        let leaders = Arc::clone(&self.inner.leaders);
        let shutdown = self.inner.locator.shutdown_token();
        self.inner.locator.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    update = updates.recv() => {
                        let Some(stream) = update else { break };
                        if leaders.remove(&stream).is_some() {
                            log::info!("leader cache invalidated: stream={stream}");
                        } else {
                            log::debug!(
                                "metadata update for uncached stream: stream={stream}"
                            );
                        }
                    }
                }
            }
        });
    }

    /// Start configuring a publisher on `stream`.
    #[must_use]
    pub fn publisher(&self, stream: impl Into<String>) -> PublisherBuilder {
        PublisherBuilder::new(self.clone(), stream.into())
    }

    /// Start configuring a consumer on `stream`.
    #[must_use]
    pub fn consumer(&self, stream: impl Into<String>) -> ConsumerBuilder {
        ConsumerBuilder::new(self.clone(), stream.into())
    }

    /// Create `stream` with the given retention settings.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::StreamAlreadyExists`] when the name is taken.
    pub async fn create_stream(&self, stream: &str, config: StreamConfig) -> Result<(), StreamError> {
        let response = self
            .inner
            .locator
            .request(|correlation_id| Request::CreateStream {
                correlation_id,
                stream: stream.to_owned(),
                arguments: config.into_arguments(),
            })
            .await?;
        let code = response.kind.code();
        if code.is_ok() {
            log::info!("stream created: stream={stream}");
            Ok(())
        } else {
            Err(StreamError::from_code("create-stream", code, stream))
        }
    }

    /// Delete `stream` and everything retained in it.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::StreamNotFound`] when the stream does not
    /// exist.
    pub async fn delete_stream(&self, stream: &str) -> Result<(), StreamError> {
        let response = self
            .inner
            .locator
            .request(|correlation_id| Request::DeleteStream {
                correlation_id,
                stream: stream.to_owned(),
            })
            .await?;
        self.inner.leaders.remove(stream);
        let code = response.kind.code();
        if code.is_ok() {
            log::info!("stream deleted: stream={stream}");
            Ok(())
        } else {
            Err(StreamError::from_code("delete-stream", code, stream))
        }
    }

    /// Resolve the current topology of `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::StreamNotFound`] for unknown streams and
    /// [`StreamError::StreamUnavailable`] for streams without a reachable
    /// leader.
    pub async fn query_metadata(&self, stream: &str) -> Result<StreamTopology, StreamError> {
        let response = self
            .inner
            .locator
            .request(|correlation_id| Request::Metadata {
                correlation_id,
                streams: vec![stream.to_owned()],
            })
            .await?;
        let ResponseKind::Metadata { brokers, streams } = response.kind else {
            return Err(StreamError::ErrorResponse {
                operation: "metadata",
                code: response.kind.code(),
            });
        };
        let Some(meta) = streams.into_iter().find(|meta| meta.stream == stream) else {
            return Err(StreamError::StreamNotFound {
                stream: stream.to_owned(),
            });
        };
        if !meta.code.is_ok() {
            return Err(StreamError::from_code("metadata", meta.code, stream));
        }
        let leader = brokers
            .iter()
            .find(|broker| broker.reference == meta.leader)
            .cloned()
            .ok_or_else(|| StreamError::StreamUnavailable {
                stream: stream.to_owned(),
            })?;
        let replicas = meta
            .replicas
            .iter()
            .filter_map(|reference| {
                brokers
                    .iter()
                    .find(|broker| broker.reference == *reference)
                    .cloned()
            })
            .collect();
        Ok(StreamTopology { leader, replicas })
    }

    /// Whether `stream` exists, regardless of leader availability.
    ///
    /// # Errors
    ///
    /// Fails only on connection-level errors; existence questions are
    /// answered in the `bool`.
    pub async fn stream_exists(&self, stream: &str) -> Result<bool, StreamError> {
        match self.query_metadata(stream).await {
            Ok(_) | Err(StreamError::StreamUnavailable { .. }) => Ok(true),
            Err(StreamError::StreamNotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Fetch the offset stored for `reference` on `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::OffsetNotFound`] when nothing was stored
    /// under that reference.
    pub async fn query_offset(&self, reference: &str, stream: &str) -> Result<u64, StreamError> {
        let response = self
            .inner
            .locator
            .request(|correlation_id| Request::QueryOffset {
                correlation_id,
                reference: reference.to_owned(),
                stream: stream.to_owned(),
            })
            .await?;
        match response.kind {
            ResponseKind::Offset { code, offset } if code.is_ok() => Ok(offset),
            ResponseKind::Offset {
                code: ResponseCode::NoOffset,
                ..
            } => Err(StreamError::OffsetNotFound {
                reference: reference.to_owned(),
                stream: stream.to_owned(),
            }),
            kind => Err(StreamError::from_code("query-offset", kind.code(), stream)),
        }
    }

    /// Last publishing id stored for a publisher reference on `stream`;
    /// zero when the reference never published.
    ///
    /// # Errors
    ///
    /// Fails on connection-level errors or a broker rejection.
    pub async fn query_publisher_sequence(
        &self,
        reference: &str,
        stream: &str,
    ) -> Result<u64, StreamError> {
        let response = self
            .inner
            .locator
            .request(|correlation_id| Request::QueryPublisherSequence {
                correlation_id,
                reference: reference.to_owned(),
                stream: stream.to_owned(),
            })
            .await?;
        match response.kind {
            ResponseKind::PublisherSequence { code, sequence } if code.is_ok() => Ok(sequence),
            ResponseKind::PublisherSequence {
                code: ResponseCode::NoOffset,
                ..
            } => Ok(0),
            kind => Err(StreamError::from_code(
                "query-publisher-sequence",
                kind.code(),
                stream,
            )),
        }
    }

    /// Properties the broker advertised during the handshake.
    #[must_use]
    pub fn server_properties(&self) -> &[(String, String)] {
        self.inner.locator.server_properties()
    }

    /// Close the locator connection.
    ///
    /// Entities sharing the locator observe
    /// [`StreamError::ConnectionClosed`]; entities on dedicated
    /// connections are unaffected and close with their own handles.
    pub async fn close(&self) {
        self.inner.locator.close().await;
        log::info!("client closed: endpoint={}", self.inner.config.endpoint);
    }

    /// Connection serving `stream`'s leader, dialling a dedicated one when
    /// the locator points at a different node. The flag reports whether the
    /// connection is dedicated and owned by the caller.
    pub(crate) async fn entity_connection(
        &self,
        stream: &str,
    ) -> Result<(Connection, bool), StreamError> {
        let leader = self.leader_endpoint(stream).await?;
        if self.locator_serves(&leader) {
            return Ok((self.inner.locator.clone(), false));
        }
        log::debug!(
            "stream leader is a different node: stream={stream}, leader={leader}"
        );
        let mut config = self.inner.config.clone();
        config.endpoint = leader;
        let connection = Connection::open(config).await?;
        Ok((connection, true))
    }

    async fn leader_endpoint(&self, stream: &str) -> Result<String, StreamError> {
        if let Some(cached) = self.inner.leaders.get(stream) {
            return Ok(cached.value().clone());
        }
        let topology = self.query_metadata(stream).await?;
        let endpoint = broker_endpoint(&topology.leader);
        self.inner
            .leaders
            .insert(stream.to_owned(), endpoint.clone());
        Ok(endpoint)
    }

    /// Whether the locator connection terminates at `endpoint`, judged by
    /// the host and port the broker advertised at open.
    fn locator_serves(&self, endpoint: &str) -> bool {
        let properties = self.inner.locator.connection_properties();
        let advertised = |key: &str| {
            properties
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.as_str())
        };
        match (advertised("advertised_host"), advertised("advertised_port")) {
            (Some(host), Some(port)) => endpoint == format!("{host}:{port}"),
            // Brokers predating advertised addresses fall back to the
            // dialled endpoint.
            _ => self.inner.config.endpoint == endpoint,
        }
    }
}

fn broker_endpoint(broker: &Broker) -> String {
    format!("{}:{}", broker.host, broker.port)
}

/// Resolved topology for one stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamTopology {
    /// Node accepting writes for the stream.
    pub leader: Broker,
    /// Nodes holding replicas.
    pub replicas: Vec<Broker>,
}

/// Retention settings applied at stream creation.
///
/// The default keeps broker defaults for everything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamConfig {
    max_length: Option<ByteCapacity>,
    max_age: Option<Duration>,
    max_segment_size: Option<ByteCapacity>,
}

impl StreamConfig {
    /// Cap the total bytes retained in the stream.
    #[must_use]
    pub fn max_length(mut self, capacity: ByteCapacity) -> Self {
        self.max_length = Some(capacity);
        self
    }

    /// Cap the age of retained messages; truncated to whole seconds.
    #[must_use]
    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    /// Cap the size of individual log segments.
    #[must_use]
    pub fn max_segment_size(mut self, capacity: ByteCapacity) -> Self {
        self.max_segment_size = Some(capacity);
        self
    }

    fn into_arguments(self) -> Vec<(String, String)> {
        let mut arguments = Vec::new();
        if let Some(capacity) = self.max_length {
            arguments.push(("max-length-bytes".to_owned(), capacity.bytes().to_string()));
        }
        if let Some(age) = self.max_age {
            arguments.push(("max-age".to_owned(), format!("{}s", age.as_secs())));
        }
        if let Some(capacity) = self.max_segment_size {
            arguments.push((
                "stream-max-segment-size-bytes".to_owned(),
                capacity.bytes().to_string(),
            ));
        }
        arguments
    }
}

/// Byte size used in retention arguments, in decimal units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteCapacity {
    /// Bytes.
    B(u64),
    /// Kilobytes (1000 bytes).
    KB(u64),
    /// Megabytes.
    MB(u64),
    /// Gigabytes.
    GB(u64),
    /// Terabytes.
    TB(u64),
}

impl ByteCapacity {
    /// The capacity in bytes, saturating at `u64::MAX`.
    #[must_use]
    pub fn bytes(self) -> u64 {
        match self {
            Self::B(count) => count,
            Self::KB(count) => count.saturating_mul(1_000),
            Self::MB(count) => count.saturating_mul(1_000_000),
            Self::GB(count) => count.saturating_mul(1_000_000_000),
            Self::TB(count) => count.saturating_mul(1_000_000_000_000),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ByteCapacity::B(512), 512)]
    #[case(ByteCapacity::KB(2), 2_000)]
    #[case(ByteCapacity::MB(5), 5_000_000)]
    #[case(ByteCapacity::GB(1), 1_000_000_000)]
    #[case(ByteCapacity::TB(1), 1_000_000_000_000)]
    #[case(ByteCapacity::TB(u64::MAX), u64::MAX)]
    fn byte_capacities_scale_decimally(#[case] capacity: ByteCapacity, #[case] bytes: u64) {
        assert_eq!(capacity.bytes(), bytes);
    }

    #[test]
    fn retention_settings_become_broker_arguments() {
        let arguments = StreamConfig::default()
            .max_length(ByteCapacity::GB(2))
            .max_age(Duration::from_secs(3600))
            .max_segment_size(ByteCapacity::MB(100))
            .into_arguments();
        assert_eq!(
            arguments,
            vec![
                ("max-length-bytes".to_owned(), "2000000000".to_owned()),
                ("max-age".to_owned(), "3600s".to_owned()),
                ("stream-max-segment-size-bytes".to_owned(), "100000000".to_owned()),
            ]
        );
    }

    #[test]
    fn an_empty_stream_config_sends_no_arguments() {
        assert!(StreamConfig::default().into_arguments().is_empty());
    }

    #[test]
    fn the_builder_accumulates_connection_settings() {
        let builder = StreamClient::builder()
            .endpoint("broker-1:5552")
            .credentials("svc", "secret")
            .virtual_host("orders")
            .heartbeat(30)
            .frame_max(262_144)
            .client_property("connection_name", "billing")
            .retry(RetryPolicy::ExponentialBackoff {
                initial: Duration::from_millis(50),
                multiplier: 2,
                max_delay: Duration::from_secs(1),
                max_attempts: 4,
            });
        assert_eq!(builder.config.endpoint, "broker-1:5552");
        assert_eq!(builder.config.username, "svc");
        assert_eq!(builder.config.virtual_host, "orders");
        assert_eq!(builder.config.heartbeat, 30);
        assert_eq!(builder.config.frame_max, 262_144);
        assert!(
            builder
                .config
                .client_properties
                .iter()
                .any(|(key, value)| key == "connection_name" && value == "billing")
        );
    }
}
