//! Multiplexed broker connection.
//!
//! A connection owns one TCP socket and two tasks: a writer draining an
//! outbound request queue (interleaving heartbeats), and a reader routing
//! inbound frames to correlated waiters, publishers, and consumers. Any
//! number of entities share one connection; correlation ids pair replies
//! with requests regardless of arrival order.
//!
//! The first fatal condition observed on a connection is recorded once and
//! fanned out to every outstanding waiter and registered entity exactly
//! once. Per-message and per-chunk problems are reported on the affected
//! entity's own channel and never tear the connection down; see
//! [`crate::error`] for the taxonomy.

mod counter;
mod dispatch;
mod handshake;
mod reader;
mod writer;

use std::{
    future::Future,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::{codec::Framed, sync::CancellationToken, task::TaskTracker};

use crate::{
    codec::{CodecError, DEFAULT_FRAME_MAX, Request, Response, ResponseCode, StreamCodec},
    config::ClientConfig,
    correlation::CorrelationTable,
    error::StreamError,
};

pub use counter::active_connection_count;
pub(crate) use dispatch::{ConsumerEvent, PublisherEvent};
use handshake::Negotiated;

/// Depth of the outbound queue shared by every entity on a connection.
///
/// Publish frames dominate the traffic; backpressure from a slow socket is
/// surfaced to publishers as `send` suspension rather than unbounded
/// buffering.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Handle to a multiplexed broker connection.
///
/// Cloning is cheap; all clones share the socket, the correlation table,
/// and the dispatch registry. The connection stays open until
/// [`Connection::close`] is called or a fatal error tears it down, even if
/// every handle is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    endpoint: String,
    request_timeout: Duration,
    negotiated: Negotiated,
    correlations: CorrelationTable,
    dispatch: dispatch::DispatchTable,
    outbound: mpsc::Sender<Request>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    fault: OnceLock<Fault>,
    closing: AtomicBool,
}

/// First fatal condition observed on a connection.
///
/// Set exactly once; every error surfaced after teardown derives from it.
#[derive(Clone, Debug)]
enum Fault {
    /// The transport failed or a frame could not be decoded.
    Lost(String),
    /// No inbound traffic within the negotiated window.
    HeartbeatTimeout(Duration),
    /// The broker sent a close frame and the connection wound down cleanly.
    ClosedByPeer,
}

impl Fault {
    /// Error delivered to waiters and registered entities after teardown.
    ///
    /// Transport loss and heartbeat silence surface as
    /// [`StreamError::ConnectionLost`]; a broker-initiated close was
    /// acknowledged and counts as an orderly shutdown.
    fn cascade(&self) -> StreamError {
        match self {
            Self::Lost(reason) => StreamError::ConnectionLost(reason.clone()),
            Self::HeartbeatTimeout(window) => StreamError::ConnectionLost(format!(
                "no frame traffic within the {window:?} heartbeat window"
            )),
            Self::ClosedByPeer => StreamError::ConnectionClosed,
        }
    }
}

impl From<StreamError> for Fault {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::HeartbeatTimeout(window) => Self::HeartbeatTimeout(window),
            StreamError::ClosedByPeer { .. } => Self::ClosedByPeer,
            StreamError::Corrupt(err) => Self::Lost(format!("corrupt frame: {err}")),
            StreamError::ConnectionLost(reason) => Self::Lost(reason),
            other => Self::Lost(other.to_string()),
        }
    }
}

impl ConnectionInner {
    fn cascade_error(&self) -> StreamError {
        self.fault
            .get()
            .map_or(StreamError::ConnectionClosed, Fault::cascade)
    }
}

impl Connection {
    /// Dial `config.endpoint`, run the handshake, and start the connection
    /// tasks.
    ///
    /// Dial failures are retried according to `config.retry`; handshake and
    /// authentication failures are not, since retrying them cannot succeed
    /// without different credentials.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] when every dial attempt fails, and the
    /// handshake taxonomy ([`StreamError::Handshake`],
    /// [`StreamError::Authentication`]) when the broker refuses the
    /// connection.
    pub async fn open(config: ClientConfig) -> Result<Self, StreamError> {
        let stream = dial(&config).await?;
        Self::from_stream(stream, config).await
    }

    /// Run the handshake over an established socket and start the tasks.
    pub(crate) async fn from_stream(
        stream: TcpStream,
        config: ClientConfig,
    ) -> Result<Self, StreamError> {
        stream.set_nodelay(true)?;
        let endpoint = config.endpoint.clone();
        let initial = if config.frame_max == 0 {
            DEFAULT_FRAME_MAX
        } else {
            config.frame_max
        };
        let mut framed = Framed::new(stream, StreamCodec::new(initial));
        let correlations = CorrelationTable::new();
        let negotiated = handshake::perform(&mut framed, &correlations, &config).await?;
        log::info!(
            "connection opened: endpoint={endpoint}, frame_max={}, heartbeat={}s",
            negotiated.frame_max,
            negotiated.heartbeat,
        );
        let guard = counter::ActiveConnection::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (sink, frames) = framed.split();
        let inner = Arc::new(ConnectionInner {
            endpoint,
            request_timeout: config.request_timeout,
            negotiated,
            correlations,
            dispatch: dispatch::DispatchTable::new(),
            outbound: outbound_tx,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            fault: OnceLock::new(),
            closing: AtomicBool::new(false),
        });
        inner
            .tasks
            .spawn(writer::run(Arc::clone(&inner), sink, outbound_rx));
        inner.tasks.spawn(reader::run(Arc::clone(&inner), frames, guard));
        Ok(Self { inner })
    }

    /// Send a correlated request and await its reply.
    ///
    /// `build` receives the freshly minted correlation id and produces the
    /// request carrying it.
    pub(crate) async fn request(
        &self,
        build: impl FnOnce(u32) -> Request,
    ) -> Result<Response, StreamError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(inner.cascade_error());
        }
        let (correlation_id, reply) = inner.correlations.register();
        if inner.outbound.send(build(correlation_id)).await.is_err() {
            inner.correlations.forget(correlation_id);
            return Err(inner.cascade_error());
        }
        match tokio::time::timeout(inner.request_timeout, reply).await {
            Ok(Ok(response)) => Ok(response),
            // The sender was dropped during teardown; report the fault.
            Ok(Err(_)) => Err(inner.cascade_error()),
            Err(_) => {
                inner.correlations.forget(correlation_id);
                Err(StreamError::RequestTimeout {
                    correlation_id,
                    timeout: inner.request_timeout,
                })
            }
        }
    }

    /// Enqueue a frame that has no reply, waiting for queue space.
    pub(crate) async fn send(&self, request: Request) -> Result<(), StreamError> {
        if self.inner.outbound.send(request).await.is_err() {
            return Err(self.inner.cascade_error());
        }
        Ok(())
    }

    /// Enqueue a frame without waiting, for use inside `poll` contexts.
    pub(crate) fn try_send(
        &self,
        request: Request,
    ) -> Result<(), mpsc::error::TrySendError<Request>> {
        self.inner.outbound.try_send(request)
    }

    /// Track a task tied to this connection's lifetime; `close` waits for
    /// it.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tasks.spawn(task);
    }

    /// Register a publisher event channel and allocate its publisher id.
    pub(crate) fn register_publisher(
        &self,
        stream: &str,
        events: mpsc::UnboundedSender<PublisherEvent>,
    ) -> Result<u8, StreamError> {
        self.inner.dispatch.register_publisher(stream, events)
    }

    /// Drop a publisher registration; confirmations for the id are ignored
    /// from here on.
    pub(crate) fn unregister_publisher(&self, publisher_id: u8) {
        self.inner.dispatch.unregister_publisher(publisher_id);
    }

    /// Register a consumer event channel and allocate its subscription id.
    pub(crate) fn register_consumer(
        &self,
        stream: &str,
        events: mpsc::UnboundedSender<ConsumerEvent>,
    ) -> Result<u8, StreamError> {
        self.inner.dispatch.register_consumer(stream, events)
    }

    /// Drop a consumer registration; deliveries for the id are ignored from
    /// here on.
    pub(crate) fn unregister_consumer(&self, subscription_id: u8) {
        self.inner.dispatch.unregister_consumer(subscription_id);
    }

    /// Receive the names of streams whose topology changed.
    ///
    /// Only the first caller gets a receiver; subsequent calls return
    /// `None`.
    pub(crate) fn watch_metadata(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.inner.dispatch.watch_metadata()
    }

    /// Error describing why the connection is finished, for entities that
    /// observe teardown indirectly.
    pub(crate) fn terminal_error(&self) -> StreamError {
        self.inner.cascade_error()
    }

    /// Token cancelled once the connection begins shutting down, for
    /// helper tasks that must not outlive it.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Negotiated maximum frame size in bytes.
    #[must_use]
    pub fn frame_max(&self) -> u32 {
        self.inner.negotiated.frame_max
    }

    /// Negotiated heartbeat interval in seconds; zero disables heartbeats.
    #[must_use]
    pub fn heartbeat(&self) -> u32 {
        self.inner.negotiated.heartbeat
    }

    /// Properties the broker advertised during the handshake.
    #[must_use]
    pub fn server_properties(&self) -> &[(String, String)] {
        &self.inner.negotiated.server_properties
    }

    /// Properties returned by the open step, including the advertised
    /// host and port used for leader comparisons.
    pub(crate) fn connection_properties(&self) -> &[(String, String)] {
        &self.inner.negotiated.connection_properties
    }

    /// Whether the connection has terminated or began closing.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Close the connection and wait for both tasks to finish.
    ///
    /// The first caller performs the close exchange with the broker (unless
    /// the connection already faulted); every caller waits for teardown to
    /// complete. Outstanding waiters and registered entities receive
    /// [`StreamError::ConnectionClosed`]. Calling `close` more than once is
    /// harmless.
    pub async fn close(&self) {
        let inner = &self.inner;
        if !inner.closing.swap(true, Ordering::SeqCst) {
            if inner.fault.get().is_none() && !inner.shutdown.is_cancelled() {
                let farewell = self
                    .request(|correlation_id| Request::Close {
                        correlation_id,
                        code: ResponseCode::Ok,
                        reason: String::from("client shutdown"),
                    })
                    .await;
                if let Err(err) = farewell {
                    tracing::debug!("close exchange failed: error={err}");
                }
            }
            inner.shutdown.cancel();
            inner.tasks.close();
        }
        inner.tasks.wait().await;
    }
}

/// Connect to the configured endpoint, retrying per the retry policy.
async fn dial(config: &ClientConfig) -> Result<TcpStream, StreamError> {
    let delays = config.retry.delays();
    let mut attempt = 0usize;
    loop {
        match TcpStream::connect(&config.endpoint).await {
            Ok(stream) => return Ok(stream),
            Err(err) if attempt < delays.len() => {
                let delay = delays[attempt];
                attempt += 1;
                log::warn!(
                    "dial failed, retrying: endpoint={}, attempt={attempt}, delay={delay:?}, error={err}",
                    config.endpoint,
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Fold a codec error into the connection-level taxonomy.
///
/// Transport and EOF failures mean the peer is gone; malformed frames mean
/// the byte stream cannot be trusted. Both are fatal.
fn transport_error(err: CodecError) -> StreamError {
    match err {
        CodecError::Io(err) => StreamError::ConnectionLost(err.to_string()),
        CodecError::Eof(err) => StreamError::ConnectionLost(err.to_string()),
        other => StreamError::Corrupt(other),
    }
}

/// Negotiated heartbeat interval as a duration; `None` when disabled.
fn heartbeat_window(heartbeat: u32) -> Option<Duration> {
    (heartbeat != 0).then_some(Duration::from_secs(u64::from(heartbeat)))
}

#[cfg(test)]
mod tests {
    use std::io;

    use rstest::rstest;

    use super::*;
    use crate::codec::{EofError, FramingError};

    #[test]
    fn transport_loss_becomes_connection_lost() {
        let err = transport_error(CodecError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(matches!(err, StreamError::ConnectionLost(_)));

        let err = transport_error(CodecError::Eof(EofError::MidHeader {
            bytes_received: 2,
            header_size: 4,
        }));
        assert!(matches!(err, StreamError::ConnectionLost(_)));
    }

    #[test]
    fn malformed_frames_become_corrupt() {
        let err = transport_error(CodecError::Framing(FramingError::EmptyFrame));
        assert!(matches!(err, StreamError::Corrupt(_)));
    }

    #[test]
    fn faults_cascade_as_terminal_errors() {
        let lost = Fault::Lost(String::from("broken pipe"));
        assert!(matches!(lost.cascade(), StreamError::ConnectionLost(r) if r == "broken pipe"));

        let stale = Fault::HeartbeatTimeout(Duration::from_secs(60));
        assert!(matches!(stale.cascade(), StreamError::ConnectionLost(_)));

        assert!(matches!(
            Fault::ClosedByPeer.cascade(),
            StreamError::ConnectionClosed
        ));
    }

    #[rstest]
    #[case(StreamError::HeartbeatTimeout(Duration::from_secs(30)))]
    #[case(StreamError::ClosedByPeer {
        code: ResponseCode::Ok,
        reason: String::from("bye"),
    })]
    #[case(StreamError::ConnectionLost(String::from("reset")))]
    fn reader_outcomes_map_onto_faults(#[case] err: StreamError) {
        let fault = Fault::from(err);
        match fault {
            Fault::HeartbeatTimeout(window) => assert_eq!(window, Duration::from_secs(30)),
            Fault::ClosedByPeer | Fault::Lost(_) => {}
        }
    }

    #[test]
    fn heartbeat_window_is_disabled_at_zero() {
        assert_eq!(heartbeat_window(0), None);
        assert_eq!(heartbeat_window(60), Some(Duration::from_secs(60)));
    }
}
