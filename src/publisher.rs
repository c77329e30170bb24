//! Message publication with asynchronous confirmation tracking.
//!
//! A [`Publisher`] assigns strictly increasing publishing ids and keeps an
//! outstanding entry per unconfirmed message. The broker confirms and
//! rejects ids asynchronously, possibly batched and out of order; each
//! entry resolves its caller's [`PendingConfirmation`] and releases one
//! slot of the in-flight capacity. When the cap is reached, `send`
//! suspends until a confirmation frees a slot.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};

use crate::{
    client::StreamClient,
    codec::{Request, ResponseCode, ResponseKind},
    connection::{Connection, PublisherEvent},
    error::StreamError,
    message::Message,
    metrics::{self, ConfirmationOutcome},
};

/// Default cap on unconfirmed messages per publisher.
const DEFAULT_MAX_IN_FLIGHT: usize = 512;

/// Broker verdict for one published message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmation {
    /// Publishing id the verdict refers to.
    pub publishing_id: u64,
    /// Whether the broker persisted or rejected the message.
    pub status: ConfirmationStatus,
}

/// Outcome side of a [`Confirmation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// The broker persisted the message.
    Confirmed,
    /// The broker rejected the message with the given code.
    Rejected(ResponseCode),
}

/// Future resolving to the broker's verdict for one message.
///
/// Dropping the handle makes the message fire-and-forget; the publisher
/// keeps tracking the id either way.
#[derive(Debug)]
pub struct PendingConfirmation {
    publishing_id: u64,
    reply: oneshot::Receiver<Result<Confirmation, StreamError>>,
}

impl PendingConfirmation {
    /// Publishing id this handle waits on.
    #[must_use]
    pub fn publishing_id(&self) -> u64 {
        self.publishing_id
    }
}

impl Future for PendingConfirmation {
    type Output = Result<Confirmation, StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply)
            .poll(cx)
            .map(|verdict| verdict.unwrap_or(Err(StreamError::ConnectionClosed)))
    }
}

/// Configures and declares a [`Publisher`]; obtained from
/// [`StreamClient::publisher`].
pub struct PublisherBuilder {
    client: StreamClient,
    stream: String,
    reference: Option<String>,
    max_in_flight: usize,
}

impl PublisherBuilder {
    pub(crate) fn new(client: StreamClient, stream: String) -> Self {
        Self {
            client,
            stream,
            reference: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Name this publisher for deduplication; the declare path resumes
    /// publishing ids after the last one the broker stored under it.
    #[must_use]
    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Cap on unconfirmed messages; `send` suspends at the cap. Values
    /// below one are treated as one.
    #[must_use]
    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Declare the publisher on the stream's leader.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::StreamNotFound`] when the stream does not
    /// exist, plus any connection-level failure from dialling or declaring.
    pub async fn build(self) -> Result<Publisher, StreamError> {
        let (connection, dedicated) = self.client.entity_connection(&self.stream).await?;
        match declare(&self, connection.clone(), dedicated).await {
            Ok(publisher) => Ok(publisher),
            Err(err) => {
                if dedicated {
                    connection.close().await;
                }
                Err(err)
            }
        }
    }
}

async fn declare(
    spec: &PublisherBuilder,
    connection: Connection,
    dedicated: bool,
) -> Result<Publisher, StreamError> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let publisher_id = connection.register_publisher(&spec.stream, events_tx)?;
    let outcome = async {
        let response = connection
            .request(|correlation_id| Request::DeclarePublisher {
                correlation_id,
                publisher_id,
                reference: spec.reference.clone(),
                stream: spec.stream.clone(),
            })
            .await?;
        let code = response.kind.code();
        if !code.is_ok() {
            return Err(StreamError::from_code("declare-publisher", code, &spec.stream));
        }
        match &spec.reference {
            Some(reference) => Ok(stored_sequence(&connection, reference, &spec.stream).await? + 1),
            None => Ok(1),
        }
    }
    .await;
    let first_id = match outcome {
        Ok(first_id) => first_id,
        Err(err) => {
            connection.unregister_publisher(publisher_id);
            return Err(err);
        }
    };

    let max_in_flight = spec.max_in_flight.max(1);
    let pending = Arc::new(DashMap::new());
    connection.spawn(confirmation_loop(
        Arc::clone(&pending),
        events_rx,
        spec.stream.clone(),
    ));
    log::info!(
        "publisher declared: stream={}, publisher_id={publisher_id}, first_publishing_id={first_id}",
        spec.stream,
    );
    Ok(Publisher {
        connection,
        stream: spec.stream.clone(),
        publisher_id,
        sequence: AtomicU64::new(first_id),
        capacity: Arc::new(Semaphore::new(max_in_flight)),
        max_in_flight,
        pending,
        dedicated,
    })
}

/// Last publishing id the broker stored under `reference`, zero when none.
async fn stored_sequence(
    connection: &Connection,
    reference: &str,
    stream: &str,
) -> Result<u64, StreamError> {
    let response = connection
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

/// Publisher bound to one stream.
///
/// Declared through [`PublisherBuilder::build`]. Call
/// [`Publisher::delete`] for an orderly teardown; merely dropping the
/// publisher leaves outstanding confirmations to resolve when the
/// connection closes.
pub struct Publisher {
    connection: Connection,
    stream: String,
    publisher_id: u8,
    sequence: AtomicU64,
    capacity: Arc<Semaphore>,
    max_in_flight: usize,
    pending: Arc<DashMap<u64, PendingEntry>>,
    dedicated: bool,
}

struct PendingEntry {
    waiter: oneshot::Sender<Result<Confirmation, StreamError>>,
    _permit: OwnedSemaphorePermit,
}

impl Publisher {
    /// Stream this publisher appends to.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Number of messages sent but not yet confirmed or rejected.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Publish one message, suspending while the in-flight cap is reached.
    ///
    /// Returns once the message is enqueued; the broker's verdict arrives
    /// through the returned [`PendingConfirmation`].
    ///
    /// # Errors
    ///
    /// Fails when the connection is closed or lost; per-message broker
    /// rejections arrive as [`ConfirmationStatus::Rejected`] instead.
    pub async fn send(
        &self,
        message: impl Into<Message>,
    ) -> Result<PendingConfirmation, StreamError> {
        let body = entry_bytes(&message.into())?;
        let permit = Arc::clone(&self.capacity)
            .acquire_owned()
            .await
            .map_err(|_| self.connection.terminal_error())?;
        let publishing_id = self.sequence.fetch_add(1, Ordering::Relaxed);
        let (waiter, reply) = oneshot::channel();
        self.pending.insert(publishing_id, PendingEntry {
            waiter,
            _permit: permit,
        });
        let sent = self
            .connection
            .send(Request::Publish {
                publisher_id: self.publisher_id,
                messages: vec![(publishing_id, body)],
            })
            .await;
        if let Err(err) = sent {
            self.pending.remove(&publishing_id);
            return Err(err);
        }
        metrics::inc_published(1);
        Ok(PendingConfirmation {
            publishing_id,
            reply,
        })
    }

    /// Publish a batch in one frame, returning one handle per message.
    ///
    /// Capacity for the whole batch is acquired atomically, so concurrent
    /// batches cannot starve each other; a batch larger than the in-flight
    /// cap could never be admitted and is rejected outright.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::BatchTooLarge`] for batches above the cap,
    /// otherwise fails only when the connection is closed or lost.
    pub async fn send_batch(
        &self,
        messages: Vec<Message>,
    ) -> Result<Vec<PendingConfirmation>, StreamError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let len = messages.len();
        let slots = u32::try_from(len)
            .ok()
            .filter(|_| len <= self.max_in_flight)
            .ok_or(StreamError::BatchTooLarge {
                len,
                capacity: self.max_in_flight,
            })?;
        let mut bodies = Vec::with_capacity(len);
        for message in &messages {
            bodies.push(entry_bytes(message)?);
        }
        let mut bundle = Arc::clone(&self.capacity)
            .acquire_many_owned(slots)
            .await
            .map_err(|_| self.connection.terminal_error())?;

        let mut handles = Vec::with_capacity(len);
        let mut entries = Vec::with_capacity(len);
        let mut count = 0u64;
        for body in bodies {
            let permit = bundle
                .split(1)
                .expect("bundle holds one permit per message");
            let publishing_id = self.sequence.fetch_add(1, Ordering::Relaxed);
            let (waiter, reply) = oneshot::channel();
            self.pending.insert(publishing_id, PendingEntry {
                waiter,
                _permit: permit,
            });
            entries.push((publishing_id, body));
            handles.push(PendingConfirmation {
                publishing_id,
                reply,
            });
            count += 1;
        }
        let sent = self
            .connection
            .send(Request::Publish {
                publisher_id: self.publisher_id,
                messages: entries,
            })
            .await;
        if let Err(err) = sent {
            for handle in &handles {
                self.pending.remove(&handle.publishing_id);
            }
            return Err(err);
        }
        metrics::inc_published(count);
        Ok(handles)
    }

    /// Publish one message and await its confirmation inline.
    ///
    /// # Errors
    ///
    /// A broker rejection surfaces as [`StreamError::Publish`]; connection
    /// failures as their terminal error.
    pub async fn send_with_confirm(
        &self,
        message: impl Into<Message>,
    ) -> Result<Confirmation, StreamError> {
        let confirmation = self.send(message).await?.await?;
        match confirmation.status {
            ConfirmationStatus::Confirmed => Ok(confirmation),
            ConfirmationStatus::Rejected(code) => Err(StreamError::Publish {
                publishing_id: confirmation.publishing_id,
                code,
            }),
        }
    }

    /// Deregister the publisher from the broker.
    ///
    /// Outstanding confirmations resolve with
    /// [`StreamError::ConnectionClosed`]; senders suspended on the
    /// in-flight cap are released with the same error.
    ///
    /// # Errors
    ///
    /// Returns the broker's rejection of the delete, after local teardown
    /// has already happened.
    pub async fn delete(self) -> Result<(), StreamError> {
        self.capacity.close();
        let response = self
            .connection
            .request(|correlation_id| Request::DeletePublisher {
                correlation_id,
                publisher_id: self.publisher_id,
            })
            .await;
        self.connection.unregister_publisher(self.publisher_id);
        drain(&self.pending, || StreamError::ConnectionClosed);
        log::info!(
            "publisher deleted: stream={}, publisher_id={}",
            self.stream,
            self.publisher_id,
        );
        if self.dedicated {
            self.connection.close().await;
        }
        let code = response?.kind.code();
        if code.is_ok() {
            Ok(())
        } else {
            Err(StreamError::from_code("delete-publisher", code, &self.stream))
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.connection.unregister_publisher(self.publisher_id);
    }
}

fn entry_bytes(message: &Message) -> Result<bytes::Bytes, StreamError> {
    message
        .to_entry()
        .map_err(|err| StreamError::Corrupt(err.into()))
}

/// Resolve pending entries as the broker's verdicts arrive.
///
/// Runs until the event channel closes; a terminal event drains whatever
/// is still outstanding, exactly once, before the loop ends.
async fn confirmation_loop(
    pending: Arc<DashMap<u64, PendingEntry>>,
    mut events: mpsc::UnboundedReceiver<PublisherEvent>,
    stream: String,
) {
    while let Some(event) = events.recv().await {
        match event {
            PublisherEvent::Confirmed(publishing_ids) => {
                let mut resolved = 0u64;
                for publishing_id in publishing_ids {
                    if let Some((_, entry)) = pending.remove(&publishing_id) {
                        resolved += 1;
                        let _ = entry.waiter.send(Ok(Confirmation {
                            publishing_id,
                            status: ConfirmationStatus::Confirmed,
                        }));
                    } else {
                        tracing::debug!(
                            "confirm for unknown publishing id: stream={stream}, publishing_id={publishing_id}"
                        );
                    }
                }
                metrics::inc_confirmations(ConfirmationOutcome::Confirmed, resolved);
            }
            PublisherEvent::Rejected(errors) => {
                let mut resolved = 0u64;
                for (publishing_id, code) in errors {
                    tracing::debug!(
                        "publish rejected: stream={stream}, publishing_id={publishing_id}, code={code:?}"
                    );
                    if let Some((_, entry)) = pending.remove(&publishing_id) {
                        resolved += 1;
                        let _ = entry.waiter.send(Ok(Confirmation {
                            publishing_id,
                            status: ConfirmationStatus::Rejected(code),
                        }));
                    }
                }
                metrics::inc_confirmations(ConfirmationOutcome::Errored, resolved);
            }
            PublisherEvent::Unavailable => {
                log::warn!(
                    "stream unavailable, draining outstanding confirmations: stream={stream}, outstanding={}",
                    pending.len(),
                );
                drain(&pending, || StreamError::StreamUnavailable {
                    stream: stream.clone(),
                });
            }
            PublisherEvent::Terminal(error) => {
                drain(&pending, || error.replicate());
                break;
            }
        }
    }
    tracing::debug!("confirmation loop finished: stream={stream}");
}

fn drain(pending: &DashMap<u64, PendingEntry>, error: impl Fn() -> StreamError) {
    let outstanding: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for publishing_id in outstanding {
        if let Some((_, entry)) = pending.remove(&publishing_id) {
            let _ = entry.waiter.send(Err(error()));
        }
    }
}
