//! Chunk consumption with credit-based flow control.
//!
//! A [`Consumer`] is a [`futures::Stream`] of [`Delivery`] items. The
//! broker pushes whole chunks against outstanding credit; the consumer
//! walks each chunk's records in log order, assigns `first_offset + i`
//! offsets, and yields one delivery per message. Tracking chunks written
//! by the broker are credited back without yielding anything. Terminal
//! failures are yielded once through the same stream, after which it ends.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    chunk::{Chunk, ChunkError, Records},
    client::StreamClient,
    codec::{Request, ResponseCode, ResponseKind},
    connection::{Connection, ConsumerEvent},
    error::StreamError,
    message::Message,
    metrics,
    offset::OffsetSpecification,
};

/// Default chunk credit granted at subscription.
const DEFAULT_INITIAL_CREDIT: u16 = 10;

/// One message as read from a stream, tagged with its offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Offset of the message within the stream.
    pub offset: u64,
    /// The decoded message.
    pub message: Message,
}

/// How chunk credit is given back to the broker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CreditPolicy {
    /// One credit per chunk, granted once the chunk is fully yielded.
    #[default]
    Auto,
    /// The application calls [`Consumer::credit`] itself.
    ///
    /// Broker-internal tracking chunks are still credited automatically;
    /// the application never sees them and could not account for them.
    Manual,
}

/// Configures and attaches a [`Consumer`]; obtained from
/// [`StreamClient::consumer`].
pub struct ConsumerBuilder {
    client: StreamClient,
    stream: String,
    offset: OffsetSpecification,
    initial_credit: u16,
    credit_policy: CreditPolicy,
    name: Option<String>,
    auto_store: Option<u32>,
}

impl ConsumerBuilder {
    pub(crate) fn new(client: StreamClient, stream: String) -> Self {
        Self {
            client,
            stream,
            offset: OffsetSpecification::default(),
            initial_credit: DEFAULT_INITIAL_CREDIT,
            credit_policy: CreditPolicy::default(),
            name: None,
            auto_store: None,
        }
    }

    /// Where to start reading; defaults to [`OffsetSpecification::Next`].
    #[must_use]
    pub fn offset(mut self, offset: OffsetSpecification) -> Self {
        self.offset = offset;
        self
    }

    /// Chunk credit granted at subscription; zero defers all delivery
    /// until credit is given manually.
    #[must_use]
    pub fn initial_credit(mut self, credit: u16) -> Self {
        self.initial_credit = credit;
        self
    }

    /// Replenishment policy; defaults to [`CreditPolicy::Auto`].
    #[must_use]
    pub fn credit_policy(mut self, policy: CreditPolicy) -> Self {
        self.credit_policy = policy;
        self
    }

    /// Name the consumer for server-side offset tracking.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Store the latest yielded offset after every `messages` deliveries.
    ///
    /// Requires a consumer name; an interval of zero disables automatic
    /// storing.
    #[must_use]
    pub fn auto_store_every(mut self, messages: u32) -> Self {
        self.auto_store = Some(messages);
        self
    }

    /// Subscribe on the stream's leader and return the active consumer.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NameRequired`] when automatic offset storing
    /// is enabled without a consumer name, [`StreamError::StreamNotFound`]
    /// when the stream does not exist, plus any connection-level failure.
    pub async fn build(self) -> Result<Consumer, StreamError> {
        let auto_store = self.auto_store.filter(|messages| *messages > 0);
        if auto_store.is_some() && self.name.is_none() {
            return Err(StreamError::NameRequired {
                operation: "auto-store-offset",
            });
        }
        let (connection, dedicated) = self.client.entity_connection(&self.stream).await?;
        match subscribe(&self, auto_store, connection.clone(), dedicated).await {
            Ok(consumer) => Ok(consumer),
            Err(err) => {
                if dedicated {
                    connection.close().await;
                }
                Err(err)
            }
        }
    }
}

async fn subscribe(
    spec: &ConsumerBuilder,
    auto_store: Option<u32>,
    connection: Connection,
    dedicated: bool,
) -> Result<Consumer, StreamError> {
    let (events_tx, events) = mpsc::unbounded_channel();
    let subscription_id = connection.register_consumer(&spec.stream, events_tx)?;
    let response = connection
        .request(|correlation_id| Request::Subscribe {
            correlation_id,
            subscription_id,
            stream: spec.stream.clone(),
            offset: spec.offset,
            credit: spec.initial_credit,
            properties: Vec::new(),
        })
        .await;
    let code = match response {
        Ok(response) => response.kind.code(),
        Err(err) => {
            connection.unregister_consumer(subscription_id);
            return Err(err);
        }
    };
    if !code.is_ok() {
        connection.unregister_consumer(subscription_id);
        return Err(StreamError::from_code("subscribe", code, &spec.stream));
    }
    log::info!(
        "subscribed: stream={}, subscription_id={subscription_id}, offset={:?}, credit={}",
        spec.stream,
        spec.offset,
        spec.initial_credit,
    );
    Ok(Consumer {
        connection,
        stream: spec.stream.clone(),
        name: spec.name.clone(),
        subscription_id,
        events,
        cursor: None,
        filter_below: spec.offset.filter_below(),
        credit_policy: spec.credit_policy,
        pending_credits: 0,
        auto_store,
        store_counter: 0,
        pending_store: None,
        phase: Phase::Active,
        dedicated,
    })
}

/// Consumer attached to one stream.
///
/// Poll it as a [`futures::Stream`]; call [`Consumer::unsubscribe`] for an
/// orderly detach. Dropping the consumer merely stops delivery routing.
pub struct Consumer {
    connection: Connection,
    stream: String,
    name: Option<String>,
    subscription_id: u8,
    events: mpsc::UnboundedReceiver<ConsumerEvent>,
    cursor: Option<ChunkCursor>,
    filter_below: Option<u64>,
    credit_policy: CreditPolicy,
    pending_credits: u16,
    auto_store: Option<u32>,
    store_counter: u32,
    pending_store: Option<u64>,
    phase: Phase,
    dedicated: bool,
}

enum Phase {
    Active,
    Finished,
}

/// Walks one chunk's records, assigning contiguous offsets.
struct ChunkCursor {
    next_offset: u64,
    records: Records,
}

impl ChunkCursor {
    fn new(chunk: &Chunk) -> Self {
        Self {
            next_offset: chunk.first_offset(),
            records: chunk.records(),
        }
    }

    /// Next record at or above `floor`, paired with its offset.
    fn next_record(&mut self, floor: Option<u64>) -> Option<Result<(u64, Bytes), ChunkError>> {
        loop {
            let record = self.records.next()?;
            let offset = self.next_offset;
            self.next_offset += 1;
            match record {
                Ok(bytes) => {
                    if floor.is_some_and(|floor| offset < floor) {
                        continue;
                    }
                    return Some(Ok((offset, bytes)));
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

impl Consumer {
    /// Stream this consumer reads.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Consumer name used for offset tracking, when one was set.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Grant the broker `credit` additional chunks.
    ///
    /// # Errors
    ///
    /// Fails when the connection is closed or lost.
    pub async fn credit(&self, credit: u16) -> Result<(), StreamError> {
        self.connection
            .send(Request::Credit {
                subscription_id: self.subscription_id,
                credit,
            })
            .await
    }

    /// Persist `offset` under the consumer name.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NameRequired`] for unnamed consumers.
    pub async fn store_offset(&self, offset: u64) -> Result<(), StreamError> {
        let Some(name) = &self.name else {
            return Err(StreamError::NameRequired {
                operation: "store-offset",
            });
        };
        self.connection
            .send(Request::StoreOffset {
                reference: name.clone(),
                stream: self.stream.clone(),
                offset,
            })
            .await
    }

    /// Fetch the offset stored under the consumer name.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NameRequired`] for unnamed consumers and
    /// [`StreamError::OffsetNotFound`] when nothing was stored yet.
    pub async fn query_offset(&self) -> Result<u64, StreamError> {
        let Some(name) = &self.name else {
            return Err(StreamError::NameRequired {
                operation: "query-offset",
            });
        };
        let response = self
            .connection
            .request(|correlation_id| Request::QueryOffset {
                correlation_id,
                reference: name.clone(),
                stream: self.stream.clone(),
            })
            .await?;
        match response.kind {
            ResponseKind::Offset { code, offset } if code.is_ok() => Ok(offset),
            ResponseKind::Offset {
                code: ResponseCode::NoOffset,
                ..
            } => Err(StreamError::OffsetNotFound {
                reference: name.clone(),
                stream: self.stream.clone(),
            }),
            kind => Err(StreamError::from_code(
                "query-offset",
                kind.code(),
                &self.stream,
            )),
        }
    }

    /// Detach the subscription from the broker.
    ///
    /// # Errors
    ///
    /// Returns the broker's rejection of the unsubscribe, after local
    /// teardown has already happened.
    pub async fn unsubscribe(self) -> Result<(), StreamError> {
        let response = self
            .connection
            .request(|correlation_id| Request::Unsubscribe {
                correlation_id,
                subscription_id: self.subscription_id,
            })
            .await;
        self.connection.unregister_consumer(self.subscription_id);
        log::info!(
            "unsubscribed: stream={}, subscription_id={}",
            self.stream,
            self.subscription_id,
        );
        if self.dedicated {
            self.connection.close().await;
        }
        let code = response?.kind.code();
        if code.is_ok() {
            Ok(())
        } else {
            Err(StreamError::from_code("unsubscribe", code, &self.stream))
        }
    }

    /// Queue one chunk credit, flushed on a later poll.
    fn replenish(&mut self, amount: u16) {
        self.pending_credits = self.pending_credits.saturating_add(amount);
    }

    /// Drop the current chunk and credit it per policy.
    fn finish_chunk(&mut self) {
        self.cursor = None;
        if self.credit_policy == CreditPolicy::Auto {
            self.replenish(1);
        }
    }

    fn note_delivery(&mut self, offset: u64) {
        metrics::inc_delivered(1);
        if let Some(every) = self.auto_store {
            self.store_counter += 1;
            if self.store_counter >= every {
                self.store_counter = 0;
                self.pending_store = Some(offset);
            }
        }
    }

    /// Push queued credit and offset-store frames without blocking; what
    /// does not fit is retried on the next poll.
    fn flush_outbound(&mut self) {
        if self.pending_credits > 0 {
            match self.connection.try_send(Request::Credit {
                subscription_id: self.subscription_id,
                credit: self.pending_credits,
            }) {
                Ok(()) | Err(TrySendError::Closed(_)) => self.pending_credits = 0,
                Err(TrySendError::Full(_)) => {}
            }
        }
        if let (Some(offset), Some(name)) = (self.pending_store, &self.name) {
            match self.connection.try_send(Request::StoreOffset {
                reference: name.clone(),
                stream: self.stream.clone(),
                offset,
            }) {
                Ok(()) | Err(TrySendError::Closed(_)) => self.pending_store = None,
                Err(TrySendError::Full(_)) => {}
            }
        }
    }
}

impl Stream for Consumer {
    type Item = Result<Delivery, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if matches!(this.phase, Phase::Finished) {
                return Poll::Ready(None);
            }
            this.flush_outbound();

            if let Some(cursor) = this.cursor.as_mut() {
                match cursor.next_record(this.filter_below) {
                    Some(Ok((offset, mut record))) => match Message::from_entry(&mut record) {
                        Ok(message) => {
                            this.note_delivery(offset);
                            return Poll::Ready(Some(Ok(Delivery { offset, message })));
                        }
                        Err(err) => {
                            this.finish_chunk();
                            return Poll::Ready(Some(Err(ChunkError::Entry(err).into())));
                        }
                    },
                    Some(Err(err)) => {
                        this.finish_chunk();
                        return Poll::Ready(Some(Err(err.into())));
                    }
                    None => {
                        this.finish_chunk();
                        continue;
                    }
                }
            }

            match this.events.poll_recv(cx) {
                Poll::Ready(Some(ConsumerEvent::Deliver(chunk))) => {
                    if chunk.chunk_type().is_tracking() {
                        tracing::trace!(
                            "tracking chunk credited: stream={}, first_offset={}",
                            this.stream,
                            chunk.first_offset(),
                        );
                        this.replenish(1);
                        continue;
                    }
                    this.cursor = Some(ChunkCursor::new(&chunk));
                }
                Poll::Ready(Some(ConsumerEvent::CreditRejected(code))) => {
                    return Poll::Ready(Some(Err(StreamError::ErrorResponse {
                        operation: "credit",
                        code,
                    })));
                }
                Poll::Ready(Some(ConsumerEvent::Unavailable)) => {
                    this.phase = Phase::Finished;
                    return Poll::Ready(Some(Err(StreamError::StreamUnavailable {
                        stream: this.stream.clone(),
                    })));
                }
                Poll::Ready(Some(ConsumerEvent::Terminal(error))) => {
                    this.phase = Phase::Finished;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => {
                    this.phase = Phase::Finished;
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    // Unsent credit must not wait for broker traffic that
                    // the credit itself unblocks.
                    if this.pending_credits > 0 || this.pending_store.is_some() {
                        cx.waker().wake_by_ref();
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.connection.unregister_consumer(self.subscription_id);
    }
}
