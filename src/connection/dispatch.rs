//! Routing of server-initiated frames to publishers and consumers.
//!
//! Publisher ids and subscription ids are separate `u8` spaces chosen by
//! the client; each registration scans its map for the lowest free id.
//! Event channels are unbounded: publisher traffic is bounded by the
//! in-flight confirmation cap and consumer traffic by outstanding credit,
//! so the reader task never blocks on a slow entity.

use std::sync::OnceLock;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::mpsc;

use crate::{chunk::Chunk, codec::ResponseCode, error::StreamError};

/// Server-pushed events consumed by a publisher's confirmation loop.
#[derive(Debug)]
pub(crate) enum PublisherEvent {
    /// Publishing ids the broker persisted.
    Confirmed(Vec<u64>),
    /// Publishing ids the broker rejected, with per-id reasons.
    Rejected(Vec<(u64, ResponseCode)>),
    /// The stream's topology changed; the publisher must re-resolve.
    Unavailable,
    /// The connection is finished; no further events will arrive.
    Terminal(StreamError),
}

/// Server-pushed events consumed by a consumer's delivery loop.
#[derive(Debug)]
pub(crate) enum ConsumerEvent {
    /// A chunk of records for this subscription.
    Deliver(Chunk),
    /// The broker rejected a credit frame for this subscription.
    CreditRejected(ResponseCode),
    /// The stream's topology changed; deliveries may stop.
    Unavailable,
    /// The connection is finished; no further events will arrive.
    Terminal(StreamError),
}

struct PublisherEntry {
    stream: String,
    events: mpsc::UnboundedSender<PublisherEvent>,
}

struct ConsumerEntry {
    stream: String,
    events: mpsc::UnboundedSender<ConsumerEvent>,
}

/// Table mapping entity ids to their event channels.
pub(super) struct DispatchTable {
    publishers: DashMap<u8, PublisherEntry>,
    consumers: DashMap<u8, ConsumerEntry>,
    metadata: OnceLock<mpsc::UnboundedSender<String>>,
}

impl DispatchTable {
    pub(super) fn new() -> Self {
        Self {
            publishers: DashMap::new(),
            consumers: DashMap::new(),
            metadata: OnceLock::new(),
        }
    }

    /// Allocate the lowest free publisher id for `stream`.
    pub(super) fn register_publisher(
        &self,
        stream: &str,
        events: mpsc::UnboundedSender<PublisherEvent>,
    ) -> Result<u8, StreamError> {
        for id in u8::MIN..=u8::MAX {
            if let Entry::Vacant(slot) = self.publishers.entry(id) {
                slot.insert(PublisherEntry {
                    stream: stream.to_owned(),
                    events,
                });
                return Ok(id);
            }
        }
        Err(StreamError::IdsExhausted)
    }

    pub(super) fn unregister_publisher(&self, publisher_id: u8) {
        self.publishers.remove(&publisher_id);
    }

    /// Allocate the lowest free subscription id for `stream`.
    pub(super) fn register_consumer(
        &self,
        stream: &str,
        events: mpsc::UnboundedSender<ConsumerEvent>,
    ) -> Result<u8, StreamError> {
        for id in u8::MIN..=u8::MAX {
            if let Entry::Vacant(slot) = self.consumers.entry(id) {
                slot.insert(ConsumerEntry {
                    stream: stream.to_owned(),
                    events,
                });
                return Ok(id);
            }
        }
        Err(StreamError::IdsExhausted)
    }

    pub(super) fn unregister_consumer(&self, subscription_id: u8) {
        self.consumers.remove(&subscription_id);
    }

    /// Hand out the metadata-update channel to its single watcher.
    pub(super) fn watch_metadata(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.metadata.set(tx).ok().map(|()| rx)
    }

    pub(super) fn confirm(&self, publisher_id: u8, publishing_ids: Vec<u64>) {
        self.publisher_event(publisher_id, PublisherEvent::Confirmed(publishing_ids));
    }

    pub(super) fn publish_error(&self, publisher_id: u8, errors: Vec<(u64, ResponseCode)>) {
        self.publisher_event(publisher_id, PublisherEvent::Rejected(errors));
    }

    pub(super) fn deliver(&self, subscription_id: u8, chunk: Chunk) {
        self.consumer_event(subscription_id, ConsumerEvent::Deliver(chunk));
    }

    pub(super) fn credit_error(&self, subscription_id: u8, code: ResponseCode) {
        self.consumer_event(subscription_id, ConsumerEvent::CreditRejected(code));
    }

    /// Tell every entity bound to `stream` that its topology changed, and
    /// notify the metadata watcher.
    pub(super) fn metadata_update(&self, stream: &str) {
        self.publishers.retain(|_, entry| {
            entry.stream != stream || entry.events.send(PublisherEvent::Unavailable).is_ok()
        });
        self.consumers.retain(|_, entry| {
            entry.stream != stream || entry.events.send(ConsumerEvent::Unavailable).is_ok()
        });
        if let Some(watcher) = self.metadata.get() {
            let _ = watcher.send(stream.to_owned());
        }
    }

    /// Deliver the terminal error to every registered entity and empty the
    /// table. Entities registered after this point belong to a dead
    /// connection and learn so from their first request.
    pub(super) fn fan_out(&self, error: impl Fn() -> StreamError) {
        for entry in &self.publishers {
            let _ = entry.events.send(PublisherEvent::Terminal(error()));
        }
        self.publishers.clear();
        for entry in &self.consumers {
            let _ = entry.events.send(ConsumerEvent::Terminal(error()));
        }
        self.consumers.clear();
    }

    fn publisher_event(&self, publisher_id: u8, event: PublisherEvent) {
        let Some(entry) = self.publishers.get(&publisher_id) else {
            tracing::warn!("frame for unknown publisher dropped: publisher_id={publisher_id}");
            return;
        };
        if entry.events.send(event).is_err() {
            drop(entry);
            self.publishers.remove(&publisher_id);
            tracing::debug!("pruned gone publisher: publisher_id={publisher_id}");
        }
    }

    fn consumer_event(&self, subscription_id: u8, event: ConsumerEvent) {
        let Some(entry) = self.consumers.get(&subscription_id) else {
            tracing::warn!(
                "frame for unknown subscription dropped: subscription_id={subscription_id}"
            );
            return;
        };
        if entry.events.send(event).is_err() {
            drop(entry);
            self.consumers.remove(&subscription_id);
            tracing::debug!("pruned gone consumer: subscription_id={subscription_id}");
        }
    }
}
