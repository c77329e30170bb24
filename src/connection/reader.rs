//! Inbound half of a connection.
//!
//! The reader owns the receive side of the split transport. It routes
//! correlated replies to their waiters, pushes server-initiated frames to
//! the dispatch table, and watches for heartbeat silence. Whatever ends the
//! loop, the exit path records the fault, wakes every waiter, and fans the
//! terminal error out to registered entities exactly once.

use std::{sync::Arc, time::Duration};

use futures::{StreamExt, stream::SplitStream};
use tokio::{
    net::TcpStream,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::codec::Framed;

use crate::{
    codec::{Request, ServerFrame, StreamCodec},
    error::StreamError,
    metrics::{self, Direction},
};

use super::{ConnectionInner, Fault, counter::ActiveConnection, heartbeat_window, transport_error};

type FrameSource = SplitStream<Framed<TcpStream, StreamCodec>>;

pub(super) async fn run(inner: Arc<ConnectionInner>, mut frames: FrameSource, guard: ActiveConnection) {
    if let Err(err) = read_frames(&inner, &mut frames).await {
        match &err {
            StreamError::ClosedByPeer { code, reason } => log::info!(
                "connection closed by broker: endpoint={}, code={code:?}, reason={reason}",
                inner.endpoint,
            ),
            other => {
                metrics::inc_errors();
                log::warn!("connection lost: endpoint={}, error={other}", inner.endpoint);
            }
        }
        let _ = inner.fault.set(Fault::from(err));
    }
    inner.shutdown.cancel();
    inner.correlations.drain();
    inner.dispatch.fan_out(|| inner.cascade_error());
    drop(guard);
    log::info!(
        "connection closed: endpoint={}, active={}",
        inner.endpoint,
        super::active_connection_count(),
    );
}

async fn read_frames(inner: &ConnectionInner, frames: &mut FrameSource) -> Result<(), StreamError> {
    let window = heartbeat_window(inner.negotiated.heartbeat);
    let mut staleness = time::interval(
        window.map_or(Duration::from_secs(60), |window| window / 2),
    );
    staleness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            biased;

            () = inner.shutdown.cancelled() => return Ok(()),

            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    last_inbound = Instant::now();
                    metrics::inc_frames(Direction::Inbound);
                    handle_frame(inner, frame)?;
                }
                Some(Err(err)) => return Err(transport_error(err)),
                None => {
                    return Err(StreamError::ConnectionLost(String::from(
                        "broker closed the connection without a close frame",
                    )));
                }
            },

            _ = staleness.tick(), if window.is_some() => {
                if let Some(window) = window {
                    if last_inbound.elapsed() > window {
                        return Err(StreamError::HeartbeatTimeout(window));
                    }
                }
            }
        }
    }
}

/// Route one inbound frame. An error return ends the read loop.
fn handle_frame(inner: &ConnectionInner, frame: ServerFrame) -> Result<(), StreamError> {
    match frame {
        ServerFrame::Response(response) => {
            let correlation_id = response.correlation_id;
            tracing::trace!("reply received: correlation_id={correlation_id}");
            if !inner.correlations.complete(correlation_id, response) {
                tracing::debug!("reply without a waiter: correlation_id={correlation_id}");
            }
        }
        ServerFrame::PublishConfirm {
            publisher_id,
            publishing_ids,
        } => {
            tracing::trace!(
                "publish confirm: publisher_id={publisher_id}, count={}",
                publishing_ids.len()
            );
            inner.dispatch.confirm(publisher_id, publishing_ids);
        }
        ServerFrame::PublishError {
            publisher_id,
            errors,
        } => {
            tracing::debug!(
                "publish error: publisher_id={publisher_id}, count={}",
                errors.len()
            );
            inner.dispatch.publish_error(publisher_id, errors);
        }
        ServerFrame::Deliver {
            subscription_id,
            chunk,
        } => {
            tracing::trace!(
                "deliver: subscription_id={subscription_id}, first_offset={}, records={}",
                chunk.first_offset(),
                chunk.num_records()
            );
            inner.dispatch.deliver(subscription_id, chunk);
        }
        ServerFrame::CreditError {
            subscription_id,
            code,
        } => {
            log::warn!("credit rejected: subscription_id={subscription_id}, code={code:?}");
            inner.dispatch.credit_error(subscription_id, code);
        }
        ServerFrame::MetadataUpdate { code, stream } => {
            log::info!("metadata update: stream={stream}, code={code:?}");
            inner.dispatch.metadata_update(&stream);
        }
        ServerFrame::Tune {
            frame_max,
            heartbeat,
        } => {
            tracing::warn!(
                "tune after negotiation ignored: frame_max={frame_max}, heartbeat={heartbeat}"
            );
        }
        ServerFrame::CloseRequest {
            correlation_id,
            code,
            reason,
        } => {
            // Acknowledge before winding down; if the queue is full the
            // broker closes the socket itself.
            if inner
                .outbound
                .try_send(Request::CloseResponse { correlation_id })
                .is_err()
            {
                tracing::debug!(
                    "server close not acknowledged: correlation_id={correlation_id}"
                );
            }
            return Err(StreamError::ClosedByPeer { code, reason });
        }
        ServerFrame::Heartbeat => tracing::trace!("heartbeat received"),
    }
    Ok(())
}
