//! Outbound half of a connection.
//!
//! The writer owns the send side of the split transport and serialises
//! frames from the shared outbound queue, interleaving heartbeats at half
//! the negotiated interval. On shutdown it drains whatever is already
//! queued (a close acknowledgement may be in flight) before closing the
//! socket; on a write failure it records the fault and cancels the
//! connection so the reader can fan the error out.

use std::{sync::Arc, time::Duration};

use futures::{SinkExt, stream::SplitSink};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::codec::Framed;

use crate::{
    codec::{CodecError, Request, StreamCodec},
    metrics::{self, Direction},
};

use super::{ConnectionInner, Fault, heartbeat_window, transport_error};

type FrameSink = SplitSink<Framed<TcpStream, StreamCodec>, Request>;

pub(super) async fn run(
    inner: Arc<ConnectionInner>,
    mut sink: FrameSink,
    mut outbound: mpsc::Receiver<Request>,
) {
    if let Err(err) = write_frames(&inner, &mut sink, &mut outbound).await {
        metrics::inc_errors();
        log::warn!("outbound write failed: endpoint={}, error={err}", inner.endpoint);
        let _ = inner.fault.set(Fault::from(transport_error(err)));
        inner.shutdown.cancel();
    }
}

async fn write_frames(
    inner: &ConnectionInner,
    sink: &mut FrameSink,
    outbound: &mut mpsc::Receiver<Request>,
) -> Result<(), CodecError> {
    let period = heartbeat_window(inner.negotiated.heartbeat).map(|window| window / 2);
    let mut beat = match period {
        Some(period) => time::interval_at(Instant::now() + period, period),
        None => time::interval(Duration::from_secs(60)),
    };
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = inner.shutdown.cancelled() => {
                while let Ok(request) = outbound.try_recv() {
                    metrics::inc_frames(Direction::Outbound);
                    sink.send(request).await?;
                }
                if let Err(err) = sink.close().await {
                    tracing::debug!("socket close failed: error={err}");
                }
                return Ok(());
            }

            request = outbound.recv() => match request {
                Some(request) => {
                    tracing::trace!("sending frame: key={:#06x}", request.wire_key());
                    metrics::inc_frames(Direction::Outbound);
                    sink.send(request).await?;
                }
                None => return Ok(()),
            },

            _ = beat.tick(), if period.is_some() => {
                tracing::trace!("heartbeat sent");
                metrics::inc_frames(Direction::Outbound);
                sink.send(Request::Heartbeat).await?;
            }
        }
    }
}
