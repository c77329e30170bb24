//! Connection establishment sequence.
//!
//! The handshake runs on the framed transport before it is split between
//! the reader and writer tasks, so replies are read inline: peer-properties
//! exchange, SASL mechanism discovery, PLAIN authentication, tune
//! negotiation, then attaching to the virtual host. The broker may push its
//! tune frame at any point after authentication; it is stashed until the
//! sequence is ready for it.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time};
use tokio_util::codec::Framed;

use crate::{
    codec::{MAX_FRAME_LENGTH, Request, ResponseCode, ResponseKind, ServerFrame, StreamCodec},
    config::ClientConfig,
    correlation::CorrelationTable,
    error::{AuthenticationError, HandshakeError, StreamError},
};

use super::transport_error;

type Transport = Framed<TcpStream, StreamCodec>;

/// Values settled by the handshake, fixed for the connection's lifetime.
#[derive(Debug)]
pub(super) struct Negotiated {
    pub(super) frame_max: u32,
    pub(super) heartbeat: u32,
    pub(super) server_properties: Vec<(String, String)>,
    pub(super) connection_properties: Vec<(String, String)>,
}

/// Run the full establishment sequence and install the tuned frame size on
/// the codec.
pub(super) async fn perform(
    framed: &mut Transport,
    correlations: &CorrelationTable,
    config: &ClientConfig,
) -> Result<Negotiated, StreamError> {
    let limit = config.request_timeout;
    let mut pending_tune = None;

    let correlation_id = correlations.next_id();
    send(framed, Request::PeerProperties {
        correlation_id,
        properties: config.client_properties.clone(),
    })
    .await?;
    let reply = await_response(framed, correlation_id, &mut pending_tune, limit).await?;
    let server_properties = match reply {
        ResponseKind::PeerProperties { code, properties } if code.is_ok() => properties,
        ResponseKind::PeerProperties { code, .. } => {
            return Err(HandshakeError::Rejected {
                step: "peer-properties",
                code,
            }
            .into());
        }
        _ => {
            return Err(HandshakeError::MismatchedReply {
                step: "peer-properties",
            }
            .into());
        }
    };
    tracing::debug!(
        "peer properties exchanged: server_properties={}",
        server_properties.len()
    );

    let correlation_id = correlations.next_id();
    send(framed, Request::SaslHandshake { correlation_id }).await?;
    let reply = await_response(framed, correlation_id, &mut pending_tune, limit).await?;
    let mechanisms = match reply {
        ResponseKind::SaslHandshake { code, mechanisms } if code.is_ok() => mechanisms,
        ResponseKind::SaslHandshake { code, .. } => {
            return Err(HandshakeError::Rejected {
                step: "sasl-handshake",
                code,
            }
            .into());
        }
        _ => {
            return Err(HandshakeError::MismatchedReply {
                step: "sasl-handshake",
            }
            .into());
        }
    };
    if !mechanisms.iter().any(|mechanism| mechanism == "PLAIN") {
        return Err(HandshakeError::MechanismNotSupported {
            offered: mechanisms,
        }
        .into());
    }

    let correlation_id = correlations.next_id();
    send(framed, Request::SaslAuthenticate {
        correlation_id,
        mechanism: String::from("PLAIN"),
        data: plain_credentials(&config.username, &config.password),
    })
    .await?;
    let reply = await_response(framed, correlation_id, &mut pending_tune, limit).await?;
    match reply {
        ResponseKind::SaslAuthenticate { code, .. } => match code {
            ResponseCode::Ok => {}
            ResponseCode::AuthenticationFailure => {
                return Err(AuthenticationError::InvalidCredentials.into());
            }
            ResponseCode::AuthenticationFailureLoopback => {
                return Err(AuthenticationError::LoopbackOnly.into());
            }
            code => return Err(AuthenticationError::Sasl { code }.into()),
        },
        _ => {
            return Err(HandshakeError::MismatchedReply {
                step: "sasl-authenticate",
            }
            .into());
        }
    }

    let (server_frame_max, server_heartbeat) = match pending_tune.take() {
        Some(proposal) => proposal,
        None => await_tune(framed, limit).await?,
    };
    let frame_max = combine(config.frame_max, server_frame_max);
    let heartbeat = combine(config.heartbeat, server_heartbeat);
    send(framed, Request::Tune {
        frame_max,
        heartbeat,
    })
    .await?;
    framed.codec().set_frame_max(effective_frame_max(frame_max));
    tracing::debug!(
        "tune settled: frame_max={frame_max}, heartbeat={heartbeat}s, proposed_frame_max={server_frame_max}, proposed_heartbeat={server_heartbeat}s"
    );

    let correlation_id = correlations.next_id();
    send(framed, Request::Open {
        correlation_id,
        virtual_host: config.virtual_host.clone(),
    })
    .await?;
    let reply = await_response(framed, correlation_id, &mut pending_tune, limit).await?;
    let connection_properties = match reply {
        ResponseKind::Open { code, properties } if code.is_ok() => properties,
        ResponseKind::Open {
            code: ResponseCode::VirtualHostAccessFailure,
            ..
        } => {
            return Err(AuthenticationError::VirtualHost {
                virtual_host: config.virtual_host.clone(),
            }
            .into());
        }
        ResponseKind::Open { code, .. } => {
            return Err(HandshakeError::Rejected { step: "open", code }.into());
        }
        _ => return Err(HandshakeError::MismatchedReply { step: "open" }.into()),
    };

    Ok(Negotiated {
        frame_max,
        heartbeat,
        server_properties,
        connection_properties,
    })
}

/// PLAIN mechanism payload: NUL, username, NUL, password.
fn plain_credentials(username: &str, password: &str) -> Bytes {
    let mut data = BytesMut::with_capacity(username.len() + password.len() + 2);
    data.put_u8(0);
    data.put_slice(username.as_bytes());
    data.put_u8(0);
    data.put_slice(password.as_bytes());
    data.freeze()
}

/// Merge a configured limit with the broker's proposal; zero means
/// unlimited on either side, so the other side's value wins.
fn combine(ours: u32, theirs: u32) -> u32 {
    match (ours, theirs) {
        (0, value) | (value, 0) => value,
        (ours, theirs) => ours.min(theirs),
    }
}

/// Frame size the encoder enforces once tuned; an unlimited negotiation
/// still leaves the absolute inbound bound in place.
fn effective_frame_max(frame_max: u32) -> u32 {
    if frame_max == 0 {
        u32::try_from(MAX_FRAME_LENGTH).unwrap_or(u32::MAX)
    } else {
        frame_max
    }
}

async fn send(framed: &mut Transport, request: Request) -> Result<(), StreamError> {
    framed.send(request).await.map_err(transport_error)
}

async fn next_frame(
    framed: &mut Transport,
    limit: Duration,
    on_timeout: impl FnOnce() -> StreamError,
) -> Result<ServerFrame, StreamError> {
    match time::timeout(limit, framed.next()).await {
        Err(_) => Err(on_timeout()),
        Ok(None) => Err(StreamError::ConnectionLost(String::from(
            "broker closed the connection during the handshake",
        ))),
        Ok(Some(Err(err))) => Err(transport_error(err)),
        Ok(Some(Ok(frame))) => Ok(frame),
    }
}

/// Read frames until the reply for `correlation_id` arrives, stashing a
/// tune proposal if the broker interleaves one.
async fn await_response(
    framed: &mut Transport,
    correlation_id: u32,
    pending_tune: &mut Option<(u32, u32)>,
    limit: Duration,
) -> Result<ResponseKind, StreamError> {
    loop {
        let frame = next_frame(framed, limit, || StreamError::RequestTimeout {
            correlation_id,
            timeout: limit,
        })
        .await?;
        match frame {
            ServerFrame::Response(response) if response.correlation_id == correlation_id => {
                return Ok(response.kind);
            }
            ServerFrame::Response(response) => {
                tracing::debug!(
                    "out-of-band reply during handshake: correlation_id={}",
                    response.correlation_id
                );
            }
            ServerFrame::Tune {
                frame_max,
                heartbeat,
            } => *pending_tune = Some((frame_max, heartbeat)),
            ServerFrame::Heartbeat => {}
            other => tracing::debug!("unexpected frame during handshake: frame={other:?}"),
        }
    }
}

/// Wait for the broker's tune proposal after authentication.
async fn await_tune(framed: &mut Transport, limit: Duration) -> Result<(u32, u32), StreamError> {
    loop {
        let frame = next_frame(framed, limit, || HandshakeError::TuneTimeout(limit).into()).await?;
        match frame {
            ServerFrame::Tune {
                frame_max,
                heartbeat,
            } => return Ok((frame_max, heartbeat)),
            ServerFrame::Heartbeat => {}
            other => tracing::debug!("unexpected frame while awaiting tune: frame={other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 0, 0)]
    #[case(0, 131_072, 131_072)]
    #[case(131_072, 0, 131_072)]
    #[case(65_536, 131_072, 65_536)]
    #[case(131_072, 65_536, 65_536)]
    fn tune_values_combine_towards_the_smaller_bound(
        #[case] ours: u32,
        #[case] theirs: u32,
        #[case] expected: u32,
    ) {
        assert_eq!(combine(ours, theirs), expected);
    }

    #[test]
    fn unlimited_negotiation_still_bounds_the_encoder() {
        assert_eq!(effective_frame_max(0), 16 * 1024 * 1024);
        assert_eq!(effective_frame_max(4096), 4096);
    }

    #[test]
    fn plain_credentials_are_nul_delimited() {
        assert_eq!(
            plain_credentials("guest", "guest").as_ref(),
            b"\0guest\0guest"
        );
    }
}
