//! Scriptable mock broker speaking the server side of the stream protocol.
//!
//! [`MockBroker`] binds a real TCP listener on an ephemeral port and serves
//! every accepted connection from one [`BrokerScript`]: it answers the
//! handshake, tracks streams, confirms publishes, and delivers queued
//! chunks strictly against outstanding credit. A control handle drives
//! server-initiated traffic (deliveries, metadata updates, close) on the
//! first connection while a test runs, and can mute the broker to provoke
//! heartbeat loss.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    sync::mpsc,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};

use crate::wire::{self, RESPONSE_FLAG, key};

/// Response codes a script can hand the broker.
pub mod code {
    pub const OK: u16 = 0x01;
    pub const STREAM_DOES_NOT_EXIST: u16 = 0x02;
    pub const STREAM_ALREADY_EXISTS: u16 = 0x05;
    pub const STREAM_NOT_AVAILABLE: u16 = 0x06;
    pub const AUTHENTICATION_FAILURE: u16 = 0x08;
    pub const AUTHENTICATION_FAILURE_LOOPBACK: u16 = 0x0b;
    pub const VIRTUAL_HOST_ACCESS_FAILURE: u16 = 0x0c;
    pub const INTERNAL_ERROR: u16 = 0x0f;
    pub const ACCESS_REFUSED: u16 = 0x10;
    pub const PRECONDITION_FAILED: u16 = 0x11;
    pub const PUBLISHER_DOES_NOT_EXIST: u16 = 0x12;
    pub const NO_OFFSET: u16 = 0x13;
}

/// Scripted behaviour applied to every connection a [`MockBroker`] accepts.
#[derive(Clone, Debug)]
pub struct BrokerScript {
    streams: Vec<String>,
    mechanisms: Vec<String>,
    auth_code: u16,
    open_code: u16,
    tune_frame_max: u32,
    tune_heartbeat: u32,
    advertise: Option<(String, u32)>,
    leader: Option<(String, u32)>,
    declare_publisher_code: u16,
    subscribe_code: u16,
    publish_error: Option<u16>,
    credit_error: Option<u16>,
    stored_offsets: Vec<(String, String, u64)>,
    publisher_sequences: Vec<(String, String, u64)>,
    chunks: Vec<Bytes>,
    mute_after_handshake: bool,
}

impl Default for BrokerScript {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            mechanisms: vec!["PLAIN".to_owned(), "EXTERNAL".to_owned()],
            auth_code: code::OK,
            open_code: code::OK,
            tune_frame_max: 1024 * 1024,
            tune_heartbeat: 60,
            advertise: None,
            leader: None,
            declare_publisher_code: code::OK,
            subscribe_code: code::OK,
            publish_error: None,
            credit_error: None,
            stored_offsets: Vec::new(),
            publisher_sequences: Vec::new(),
            chunks: Vec::new(),
            mute_after_handshake: false,
        }
    }
}

impl BrokerScript {
    /// Declare `stream` as pre-existing.
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.streams.push(stream.into());
        self
    }

    /// Offer this SASL mechanism list during the handshake.
    pub fn mechanisms(mut self, mechanisms: Vec<String>) -> Self {
        self.mechanisms = mechanisms;
        self
    }

    /// Answer sasl-authenticate with `auth_code` instead of Ok.
    pub fn auth_code(mut self, auth_code: u16) -> Self {
        self.auth_code = auth_code;
        self
    }

    /// Answer open with `open_code` instead of Ok.
    pub fn open_code(mut self, open_code: u16) -> Self {
        self.open_code = open_code;
        self
    }

    /// Values the broker proposes in its tune frame.
    pub fn tune(mut self, frame_max: u32, heartbeat: u32) -> Self {
        self.tune_frame_max = frame_max;
        self.tune_heartbeat = heartbeat;
        self
    }

    /// Advertise this host and port in the open response instead of the
    /// listener's own address.
    pub fn advertise(mut self, host: impl Into<String>, port: u32) -> Self {
        self.advertise = Some((host.into(), port));
        self
    }

    /// Report this host and port as every stream's leader in metadata
    /// responses.
    pub fn leader(mut self, host: impl Into<String>, port: u32) -> Self {
        self.leader = Some((host.into(), port));
        self
    }

    /// Reject declare-publisher requests with this code.
    pub fn declare_publisher_code(mut self, declare_code: u16) -> Self {
        self.declare_publisher_code = declare_code;
        self
    }

    /// Reject subscribe requests with this code.
    pub fn subscribe_code(mut self, subscribe_code: u16) -> Self {
        self.subscribe_code = subscribe_code;
        self
    }

    /// Answer every publish with a publish-error carrying this code.
    pub fn publish_error(mut self, error_code: u16) -> Self {
        self.publish_error = Some(error_code);
        self
    }

    /// Answer every credit frame with a credit error carrying this code.
    pub fn credit_error(mut self, error_code: u16) -> Self {
        self.credit_error = Some(error_code);
        self
    }

    /// Seed a stored consumer offset.
    pub fn with_stored_offset(
        mut self,
        reference: impl Into<String>,
        stream: impl Into<String>,
        offset: u64,
    ) -> Self {
        self.stored_offsets
            .push((reference.into(), stream.into(), offset));
        self
    }

    /// Seed a stored publisher sequence.
    pub fn with_publisher_sequence(
        mut self,
        reference: impl Into<String>,
        stream: impl Into<String>,
        sequence: u64,
    ) -> Self {
        self.publisher_sequences
            .push((reference.into(), stream.into(), sequence));
        self
    }

    /// Queue a chunk for the first subscription, delivered against credit.
    pub fn with_chunk(mut self, chunk: Bytes) -> Self {
        self.chunks.push(chunk);
        self
    }

    /// Complete the handshake, then never write another frame.
    pub fn mute_after_handshake(mut self) -> Self {
        self.mute_after_handshake = true;
        self
    }
}

/// One message the broker received in a publish frame.
///
/// `body` holds the entry bytes as published, message envelope included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    pub publisher_id: u8,
    pub publishing_id: u64,
    pub body: Bytes,
}

impl PublishedMessage {
    /// Payload carried inside the message envelope.
    ///
    /// # Panics
    ///
    /// Panics when the entry bytes are not a well-formed envelope.
    pub fn payload(&self) -> Bytes {
        let mut src = self.body.clone();
        let flags = src.get_u8();
        if flags & 0x01 != 0 {
            let _properties = wire::get_string_map(&mut src);
        }
        wire::get_bytes(&mut src)
    }

    /// Properties carried inside the message envelope, in encoded order.
    pub fn properties(&self) -> Vec<(String, String)> {
        let mut src = self.body.clone();
        let flags = src.get_u8();
        if flags & 0x01 == 0 {
            return Vec::new();
        }
        wire::get_string_map(&mut src)
    }
}

/// One subscribe request the broker accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSeen {
    pub subscription_id: u8,
    pub stream: String,
    /// Wire offset specification type (1 first, 2 last, 3 next, 4 offset,
    /// 5 timestamp).
    pub offset_type: u16,
    /// Absolute offset, for offset-typed subscriptions.
    pub offset_value: Option<u64>,
    pub initial_credit: u16,
}

#[derive(Debug, Default)]
struct BrokerState {
    streams: Mutex<BTreeSet<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    stored_offsets: Mutex<Vec<(String, String, u64)>>,
    credits: Mutex<Vec<(u8, u16)>>,
    subscriptions: Mutex<Vec<SubscriptionSeen>>,
    connections: AtomicUsize,
}

enum Control {
    Deliver { subscription_id: u8, chunk: Bytes },
    MetadataUpdate { code: u16, stream: String },
    Close { code: u16, reason: String },
    Mute,
    DropConnection,
}

/// A running mock broker bound to an ephemeral port.
///
/// Dropping the broker stops accepting; established sessions end when
/// their sockets do.
pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    control: mpsc::UnboundedSender<Control>,
    accept_task: JoinHandle<()>,
}

impl MockBroker {
    /// Bind an ephemeral port and serve `script` to every connection.
    ///
    /// # Panics
    ///
    /// Panics when the listener cannot bind, which fails the test.
    pub async fn start(script: BrokerScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock broker");
        let addr = listener.local_addr().expect("mock broker address");
        let state = Arc::new(BrokerState {
            streams: Mutex::new(script.streams.iter().cloned().collect()),
            stored_offsets: Mutex::new(script.stored_offsets.clone()),
            ..BrokerState::default()
        });
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        // Only the first session is remotely controllable; later
        // connections run the script without a control channel.
        let control_slot = Arc::new(Mutex::new(Some(control_rx)));
        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let session = Session::new(script.clone(), Arc::clone(&accept_state), addr.port());
                let control = control_slot.lock().expect("control slot").take();
                tokio::spawn(session.run(socket, control));
            }
        });
        Self {
            addr,
            state,
            control: control_tx,
            accept_task,
        }
    }

    /// Endpoint in the `host:port` form the client builder takes.
    pub fn endpoint(&self) -> String {
        format!("localhost:{}", self.addr.port())
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Messages received in publish frames, in arrival order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().expect("broker state").clone()
    }

    /// Offsets stored via store-offset frames (plus any the script seeded).
    pub fn stored_offsets(&self) -> Vec<(String, String, u64)> {
        self.state
            .stored_offsets
            .lock()
            .expect("broker state")
            .clone()
    }

    /// Credit frames received, in arrival order.
    pub fn credits(&self) -> Vec<(u8, u16)> {
        self.state.credits.lock().expect("broker state").clone()
    }

    /// Subscribe requests handled, in arrival order.
    pub fn subscriptions(&self) -> Vec<SubscriptionSeen> {
        self.state
            .subscriptions
            .lock()
            .expect("broker state")
            .clone()
    }

    /// Streams currently in existence.
    pub fn streams(&self) -> Vec<String> {
        self.state
            .streams
            .lock()
            .expect("broker state")
            .iter()
            .cloned()
            .collect()
    }

    /// Queue a chunk for delivery on the first connection, against credit.
    pub fn deliver(&self, subscription_id: u8, chunk: Bytes) {
        let _ = self.control.send(Control::Deliver {
            subscription_id,
            chunk,
        });
    }

    /// Push a metadata-update notification on the first connection.
    pub fn push_metadata_update(&self, update_code: u16, stream: impl Into<String>) {
        let _ = self.control.send(Control::MetadataUpdate {
            code: update_code,
            stream: stream.into(),
        });
    }

    /// Initiate a server-side close exchange on the first connection.
    pub fn server_close(&self, close_code: u16, reason: impl Into<String>) {
        let _ = self.control.send(Control::Close {
            code: close_code,
            reason: reason.into(),
        });
    }

    /// Stop writing frames on the first connection, provoking heartbeat
    /// loss.
    pub fn mute(&self) {
        let _ = self.control.send(Control::Mute);
    }

    /// Sever the first connection without a close exchange.
    pub fn drop_connection(&self) {
        let _ = self.control.send(Control::DropConnection);
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[derive(Default)]
struct Outcome {
    frames: Vec<Bytes>,
    hang_up: bool,
}

struct Session {
    script: BrokerScript,
    state: Arc<BrokerState>,
    port: u16,
    muted: bool,
    handshaken: bool,
    negotiated_heartbeat: u32,
    credit: HashMap<u8, u16>,
    pending_chunks: VecDeque<(u8, Bytes)>,
    server_correlation: u32,
}

impl Session {
    fn new(script: BrokerScript, state: Arc<BrokerState>, port: u16) -> Self {
        Self {
            script,
            state,
            port,
            muted: false,
            handshaken: false,
            negotiated_heartbeat: 0,
            credit: HashMap::new(),
            pending_chunks: VecDeque::new(),
            server_correlation: 0,
        }
    }

    async fn run(
        mut self,
        socket: TcpStream,
        control: Option<mpsc::UnboundedReceiver<Control>>,
    ) {
        socket.set_nodelay(true).ok();
        let (mut read_half, mut writer) = socket.into_split();
        let (frames_tx, mut frames) = mpsc::unbounded_channel();
        let read_task = tokio::spawn(async move {
            while let Ok(frame) = read_frame(&mut read_half).await {
                if frames_tx.send(frame).is_err() {
                    break;
                }
            }
        });
        let mut control = control;
        let mut beat = interval(Duration::from_millis(500));
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let outcome = tokio::select! {
                biased;
                frame = frames.recv() => match frame {
                    Some(payload) => self.on_frame(payload),
                    None => break,
                },
                command = recv_control(&mut control) => match command {
                    Some(command) => self.on_control(command),
                    None => {
                        control = None;
                        continue;
                    }
                },
                _ = beat.tick() => {
                    if self.handshaken && !self.muted && self.negotiated_heartbeat > 0 {
                        Outcome {
                            frames: vec![wire::frame(key::HEARTBEAT, |_| {})],
                            hang_up: false,
                        }
                    } else {
                        continue;
                    }
                }
            };
            for frame in outcome.frames {
                if writer.write_all(&frame).await.is_err() {
                    read_task.abort();
                    return;
                }
            }
            if outcome.hang_up {
                break;
            }
        }
        read_task.abort();
        let _ = writer.shutdown().await;
    }

    fn advertised(&self) -> (String, u32) {
        self.script
            .advertise
            .clone()
            .unwrap_or_else(|| ("localhost".to_owned(), u32::from(self.port)))
    }

    fn leader(&self) -> (String, u32) {
        self.script
            .leader
            .clone()
            .unwrap_or_else(|| self.advertised())
    }

    fn stream_exists(&self, stream: &str) -> bool {
        self.state
            .streams
            .lock()
            .expect("broker state")
            .contains(stream)
    }

    fn on_frame(&mut self, payload: Bytes) -> Outcome {
        let was_muted = self.muted;
        let mut src = payload;
        let frame_key = src.get_u16();
        let _version = src.get_u16();
        let mut out = Outcome::default();
        match frame_key {
            key::PEER_PROPERTIES => {
                let correlation_id = src.get_u32();
                let _client_properties = wire::get_string_map(&mut src);
                out.frames.push(wire::response(
                    key::PEER_PROPERTIES,
                    correlation_id,
                    |dst| {
                        dst.put_u16(code::OK);
                        wire::put_string_map(
                            dst,
                            &[
                                ("product".to_owned(), "streamwire-mock".to_owned()),
                                ("version".to_owned(), "0.1.0".to_owned()),
                            ],
                        );
                    },
                ));
            }
            key::SASL_HANDSHAKE => {
                let correlation_id = src.get_u32();
                let mechanisms = self.script.mechanisms.clone();
                out.frames
                    .push(wire::response(key::SASL_HANDSHAKE, correlation_id, |dst| {
                        dst.put_u16(code::OK);
                        dst.put_i32(i32::try_from(mechanisms.len()).expect("few mechanisms"));
                        for mechanism in &mechanisms {
                            wire::put_string(dst, mechanism);
                        }
                    }));
            }
            key::SASL_AUTHENTICATE => {
                let correlation_id = src.get_u32();
                let _mechanism = wire::get_string(&mut src);
                let _credentials = wire::get_bytes(&mut src);
                let auth_code = self.script.auth_code;
                out.frames.push(wire::response(
                    key::SASL_AUTHENTICATE,
                    correlation_id,
                    |dst| dst.put_u16(auth_code),
                ));
                if auth_code == code::OK {
                    let (frame_max, heartbeat) =
                        (self.script.tune_frame_max, self.script.tune_heartbeat);
                    out.frames.push(wire::frame(key::TUNE, |dst| {
                        dst.put_u32(frame_max);
                        dst.put_u32(heartbeat);
                    }));
                }
            }
            key::TUNE => {
                let _frame_max = src.get_u32();
                self.negotiated_heartbeat = src.get_u32();
            }
            key::OPEN => {
                let correlation_id = src.get_u32();
                let _virtual_host = wire::get_string(&mut src);
                let open_code = self.script.open_code;
                let advertised = self.advertised();
                out.frames
                    .push(wire::response(key::OPEN, correlation_id, |dst| {
                        dst.put_u16(open_code);
                        if open_code == code::OK {
                            wire::put_string_map(
                                dst,
                                &[
                                    ("advertised_host".to_owned(), advertised.0.clone()),
                                    ("advertised_port".to_owned(), advertised.1.to_string()),
                                ],
                            );
                        }
                    }));
                self.handshaken = true;
                if self.script.mute_after_handshake {
                    self.muted = true;
                }
            }
            key::CLOSE => {
                let correlation_id = src.get_u32();
                let _close_code = src.get_u16();
                let _reason = wire::get_string(&mut src);
                out.frames
                    .push(wire::status_response(key::CLOSE, correlation_id, code::OK));
                out.hang_up = true;
            }
            k if k == key::CLOSE | RESPONSE_FLAG => {
                // The client acknowledged a server-initiated close.
                out.hang_up = true;
            }
            key::DECLARE_PUBLISHER => {
                let correlation_id = src.get_u32();
                let _publisher_id = src.get_u8();
                let _reference = wire::get_string(&mut src);
                let stream = wire::get_string(&mut src);
                let declare_code = if self.script.declare_publisher_code != code::OK {
                    self.script.declare_publisher_code
                } else if self.stream_exists(&stream) {
                    code::OK
                } else {
                    code::STREAM_DOES_NOT_EXIST
                };
                out.frames.push(wire::status_response(
                    key::DECLARE_PUBLISHER,
                    correlation_id,
                    declare_code,
                ));
            }
            key::PUBLISH => {
                let publisher_id = src.get_u8();
                let count = src.get_i32();
                let mut publishing_ids = Vec::new();
                for _ in 0..count {
                    let publishing_id = src.get_u64();
                    let body = wire::get_bytes(&mut src);
                    publishing_ids.push(publishing_id);
                    self.state
                        .published
                        .lock()
                        .expect("broker state")
                        .push(PublishedMessage {
                            publisher_id,
                            publishing_id,
                            body,
                        });
                }
                out.frames.push(self.publish_reply(publisher_id, &publishing_ids));
            }
            key::QUERY_PUBLISHER_SEQUENCE => {
                let correlation_id = src.get_u32();
                let reference = wire::get_string(&mut src);
                let stream = wire::get_string(&mut src);
                let stored = self
                    .script
                    .publisher_sequences
                    .iter()
                    .rev()
                    .find(|(r, s, _)| *r == reference && *s == stream)
                    .map(|(_, _, sequence)| *sequence);
                out.frames.push(wire::response(
                    key::QUERY_PUBLISHER_SEQUENCE,
                    correlation_id,
                    |dst| match stored {
                        Some(sequence) => {
                            dst.put_u16(code::OK);
                            dst.put_u64(sequence);
                        }
                        None => {
                            dst.put_u16(code::NO_OFFSET);
                            dst.put_u64(0);
                        }
                    },
                ));
            }
            key::DELETE_PUBLISHER => {
                let correlation_id = src.get_u32();
                let _publisher_id = src.get_u8();
                out.frames.push(wire::status_response(
                    key::DELETE_PUBLISHER,
                    correlation_id,
                    code::OK,
                ));
            }
            key::SUBSCRIBE => {
                let correlation_id = src.get_u32();
                let subscription_id = src.get_u8();
                let stream = wire::get_string(&mut src);
                let offset_type = src.get_u16();
                let offset_value = match offset_type {
                    4 => Some(src.get_u64()),
                    5 => {
                        let _timestamp = src.get_i64();
                        None
                    }
                    _ => None,
                };
                let initial_credit = src.get_u16();
                let _properties = wire::get_string_map(&mut src);
                let subscribe_code = if self.script.subscribe_code != code::OK {
                    self.script.subscribe_code
                } else if self.stream_exists(&stream) {
                    code::OK
                } else {
                    code::STREAM_DOES_NOT_EXIST
                };
                self.state
                    .subscriptions
                    .lock()
                    .expect("broker state")
                    .push(SubscriptionSeen {
                        subscription_id,
                        stream,
                        offset_type,
                        offset_value,
                        initial_credit,
                    });
                out.frames.push(wire::status_response(
                    key::SUBSCRIBE,
                    correlation_id,
                    subscribe_code,
                ));
                if subscribe_code == code::OK {
                    self.credit.insert(subscription_id, initial_credit);
                    for chunk in std::mem::take(&mut self.script.chunks) {
                        self.pending_chunks.push_back((subscription_id, chunk));
                    }
                    self.flush_deliveries(&mut out);
                }
            }
            key::CREDIT => {
                let subscription_id = src.get_u8();
                let credit = src.get_u16();
                self.state
                    .credits
                    .lock()
                    .expect("broker state")
                    .push((subscription_id, credit));
                if let Some(error_code) = self.script.credit_error {
                    out.frames
                        .push(wire::frame(key::CREDIT | RESPONSE_FLAG, |dst| {
                            dst.put_u16(error_code);
                            dst.put_u8(subscription_id);
                        }));
                } else {
                    *self.credit.entry(subscription_id).or_insert(0) += credit;
                    self.flush_deliveries(&mut out);
                }
            }
            key::STORE_OFFSET => {
                let reference = wire::get_string(&mut src);
                let stream = wire::get_string(&mut src);
                let offset = src.get_u64();
                self.state
                    .stored_offsets
                    .lock()
                    .expect("broker state")
                    .push((reference, stream, offset));
            }
            key::QUERY_OFFSET => {
                let correlation_id = src.get_u32();
                let reference = wire::get_string(&mut src);
                let stream = wire::get_string(&mut src);
                let stored = self
                    .state
                    .stored_offsets
                    .lock()
                    .expect("broker state")
                    .iter()
                    .rev()
                    .find(|(r, s, _)| *r == reference && *s == stream)
                    .map(|(_, _, offset)| *offset);
                out.frames
                    .push(wire::response(key::QUERY_OFFSET, correlation_id, |dst| {
                        match stored {
                            Some(offset) => {
                                dst.put_u16(code::OK);
                                dst.put_u64(offset);
                            }
                            None => {
                                dst.put_u16(code::NO_OFFSET);
                                dst.put_u64(0);
                            }
                        }
                    }));
            }
            key::UNSUBSCRIBE => {
                let correlation_id = src.get_u32();
                let subscription_id = src.get_u8();
                self.credit.remove(&subscription_id);
                out.frames.push(wire::status_response(
                    key::UNSUBSCRIBE,
                    correlation_id,
                    code::OK,
                ));
            }
            key::CREATE_STREAM => {
                let correlation_id = src.get_u32();
                let stream = wire::get_string(&mut src);
                let _arguments = wire::get_string_map(&mut src);
                let created = self
                    .state
                    .streams
                    .lock()
                    .expect("broker state")
                    .insert(stream);
                out.frames.push(wire::status_response(
                    key::CREATE_STREAM,
                    correlation_id,
                    if created {
                        code::OK
                    } else {
                        code::STREAM_ALREADY_EXISTS
                    },
                ));
            }
            key::DELETE_STREAM => {
                let correlation_id = src.get_u32();
                let stream = wire::get_string(&mut src);
                let removed = self
                    .state
                    .streams
                    .lock()
                    .expect("broker state")
                    .remove(&stream);
                out.frames.push(wire::status_response(
                    key::DELETE_STREAM,
                    correlation_id,
                    if removed {
                        code::OK
                    } else {
                        code::STREAM_DOES_NOT_EXIST
                    },
                ));
            }
            key::METADATA => {
                let correlation_id = src.get_u32();
                let count = src.get_i32();
                let mut requested = Vec::new();
                for _ in 0..count {
                    requested.push(wire::get_string(&mut src));
                }
                out.frames
                    .push(self.metadata_reply(correlation_id, &requested));
            }
            key::HEARTBEAT => {}
            other => panic!("mock broker received unknown frame key {other:#06x}"),
        }
        if was_muted {
            out.frames.clear();
        }
        out
    }

    fn publish_reply(&self, publisher_id: u8, publishing_ids: &[u64]) -> Bytes {
        match self.script.publish_error {
            Some(error_code) => wire::frame(key::PUBLISH_ERROR, |dst| {
                dst.put_u8(publisher_id);
                dst.put_i32(i32::try_from(publishing_ids.len()).expect("few ids"));
                for publishing_id in publishing_ids {
                    dst.put_u64(*publishing_id);
                    dst.put_u16(error_code);
                }
            }),
            None => wire::frame(key::PUBLISH_CONFIRM, |dst| {
                dst.put_u8(publisher_id);
                dst.put_i32(i32::try_from(publishing_ids.len()).expect("few ids"));
                for publishing_id in publishing_ids {
                    dst.put_u64(*publishing_id);
                }
            }),
        }
    }

    fn metadata_reply(&self, correlation_id: u32, requested: &[String]) -> Bytes {
        let (leader_host, leader_port) = self.leader();
        let known: Vec<(String, bool)> = requested
            .iter()
            .map(|stream| (stream.clone(), self.stream_exists(stream)))
            .collect();
        wire::response(key::METADATA, correlation_id, |dst| {
            dst.put_i32(1);
            dst.put_u16(0);
            wire::put_string(dst, &leader_host);
            dst.put_u32(leader_port);
            dst.put_i32(i32::try_from(known.len()).expect("few streams"));
            for (stream, exists) in &known {
                wire::put_string(dst, stream);
                dst.put_u16(if *exists {
                    code::OK
                } else {
                    code::STREAM_DOES_NOT_EXIST
                });
                dst.put_u16(0);
                dst.put_i32(0);
            }
        })
    }

    fn on_control(&mut self, command: Control) -> Outcome {
        let was_muted = self.muted;
        let mut out = Outcome::default();
        match command {
            Control::Deliver {
                subscription_id,
                chunk,
            } => {
                self.pending_chunks.push_back((subscription_id, chunk));
                self.flush_deliveries(&mut out);
            }
            Control::MetadataUpdate { code, stream } => {
                out.frames.push(wire::frame(key::METADATA_UPDATE, |dst| {
                    dst.put_u16(code);
                    wire::put_string(dst, &stream);
                }));
            }
            Control::Close { code, reason } => {
                self.server_correlation += 1;
                let correlation_id = self.server_correlation;
                out.frames.push(wire::frame(key::CLOSE, |dst| {
                    dst.put_u32(correlation_id);
                    dst.put_u16(code);
                    wire::put_string(dst, &reason);
                }));
            }
            Control::Mute => self.muted = true,
            Control::DropConnection => out.hang_up = true,
        }
        if was_muted {
            out.frames.clear();
        }
        out
    }

    fn flush_deliveries(&mut self, out: &mut Outcome) {
        while let Some((subscription_id, _)) = self.pending_chunks.front() {
            let available = self.credit.get(subscription_id).copied().unwrap_or(0);
            if available == 0 {
                break;
            }
            let (subscription_id, chunk) = self
                .pending_chunks
                .pop_front()
                .expect("front entry exists");
            *self
                .credit
                .get_mut(&subscription_id)
                .expect("credit tracked") -= 1;
            out.frames.push(wire::frame(key::DELIVER, |dst| {
                dst.put_u8(subscription_id);
                dst.put_slice(&chunk);
            }));
        }
    }
}

async fn recv_control(
    control: &mut Option<mpsc::UnboundedReceiver<Control>>,
) -> Option<Control> {
    match control.as_mut() {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Bytes> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let length = u32::from_be_bytes(header);
    let mut payload = vec![0u8; usize::try_from(length).expect("length fits usize")];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}
