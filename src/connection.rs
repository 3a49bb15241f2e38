//! One client connection: handshake, frame handling and actions.
//!
//! A [`Connection`] is passive state plus its transport: the byte buffer,
//! the frame codec, and where it is in its lifecycle. The reacting happens in
//! a [`Session`], which borrows the repositories for the duration of one
//! read event so a connection can reach its channel and its channel can
//! reach every other connection through a [`Postman`].
//!
//! Teardown is deferred. Anything that decides a connection must go pushes
//! its id onto the teardown list; the server drains that list after the
//! event, telling the channel and releasing the socket.

use crate::channel::envelope::notice;
use crate::channel::{
    parse_inbound, Action, Channel, ChannelEvent, ChannelMessage, ChannelRequest, Inbound, Member,
    Outbox,
};
use crate::codec::Decoder;
use crate::net::websocket::{
    AcceptResponse, CloseCode, CloseReason, Frame, FrameCodec, HandshakeError, HttpRequest,
    Opcode, ServerHandshake, WsError, MAX_REQUEST_SIZE,
};
use crate::net::{Transport, TransportError};
use crate::repository::{ChannelRepository, ConnectionRepository, OriginValidator};
use crate::types::ConnectionId;
use bytes::BytesMut;
use mio::Token;
use serde_json::{json, Map, Value};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failure to deliver to one connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket I/O failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Frame could not be encoded.
    #[error(transparent)]
    Frame(#[from] WsError),
    /// Payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    /// The connection is already closed.
    #[error("connection is closed")]
    Closed,
}

/// Primary lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, upgrade request not processed yet.
    Connecting,
    /// Upgrade done; frames are exchanged.
    HandshakeDone,
    /// Terminal.
    Closed,
}

/// A client socket and its protocol state.
pub struct Connection {
    id: ConnectionId,
    token: Token,
    peer: SocketAddr,
    transport: Box<dyn Transport>,
    state: ConnectionState,
    joined: bool,
    ready_for_close: bool,
    buffer: BytesMut,
    waiting_for_data: bool,
    codec: FrameCodec,
    channel: Option<String>,
    old_id: Option<ConnectionId>,
}

impl Connection {
    /// Wrap an admitted transport.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        token: Token,
        peer: SocketAddr,
        transport: Box<dyn Transport>,
        max_payload_size: usize,
    ) -> Self {
        Self {
            id,
            token,
            peer,
            transport,
            state: ConnectionState::Connecting,
            joined: false,
            ready_for_close: false,
            buffer: BytesMut::new(),
            waiting_for_data: false,
            codec: FrameCodec::server().max_payload_size(max_payload_size),
            channel: None,
            old_id: None,
        }
    }

    /// Stable id.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Poll token.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Remote address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Remote IP.
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }

    /// Remote port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.peer.port()
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection is closed or awaiting teardown.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Whether a connect or reconnect action was accepted.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Whether the client announced a polite close.
    #[must_use]
    pub fn is_ready_for_close(&self) -> bool {
        self.ready_for_close
    }

    /// Channel bound at handshake.
    #[must_use]
    pub fn channel_name(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Id reclaimed by a reconnect.
    #[must_use]
    pub fn old_id(&self) -> Option<&ConnectionId> {
        self.old_id.as_ref()
    }

    /// Whether the last processing pass left an incomplete request or
    /// frame buffered. Reads do not change this; only processing does.
    #[must_use]
    pub fn is_waiting_for_data(&self) -> bool {
        self.waiting_for_data
    }

    /// Whether the peer closed its side.
    #[must_use]
    pub fn at_eof(&self) -> bool {
        self.transport.at_eof()
    }

    /// Transport, for poll registration.
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Serialize `payload` and send it as one text frame.
    pub fn send(&mut self, payload: &Value) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(payload)?;
        self.send_frame(Frame::text(text))
    }

    /// Encode and write one frame.
    pub fn send_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::HandshakeDone {
            return Err(ConnectionError::Closed);
        }
        let bytes = self.codec.encode_to_vec(frame)?;
        self.transport.write_all(&bytes)?;
        Ok(())
    }

    /// Send a close frame (after the handshake) and enter `Closed`.
    pub fn close(&mut self, code: CloseCode) {
        if self.state == ConnectionState::HandshakeDone {
            if let Err(err) = self.send_frame(CloseReason::new(code).to_frame()) {
                debug!(
                    category = "connection",
                    connection_id = %self.id,
                    error = %err,
                    "close frame not delivered"
                );
            }
        }
        self.state = ConnectionState::Closed;
    }

    /// Shut the socket down. Idempotent.
    pub fn shutdown(&mut self) {
        self.state = ConnectionState::Closed;
        self.transport.shutdown();
    }

    fn read(&mut self) -> Result<usize, TransportError> {
        let data = self.transport.read_all()?;
        self.buffer.extend_from_slice(&data);
        Ok(data.len())
    }

    fn take_request_block(&mut self) -> Result<Option<BytesMut>, HandshakeError> {
        match HttpRequest::header_block_len(&self.buffer) {
            Some(len) if len <= MAX_REQUEST_SIZE => Ok(Some(self.buffer.split_to(len))),
            Some(_) => Err(HandshakeError::RequestTooLarge(MAX_REQUEST_SIZE)),
            None if self.buffer.len() > MAX_REQUEST_SIZE => {
                Err(HandshakeError::RequestTooLarge(MAX_REQUEST_SIZE))
            }
            None => Ok(None),
        }
    }

    fn settle_buffer(&mut self) {
        self.waiting_for_data = !self.buffer.is_empty();
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, WsError> {
        self.codec.decode(&mut self.buffer)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.transport.write_all(bytes).map(|_| ())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("joined", &self.joined)
            .field("channel", &self.channel)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

/// [`Outbox`] over the live connection table.
///
/// Failed deliveries and closes push the connection onto the teardown list.
pub struct Postman<'a> {
    connections: &'a mut ConnectionRepository,
    teardown: &'a mut Vec<ConnectionId>,
}

impl<'a> Postman<'a> {
    /// Deliver through `connections`, scheduling failures on `teardown`.
    pub fn new(
        connections: &'a mut ConnectionRepository,
        teardown: &'a mut Vec<ConnectionId>,
    ) -> Self {
        Self {
            connections,
            teardown,
        }
    }

    /// Tear `id` down without a close frame; the peer is gone.
    pub fn abandon(&mut self, id: &ConnectionId) {
        if let Some(connection) = self.connections.get_by_id_mut(id) {
            connection.state = ConnectionState::Closed;
            self.schedule(id);
        }
    }

    fn schedule(&mut self, id: &ConnectionId) {
        if !self.teardown.contains(id) {
            self.teardown.push(id.clone());
        }
    }
}

impl Outbox for Postman<'_> {
    fn send(&mut self, to: &ConnectionId, payload: &Value) -> bool {
        let Some(connection) = self.connections.get_by_id_mut(to) else {
            return false;
        };
        if connection.state() != ConnectionState::HandshakeDone {
            return false;
        }
        match connection.send(payload) {
            Ok(()) => true,
            Err(err) => {
                warn!(category = "connection", connection_id = %to, error = %err, "send failed");
                connection.state = ConnectionState::Closed;
                self.schedule(to);
                false
            }
        }
    }

    fn close(&mut self, id: &ConnectionId, code: CloseCode) {
        if let Some(connection) = self.connections.get_by_id_mut(id) {
            debug!(category = "connection", connection_id = %id, code = %code, "closing");
            connection.close(code);
            self.schedule(id);
        }
    }
}

/// Borrowed server state for reacting to one read event.
pub struct Session<'a> {
    /// Live connections.
    pub connections: &'a mut ConnectionRepository,
    /// Channels by name.
    pub channels: &'a mut ChannelRepository,
    /// Handshake origin gate.
    pub origin: &'a OriginValidator,
    /// Ids to tear down once the event is handled.
    pub teardown: &'a mut Vec<ConnectionId>,
}

impl Session<'_> {
    /// Read what is available on `token` and act on it: handshake, then
    /// every complete frame in order.
    pub fn react(&mut self, token: Token) {
        let Some(connection) = self.connections.get_mut(token) else {
            return;
        };
        if connection.is_closed() {
            return;
        }
        let id = connection.id().clone();

        if let Err(err) = connection.transport_mut().flush() {
            warn!(category = "connection", connection_id = %id, error = %err, "flush failed");
            self.postman().abandon(&id);
            return;
        }

        match connection.read() {
            Ok(0) if !connection.at_eof() => return,
            Ok(_) => {}
            Err(TransportError::Closed) => {
                debug!(category = "connection", connection_id = %id, "peer closed");
                self.postman().abandon(&id);
                return;
            }
            Err(err) => {
                warn!(category = "connection", connection_id = %id, error = %err, "read failed");
                self.postman().abandon(&id);
                return;
            }
        }

        if !self.connections.check_request_limit(&id) {
            warn!(category = "admission", connection_id = %id, "request limit exceeded");
            self.postman().close(&id, CloseCode::RequestLimitExceeded);
            return;
        }

        self.process_buffer(token, &id);
        if let Some(connection) = self.connections.get_mut(token) {
            connection.settle_buffer();
        }

        let eof = self
            .connections
            .get(token)
            .is_some_and(|connection| connection.at_eof() && !connection.is_closed());
        if eof {
            debug!(category = "connection", connection_id = %id, "peer closed after data");
            self.postman().abandon(&id);
        }
    }

    fn postman(&mut self) -> Postman<'_> {
        Postman::new(self.connections, self.teardown)
    }

    fn process_buffer(&mut self, token: Token, id: &ConnectionId) {
        let connecting = self
            .connections
            .get(token)
            .is_some_and(|connection| connection.state() == ConnectionState::Connecting);
        if connecting && !self.perform_handshake(token, id) {
            return;
        }

        loop {
            let Some(connection) = self.connections.get_mut(token) else {
                return;
            };
            if connection.is_closed() {
                return;
            }
            match connection.next_frame() {
                Ok(None) => return,
                Ok(Some(frame)) => self.handle_frame(token, id, frame),
                Err(err) => {
                    warn!(category = "connection", connection_id = %id, error = %err, "bad frame");
                    self.postman().close(id, err.close_code());
                    return;
                }
            }
        }
    }

    /// Returns `true` once the upgrade is complete.
    fn perform_handshake(&mut self, token: Token, id: &ConnectionId) -> bool {
        let Some(connection) = self.connections.get_mut(token) else {
            return false;
        };
        let block = match connection.take_request_block() {
            Ok(Some(block)) => block,
            Ok(None) => return false,
            Err(err) => {
                self.reject(token, id, &err);
                return false;
            }
        };

        let outcome = HttpRequest::parse(&block).and_then(|request| {
            let response = self.check_request(&request)?;
            Ok((request.channel_key().to_string(), response))
        });
        let (channel_name, response) = match outcome {
            Ok(accepted) => accepted,
            Err(err) => {
                self.reject(token, id, &err);
                return false;
            }
        };

        let Some(connection) = self.connections.get_mut(token) else {
            return false;
        };
        if let Err(err) = connection.write_raw(&response.response_bytes()) {
            warn!(category = "handshake", connection_id = %id, error = %err, "upgrade write failed");
            self.postman().abandon(id);
            return false;
        }
        connection.state = ConnectionState::HandshakeDone;
        connection.channel = Some(channel_name.clone());
        info!(
            category = "handshake",
            connection_id = %id,
            peer = %connection.peer(),
            channel = %channel_name,
            "handshake accepted"
        );

        self.send_bootstrap(&channel_name, id);
        true
    }

    fn check_request(&self, request: &HttpRequest) -> Result<AcceptResponse, HandshakeError> {
        let key = request.channel_key();
        let channel = self
            .channels
            .get(key)
            .ok_or_else(|| HandshakeError::UnknownChannel(key.to_string()))?;
        if channel.is_closed() {
            return Err(HandshakeError::ChannelClosed(key.to_string()));
        }
        request.check_version()?;
        if !self.origin.admits(request.origin()) {
            return Err(HandshakeError::OriginRejected(
                request.origin().unwrap_or("missing").to_string(),
            ));
        }
        ServerHandshake::new().echo_protocol(key).accept(request)
    }

    fn reject(&mut self, token: Token, id: &ConnectionId, err: &HandshakeError) {
        let Some(connection) = self.connections.get_mut(token) else {
            return;
        };
        warn!(
            category = "handshake",
            connection_id = %id,
            peer = %connection.peer(),
            status = err.status(),
            error = %err,
            "handshake rejected"
        );
        if let Err(write_err) = connection.write_raw(&err.response_bytes()) {
            debug!(category = "handshake", error = %write_err, "rejection not delivered");
        }
        self.postman().abandon(id);
    }

    fn send_bootstrap(&mut self, channel_name: &str, id: &ConnectionId) {
        let Some(channel) = self.channels.get_mut(channel_name) else {
            return;
        };
        let mut connections = channel.get_connections_data();
        connections.insert(id.to_string(), json!({ "id": id }));

        let mut bootstrap = Map::new();
        bootstrap.insert("id".into(), Value::String(id.to_string()));
        bootstrap.insert("channelData".into(), channel.channel_data(id));
        bootstrap.insert("connections".into(), Value::Object(connections));
        if channel.is_reconnection_allowed() {
            bootstrap.insert("reconnectionAllowed".into(), Value::Bool(true));
        }
        Postman::new(self.connections, self.teardown).send(id, &Value::Object(bootstrap));
    }

    fn handle_frame(&mut self, token: Token, id: &ConnectionId, frame: Frame) {
        if !frame.fin || frame.opcode == Opcode::Continuation {
            debug!(category = "connection", connection_id = %id, "fragmented frame");
            self.postman().close(id, CloseCode::PolicyViolation);
            return;
        }

        match frame.opcode {
            Opcode::Text => match std::str::from_utf8(&frame.payload) {
                Ok(text) => match parse_inbound(text) {
                    Ok(inbound) => self.process_message(token, id, inbound),
                    Err(err) => {
                        debug!(category = "connection", connection_id = %id, error = %err, "ignoring document");
                    }
                },
                Err(_) => self.postman().close(id, CloseCode::WrongEncoding),
            },
            Opcode::Binary => self.postman().close(id, CloseCode::UnknownData),
            Opcode::Ping => {
                let Some(connection) = self.connections.get_mut(token) else {
                    return;
                };
                if let Err(err) = connection.send_frame(Frame::pong(frame.payload)) {
                    warn!(category = "connection", connection_id = %id, error = %err, "pong failed");
                    self.postman().abandon(id);
                }
            }
            Opcode::Pong => {}
            Opcode::Close => self.on_close_frame(token, id),
            Opcode::Continuation => self.postman().close(id, CloseCode::PolicyViolation),
        }
    }

    fn on_close_frame(&mut self, token: Token, id: &ConnectionId) {
        let Some(connection) = self.connections.get(token) else {
            return;
        };
        let leaving = connection.is_ready_for_close();
        let bound = connection
            .is_joined()
            .then(|| connection.channel_name().map(str::to_owned))
            .flatten();

        if let Some(channel) = bound.and_then(|name| self.channels.get_mut(&name)) {
            let mut out = Postman::new(self.connections, self.teardown);
            if leaving {
                channel.on_leave(id, &mut out);
            } else {
                channel.on_disconnect(id, &mut out);
            }
        }

        let code = if leaving {
            CloseCode::Leave
        } else {
            CloseCode::Normal
        };
        self.postman().close(id, code);
    }

    fn process_message(&mut self, token: Token, id: &ConnectionId, inbound: Inbound) {
        let Some(connection) = self.connections.get(token) else {
            return;
        };
        let joined = connection.is_joined();
        let peer = connection.peer();
        let Some(name) = connection.channel_name().map(str::to_owned) else {
            return;
        };
        let Some(channel) = self.channels.get_mut(&name) else {
            debug!(category = "connection", connection_id = %id, channel = %name, "channel is gone");
            return;
        };
        let mut out = Postman::new(self.connections, self.teardown);

        match inbound {
            Inbound::Action(action) => process_action(channel, &mut out, token, id, peer, action),
            _ if !joined => {
                debug!(category = "connection", connection_id = %id, "ignoring message before connect");
            }
            Inbound::Event { name, envelope } => {
                debug!(category = "connection", connection_id = %id, event = %name, "event");
                channel.on_event(
                    ChannelEvent::from_envelope(name, envelope, Some(id.clone())),
                    &mut out,
                );
            }
            Inbound::Request { route, key, envelope } => {
                debug!(category = "connection", connection_id = %id, route = %route, "request");
                channel.on_request(&ChannelRequest::new(route, key, envelope, id.clone()), &mut out);
            }
            Inbound::Message(envelope) => {
                channel.on_message(
                    ChannelMessage::from_envelope(envelope, Some(id.clone())),
                    &mut out,
                );
            }
        }
    }
}

fn process_action(
    channel: &mut Channel,
    out: &mut Postman<'_>,
    token: Token,
    id: &ConnectionId,
    peer: SocketAddr,
    action: Action,
) {
    let joined = out
        .connections
        .get(token)
        .is_some_and(Connection::is_joined);

    match action {
        Action::Connect { open_data, auth } => {
            if joined {
                debug!(category = "connection", connection_id = %id, "repeated connect ignored");
                return;
            }
            if !channel.check_on_connect(&auth) {
                warn!(category = "connection", connection_id = %id, channel = %channel.name(), "connect refused");
                out.close(id, CloseCode::AccessError);
                return;
            }
            if let Some(connection) = out.connections.get_mut(token) {
                connection.joined = true;
            }
            channel.on_connect(Member::new(id.clone(), peer, open_data), out);
        }
        Action::Reconnect {
            old_connection_id,
            open_data,
            auth,
        } => {
            if joined {
                debug!(category = "connection", connection_id = %id, "reconnect after join ignored");
                return;
            }
            if !channel.check_on_connect(&auth) {
                warn!(category = "connection", connection_id = %id, channel = %channel.name(), "reconnect refused");
                out.close(id, CloseCode::AccessError);
                return;
            }
            if !channel.check_on_reconnect(&old_connection_id) {
                warn!(
                    category = "connection",
                    connection_id = %id,
                    old_connection_id = %old_connection_id,
                    "unknown former connection id"
                );
                out.send(id, &notice("oldConnectionIdNotFound", Map::new()));
                out.close(id, CloseCode::AccessError);
                return;
            }
            if let Some(connection) = out.connections.get_mut(token) {
                connection.joined = true;
                connection.old_id = Some(old_connection_id.clone());
            }
            channel.on_reconnect(Member::new(id.clone(), peer, open_data), &old_connection_id, out);
        }
        Action::Close => {
            if let Some(connection) = out.connections.get_mut(token) {
                connection.ready_for_close = true;
            }
            out.send(id, &notice("close", Map::new()));
        }
        Action::Break => {
            out.send(id, &notice("break", Map::new()));
        }
        Action::AddOpenData(data) => {
            if joined {
                channel.on_add_open_data(id, data, out);
            }
        }
        Action::Unknown(name) => {
            debug!(category = "connection", connection_id = %id, action = %name, "unknown action");
        }
    }
}
