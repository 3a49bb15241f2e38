//! The poll-dispatch loop.
//!
//! One [`Server`] owns the listening socket, the connection and channel
//! repositories and a mio [`Poll`]. Each call to [`Server::iterate`] runs one
//! tick:
//!
//! 1. poll every socket with a zero timeout
//! 2. accept pending clients and let ready connections react
//! 3. tear down every connection scheduled during the tick
//! 4. run `on_iteration` for channels on the timer
//! 5. close channels that asked to be dropped
//!
//! Everything runs on the calling thread. A panic inside a connection's
//! handling or a channel hook is caught and logged; the offending
//! connection is torn down and the loop carries on.

use crate::channel::{Channel, ChannelConfig, Outbox};
use crate::config::ServerConfig;
use crate::connection::{Postman, Session};
use crate::error::{Error, ErrorKind, Result};
use crate::net::{Listener, Transport};
use crate::repository::{ChannelRepository, ConnectionRepository, OriginValidator};
use crate::types::ConnectionId;
use mio::{Events, Poll, Token};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Poll token of the listening socket.
pub const LISTENER: Token = Token(0);

const EVENT_CAPACITY: usize = 256;

type KindFactory = Box<dyn Fn(&mut Channel)>;

/// Builds a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    secret: Option<String>,
    kinds: Vec<(String, KindFactory)>,
}

impl ServerBuilder {
    /// Builder over `config`.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            secret: None,
            kinds: Vec::new(),
        }
    }

    /// Fix the secret that salts connection ids. Random by default.
    #[must_use]
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Register a channel kind before the configured channels are created.
    #[must_use]
    pub fn kind<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&mut Channel) + 'static,
    {
        self.kinds.push((name.into(), Box::new(factory)));
        self
    }

    /// Build without listening; transports are handed in through
    /// [`Server::accept_transport`].
    pub fn build(self) -> Result<Server> {
        let poll = Poll::new()?;
        let secret = match self.secret {
            Some(secret) => secret,
            None => random_secret()?,
        };

        let connections = ConnectionRepository::new(self.config.limits(), secret)
            .with_registry(poll.registry().try_clone()?);
        let mut channels = ChannelRepository::new();
        for (name, factory) in self.kinds {
            channels.register_kind(name, factory);
        }
        for spec in &self.config.channels {
            if !channels.has_kind(&spec.kind) {
                return Err(Error::new(ErrorKind::UnknownKind)
                    .with_message(format!("channel {} has unknown kind {}", spec.name, spec.kind)));
            }
            if channels
                .create(&spec.name, &spec.kind, spec.channel_config())
                .is_none()
            {
                return Err(Error::new(ErrorKind::DuplicateChannel)
                    .with_message(format!("channel {} is declared twice", spec.name)));
            }
        }

        Ok(Server {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener: None,
            origin: self.config.origin_validator(),
            connections,
            channels,
            teardown: Vec::new(),
            config: self.config,
        })
    }

    /// Build and listen on the configured host and port.
    pub fn bind(self) -> Result<Server> {
        let mut server = self.build()?;
        server.listen()?;
        Ok(server)
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("kinds", &self.kinds.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn random_secret() -> Result<String> {
    let mut seed = [0u8; 16];
    getrandom::getrandom(&mut seed)
        .map_err(|err| Error::internal(format!("no entropy for the server secret: {err}")))?;
    Ok(hex::encode(seed))
}

/// WebSocket channel server.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: Option<Listener>,
    origin: OriginValidator,
    connections: ConnectionRepository,
    channels: ChannelRepository,
    teardown: Vec<ConnectionId>,
    config: ServerConfig,
}

impl Server {
    /// Shorthand for `ServerBuilder::new(config)`.
    #[must_use]
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// Bind the listening socket. No-op when already listening.
    pub fn listen(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let mut listener = Listener::bind(&self.config.host, self.config.port)?;
        listener.register(self.poll.registry(), LISTENER)?;
        info!(
            category = "server",
            addr = %listener.local_addr()?,
            channels = self.channels.len(),
            "server listening"
        );
        self.listener = Some(listener);
        Ok(())
    }

    /// Bound address, once listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|listener| listener.local_addr().ok())
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Channel registry.
    #[must_use]
    pub fn channels(&self) -> &ChannelRepository {
        &self.channels
    }

    /// Channel registry, mutably; for creating channels and kinds.
    pub fn channels_mut(&mut self) -> &mut ChannelRepository {
        &mut self.channels
    }

    /// Connection registry.
    #[must_use]
    pub fn connections(&self) -> &ConnectionRepository {
        &self.connections
    }

    /// Create channel `name` of `kind`.
    pub fn create_channel(
        &mut self,
        name: &str,
        kind: &str,
        config: ChannelConfig,
    ) -> Result<&mut Channel> {
        if !self.channels.has_kind(kind) {
            return Err(Error::new(ErrorKind::UnknownKind).with_message(kind.to_string()));
        }
        self.channels
            .create(name, kind, config)
            .ok_or_else(|| Error::new(ErrorKind::DuplicateChannel).with_message(name.to_string()))
    }

    /// Run `f` against channel `name` with live delivery, then tear down
    /// whatever it closed. `None` when the channel does not exist.
    pub fn with_channel<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Channel, &mut dyn Outbox) -> R,
    ) -> Option<R> {
        let channel = self.channels.get_mut(name)?;
        let mut out = Postman::new(&mut self.connections, &mut self.teardown);
        let result = f(channel, &mut out);
        self.drain_teardown();
        Some(result)
    }

    /// Close channel `name`: every member gets `leave`, then it is removed.
    pub fn close_channel(&mut self, name: &str) -> bool {
        let mut out = Postman::new(&mut self.connections, &mut self.teardown);
        let closed = self.channels.close(name, &mut out);
        self.drain_teardown();
        closed
    }

    /// Admit an already accepted transport. `None` when admission refuses
    /// it; the transport is dropped.
    pub fn accept_transport(&mut self, transport: Box<dyn Transport>) -> Option<Token> {
        self.connections.create(transport)
    }

    /// One tick with a zero poll timeout.
    pub fn iterate(&mut self) -> Result<()> {
        self.tick(Some(Duration::ZERO))
    }

    /// Tick forever, waiting up to `tick` for socket activity each time.
    /// Returns only when polling itself fails.
    pub fn run(&mut self, tick: Duration) -> Result<()> {
        self.listen()?;
        loop {
            self.tick(Some(tick))?;
        }
    }

    /// Let every live connection react, ready or not, then finish the tick.
    ///
    /// Meant for transports that are not registered with the poll, such
    /// as in-memory sockets.
    pub fn pump(&mut self) {
        let mut tokens = self.connections.tokens();
        tokens.sort_unstable();
        for token in tokens {
            self.react(token);
        }
        self.finish_tick();
    }

    /// Close every channel and drop every connection.
    pub fn shutdown(&mut self) {
        for name in self.channels.names() {
            let mut out = Postman::new(&mut self.connections, &mut self.teardown);
            self.channels.close(&name, &mut out);
        }
        self.drain_teardown();
        self.connections.clear();
        info!(category = "server", "server shut down");
    }

    fn tick(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => {
                error!(category = "server", error = %err, "poll failed");
                return Err(err.into());
            }
        }

        let ready: Vec<Token> = self.events.iter().map(mio::event::Event::token).collect();
        for token in ready {
            if token == LISTENER {
                self.accept_pending();
            } else {
                self.react(token);
            }
        }
        self.finish_tick();
        Ok(())
    }

    fn accept_pending(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        loop {
            match listener.accept() {
                Ok(Some(socket)) => {
                    let peer = socket.peer_addr();
                    if self.connections.create(Box::new(socket)).is_none() {
                        debug!(category = "admission", peer = ?peer, "socket dropped");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(category = "server", error = %err, "accept failed");
                    break;
                }
            }
        }
    }

    fn react(&mut self, token: Token) {
        let mut session = Session {
            connections: &mut self.connections,
            channels: &mut self.channels,
            origin: &self.origin,
            teardown: &mut self.teardown,
        };
        if panic::catch_unwind(AssertUnwindSafe(|| session.react(token))).is_err() {
            error!(category = "server", token = token.0, "connection handler panicked");
            if let Some(id) = self.connections.get(token).map(|c| c.id().clone()) {
                Postman::new(&mut self.connections, &mut self.teardown).abandon(&id);
            }
        }
    }

    fn finish_tick(&mut self) {
        self.drain_teardown();
        self.run_timers();
        self.drain_teardown();
        self.close_dropped();
    }

    fn run_timers(&mut self) {
        for name in self.channels.timer_channels() {
            let Some(channel) = self.channels.get_mut(&name) else {
                continue;
            };
            let mut out = Postman::new(&mut self.connections, &mut self.teardown);
            if panic::catch_unwind(AssertUnwindSafe(|| channel.on_iteration(&mut out))).is_err() {
                error!(category = "server", channel = %name, "channel iteration panicked");
            }
        }
    }

    fn close_dropped(&mut self) {
        let dropped = self.channels.take_dropped();
        if dropped.is_empty() {
            return;
        }
        for name in dropped {
            let mut out = Postman::new(&mut self.connections, &mut self.teardown);
            if self.channels.close(&name, &mut out) {
                info!(category = "channel", channel = %name, "channel dropped");
            }
        }
        self.drain_teardown();
    }

    /// Tell each scheduled connection's channel it is gone, then release it.
    /// Notifying a channel may schedule more connections; they are handled
    /// in the same pass.
    fn drain_teardown(&mut self) {
        let mut index = 0;
        while index < self.teardown.len() {
            let id = self.teardown[index].clone();
            index += 1;
            let Some(token) = self.connections.token_of(&id) else {
                continue;
            };
            let channel_name = self
                .connections
                .get(token)
                .and_then(|connection| connection.channel_name().map(str::to_owned));
            if let Some(channel) = channel_name.and_then(|name| self.channels.get_mut(&name)) {
                let mut out = Postman::new(&mut self.connections, &mut self.teardown);
                channel.on_disconnect(&id, &mut out);
            }
            self.connections.remove(token);
        }
        self.teardown.clear();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listening", &self.local_addr())
            .field("connections", &self.connections)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}
