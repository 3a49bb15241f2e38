//! Live connections and admission control.
//!
//! Admission is checked on three axes:
//! - total connections against `max_connections`
//! - connections per remote IP against `max_connections_per_ip`
//! - read events per connection against `max_requests_per_minute`, counted
//!   in a window that restarts 60 seconds after its first request

use crate::connection::Connection;
use crate::net::Transport;
use crate::types::ConnectionId;
use mio::{Registry, Token};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Length of one rate-limit window.
pub const REQUEST_WINDOW: Duration = Duration::from_secs(60);

/// Admission thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Total connections.
    pub max_connections: usize,
    /// Connections from one IP.
    pub max_connections_per_ip: usize,
    /// Read events per connection per window.
    pub max_requests_per_minute: u32,
    /// Largest accepted frame payload.
    pub max_payload_size: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_connections: 30,
            max_connections_per_ip: 5,
            max_requests_per_minute: 50,
            max_payload_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestWindow {
    started: Instant,
    total: u32,
}

/// Registry of live connections keyed by poll token.
pub struct ConnectionRepository {
    connections: HashMap<Token, Connection>,
    by_id: HashMap<ConnectionId, Token>,
    ip_storage: HashMap<IpAddr, usize>,
    request_storage: HashMap<ConnectionId, RequestWindow>,
    limits: AdmissionLimits,
    secret: String,
    serial: u64,
    registry: Option<Registry>,
}

impl ConnectionRepository {
    /// Empty repository. Connection ids are salted with `secret`.
    #[must_use]
    pub fn new(limits: AdmissionLimits, secret: impl Into<String>) -> Self {
        Self {
            connections: HashMap::new(),
            by_id: HashMap::new(),
            ip_storage: HashMap::new(),
            request_storage: HashMap::new(),
            limits,
            secret: secret.into(),
            serial: 0,
            registry: None,
        }
    }

    /// Register admitted transports with `registry` and deregister them on
    /// removal.
    #[must_use]
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Active limits.
    #[must_use]
    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    /// Admit `transport`, returning its token.
    ///
    /// Refused when the server is full, the peer address is unknown, the
    /// peer's IP holds too many slots, or poll registration fails. A refused
    /// transport is dropped, which closes it.
    pub fn create(&mut self, mut transport: Box<dyn Transport>) -> Option<Token> {
        if self.connections.len() >= self.limits.max_connections {
            warn!(
                category = "admission",
                max_connections = self.limits.max_connections,
                "connection refused: server full"
            );
            return None;
        }
        let Some(peer) = transport.peer_addr() else {
            warn!(category = "admission", "connection refused: unknown peer address");
            return None;
        };
        if self.ip_count(peer.ip()) >= self.limits.max_connections_per_ip {
            warn!(
                category = "admission",
                peer = %peer,
                max_connections_per_ip = self.limits.max_connections_per_ip,
                "connection refused: too many connections from this address"
            );
            return None;
        }

        self.serial += 1;
        // Token 0 belongs to the listener.
        let token = Token(self.serial as usize);
        if let Some(registry) = &self.registry {
            if let Err(err) = transport.register(registry, token) {
                warn!(category = "admission", peer = %peer, error = %err, "poll registration failed");
                return None;
            }
        }

        let id = ConnectionId::derive(&peer, self.serial, &self.secret);
        debug!(category = "admission", connection_id = %id, peer = %peer, "connection admitted");
        *self.ip_storage.entry(peer.ip()).or_insert(0) += 1;
        self.by_id.insert(id.clone(), token);
        self.connections.insert(
            token,
            Connection::new(id, token, peer, transport, self.limits.max_payload_size),
        );
        Some(token)
    }

    /// Connection by token.
    #[must_use]
    pub fn get(&self, token: Token) -> Option<&Connection> {
        self.connections.get(&token)
    }

    /// Connection by token, mutably.
    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.get_mut(&token)
    }

    /// Connection by id, mutably.
    pub fn get_by_id_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        let token = *self.by_id.get(id)?;
        self.connections.get_mut(&token)
    }

    /// Token of `id`.
    #[must_use]
    pub fn token_of(&self, id: &ConnectionId) -> Option<Token> {
        self.by_id.get(id).copied()
    }

    /// Whether `token` is live.
    #[must_use]
    pub fn has(&self, token: Token) -> bool {
        self.connections.contains_key(&token)
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Slots held by `ip`.
    #[must_use]
    pub fn ip_count(&self, ip: IpAddr) -> usize {
        self.ip_storage.get(&ip).copied().unwrap_or(0)
    }

    /// Live tokens.
    #[must_use]
    pub fn tokens(&self) -> Vec<Token> {
        self.connections.keys().copied().collect()
    }

    /// Count one request for `id` against the current window. A connection
    /// still waiting for the rest of a partial request or frame is exempt.
    pub fn check_request_limit(&mut self, id: &ConnectionId) -> bool {
        self.check_request_limit_at(id, Instant::now())
    }

    /// [`check_request_limit`](Self::check_request_limit) at a given time.
    pub fn check_request_limit_at(&mut self, id: &ConnectionId, now: Instant) -> bool {
        let waiting = self
            .token_of(id)
            .and_then(|token| self.connections.get(&token))
            .is_some_and(Connection::is_waiting_for_data);
        if waiting {
            return true;
        }

        let max = self.limits.max_requests_per_minute;
        let window = self.request_storage.entry(id.clone()).or_insert(RequestWindow {
            started: now,
            total: 0,
        });

        if max == 0 {
            return false;
        }
        if window.total == 0 || now.saturating_duration_since(window.started) > REQUEST_WINDOW {
            *window = RequestWindow {
                started: now,
                total: 1,
            };
            return true;
        }
        if window.total >= max {
            return false;
        }
        window.total += 1;
        true
    }

    /// Forget `token`: release its IP slot and rate window, deregister and
    /// shut down the transport. Every step runs regardless of the others.
    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        let mut connection = self.connections.remove(&token)?;
        let id = connection.id().clone();
        let ip = connection.ip();

        if let Some(count) = self.ip_storage.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ip_storage.remove(&ip);
            }
        }
        self.request_storage.remove(&id);
        self.by_id.remove(&id);

        if let Some(registry) = &self.registry {
            if let Err(err) = connection.transport_mut().deregister(registry) {
                debug!(category = "connection", connection_id = %id, error = %err, "deregister failed");
            }
        }
        connection.shutdown();
        debug!(category = "connection", connection_id = %id, "connection removed");
        Some(connection)
    }

    /// Remove every connection.
    pub fn clear(&mut self) {
        for token in self.tokens() {
            self.remove(token);
        }
    }
}

impl fmt::Debug for ConnectionRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRepository")
            .field("connections", &self.connections.len())
            .field("ips", &self.ip_storage.len())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
