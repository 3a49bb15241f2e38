//! Named routing domain.
//!
//! A [`Channel`] owns the membership of one broadcast domain: who is live,
//! which ids may still reconnect, and how messages, events and requests fan
//! out. It never touches sockets; every delivery goes through an
//! [`Outbox`].

use super::envelope::notice;
use super::event::ChannelEvent;
use super::listener::{EventListener, EventRouter};
use super::message::{ChannelMessage, Routed};
use super::outbox::Outbox;
use super::registry::RegistryHandle;
use super::request::{ChannelRequest, ChannelResponse, RequestHandler};
use crate::net::websocket::CloseCode;
use crate::types::ConnectionId;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info};

/// Construction parameters of a channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelConfig {
    /// How long a disconnected id may be reclaimed. Zero disables reconnects.
    pub reconnection_period: Duration,
    /// Shared secret clients must present in `auth.password`.
    pub password: Option<String>,
    /// Application parameters exposed through [`Channel::parameters`].
    pub parameters: Map<String, Value>,
}

impl ChannelConfig {
    /// Defaults: no reconnects, no password, no parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow reconnects within `period`.
    #[must_use]
    pub fn reconnection_period(mut self, period: Duration) -> Self {
        self.reconnection_period = period;
        self
    }

    /// Require `password` on connect and reconnect.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set one application parameter.
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// One live member of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    /// Connection id.
    pub id: ConnectionId,
    /// Remote address.
    pub peer: SocketAddr,
    /// Attributes published to the other members.
    pub open_data: Map<String, Value>,
}

impl Member {
    /// Member with the given published attributes.
    #[must_use]
    pub fn new(id: ConnectionId, peer: SocketAddr, open_data: Map<String, Value>) -> Self {
        Self {
            id,
            peer,
            open_data,
        }
    }

    /// Published attributes plus `id`, as peers see them.
    #[must_use]
    pub fn client_data(&self) -> Value {
        let mut data = self.open_data.clone();
        data.insert("id".into(), Value::String(self.id.to_string()));
        Value::Object(data)
    }
}

/// Application hooks on channel lifecycle points.
///
/// Every hook has a no-op default. While a hook runs the behavior is
/// detached from the channel, so hooks may freely call back into it.
#[allow(unused_variables)]
pub trait ChannelBehavior {
    /// `channelData` sent to `connection` right after its handshake.
    fn channel_data(&mut self, channel: &mut Channel, connection: &ConnectionId) -> Value {
        json!({})
    }

    /// After `connection` joined and `clientJoin` went out.
    fn after_connect(&mut self, channel: &mut Channel, connection: &ConnectionId, out: &mut dyn Outbox) {}

    /// After `connection` reclaimed `old_id`.
    fn after_reconnect(
        &mut self,
        channel: &mut Channel,
        connection: &ConnectionId,
        old_id: &ConnectionId,
        out: &mut dyn Outbox,
    ) {
    }

    /// After `connection` dropped (reconnectable) or left.
    fn after_disconnect(&mut self, channel: &mut Channel, connection: &ConnectionId, out: &mut dyn Outbox) {}

    /// Before the members are closed by [`Channel::close`].
    fn before_close(&mut self, channel: &mut Channel, out: &mut dyn Outbox) {}

    /// Once per loop tick while the channel's timer is on.
    fn on_iteration(&mut self, channel: &mut Channel, out: &mut dyn Outbox) {}
}

/// A named broadcast domain.
pub struct Channel {
    name: String,
    members: IndexMap<ConnectionId, Member>,
    former_connection_ids: IndexMap<ConnectionId, Instant>,
    reconnection_period: Duration,
    password: Option<String>,
    parameters: Map<String, Value>,
    is_closed: bool,
    created_at: SystemTime,
    timer_started: Option<Instant>,
    listener: Option<Box<dyn EventListener>>,
    request_handler: Option<Box<dyn RequestHandler>>,
    behavior: Option<Box<dyn ChannelBehavior>>,
    registry: RegistryHandle,
}

impl Channel {
    /// Standalone channel with the stock [`EventRouter`].
    #[must_use]
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        Self::with_registry(name, config, RegistryHandle::new())
    }

    /// Channel bound to an owning repository through `registry`.
    #[must_use]
    pub fn with_registry(
        name: impl Into<String>,
        config: ChannelConfig,
        registry: RegistryHandle,
    ) -> Self {
        Self {
            name: name.into(),
            members: IndexMap::new(),
            former_connection_ids: IndexMap::new(),
            reconnection_period: config.reconnection_period,
            password: config.password,
            parameters: config.parameters,
            is_closed: false,
            created_at: SystemTime::now(),
            timer_started: None,
            listener: Some(Box::new(EventRouter::new())),
            request_handler: None,
            behavior: None,
            registry,
        }
    }

    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Whether the channel refuses new handshakes.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /// Reconnection grace period.
    #[must_use]
    pub fn reconnection_period(&self) -> Duration {
        self.reconnection_period
    }

    /// Whether dropped connections may reconnect.
    #[must_use]
    pub fn is_reconnection_allowed(&self) -> bool {
        !self.reconnection_period.is_zero()
    }

    /// Whether a password is configured.
    #[must_use]
    pub fn requires_password(&self) -> bool {
        self.password.is_some()
    }

    /// Replace the event listener.
    pub fn set_event_listener(&mut self, listener: impl EventListener + 'static) {
        self.listener = Some(Box::new(listener));
    }

    /// Remove the event listener; events are then routed unchanged.
    pub fn clear_event_listener(&mut self) {
        self.listener = None;
    }

    /// Install a request handler.
    pub fn set_request_handler(&mut self, handler: impl RequestHandler + 'static) {
        self.request_handler = Some(Box::new(handler));
    }

    /// Install lifecycle hooks.
    pub fn set_behavior(&mut self, behavior: impl ChannelBehavior + 'static) {
        self.behavior = Some(Box::new(behavior));
    }

    /// Application parameters plus `requirePassword`.
    #[must_use]
    pub fn parameters(&self) -> Map<String, Value> {
        let mut parameters = self.parameters.clone();
        parameters.insert("requirePassword".into(), Value::Bool(self.requires_password()));
        parameters
    }

    /// One application parameter.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Whether an application parameter exists.
    #[must_use]
    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    /// Whether `id` is a live member.
    #[must_use]
    pub fn has_connection(&self, id: &ConnectionId) -> bool {
        self.members.contains_key(id)
    }

    /// Live member by id.
    #[must_use]
    pub fn connection(&self, id: &ConnectionId) -> Option<&Member> {
        self.members.get(id)
    }

    /// Live members in join order.
    #[must_use]
    pub fn connections(&self) -> &IndexMap<ConnectionId, Member> {
        &self.members
    }

    /// Number of live members.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.members.len()
    }

    /// `id -> open data + id` for every live member.
    #[must_use]
    pub fn get_connections_data(&self) -> Map<String, Value> {
        self.members
            .iter()
            .map(|(id, member)| (id.to_string(), member.client_data()))
            .collect()
    }

    /// Ids that may still be reclaimed, oldest first.
    #[must_use]
    pub fn former_connection_ids(&self) -> Vec<ConnectionId> {
        self.former_connection_ids.keys().cloned().collect()
    }

    /// Password gate for a first join; a missing password reads as `""`.
    #[must_use]
    pub fn check_on_connect(&self, auth: &Map<String, Value>) -> bool {
        match &self.password {
            None => true,
            Some(password) => auth.get("password").and_then(Value::as_str).unwrap_or("") == password,
        }
    }

    /// Consume `old_id` from the former ids. Each id is reclaimable once.
    pub fn check_on_reconnect(&mut self, old_id: &ConnectionId) -> bool {
        self.purge_expired_former_ids(Instant::now());
        self.former_connection_ids.shift_remove(old_id).is_some()
    }

    /// `channelData` for the bootstrap sent to `connection`.
    pub fn channel_data(&mut self, connection: &ConnectionId) -> Value {
        self.with_behavior(|behavior, channel| behavior.channel_data(channel, connection))
            .unwrap_or_else(|| json!({}))
    }

    /// Register `member` and announce it to everyone, itself included.
    pub fn on_connect(&mut self, member: Member, out: &mut dyn Outbox) {
        let id = member.id.clone();
        let client = member.client_data();
        self.purge_expired_former_ids(Instant::now());
        self.former_connection_ids.shift_remove(&id);
        self.members.insert(id.clone(), member);
        info!(category = "channel", channel = %self.name, connection_id = %id, "client joined");

        self.broadcast(&notice("clientJoin", fields([("client", client)])), None, out);
        self.with_behavior(|behavior, channel| behavior.after_connect(channel, &id, out));
    }

    /// Register `member` as the successor of `old_id` and tell everyone.
    pub fn on_reconnect(&mut self, member: Member, old_id: &ConnectionId, out: &mut dyn Outbox) {
        if !self.is_reconnection_allowed() {
            return;
        }
        let id = member.id.clone();
        let client = member.client_data();
        self.purge_expired_former_ids(Instant::now());
        self.members.insert(id.clone(), member);
        info!(
            category = "channel",
            channel = %self.name,
            connection_id = %id,
            old_connection_id = %old_id,
            "client reconnected"
        );

        let body = notice(
            "clientReconnected",
            fields([
                ("client", client),
                ("oldConnectionId", Value::String(old_id.to_string())),
            ]),
        );
        self.broadcast(&body, None, out);
        self.with_behavior(|behavior, channel| behavior.after_reconnect(channel, &id, old_id, out));
    }

    /// Merge `data` into the member's open data and announce the subset.
    pub fn on_add_open_data(
        &mut self,
        id: &ConnectionId,
        data: Map<String, Value>,
        out: &mut dyn Outbox,
    ) {
        let Some(member) = self.members.get_mut(id) else {
            return;
        };
        for (key, value) in &data {
            member.open_data.insert(key.clone(), value.clone());
        }
        debug!(category = "channel", channel = %self.name, connection_id = %id, "open data added");

        let body = notice(
            "clientAddOpenData",
            fields([
                ("connectionId", Value::String(id.to_string())),
                ("data", Value::Object(data)),
            ]),
        );
        self.broadcast(&body, None, out);
    }

    /// Temporary departure: the id stays reclaimable if reconnects are on.
    pub fn on_disconnect(&mut self, id: &ConnectionId, out: &mut dyn Outbox) {
        let Some(member) = self.members.shift_remove(id) else {
            return;
        };
        let now = Instant::now();
        self.purge_expired_former_ids(now);
        if self.is_reconnection_allowed() && !self.former_connection_ids.contains_key(id) {
            self.former_connection_ids.insert(id.clone(), now);
        }
        info!(category = "channel", channel = %self.name, connection_id = %id, "client disconnected");

        let body = notice("clientDisconnected", fields([("client", member.client_data())]));
        self.broadcast(&body, Some(id), out);
        self.with_behavior(|behavior, channel| behavior.after_disconnect(channel, id, out));
    }

    /// Permanent departure: the id can never be reclaimed.
    pub fn on_leave(&mut self, id: &ConnectionId, out: &mut dyn Outbox) {
        self.former_connection_ids.shift_remove(id);
        let Some(member) = self.members.shift_remove(id) else {
            return;
        };
        info!(category = "channel", channel = %self.name, connection_id = %id, "client left");

        let body = notice("clientLeave", fields([("client", member.client_data())]));
        self.broadcast(&body, Some(id), out);
        self.with_behavior(|behavior, channel| behavior.after_disconnect(channel, id, out));
    }

    /// Route a plain client message.
    pub fn on_message(&mut self, message: ChannelMessage, out: &mut dyn Outbox) {
        self.send_message(&message, out);
    }

    /// Run `event` through the listener, then route it unless vetoed.
    pub fn on_event(&mut self, mut event: ChannelEvent, out: &mut dyn Outbox) {
        if let Some(mut listener) = self.listener.take() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.process_any_event(&mut event, self)
            }));
            self.listener = Some(listener);
            let proceed = outcome.unwrap_or_else(|payload| panic::resume_unwind(payload));
            if !proceed {
                debug!(category = "channel", channel = %self.name, event = event.name(), "event vetoed");
                return;
            }
        }
        self.send_event(&event, out);
    }

    /// Answer `request` and send the response to the asker only.
    pub fn on_request(&mut self, request: &ChannelRequest, out: &mut dyn Outbox) {
        let Some(mut response) = self.handle_request(request) else {
            debug!(
                category = "channel",
                channel = %self.name,
                route = request.route(),
                "request produced no response"
            );
            return;
        };
        response.init_transport(request);
        self.send_message(&response, out);
    }

    /// Produce the response for `request`. Without a handler the answer is
    /// an empty object, so the client's callback still resolves.
    pub fn handle_request(&mut self, request: &ChannelRequest) -> Option<ChannelResponse> {
        let Some(mut handler) = self.request_handler.take() else {
            return Some(request.prepare_response(json!({})));
        };
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| handler.handle_request(request, self)));
        self.request_handler = Some(handler);
        outcome.unwrap_or_else(|payload| panic::resume_unwind(payload))
    }

    /// Deliver `routed` to its resolved receivers. Returns how many
    /// deliveries succeeded.
    pub fn send_message<R: Routed + ?Sized>(&self, routed: &R, out: &mut dyn Outbox) -> usize {
        let receivers = routed.message().resolve_receivers(&self.members);
        let mut delivered = 0;
        for id in &receivers {
            if out.send(id, &routed.payload_for(id)) {
                delivered += 1;
            } else {
                debug!(category = "channel", channel = %self.name, connection_id = %id, "delivery failed");
            }
        }
        delivered
    }

    /// Deliver `event` unless stopped; async sub-events follow separately.
    pub fn send_event(&self, event: &ChannelEvent, out: &mut dyn Outbox) {
        if event.is_stopped() {
            return;
        }
        self.send_message(event, out);
        if event.is_multiple() && event.is_async() {
            for sub_event in event.sub_events() {
                self.send_event(sub_event, out);
            }
        }
    }

    /// Server-originated message.
    #[must_use]
    pub fn create_message(&self, data: Value) -> ChannelMessage {
        ChannelMessage::new(data)
    }

    /// Server-originated event.
    #[must_use]
    pub fn create_event(&self, name: impl Into<String>, data: Value) -> ChannelEvent {
        ChannelEvent::new(name, ChannelMessage::new(data))
    }

    /// Create and send a server-originated event to every member.
    pub fn trigger(&self, name: impl Into<String>, data: Value, out: &mut dyn Outbox) {
        let event = self.create_event(name, data);
        self.send_event(&event, out);
    }

    /// Close every member with `leave` and refuse new handshakes.
    pub fn close(&mut self, out: &mut dyn Outbox) {
        if self.is_closed {
            return;
        }
        self.with_behavior(|behavior, channel| behavior.before_close(channel, out));
        for id in self.members.keys() {
            out.close(id, CloseCode::Leave);
        }
        self.members.clear();
        self.former_connection_ids.clear();
        self.is_closed = true;
        info!(category = "channel", channel = %self.name, "channel closed");
    }

    /// Accept handshakes again.
    pub fn open(&mut self) {
        self.is_closed = false;
    }

    /// Start per-tick iteration and the elapsed-time clock.
    pub fn timer_on(&mut self) {
        self.timer_started = Some(Instant::now());
        self.registry.timer_on(&self.name);
    }

    /// Stop per-tick iteration.
    pub fn timer_off(&mut self) {
        self.timer_started = None;
        self.registry.timer_off(&self.name);
    }

    /// Time since [`timer_on`](Self::timer_on), if running.
    #[must_use]
    pub fn timer(&self) -> Option<Duration> {
        self.timer_started.map(|started| started.elapsed())
    }

    /// Per-tick hook; called by the server only while the timer is on.
    pub fn on_iteration(&mut self, out: &mut dyn Outbox) {
        self.with_behavior(|behavior, channel| behavior.on_iteration(channel, out));
    }

    /// Ask the owning repository to close and remove this channel.
    pub fn drop_channel(&self) {
        self.registry.request_drop(&self.name);
    }

    fn broadcast(&self, body: &Value, except: Option<&ConnectionId>, out: &mut dyn Outbox) {
        for id in self.members.keys() {
            if Some(id) != except {
                out.send(id, body);
            }
        }
    }

    fn purge_expired_former_ids(&mut self, now: Instant) {
        let period = self.reconnection_period;
        self.former_connection_ids
            .retain(|_, dropped_at| now.saturating_duration_since(*dropped_at) <= period);
    }

    /// Run a behavior hook. The behavior is back in place even when the
    /// hook panics; the panic then continues to the loop's handler.
    fn with_behavior<T>(
        &mut self,
        hook: impl FnOnce(&mut dyn ChannelBehavior, &mut Self) -> T,
    ) -> Option<T> {
        let mut behavior = self.behavior.take()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| hook(behavior.as_mut(), self)));
        if self.behavior.is_none() {
            self.behavior = Some(behavior);
        }
        Some(outcome.unwrap_or_else(|payload| panic::resume_unwind(payload)))
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("members", &self.members.len())
            .field("former_connection_ids", &self.former_connection_ids.len())
            .field("reconnection_period", &self.reconnection_period)
            .field("requires_password", &self.password.is_some())
            .field("is_closed", &self.is_closed)
            .finish_non_exhaustive()
    }
}

fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::envelope::Envelope;
    use crate::channel::RequestRouter;
    use crate::test_utils::RecordingOutbox;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    fn member(id: &str, name: &str) -> Member {
        let mut open_data = Map::new();
        open_data.insert("name".into(), json!(name));
        Member::new(id.into(), "127.0.0.1:4000".parse().unwrap(), open_data)
    }

    fn with_members(config: ChannelConfig, ids: &[&str]) -> (Channel, RecordingOutbox) {
        let mut channel = Channel::new("room", config);
        let mut out = RecordingOutbox::new();
        for id in ids {
            channel.on_connect(member(id, id), &mut out);
        }
        out.clear();
        (channel, out)
    }

    #[test]
    fn test_password_check() {
        let open = Channel::new("open", ChannelConfig::new());
        assert!(open.check_on_connect(&Map::new()));

        let locked = Channel::new("locked", ChannelConfig::new().password("pw"));
        assert!(!locked.check_on_connect(&Map::new()));
        let mut auth = Map::new();
        auth.insert("password".into(), json!("nope"));
        assert!(!locked.check_on_connect(&auth));
        auth.insert("password".into(), json!("pw"));
        assert!(locked.check_on_connect(&auth));
    }

    #[test]
    fn test_connect_broadcasts_join_to_everyone() {
        let (mut channel, mut out) = with_members(ChannelConfig::new(), &["A"]);
        channel.on_connect(member("B", "Bob"), &mut out);

        let expected = json!({"__lxws_event__":"clientJoin","client":{"name":"Bob","id":"B"}});
        assert_eq!(out.sent_to(&"A".into()), vec![expected.clone()]);
        assert_eq!(out.sent_to(&"B".into()), vec![expected]);
        assert_eq!(channel.connection_count(), 2);
    }

    #[test]
    fn test_disconnect_keeps_former_id_when_reconnect_allowed() {
        let config = ChannelConfig::new().reconnection_period(Duration::from_secs(30));
        let (mut channel, mut out) = with_members(config, &["A", "B"]);

        channel.on_disconnect(&"A".into(), &mut out);
        assert!(!channel.has_connection(&"A".into()));
        assert_eq!(channel.former_connection_ids(), vec![ConnectionId::from("A")]);
        assert_eq!(
            out.sent_to(&"B".into()),
            vec![json!({"__lxws_event__":"clientDisconnected","client":{"name":"A","id":"A"}})]
        );
        assert!(out.sent_to(&"A".into()).is_empty());

        assert!(channel.check_on_reconnect(&"A".into()));
        assert!(!channel.check_on_reconnect(&"A".into()));
    }

    #[test]
    fn test_disconnect_without_reconnect_keeps_nothing() {
        let (mut channel, mut out) = with_members(ChannelConfig::new(), &["A"]);
        channel.on_disconnect(&"A".into(), &mut out);
        assert!(channel.former_connection_ids().is_empty());
        assert!(!channel.check_on_reconnect(&"A".into()));
    }

    #[test]
    fn test_expired_former_ids_are_purged() {
        let config = ChannelConfig::new().reconnection_period(Duration::from_millis(1));
        let (mut channel, mut out) = with_members(config, &["A"]);
        channel.on_disconnect(&"A".into(), &mut out);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!channel.check_on_reconnect(&"A".into()));
    }

    #[test]
    fn test_leave_is_permanent() {
        let config = ChannelConfig::new().reconnection_period(Duration::from_secs(30));
        let (mut channel, mut out) = with_members(config, &["A", "B"]);
        channel.on_leave(&"A".into(), &mut out);
        assert!(channel.former_connection_ids().is_empty());
        assert_eq!(
            out.sent_to(&"B".into()),
            vec![json!({"__lxws_event__":"clientLeave","client":{"name":"A","id":"A"}})]
        );
    }

    #[test]
    fn test_reconnect_broadcast() {
        let config = ChannelConfig::new().reconnection_period(Duration::from_secs(30));
        let (mut channel, mut out) = with_members(config, &["A", "B"]);
        channel.on_disconnect(&"A".into(), &mut out);
        out.clear();

        assert!(channel.check_on_reconnect(&"A".into()));
        channel.on_reconnect(member("A2", "A"), &"A".into(), &mut out);
        let expected = json!({
            "__lxws_event__":"clientReconnected",
            "client":{"name":"A","id":"A2"},
            "oldConnectionId":"A"
        });
        assert_eq!(out.sent_to(&"B".into()), vec![expected.clone()]);
        assert_eq!(out.sent_to(&"A2".into()), vec![expected]);
    }

    #[test]
    fn test_reconnect_noop_when_disabled() {
        let (mut channel, mut out) = with_members(ChannelConfig::new(), &["B"]);
        channel.on_reconnect(member("A2", "A"), &"A".into(), &mut out);
        assert!(!channel.has_connection(&"A2".into()));
        assert!(out.is_empty());
    }

    #[test]
    fn test_add_open_data() {
        let (mut channel, mut out) = with_members(ChannelConfig::new(), &["A", "B"]);
        let mut data = Map::new();
        data.insert("status".into(), json!("away"));
        channel.on_add_open_data(&"A".into(), data, &mut out);

        assert_eq!(
            channel.connection(&"A".into()).unwrap().client_data(),
            json!({"name":"A","status":"away","id":"A"})
        );
        assert_eq!(
            out.sent_to(&"B".into()),
            vec![json!({"__lxws_event__":"clientAddOpenData","connectionId":"A","data":{"status":"away"}})]
        );
    }

    #[test]
    fn test_unknown_event_is_returned_as_error() {
        let (mut channel, mut out) = with_members(ChannelConfig::new(), &["A", "B"]);
        let mut message = ChannelMessage::new(json!({}));
        message.set_initiator("A".into()).set_receiver("A".into());
        channel.on_event(ChannelEvent::new("ping", message), &mut out);

        let sent = out.sent_to(&"A".into());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["__event__"], json!("error"));
        assert_eq!(sent[0]["data"], json!({"message":"Unknown event"}));
        assert!(out.sent_to(&"B".into()).is_empty());
    }

    #[test]
    fn test_without_listener_event_routes_unchanged() {
        let (mut channel, mut out) = with_members(ChannelConfig::new(), &["A", "B"]);
        channel.clear_event_listener();
        channel.trigger("tick", json!({"n":1}), &mut out);
        assert_eq!(out.sent_to(&"B".into())[0]["__event__"], json!("tick"));
        assert_eq!(out.sent_to(&"A".into())[0]["from"], Value::Null);
    }

    #[test]
    fn test_async_sub_events_sent_separately() {
        let (mut channel, mut out) = with_members(ChannelConfig::new(), &["A"]);
        channel.clear_event_listener();
        let mut event = channel.create_event("first", json!({}));
        event.add_sub_event("second", json!({}));
        channel.on_event(event, &mut out);

        let names: Vec<Value> = out
            .sent_to(&"A".into())
            .iter()
            .map(|payload| payload["__event__"].clone())
            .collect();
        assert_eq!(names, vec![json!("first"), json!("second")]);
    }

    #[test]
    fn test_stopped_event_is_dropped() {
        let (channel, mut out) = with_members(ChannelConfig::new(), &["A"]);
        let mut event = channel.create_event("x", json!({}));
        event.stop();
        channel.send_event(&event, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_request_without_handler_answers_empty() {
        let (mut channel, mut out) = with_members(ChannelConfig::new(), &["A", "B"]);
        let request = ChannelRequest::new("anything", "k1", Envelope::new(json!({})), "A".into());
        channel.on_request(&request, &mut out);

        let sent = out.sent_to(&"A".into());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["__response__"], json!("k1"));
        assert_eq!(sent[0]["data"], json!({}));
        assert!(out.sent_to(&"B".into()).is_empty());
    }

    #[test]
    fn test_request_handler_may_drop() {
        let (mut channel, mut out) = with_members(ChannelConfig::new(), &["A"]);
        channel.set_request_handler(RequestRouter::new().route("count", |_, ch| {
            Some(json!({"members": ch.connection_count()}))
        }));

        let known = ChannelRequest::new("count", "1", Envelope::new(json!(null)), "A".into());
        channel.on_request(&known, &mut out);
        assert_eq!(out.sent_to(&"A".into())[0]["data"], json!({"members":1}));

        out.clear();
        let unknown = ChannelRequest::new("other", "2", Envelope::new(json!(null)), "A".into());
        channel.on_request(&unknown, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_panicking_handlers_stay_installed() {
        let (mut channel, mut out) = with_members(ChannelConfig::new(), &["A"]);
        channel.set_event_listener(
            EventRouter::new().on("boom", |_, _| panic!("event handler failed")),
        );
        channel.set_request_handler(
            RequestRouter::new()
                .route("boom", |_, _| panic!("request handler failed"))
                .route("count", |_, ch| Some(json!({"members": ch.connection_count()}))),
        );

        let mut from_a = ChannelMessage::new(json!({}));
        from_a.set_initiator("A".into());
        let boom = ChannelEvent::new("boom", from_a.clone());
        let caught = panic::catch_unwind(AssertUnwindSafe(|| channel.on_event(boom, &mut out)));
        assert!(caught.is_err());

        channel.on_event(ChannelEvent::new("ping", from_a), &mut out);
        assert_eq!(out.sent_to(&"A".into())[0]["__event__"], json!("error"));

        out.clear();
        let boom = ChannelRequest::new("boom", "1", Envelope::new(json!(null)), "A".into());
        let caught = panic::catch_unwind(AssertUnwindSafe(|| channel.on_request(&boom, &mut out)));
        assert!(caught.is_err());

        let count = ChannelRequest::new("count", "2", Envelope::new(json!(null)), "A".into());
        channel.on_request(&count, &mut out);
        assert_eq!(out.sent_to(&"A".into())[0]["data"], json!({"members":1}));
    }

    #[test]
    fn test_panicking_behavior_stays_installed() {
        struct Fragile {
            ticks: Rc<Cell<u32>>,
        }

        impl ChannelBehavior for Fragile {
            fn on_iteration(&mut self, _: &mut Channel, _: &mut dyn Outbox) {
                self.ticks.set(self.ticks.get() + 1);
                assert!(self.ticks.get() > 1, "first tick fails");
            }
        }

        let ticks = Rc::new(Cell::new(0));
        let (mut channel, mut out) = with_members(ChannelConfig::new(), &["A"]);
        channel.set_behavior(Fragile {
            ticks: Rc::clone(&ticks),
        });

        let caught = panic::catch_unwind(AssertUnwindSafe(|| channel.on_iteration(&mut out)));
        assert!(caught.is_err());
        channel.on_iteration(&mut out);
        assert_eq!(ticks.get(), 2);
    }

    #[test]
    fn test_close_sends_leave_and_refuses() {
        let (mut channel, mut out) = with_members(ChannelConfig::new(), &["A", "B"]);
        channel.close(&mut out);
        assert!(channel.is_closed());
        assert_eq!(channel.connection_count(), 0);
        assert_eq!(
            out.closed(),
            vec![
                (ConnectionId::from("A"), CloseCode::Leave),
                (ConnectionId::from("B"), CloseCode::Leave)
            ]
        );

        out.clear();
        channel.close(&mut out);
        assert!(out.closed().is_empty());
        channel.open();
        assert!(!channel.is_closed());
    }

    #[test]
    fn test_parameters_expose_password_requirement() {
        let channel = Channel::new(
            "p",
            ChannelConfig::new().password("x").parameter("topic", json!("rust")),
        );
        assert_eq!(
            Value::Object(channel.parameters()),
            json!({"topic":"rust","requirePassword":true})
        );
        assert_eq!(channel.parameter("topic"), Some(&json!("rust")));
        assert!(!channel.has_parameter("requirePassword"));
    }

    struct Counting {
        ticks: Rc<Cell<u32>>,
    }

    impl ChannelBehavior for Counting {
        fn channel_data(&mut self, channel: &mut Channel, _: &ConnectionId) -> Value {
            json!({"name": channel.name()})
        }

        fn on_iteration(&mut self, channel: &mut Channel, out: &mut dyn Outbox) {
            self.ticks.set(self.ticks.get() + 1);
            if self.ticks.get() == 2 {
                channel.trigger("tick", json!({}), out);
                channel.timer_off();
            }
        }

        fn before_close(&mut self, channel: &mut Channel, out: &mut dyn Outbox) {
            channel.trigger("bye", json!({}), out);
        }
    }

    #[test]
    fn test_behavior_hooks() {
        let ticks = Rc::new(Cell::new(0));
        let registry = RegistryHandle::new();
        let mut channel = Channel::with_registry("game", ChannelConfig::new(), registry.clone());
        channel.set_behavior(Counting {
            ticks: Rc::clone(&ticks),
        });
        let mut out = RecordingOutbox::new();
        channel.on_connect(member("A", "A"), &mut out);
        out.clear();

        assert_eq!(channel.channel_data(&"A".into()), json!({"name":"game"}));

        channel.timer_on();
        assert!(registry.is_timer_on("game"));
        assert!(channel.timer().is_some());
        channel.on_iteration(&mut out);
        channel.on_iteration(&mut out);
        assert_eq!(ticks.get(), 2);
        assert!(!registry.is_timer_on("game"));
        assert!(channel.timer().is_none());
        assert_eq!(out.sent_to(&"A".into())[0]["__event__"], json!("tick"));

        out.clear();
        channel.close(&mut out);
        assert_eq!(out.sent_to(&"A".into())[0]["__event__"], json!("bye"));
    }

    #[test]
    fn test_drop_channel_goes_through_registry() {
        let registry = RegistryHandle::new();
        let channel = Channel::with_registry("temp", ChannelConfig::new(), registry.clone());
        channel.drop_channel();
        assert_eq!(registry.take_dropped(), ["temp"]);
    }

    #[test]
    fn test_connections_data() {
        let (channel, _) = with_members(ChannelConfig::new(), &["A", "B"]);
        assert_eq!(
            Value::Object(channel.get_connections_data()),
            json!({"A":{"name":"A","id":"A"},"B":{"name":"B","id":"B"}})
        );
    }
}
