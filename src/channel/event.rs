//! Named events with optional sub-events.

use super::envelope::{Envelope, EVENT_KEY, MULTIPLE_EVENTS_KEY};
use super::message::{ChannelMessage, Routed};
use crate::types::ConnectionId;
use serde_json::{Map, Value};

/// A named, stoppable message that can carry further sub-events.
///
/// Async sub-events (the default) are sent after the parent as separate
/// messages. Sync sub-events are bundled with the parent into one
/// `__multipleEvents__` document so the client handles them together.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    name: String,
    message: ChannelMessage,
    stopped: bool,
    sub_events: Vec<ChannelEvent>,
    is_async: bool,
}

impl ChannelEvent {
    /// Event around an existing message.
    #[must_use]
    pub fn new(name: impl Into<String>, message: ChannelMessage) -> Self {
        Self {
            name: name.into(),
            message,
            stopped: false,
            sub_events: Vec::new(),
            is_async: true,
        }
    }

    /// Event built from a client envelope.
    #[must_use]
    pub fn from_envelope(
        name: impl Into<String>,
        envelope: Envelope,
        initiator: Option<ConnectionId>,
    ) -> Self {
        Self::new(name, ChannelMessage::from_envelope(envelope, initiator))
    }

    /// Event name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying message.
    #[must_use]
    pub fn message(&self) -> &ChannelMessage {
        &self.message
    }

    /// Underlying message, for routing and payload changes.
    pub fn message_mut(&mut self) -> &mut ChannelMessage {
        &mut self.message
    }

    /// Rename the event and replace its payload.
    pub fn replace_event(&mut self, name: impl Into<String>, data: Value) -> &mut Self {
        self.name = name.into();
        self.message.set_data(data);
        self
    }

    /// Append a sub-event sharing this event's initiator, receivers and
    /// privacy.
    pub fn add_sub_event(&mut self, name: impl Into<String>, data: Value) -> &mut ChannelEvent {
        let mut message = ChannelMessage::new(data);
        if let Some(initiator) = self.message.initiator() {
            message.set_initiator(initiator.clone());
        }
        message
            .set_receivers(self.message.receivers().iter().cloned())
            .set_private(self.message.is_private());

        self.sub_events.push(Self::new(name, message));
        let last = self.sub_events.len() - 1;
        &mut self.sub_events[last]
    }

    /// Sub-events in insertion order.
    #[must_use]
    pub fn sub_events(&self) -> &[ChannelEvent] {
        &self.sub_events
    }

    /// Choose between separate (`true`) and bundled (`false`) sub-events.
    pub fn set_async(&mut self, value: bool) -> &mut Self {
        self.is_async = value;
        self
    }

    /// Whether sub-events are sent separately.
    #[must_use]
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Suppress routing entirely.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Whether routing is suppressed.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Whether any sub-event exists.
    #[must_use]
    pub fn is_multiple(&self) -> bool {
        !self.sub_events.is_empty()
    }

    fn own_payload(&self, connection: &ConnectionId) -> Map<String, Value> {
        let mut payload = self.message.data_for_connection(connection);
        payload.insert(EVENT_KEY.into(), Value::String(self.name.clone()));
        payload
    }
}

impl Routed for ChannelEvent {
    fn message(&self) -> &ChannelMessage {
        &self.message
    }

    fn payload_for(&self, connection: &ConnectionId) -> Value {
        if self.is_multiple() && !self.is_async {
            let bundle = std::iter::once(self)
                .chain(self.sub_events.iter())
                .map(|event| Value::Object(event.own_payload(connection)))
                .collect();
            let mut wrapper = Map::new();
            wrapper.insert(MULTIPLE_EVENTS_KEY.into(), Value::Array(bundle));
            return Value::Object(wrapper);
        }
        Value::Object(self.own_payload(connection))
    }
}
