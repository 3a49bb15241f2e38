//! Routed messages and per-recipient payload shaping.

use super::envelope::{Envelope, Routing};
use crate::types::ConnectionId;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Anything a channel can fan out to its members.
pub trait Routed {
    /// The underlying message carrying routing state.
    fn message(&self) -> &ChannelMessage;

    /// The JSON document sent to `connection`.
    fn payload_for(&self, connection: &ConnectionId) -> Value;
}

/// A payload routed among the connections of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    data: Value,
    routing: Routing,
    initiator: Option<ConnectionId>,
    data_for_connections: HashMap<ConnectionId, Map<String, Value>>,
}

impl ChannelMessage {
    /// Server-originated message with default routing.
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self::from_envelope(Envelope::new(data), None)
    }

    /// Message built from a parsed client envelope.
    #[must_use]
    pub fn from_envelope(envelope: Envelope, initiator: Option<ConnectionId>) -> Self {
        Self {
            data: envelope.data,
            routing: envelope.routing,
            initiator,
            data_for_connections: HashMap::new(),
        }
    }

    /// Common payload.
    #[must_use]
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Explicit receiver list as given; empty means everybody.
    #[must_use]
    pub fn receivers(&self) -> &[ConnectionId] {
        &self.routing.receivers
    }

    /// Privacy flag.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.routing.private
    }

    /// Originating connection, if any.
    #[must_use]
    pub fn initiator(&self) -> Option<&ConnectionId> {
        self.initiator.as_ref()
    }

    /// Set the originating connection.
    pub fn set_initiator(&mut self, initiator: ConnectionId) -> &mut Self {
        self.initiator = Some(initiator);
        self
    }

    /// Whether the initiator gets its own message back. Always false for
    /// server-originated messages.
    #[must_use]
    pub fn is_return_to_sender(&self) -> bool {
        self.initiator.is_some() && self.routing.return_to_sender
    }

    /// Resolve the receiver set against the live members of a channel.
    ///
    /// Ids that are no longer live are dropped silently.
    #[must_use]
    pub fn resolve_receivers<V>(&self, live: &IndexMap<ConnectionId, V>) -> Vec<ConnectionId> {
        let mut resolved: Vec<ConnectionId> = if self.routing.receivers.is_empty() {
            live.keys().cloned().collect()
        } else {
            let mut explicit = Vec::with_capacity(self.routing.receivers.len());
            for id in &self.routing.receivers {
                if live.contains_key(id) && !explicit.contains(id) {
                    explicit.push(id.clone());
                }
            }
            explicit
        };

        if let Some(initiator) = &self.initiator {
            if self.routing.return_to_sender {
                if live.contains_key(initiator) && !resolved.contains(initiator) {
                    resolved.push(initiator.clone());
                }
            } else {
                resolved.retain(|id| id != initiator);
            }
        }

        resolved
    }

    /// Base payload for one recipient:
    /// `{data, private, from, receivers, toMe}`. Overlay keys are added only
    /// where the common data has none.
    #[must_use]
    pub fn data_for_connection(&self, connection: &ConnectionId) -> Map<String, Value> {
        let mut data = self.data.clone();
        if let Some(overlay) = self.data_for_connections.get(connection) {
            match &mut data {
                Value::Object(common) => {
                    for (key, value) in overlay {
                        common.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                }
                Value::Null => data = Value::Object(overlay.clone()),
                _ => {}
            }
        }

        let mut result = Map::new();
        result.insert("data".into(), data);
        result.insert("private".into(), Value::Bool(self.routing.private));
        result.insert(
            "from".into(),
            self.initiator
                .as_ref()
                .map_or(Value::Null, |id| Value::String(id.to_string())),
        );
        result.insert(
            "receivers".into(),
            Value::Array(
                self.routing
                    .receivers
                    .iter()
                    .map(|id| Value::String(id.to_string()))
                    .collect(),
            ),
        );
        result.insert(
            "toMe".into(),
            Value::Bool(self.routing.receivers.contains(connection)),
        );
        result
    }

    /// Address only `receiver`.
    pub fn set_receiver(&mut self, receiver: ConnectionId) -> &mut Self {
        self.routing.receivers = vec![receiver];
        self
    }

    /// Add one receiver unless already listed.
    pub fn add_receiver(&mut self, receiver: ConnectionId) -> &mut Self {
        if !self.routing.receivers.contains(&receiver) {
            self.routing.receivers.push(receiver);
        }
        self
    }

    /// Replace the receiver list.
    pub fn set_receivers(&mut self, receivers: impl IntoIterator<Item = ConnectionId>) -> &mut Self {
        self.routing.receivers.clear();
        self.add_receivers(receivers)
    }

    /// Add several receivers, skipping duplicates.
    pub fn add_receivers(&mut self, receivers: impl IntoIterator<Item = ConnectionId>) -> &mut Self {
        for receiver in receivers {
            self.add_receiver(receiver);
        }
        self
    }

    /// Set the privacy flag.
    pub fn set_private(&mut self, private: bool) -> &mut Self {
        self.routing.private = private;
        self
    }

    /// Include or exclude the initiator.
    pub fn set_return_to_sender(&mut self, value: bool) -> &mut Self {
        self.routing.return_to_sender = value;
        self
    }

    /// Replace the common payload.
    pub fn set_data(&mut self, data: Value) -> &mut Self {
        self.data = data;
        self
    }

    /// Merge `data` into the common payload, recursing into objects; new
    /// values win.
    pub fn add_data(&mut self, data: Value) -> &mut Self {
        if is_empty(&data) {
            return self;
        }
        merge_value(&mut self.data, data, true);
        self
    }

    /// Replace the overlay for one recipient.
    pub fn set_data_for_connection(
        &mut self,
        connection: ConnectionId,
        data: Map<String, Value>,
    ) -> &mut Self {
        self.data_for_connections.insert(connection, data);
        self
    }

    /// Merge into the overlay for one recipient. Existing keys are kept
    /// unless `rewrite` is set.
    pub fn add_data_for_connection(
        &mut self,
        connection: ConnectionId,
        data: Map<String, Value>,
        rewrite: bool,
    ) -> &mut Self {
        if data.is_empty() {
            return self;
        }
        let overlay = self.data_for_connections.entry(connection).or_default();
        merge_map(overlay, data, rewrite);
        self
    }
}

impl Routed for ChannelMessage {
    fn message(&self) -> &ChannelMessage {
        self
    }

    fn payload_for(&self, connection: &ConnectionId) -> Value {
        Value::Object(self.data_for_connection(connection))
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn merge_value(target: &mut Value, source: Value, rewrite: bool) {
    match source {
        Value::Object(incoming) if target.is_object() => {
            if let Value::Object(existing) = target {
                merge_map(existing, incoming, rewrite);
            }
        }
        other => {
            if rewrite || target.is_null() {
                *target = other;
            }
        }
    }
}

fn merge_map(target: &mut Map<String, Value>, source: Map<String, Value>, rewrite: bool) {
    for (key, value) in source {
        match target.get_mut(&key) {
            Some(existing) => merge_value(existing, value, rewrite),
            None => {
                target.insert(key, value);
            }
        }
    }
}
