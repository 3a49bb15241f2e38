//! Correlated requests and their responses.

use super::channel::Channel;
use super::envelope::{Envelope, RESPONSE_KEY};
use super::message::{ChannelMessage, Routed};
use crate::types::ConnectionId;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// A client question addressed to the channel, answered only to the asker.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    route: String,
    key: String,
    message: ChannelMessage,
}

impl ChannelRequest {
    /// Request from `initiator`; the receiver list is forced to the asker.
    #[must_use]
    pub fn new(
        route: impl Into<String>,
        key: impl Into<String>,
        envelope: Envelope,
        initiator: ConnectionId,
    ) -> Self {
        let mut message = ChannelMessage::from_envelope(envelope, Some(initiator.clone()));
        message.set_receiver(initiator);
        Self {
            route: route.into(),
            key: key.into(),
            message,
        }
    }

    /// Handler route.
    #[must_use]
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Correlation key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Request payload.
    #[must_use]
    pub fn data(&self) -> &Value {
        self.message.data()
    }

    /// The asking connection.
    #[must_use]
    pub fn initiator(&self) -> Option<&ConnectionId> {
        self.message.initiator()
    }

    /// Underlying message.
    #[must_use]
    pub fn message(&self) -> &ChannelMessage {
        &self.message
    }

    /// Build a response to this request.
    #[must_use]
    pub fn prepare_response(&self, data: Value) -> ChannelResponse {
        let mut response = ChannelResponse::new(data);
        response.init_transport(self);
        response
    }
}

/// Answer to a [`ChannelRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelResponse {
    key: Option<String>,
    message: ChannelMessage,
}

impl ChannelResponse {
    /// Response not yet bound to a request.
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            key: None,
            message: ChannelMessage::new(data),
        }
    }

    /// Bind to `request`: copy its key and address only its initiator.
    pub fn init_transport(&mut self, request: &ChannelRequest) -> &mut Self {
        self.key = Some(request.key.clone());
        match request.initiator() {
            Some(initiator) => {
                self.message.set_initiator(initiator.clone());
                self.message.set_receiver(initiator.clone());
            }
            None => {
                self.message.set_receivers(Vec::new());
            }
        }
        self.message.set_private(true);
        self
    }

    /// Correlation key, once bound.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Underlying message.
    #[must_use]
    pub fn message(&self) -> &ChannelMessage {
        &self.message
    }

    /// Underlying message, for payload changes.
    pub fn message_mut(&mut self) -> &mut ChannelMessage {
        &mut self.message
    }
}

impl Routed for ChannelResponse {
    fn message(&self) -> &ChannelMessage {
        &self.message
    }

    fn payload_for(&self, connection: &ConnectionId) -> Value {
        let mut payload = self.message.data_for_connection(connection);
        payload.insert(
            RESPONSE_KEY.into(),
            self.key.clone().map_or(Value::Null, Value::String),
        );
        Value::Object(payload)
    }
}

/// Produces responses for a channel's requests.
pub trait RequestHandler {
    /// Answer `request`, or `None` to drop it silently.
    fn handle_request(&mut self, request: &ChannelRequest, channel: &Channel)
        -> Option<ChannelResponse>;
}

type RouteFn = Box<dyn FnMut(&ChannelRequest, &Channel) -> Option<Value>>;

/// Request handler dispatching on [`ChannelRequest::route`].
///
/// Unknown routes produce no response.
#[derive(Default)]
pub struct RequestRouter {
    routes: HashMap<String, RouteFn>,
}

impl RequestRouter {
    /// Router with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `route`, replacing any previous one.
    #[must_use]
    pub fn route<F>(mut self, route: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(&ChannelRequest, &Channel) -> Option<Value> + 'static,
    {
        self.routes.insert(route.into(), Box::new(handler));
        self
    }

    /// Whether `route` has a handler.
    #[must_use]
    pub fn has_route(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }
}

impl fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routes: Vec<&String> = self.routes.keys().collect();
        routes.sort();
        f.debug_struct("RequestRouter").field("routes", &routes).finish()
    }
}

impl RequestHandler for RequestRouter {
    fn handle_request(
        &mut self,
        request: &ChannelRequest,
        channel: &Channel,
    ) -> Option<ChannelResponse> {
        let handler = self.routes.get_mut(request.route())?;
        handler(request, channel).map(|data| request.prepare_response(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use serde_json::json;

    fn history_request() -> ChannelRequest {
        ChannelRequest::new("history", "7", Envelope::new(json!({"limit":2})), "A".into())
    }

    #[test]
    fn test_request_addresses_only_asker() {
        let request = history_request();
        assert_eq!(request.message().receivers(), &[ConnectionId::from("A")]);
        assert_eq!(request.route(), "history");
        assert_eq!(request.key(), "7");
    }

    #[test]
    fn test_response_carries_key() {
        let response = history_request().prepare_response(json!({"items":[]}));
        assert_eq!(response.key(), Some("7"));
        assert_eq!(response.message().receivers(), &[ConnectionId::from("A")]);

        let payload = response.payload_for(&"A".into());
        assert_eq!(payload["__response__"], json!("7"));
        assert_eq!(payload["data"], json!({"items":[]}));
        assert_eq!(payload["toMe"], json!(true));
    }

    #[test]
    fn test_router_dispatch() {
        let channel = Channel::new("lobby", ChannelConfig::default());
        let mut router = RequestRouter::new()
            .route("history", |req, ch| {
                Some(json!({"limit": req.data()["limit"], "channel": ch.name()}))
            })
            .route("silent", |_, _| None);
        assert!(router.has_route("history"));

        let answered = router.handle_request(&history_request(), &channel).unwrap();
        assert_eq!(
            answered.message().data(),
            &json!({"limit":2,"channel":"lobby"})
        );

        let silent = ChannelRequest::new("silent", "1", Envelope::new(json!(null)), "A".into());
        assert!(router.handle_request(&silent, &channel).is_none());

        let unknown = ChannelRequest::new("nope", "2", Envelope::new(json!(null)), "A".into());
        assert!(router.handle_request(&unknown, &channel).is_none());
    }

    #[test]
    fn test_unbound_response_has_null_key() {
        let response = ChannelResponse::new(json!(1));
        assert_eq!(response.payload_for(&"A".into())["__response__"], Value::Null);
    }
}
