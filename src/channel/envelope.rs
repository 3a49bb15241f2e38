//! Wire envelope of client frames.
//!
//! Every text frame carries one JSON document. [`parse_inbound`] decides
//! once what it is and returns a tagged [`Inbound`]:
//!
//! ```json
//! {"__lxws_action__":"connect","channelOpenData":{"name":"Alice"},"auth":{"password":"x"}}
//! {"__data__":{"text":"hi"},"__metaData__":{"receivers":["<id>"],"private":true}}
//! {"__data__":{},"__metaData__":{"__event__":"typing"}}
//! {"__data__":{},"__metaData__":{"__request__":{"route":"history","key":"7"}}}
//! ```
//!
//! A body without both `__data__` and `__metaData__` is itself the payload,
//! routed with default metadata.

use crate::types::ConnectionId;
use serde_json::{Map, Value};
use thiserror::Error;

/// Key naming a client lifecycle action.
pub const ACTION_KEY: &str = "__lxws_action__";
/// Key naming a server lifecycle notice.
pub const NOTICE_KEY: &str = "__lxws_event__";
/// Wrapped payload key.
pub const DATA_KEY: &str = "__data__";
/// Routing metadata key.
pub const META_KEY: &str = "__metaData__";
/// Event name, inside metadata and in routed payloads.
pub const EVENT_KEY: &str = "__event__";
/// Request correlation, inside metadata.
pub const REQUEST_KEY: &str = "__request__";
/// Bundle of synchronous sub-events.
pub const MULTIPLE_EVENTS_KEY: &str = "__multipleEvents__";
/// Request key echoed in a response.
pub const RESPONSE_KEY: &str = "__response__";

/// Malformed client document.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Body is not JSON.
    #[error("body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A required field is absent or has the wrong type.
    #[error("missing or invalid field '{0}'")]
    Field(&'static str),
}

/// Routing metadata of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    /// Explicit receivers; empty means everybody.
    pub receivers: Vec<ConnectionId>,
    /// Informational privacy flag passed through to recipients.
    pub private: bool,
    /// Whether the initiator receives its own message.
    pub return_to_sender: bool,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            receivers: Vec::new(),
            private: false,
            return_to_sender: true,
        }
    }
}

/// Payload plus routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Application payload.
    pub data: Value,
    /// Routing metadata.
    pub routing: Routing,
}

impl Envelope {
    /// Envelope with default routing.
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            data,
            routing: Routing::default(),
        }
    }

    /// Split a body into payload and routing.
    ///
    /// Only a body holding both `__data__` and `__metaData__` is treated as
    /// wrapped; anything else is the payload itself.
    #[must_use]
    pub fn from_value(body: Value) -> Self {
        let Value::Object(mut map) = body else {
            return Self::new(body);
        };
        if !(map.contains_key(DATA_KEY) && map.contains_key(META_KEY)) {
            return Self::new(Value::Object(map));
        }

        let data = map.remove(DATA_KEY).unwrap_or(Value::Null);
        let meta = map.remove(META_KEY).unwrap_or(Value::Null);
        let routing = Routing {
            receivers: receivers_of(meta.get("receivers")),
            private: meta.get("private").and_then(Value::as_bool).unwrap_or(false),
            return_to_sender: meta
                .get("returnToSender")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        };
        Self { data, routing }
    }
}

fn receivers_of(value: Option<&Value>) -> Vec<ConnectionId> {
    match value {
        Some(Value::String(id)) => vec![ConnectionId::from(id.as_str())],
        Some(Value::Array(ids)) => ids
            .iter()
            .filter_map(Value::as_str)
            .map(ConnectionId::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// Client lifecycle actions.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// First join of the channel.
    Connect {
        /// Attributes published to peers.
        open_data: Map<String, Value>,
        /// Credentials, e.g. `password`.
        auth: Map<String, Value>,
    },
    /// Re-join under a new id, reclaiming a former one.
    Reconnect {
        /// The id the client held before the drop.
        old_connection_id: ConnectionId,
        /// Attributes published to peers.
        open_data: Map<String, Value>,
        /// Credentials.
        auth: Map<String, Value>,
    },
    /// Polite close: the client's close frame will follow.
    Close,
    /// Hard break: the client closes without the polite handshake.
    Break,
    /// Publish more attributes after joining.
    AddOpenData(Map<String, Value>),
    /// Action name this server does not know.
    Unknown(String),
}

/// One decoded client document.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Lifecycle action.
    Action(Action),
    /// Named event.
    Event {
        /// Event name.
        name: String,
        /// Payload and routing.
        envelope: Envelope,
    },
    /// Correlated request.
    Request {
        /// Handler route.
        route: String,
        /// Correlation key echoed in the response.
        key: String,
        /// Payload and routing.
        envelope: Envelope,
    },
    /// Plain routed message.
    Message(Envelope),
}

/// Parse one text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, EnvelopeError> {
    let body: Value = serde_json::from_str(text)?;

    if let Some(action) = body.get(ACTION_KEY) {
        let name = action.as_str().ok_or(EnvelopeError::Field(ACTION_KEY))?;
        return parse_action(name, &body).map(Inbound::Action);
    }

    let meta = body.get(META_KEY);
    if let Some(name) = meta.and_then(|m| m.get(EVENT_KEY)).and_then(Value::as_str) {
        let name = name.to_string();
        return Ok(Inbound::Event {
            name,
            envelope: Envelope::from_value(body),
        });
    }

    if let Some(request) = meta.and_then(|m| m.get(REQUEST_KEY)) {
        let route = request
            .get("route")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::Field("__request__.route"))?
            .to_string();
        let key = match request.get("key") {
            Some(Value::String(key)) => key.clone(),
            Some(Value::Number(key)) => key.to_string(),
            _ => return Err(EnvelopeError::Field("__request__.key")),
        };
        return Ok(Inbound::Request {
            route,
            key,
            envelope: Envelope::from_value(body),
        });
    }

    Ok(Inbound::Message(Envelope::from_value(body)))
}

fn parse_action(name: &str, body: &Value) -> Result<Action, EnvelopeError> {
    let action = match name {
        "connect" => Action::Connect {
            open_data: object_or_empty(body.get("channelOpenData")),
            auth: object_or_empty(body.get("auth")),
        },
        "reconnect" => Action::Reconnect {
            old_connection_id: body
                .get("oldConnectionId")
                .and_then(Value::as_str)
                .map(ConnectionId::from)
                .ok_or(EnvelopeError::Field("oldConnectionId"))?,
            open_data: object_or_empty(body.get("channelOpenData")),
            auth: object_or_empty(body.get("auth")),
        },
        "close" => Action::Close,
        "break" => Action::Break,
        "addOpenData" => Action::AddOpenData(object_or_empty(body.get("data"))),
        other => Action::Unknown(other.to_string()),
    };
    Ok(action)
}

/// `true`, `null` and absent all mean "nothing beyond the id".
fn object_or_empty(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

/// Build a server lifecycle notice.
#[must_use]
pub fn notice(event: &str, fields: Map<String, Value>) -> Value {
    let mut body = fields;
    body.insert(NOTICE_KEY.to_string(), Value::String(event.to_string()));
    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_action_defaults() {
        let inbound =
            parse_inbound(r#"{"__lxws_action__":"connect","channelOpenData":true}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Action(Action::Connect {
                open_data: Map::new(),
                auth: Map::new(),
            })
        );
    }

    #[test]
    fn test_connect_action_with_data_and_auth() {
        let inbound = parse_inbound(
            r#"{"__lxws_action__":"connect","channelOpenData":{"name":"Alice"},"auth":{"password":"pw"}}"#,
        )
        .unwrap();
        let Inbound::Action(Action::Connect { open_data, auth }) = inbound else {
            panic!("expected connect");
        };
        assert_eq!(open_data.get("name"), Some(&json!("Alice")));
        assert_eq!(auth.get("password"), Some(&json!("pw")));
    }

    #[test]
    fn test_reconnect_requires_old_id() {
        let err = parse_inbound(r#"{"__lxws_action__":"reconnect"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::Field("oldConnectionId")));

        let inbound =
            parse_inbound(r#"{"__lxws_action__":"reconnect","oldConnectionId":"abc"}"#).unwrap();
        assert!(matches!(
            inbound,
            Inbound::Action(Action::Reconnect { ref old_connection_id, .. })
                if old_connection_id.as_str() == "abc"
        ));
    }

    #[test]
    fn test_simple_actions() {
        assert_eq!(
            parse_inbound(r#"{"__lxws_action__":"close"}"#).unwrap(),
            Inbound::Action(Action::Close)
        );
        assert_eq!(
            parse_inbound(r#"{"__lxws_action__":"break"}"#).unwrap(),
            Inbound::Action(Action::Break)
        );
        assert_eq!(
            parse_inbound(r#"{"__lxws_action__":"dance"}"#).unwrap(),
            Inbound::Action(Action::Unknown("dance".into()))
        );
    }

    #[test]
    fn test_wrapped_message_routing() {
        let inbound = parse_inbound(
            r#"{"__data__":{"text":"hi"},"__metaData__":{"receivers":["B"],"private":true,"returnToSender":false}}"#,
        )
        .unwrap();
        let Inbound::Message(envelope) = inbound else {
            panic!("expected message");
        };
        assert_eq!(envelope.data, json!({"text":"hi"}));
        assert_eq!(envelope.routing.receivers, vec![ConnectionId::from("B")]);
        assert!(envelope.routing.private);
        assert!(!envelope.routing.return_to_sender);
    }

    #[test]
    fn test_bare_body_is_payload() {
        let inbound = parse_inbound(r#"{"text":"hi","__data__":1}"#).unwrap();
        let Inbound::Message(envelope) = inbound else {
            panic!("expected message");
        };
        assert_eq!(envelope.data, json!({"text":"hi","__data__":1}));
        assert_eq!(envelope.routing, Routing::default());

        let scalar = parse_inbound("42").unwrap();
        assert_eq!(scalar, Inbound::Message(Envelope::new(json!(42))));
    }

    #[test]
    fn test_single_receiver_string() {
        let envelope =
            Envelope::from_value(json!({"__data__":null,"__metaData__":{"receivers":"X"}}));
        assert_eq!(envelope.routing.receivers, vec![ConnectionId::from("X")]);
    }

    #[test]
    fn test_event_detection() {
        let inbound = parse_inbound(r#"{"__metaData__":{"__event__":"ping"}}"#).unwrap();
        let Inbound::Event { name, envelope } = inbound else {
            panic!("expected event");
        };
        assert_eq!(name, "ping");
        // Without __data__ the whole body is the payload.
        assert_eq!(envelope.data, json!({"__metaData__":{"__event__":"ping"}}));
    }

    #[test]
    fn test_request_detection() {
        let inbound = parse_inbound(
            r#"{"__data__":{"q":1},"__metaData__":{"__request__":{"route":"history","key":7}}}"#,
        )
        .unwrap();
        let Inbound::Request { route, key, envelope } = inbound else {
            panic!("expected request");
        };
        assert_eq!(route, "history");
        assert_eq!(key, "7");
        assert_eq!(envelope.data, json!({"q":1}));

        let err = parse_inbound(r#"{"__metaData__":{"__request__":{"key":"1"}}}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::Field("__request__.route")));
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(
            parse_inbound("not json"),
            Err(EnvelopeError::Json(_))
        ));
    }

    #[test]
    fn test_notice_shape() {
        let mut fields = Map::new();
        fields.insert("connectionId".into(), json!("a"));
        assert_eq!(
            notice("clientLeave", fields),
            json!({"__lxws_event__":"clientLeave","connectionId":"a"})
        );
    }
}
