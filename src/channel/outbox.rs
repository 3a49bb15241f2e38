//! Delivery seam between a channel and the live connections.

use crate::net::websocket::CloseCode;
use crate::types::ConnectionId;
use serde_json::Value;

/// Where a channel hands outgoing payloads and close requests.
///
/// The server implements this over its connection table; tests record.
pub trait Outbox {
    /// Send one JSON document to `to`. Returns `false` when delivery failed;
    /// the connection is then scheduled for teardown by the implementor.
    fn send(&mut self, to: &ConnectionId, payload: &Value) -> bool;

    /// Close `id` with `code`.
    fn close(&mut self, id: &ConnectionId, code: CloseCode);
}
