//! Event listeners: per-channel event interception.
//!
//! [`EventRouter`] is the stock listener. Handlers are registered per event
//! name into a table keyed by the handler name (`foo-bar` is served by
//! `onFooBar`), built once when the router is configured. Events nobody
//! handles become an `error` event sent back to the sender.

use super::channel::Channel;
use super::event::ChannelEvent;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Hook run on every inbound event before it is routed.
pub trait EventListener {
    /// Inspect or rewrite `event`; return `false` to veto routing.
    fn process_any_event(&mut self, event: &mut ChannelEvent, channel: &Channel) -> bool;
}

type HandlerFn = Box<dyn FnMut(&mut ChannelEvent, &Channel) -> bool>;

/// Dispatch-table event listener.
///
/// Order of processing: transit names (passed through untouched, `before`
/// is skipped), the `before` hook (may veto), the registered handler, then
/// the fallback.
#[derive(Default)]
pub struct EventRouter {
    before: Option<HandlerFn>,
    transit: HashSet<String>,
    handlers: HashMap<String, HandlerFn>,
    fallback: Option<HandlerFn>,
}

impl EventRouter {
    /// Router with no handlers; every event falls back to `error`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward `name` without dispatching it.
    #[must_use]
    pub fn transit(mut self, name: impl Into<String>) -> Self {
        self.transit.insert(name.into());
        self
    }

    /// Hook run before every event; returning `false` vetoes it.
    #[must_use]
    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut ChannelEvent, &Channel) -> bool + 'static,
    {
        self.before = Some(Box::new(hook));
        self
    }

    /// Handle events called `event`; returning `false` vetoes routing.
    #[must_use]
    pub fn on<F>(mut self, event: &str, handler: F) -> Self
    where
        F: FnMut(&mut ChannelEvent, &Channel) -> bool + 'static,
    {
        self.handlers.insert(handler_name(event), Box::new(handler));
        self
    }

    /// Replace the unknown-event fallback.
    #[must_use]
    pub fn fallback<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut ChannelEvent, &Channel) -> bool + 'static,
    {
        self.fallback = Some(Box::new(handler));
        self
    }

    /// Whether some handler serves `event`.
    #[must_use]
    pub fn handles(&self, event: &str) -> bool {
        self.handlers.contains_key(&handler_name(event))
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<&String> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("EventRouter")
            .field("transit", &self.transit)
            .field("handlers", &handlers)
            .field("before", &self.before.is_some())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl EventListener for EventRouter {
    fn process_any_event(&mut self, event: &mut ChannelEvent, channel: &Channel) -> bool {
        if self.transit.contains(event.name()) {
            return true;
        }

        if let Some(before) = self.before.as_mut() {
            if !before(event, channel) {
                return false;
            }
        }

        if let Some(handler) = self.handlers.get_mut(&handler_name(event.name())) {
            return handler(event, channel);
        }

        match self.fallback.as_mut() {
            Some(fallback) => fallback(event, channel),
            None => {
                event.replace_event("error", json!({"message": "Unknown event"}));
                true
            }
        }
    }
}

/// `foo-bar` / `foo_bar` -> `onFooBar`.
#[must_use]
pub fn handler_name(event: &str) -> String {
    let mut name = String::with_capacity(event.len() + 2);
    name.push_str("on");
    for part in event.split(['-', '_']).filter(|part| !part.is_empty()) {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            name.extend(first.to_uppercase());
            name.push_str(chars.as_str());
        }
    }
    name
}
