//! Named channels, channel kinds and the timer set.

use crate::channel::{Channel, ChannelConfig, Outbox, RegistryHandle};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

/// Kind registered by default; installs nothing beyond the stock listener.
pub const DEFAULT_KIND: &str = "default";

type KindFactory = Box<dyn Fn(&mut Channel)>;

/// Registry of live channels.
///
/// Channel kinds are factories run on every freshly created channel of that
/// kind: they install listeners, request handlers and behaviors.
pub struct ChannelRepository {
    channels: IndexMap<String, Channel>,
    kinds: HashMap<String, KindFactory>,
    registry: RegistryHandle,
}

impl Default for ChannelRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRepository {
    /// Empty repository with the `default` kind.
    #[must_use]
    pub fn new() -> Self {
        let mut kinds: HashMap<String, KindFactory> = HashMap::new();
        kinds.insert(DEFAULT_KIND.to_string(), Box::new(|_: &mut Channel| {}));
        Self {
            channels: IndexMap::new(),
            kinds,
            registry: RegistryHandle::new(),
        }
    }

    /// Register (or replace) a channel kind.
    pub fn register_kind<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&mut Channel) + 'static,
    {
        self.kinds.insert(kind.into(), Box::new(factory));
    }

    /// Whether `kind` is registered.
    #[must_use]
    pub fn has_kind(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Create channel `name` of `kind`. `None` if the name is taken or the
    /// kind is unknown.
    pub fn create(&mut self, name: &str, kind: &str, config: ChannelConfig) -> Option<&mut Channel> {
        if self.channels.contains_key(name) {
            warn!(category = "channel", channel = %name, "channel already exists");
            return None;
        }
        let Some(factory) = self.kinds.get(kind) else {
            warn!(category = "channel", channel = %name, kind = %kind, "unknown channel kind");
            return None;
        };

        let mut channel = Channel::with_registry(name, config, self.registry.clone());
        factory(&mut channel);
        info!(category = "channel", channel = %name, kind = %kind, "channel created");
        self.channels.insert(name.to_string(), channel);
        self.channels.get_mut(name)
    }

    /// Whether `name` exists.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Channel by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// Channel by name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(name)
    }

    /// Channel names in creation order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Number of channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether there are no channels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Close `name` (its members get `leave`) and forget it.
    pub fn close(&mut self, name: &str, out: &mut dyn Outbox) -> bool {
        let Some(mut channel) = self.channels.shift_remove(name) else {
            return false;
        };
        channel.close(out);
        self.registry.timer_off(name);
        true
    }

    /// Forget `name` without closing it.
    pub fn remove(&mut self, name: &str) -> Option<Channel> {
        self.registry.timer_off(name);
        self.channels.shift_remove(name)
    }

    /// Start per-tick iteration for `name`.
    pub fn channel_to_timer(&mut self, name: &str) {
        if let Some(channel) = self.channels.get_mut(name) {
            channel.timer_on();
        }
    }

    /// Stop per-tick iteration for `name`.
    pub fn channel_from_timer(&mut self, name: &str) {
        match self.channels.get_mut(name) {
            Some(channel) => channel.timer_off(),
            None => self.registry.timer_off(name),
        }
    }

    /// Whether `name` iterates every tick.
    #[must_use]
    pub fn is_timer_on(&self, name: &str) -> bool {
        self.registry.is_timer_on(name)
    }

    /// Channels that iterate every tick, in registration order.
    #[must_use]
    pub fn timer_channels(&self) -> Vec<String> {
        self.registry.timers()
    }

    /// Channels that asked to be dropped since the last call.
    #[must_use]
    pub fn take_dropped(&self) -> Vec<String> {
        self.registry.take_dropped()
    }
}

impl fmt::Debug for ChannelRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.kinds.keys().collect();
        kinds.sort();
        f.debug_struct("ChannelRepository")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("kinds", &kinds)
            .field("registry", &self.registry)
            .finish()
    }
}
