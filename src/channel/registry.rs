//! Handle a channel holds onto its owning repository.

use indexmap::IndexSet;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Default)]
struct RegistryState {
    timers: IndexSet<String>,
    dropped: Vec<String>,
}

/// Shared view of the repository-side sets a channel may change: timer
/// membership and pending drops.
///
/// Cloning shares the state. A channel built outside a repository gets a
/// detached handle nobody drains.
#[derive(Debug, Clone, Default)]
pub struct RegistryHandle {
    state: Rc<RefCell<RegistryState>>,
}

impl RegistryHandle {
    /// Fresh, unshared handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `name` to the timer set.
    pub fn timer_on(&self, name: &str) {
        self.state.borrow_mut().timers.insert(name.to_string());
    }

    /// Remove `name` from the timer set.
    pub fn timer_off(&self, name: &str) {
        self.state.borrow_mut().timers.shift_remove(name);
    }

    /// Whether `name` is in the timer set.
    #[must_use]
    pub fn is_timer_on(&self, name: &str) -> bool {
        self.state.borrow().timers.contains(name)
    }

    /// Timer set, in registration order.
    #[must_use]
    pub fn timers(&self) -> Vec<String> {
        self.state.borrow().timers.iter().cloned().collect()
    }

    /// Ask the owner to close and remove `name`.
    pub fn request_drop(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        if !state.dropped.iter().any(|pending| pending == name) {
            state.dropped.push(name.to_string());
        }
    }

    /// Drain pending drop requests.
    #[must_use]
    pub fn take_dropped(&self) -> Vec<String> {
        std::mem::take(&mut self.state.borrow_mut().dropped)
    }
}
