//! Signal registry and synchronous event delivery.
//!
//! Each [`PvddConnection`](crate::PvddConnection) owns one [`EventBus`].
//! Protocol-native signals form the closed [`Signal`] enum; the per-attribute
//! signals (`"on" + attrName`) depend on what the daemon sends and live in a
//! separate string-keyed table.
//!
//! Delivery happens on the emitting thread (the connection's reader thread
//! for protocol events), in subscription order. Listeners that need to do
//! slow work should hand it off themselves.
//!
//! ```ignore
//! let on_list = listener(|event| {
//!     if let PvdEvent::PvdList(names) = event {
//!         println!("{} PvDs", names.len());
//!     }
//! });
//! connection.subscribe(Signal::PvdList, on_list.clone());
//! connection.unsubscribe(&Signal::PvdList, &on_list);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::protocol::PvdEvent;

/// Prefix of the per-attribute signal names.
pub const ATTRIBUTE_SIGNAL_PREFIX: &str = "on";

/// A named event category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Signal {
    Connected,
    Error,
    Data,
    PvdList,
    NewPvd,
    DelPvd,
    PvdAttributes,
    PvdAttribute,
    /// Updates of one attribute, whatever the PvD.
    Attribute(String),
}

impl Signal {
    /// The traditional string name of the signal.
    pub fn name(&self) -> String {
        match self {
            Signal::Connected => "connected".to_string(),
            Signal::Error => "error".to_string(),
            Signal::Data => "data".to_string(),
            Signal::PvdList => "pvdList".to_string(),
            Signal::NewPvd => "newPvd".to_string(),
            Signal::DelPvd => "delPvd".to_string(),
            Signal::PvdAttributes => "pvdAttributes".to_string(),
            Signal::PvdAttribute => "pvdAttribute".to_string(),
            Signal::Attribute(name) => format!("{}{}", ATTRIBUTE_SIGNAL_PREFIX, name),
        }
    }

    /// Parse a string signal name. `"connect"` is accepted as an alias of
    /// `"connected"`; any other `on<attr>` name maps to [`Signal::Attribute`].
    pub fn from_name(name: &str) -> Option<Signal> {
        let signal = match name {
            "connected" | "connect" => Signal::Connected,
            "error" => Signal::Error,
            "data" => Signal::Data,
            "pvdList" => Signal::PvdList,
            "newPvd" => Signal::NewPvd,
            "delPvd" => Signal::DelPvd,
            "pvdAttributes" => Signal::PvdAttributes,
            "pvdAttribute" => Signal::PvdAttribute,
            other => {
                let attr = other.strip_prefix(ATTRIBUTE_SIGNAL_PREFIX)?;
                if attr.is_empty() {
                    return None;
                }
                Signal::Attribute(attr.to_string())
            }
        };
        Some(signal)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl PvdEvent {
    /// The signal this event is delivered on.
    pub fn signal(&self) -> Signal {
        match self {
            PvdEvent::Connected => Signal::Connected,
            PvdEvent::Error(_) => Signal::Error,
            PvdEvent::Data(_) => Signal::Data,
            PvdEvent::PvdList(_) => Signal::PvdList,
            PvdEvent::NewPvd(_) => Signal::NewPvd,
            PvdEvent::DelPvd(_) => Signal::DelPvd,
            PvdEvent::PvdAttributes { .. } => Signal::PvdAttributes,
            PvdEvent::PvdAttribute { .. } => Signal::PvdAttribute,
            PvdEvent::NamedAttribute { name, .. } => Signal::Attribute(name.clone()),
        }
    }
}

/// What a listener asks the bus to do after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    /// Keep delivering to the remaining listeners.
    #[default]
    Continue,
    /// Skip the remaining listeners of this signal for this event.
    Handled,
}

/// A subscriber callback. Its identity is the `Arc` allocation, so keep a
/// clone around to unsubscribe later.
pub type Listener = Arc<dyn Fn(&PvdEvent) -> Propagation + Send + Sync>;

/// Wrap a plain closure into a [`Listener`] that never stops propagation.
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&PvdEvent) + Send + Sync + 'static,
{
    Arc::new(move |event: &PvdEvent| {
        f(event);
        Propagation::Continue
    })
}

#[derive(Default)]
struct Registry {
    signals: HashMap<Signal, Vec<Listener>>,
    attributes: HashMap<String, Vec<Listener>>,
}

impl Registry {
    fn slot(&mut self, signal: Signal) -> &mut Vec<Listener> {
        match signal {
            Signal::Attribute(name) => self.attributes.entry(name).or_default(),
            other => self.signals.entry(other).or_default(),
        }
    }

    fn get(&self, signal: &Signal) -> Option<&Vec<Listener>> {
        match signal {
            Signal::Attribute(name) => self.attributes.get(name),
            other => self.signals.get(other),
        }
    }

    fn slot_if_present(&mut self, signal: &Signal) -> Option<&mut Vec<Listener>> {
        match signal {
            Signal::Attribute(name) => self.attributes.get_mut(name),
            other => self.signals.get_mut(other),
        }
    }

    fn remove_entry(&mut self, signal: &Signal) {
        match signal {
            Signal::Attribute(name) => {
                self.attributes.remove(name);
            }
            other => {
                self.signals.remove(other);
            }
        }
    }
}

/// Per-connection signal registry.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `listener` on `signal`.
    ///
    /// Returns `false` if that same listener was already registered there.
    pub fn subscribe(&self, signal: Signal, listener: Listener) -> bool {
        let mut registry = self.registry();
        let listeners = registry.slot(signal);
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Remove `listener` from `signal`. The signal entry disappears with its
    /// last listener.
    pub fn unsubscribe(&self, signal: &Signal, listener: &Listener) -> bool {
        let mut registry = self.registry();
        let Some(listeners) = registry.slot_if_present(signal) else {
            return false;
        };

        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        let removed = listeners.len() != before;

        if listeners.is_empty() {
            registry.remove_entry(signal);
        }
        removed
    }

    /// Number of listeners currently registered on `signal`.
    pub fn listener_count(&self, signal: &Signal) -> usize {
        self.registry().get(signal).map_or(0, Vec::len)
    }

    /// Whether `signal` has an entry in the registry.
    pub fn has_signal(&self, signal: &Signal) -> bool {
        self.registry().get(signal).is_some()
    }

    /// Deliver `event` to the listeners of `signal`, in order.
    ///
    /// The listener list is snapshotted first, so listeners may subscribe,
    /// unsubscribe or send commands without deadlocking. Returns how many
    /// listeners ran.
    pub fn emit(&self, signal: &Signal, event: &PvdEvent) -> usize {
        let snapshot: Vec<Listener> = match self.registry().get(signal) {
            Some(listeners) => listeners.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for listener in snapshot {
            delivered += 1;
            if listener(event) == Propagation::Handled {
                break;
            }
        }
        delivered
    }

    /// Deliver `event` on its own signal, then attribute updates again on
    /// their per-attribute signal.
    pub fn publish(&self, event: &PvdEvent) {
        self.emit(&event.signal(), event);
        if let Some(companion) = event.named_companion() {
            self.emit(&companion.signal(), &companion);
        }
    }
}
