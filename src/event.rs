//! Events delivered to waiting fibers.
//!
//! A waiting fiber stores its registration in its scheduler tag as
//! `(value << 16) | id`. Delivery compares the incoming event against that
//! tag; an id of [`EVENT_ID_ANY`] or a value of [`EVENT_VALUE_ANY`] in the
//! registration matches anything in that field.

/// Registration id that matches events from every source.
pub const EVENT_ID_ANY: u16 = 0;

/// Registration value that matches every event value.
pub const EVENT_VALUE_ANY: u16 = 0;

/// An event raised by the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    /// Identifier of the component that raised the event
    pub source: u16,
    /// Component-specific event code
    pub value: u16,
}

impl Event {
    pub const fn new(source: u16, value: u16) -> Self {
        Self { source, value }
    }

    /// Pack an `(id, value)` registration into a scheduler tag.
    pub const fn encode(id: u16, value: u16) -> u32 {
        ((value as u32) << 16) | id as u32
    }

    /// Unpack a scheduler tag into its `(id, value)` registration.
    pub const fn decode(context: u32) -> (u16, u16) {
        ((context & 0xFFFF) as u16, (context >> 16) as u16)
    }

    /// Whether this event satisfies the registration packed in `context`.
    pub fn matches(&self, context: u32) -> bool {
        let (id, value) = Self::decode(context);
        (id == EVENT_ID_ANY || id == self.source) && (value == EVENT_VALUE_ANY || value == self.value)
    }
}

/// The message bus the scheduler subscribes through.
///
/// When a fiber starts waiting the scheduler calls `listen` so that the
/// bus forwards matching events to `scheduler_event`; after delivering an
/// event it calls `ignore` for that event's pair.
pub trait EventBus {
    fn listen(&self, id: u16, value: u16);
    fn ignore(&self, id: u16, value: u16);
}
