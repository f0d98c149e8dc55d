//! Double-buffered intake for pending messages.
//!
//! Emitters only ever write to the staging buffers. At the start of a tick the
//! dispatcher calls [`EventHub::flip`], which moves staging into active and
//! leaves fresh empty containers behind, so handlers running off the active
//! side can keep emitting without touching the batch being read.
//!
//! ```text
//! emit ──► staging ──flip──► active ──► tasks
//!            ▲                            │
//!            └────── handler emits ───────┘
//! ```

use std::collections::HashMap;
use std::mem;

use crate::message::{Discipline, Envelope, MessageKey};

/// One side of the double buffer.
#[derive(Default)]
struct Buffers {
    coalesced: HashMap<MessageKey, Vec<Envelope>>,
    ordered: Vec<Envelope>,
}

impl Buffers {
    fn is_empty(&self) -> bool {
        self.coalesced.is_empty() && self.ordered.is_empty()
    }
}

/// Staging and active buffers for both disciplines.
#[derive(Default)]
pub struct EventHub {
    staging: Buffers,
    active: Buffers,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a message in the staging side, routed by its discipline.
    pub fn push(&mut self, envelope: Envelope) {
        match envelope.discipline() {
            Discipline::Coalesced => self
                .staging
                .coalesced
                .entry(envelope.key())
                .or_default()
                .push(envelope),
            Discipline::Ordered => self.staging.ordered.push(envelope),
        }
    }

    /// Move staging into active and start a fresh staging side.
    ///
    /// Whatever was left in active is dropped.
    pub fn flip(&mut self) {
        self.active = mem::take(&mut self.staging);
    }

    /// All active coalesced instances of one type, in arrival order.
    pub fn peek_coalesced(&self, key: &MessageKey) -> &[Envelope] {
        self.active
            .coalesced
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The active ordered stream, in arrival order.
    pub fn peek_ordered(&self) -> &[Envelope] {
        &self.active.ordered
    }

    /// Drop active entries of the given coalesced types.
    pub fn clear_coalesced<'a>(&mut self, keys: impl IntoIterator<Item = &'a MessageKey>) {
        for key in keys {
            self.active.coalesced.remove(key);
        }
    }

    pub fn clear_ordered(&mut self) {
        self.active.ordered.clear();
    }

    /// Hard-clear both sides.
    pub fn reset(&mut self) {
        self.staging = Buffers::default();
        self.active = Buffers::default();
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty() && self.active.is_empty()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("staged_ordered", &self.staging.ordered.len())
            .field("staged_coalesced_types", &self.staging.coalesced.len())
            .field("active_ordered", &self.active.ordered.len())
            .field("active_coalesced_types", &self.active.coalesced.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Moved(u32);
    crate::coalesced_message!(Moved);

    struct Typed(char);
    crate::ordered_message!(Typed);

    fn values(envelopes: &[Envelope]) -> Vec<u32> {
        envelopes
            .iter()
            .filter_map(|e| e.downcast_ref::<Moved>())
            .map(|m| m.0)
            .collect()
    }

    #[test]
    fn push_routes_by_discipline() {
        let mut hub = EventHub::new();
        hub.push(Envelope::new(Moved(1)));
        hub.push(Envelope::new(Typed('a')));
        hub.push(Envelope::new(Moved(2)));

        hub.flip();

        assert_eq!(values(hub.peek_coalesced(&MessageKey::of::<Moved>())), vec![1, 2]);
        assert_eq!(hub.peek_ordered().len(), 1);
    }

    #[test]
    fn staged_messages_are_invisible_until_flip() {
        let mut hub = EventHub::new();
        hub.push(Envelope::new(Moved(1)));

        assert!(hub.peek_coalesced(&MessageKey::of::<Moved>()).is_empty());

        hub.flip();
        assert_eq!(hub.peek_coalesced(&MessageKey::of::<Moved>()).len(), 1);
    }

    #[test]
    fn writes_after_flip_do_not_touch_active_batch() {
        let mut hub = EventHub::new();
        hub.push(Envelope::new(Typed('a')));
        hub.flip();

        hub.push(Envelope::new(Typed('b')));

        assert_eq!(hub.peek_ordered().len(), 1);
        assert_eq!(
            hub.peek_ordered()[0].downcast_ref::<Typed>().map(|t| t.0),
            Some('a')
        );
    }

    #[test]
    fn peek_missing_type_is_empty() {
        let hub = EventHub::new();
        assert!(hub.peek_coalesced(&MessageKey::of::<Moved>()).is_empty());
    }

    #[test]
    fn clear_removes_only_processed_entries() {
        let mut hub = EventHub::new();
        hub.push(Envelope::new(Moved(1)));
        hub.push(Envelope::new(Typed('a')));
        hub.flip();
        hub.push(Envelope::new(Moved(2)));

        hub.clear_coalesced([&MessageKey::of::<Moved>()]);
        hub.clear_ordered();

        assert!(hub.peek_coalesced(&MessageKey::of::<Moved>()).is_empty());
        assert!(hub.peek_ordered().is_empty());
        assert!(!hub.is_empty(), "staging still holds Moved(2)");
    }

    #[test]
    fn reset_clears_both_sides() {
        let mut hub = EventHub::new();
        hub.push(Envelope::new(Moved(1)));
        hub.flip();
        hub.push(Envelope::new(Typed('z')));

        hub.reset();

        assert!(hub.is_empty());
    }
}
