//! In-memory queue of unacknowledged outbound messages.
//!
//! Every submitted message lives here from creation until the server
//! acknowledges it by correlation id. The queue is deliberately unbounded
//! and entries are never evicted: delivery is at-least-once, and the server
//! deduplicates resends by correlation id.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One outbound message awaiting acknowledgment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingMessage {
    /// Opaque unique id matching the `tempId` injected into the frame.
    pub correlation_id: String,
    /// Serialized frame text; immutable once created.
    pub payload: String,
    /// Submit timestamp in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

/// Ordered collection of pending messages. Insertion order is send priority.
///
/// Only the session worker mutates the outbox, so it needs no internal
/// locking.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: VecDeque<PendingMessage>,
}

impl Outbox {
    /// Creates an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message. Correlation ids must be unique across all pending
    /// entries; the session guarantees this by generating fresh UUIDs.
    pub fn push(&mut self, message: PendingMessage) {
        debug_assert!(
            !self.contains(&message.correlation_id),
            "duplicate correlation id in outbox"
        );
        self.entries.push_back(message);
    }

    /// Removes the first entry with the given correlation id.
    ///
    /// Returns whether an entry was removed; a second acknowledgment with
    /// the same id is a no-op.
    pub fn acknowledge(&mut self, correlation_id: &str) -> bool {
        match self
            .entries
            .iter()
            .position(|entry| entry.correlation_id == correlation_id)
        {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Entries at least `grace` old at `now_ms`, in insertion order.
    pub fn aged(&self, now_ms: u64, grace: Duration) -> impl Iterator<Item = &PendingMessage> {
        let grace_ms = grace.as_millis() as u64;
        self.entries
            .iter()
            .filter(move |entry| now_ms.saturating_sub(entry.created_at_ms) >= grace_ms)
    }

    /// Whether an entry with this correlation id is pending.
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.correlation_id == correlation_id)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the outbox is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Outbox, PendingMessage};

    fn message(id: &str, created_at_ms: u64) -> PendingMessage {
        PendingMessage {
            correlation_id: id.to_string(),
            payload: format!(r#"{{"method":"sendMessage","tempId":"{id}"}}"#),
            created_at_ms,
        }
    }

    #[test]
    fn entries_stay_until_acknowledged() {
        let mut outbox = Outbox::new();
        outbox.push(message("a", 0));
        outbox.push(message("b", 0));
        assert_eq!(outbox.len(), 2);

        assert!(outbox.acknowledge("a"));
        assert_eq!(outbox.len(), 1);
        assert!(outbox.contains("b"));
    }

    #[test]
    fn duplicate_acknowledgment_is_a_no_op() {
        let mut outbox = Outbox::new();
        outbox.push(message("a", 0));

        assert!(outbox.acknowledge("a"));
        assert!(!outbox.acknowledge("a"));
        assert!(outbox.is_empty());
    }

    #[test]
    fn acknowledging_an_unknown_id_changes_nothing() {
        let mut outbox = Outbox::new();
        outbox.push(message("a", 0));
        assert!(!outbox.acknowledge("zzz"));
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn aged_entries_come_back_in_insertion_order() {
        let grace = Duration::from_millis(10_000);
        let mut outbox = Outbox::new();
        outbox.push(message("old-1", 0));
        outbox.push(message("fresh", 25_000));
        outbox.push(message("old-2", 5_000));

        let aged: Vec<&str> = outbox
            .aged(30_000, grace)
            .map(|entry| entry.correlation_id.as_str())
            .collect();
        assert_eq!(aged, vec!["old-1", "old-2"]);
    }

    #[test]
    fn entry_exactly_at_the_grace_boundary_is_aged() {
        let grace = Duration::from_millis(10_000);
        let mut outbox = Outbox::new();
        outbox.push(message("edge", 20_000));

        assert_eq!(outbox.aged(30_000, grace).count(), 1);
        assert_eq!(outbox.aged(29_999, grace).count(), 0);
    }
}
