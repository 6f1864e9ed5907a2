//! Rotation audit log.
//!
//! Records are immutable once appended. When the log is full the oldest
//! records are dropped; nothing else is ever removed or rewritten.

use std::collections::VecDeque;

use tessera_types::keys::RotationEvent;

/// Default number of retained audit records.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Append-only, size-capped log of [`RotationEvent`]s.
///
/// Every record carries a sequence number so it can be persisted as its own
/// row; [`RotationAuditLog::push`] reports which rows fell off the end.
#[derive(Clone, Debug)]
pub struct RotationAuditLog {
    events: VecDeque<(u64, RotationEvent)>,
    capacity: usize,
    next_seq: u64,
}

impl RotationAuditLog {
    /// Create an empty log holding at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    /// Rebuild a log from persisted `(sequence, record)` rows, keeping the
    /// newest `capacity`. Also returns the sequence numbers that were dropped.
    pub fn from_records(
        mut records: Vec<(u64, RotationEvent)>,
        capacity: usize,
    ) -> (Self, Vec<u64>) {
        records.sort_by_key(|(seq, _)| *seq);
        let mut log = Self::new(capacity);
        log.next_seq = records.last().map_or(0, |(seq, _)| seq + 1);
        let excess = records.len().saturating_sub(log.capacity);
        let dropped = records.drain(..excess).map(|(seq, _)| seq).collect();
        log.events = records.into();
        (log, dropped)
    }

    /// Append a record, truncating the oldest if over capacity.
    ///
    /// Returns the new record's sequence number and those of the records
    /// truncated to make room.
    pub fn push(&mut self, event: RotationEvent) -> (u64, Vec<u64>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push_back((seq, event));
        let mut dropped = Vec::new();
        while self.events.len() > self.capacity {
            if let Some((old, _)) = self.events.pop_front() {
                dropped.push(old);
            }
        }
        (seq, dropped)
    }

    /// Sequence number the next pushed record will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All records, oldest first.
    pub fn events(&self) -> Vec<RotationEvent> {
        self.events.iter().map(|(_, e)| e.clone()).collect()
    }

    /// Records for one key, oldest first.
    pub fn for_key(&self, key_id: &str) -> Vec<RotationEvent> {
        self.events
            .iter()
            .map(|(_, e)| e)
            .filter(|e| e.key_id == key_id)
            .cloned()
            .collect()
    }

    /// Records that describe failed attempts.
    pub fn failures(&self) -> Vec<RotationEvent> {
        self.events
            .iter()
            .map(|(_, e)| e)
            .filter(|e| !e.success)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::keys::RotationReason;

    fn event(n: u32, key_id: &str, success: bool) -> RotationEvent {
        RotationEvent {
            event_id: format!("ev-{n}"),
            key_id: key_id.into(),
            old_version: n,
            new_version: n + 1,
            timestamp: u64::from(n),
            reason: RotationReason::Scheduled,
            success,
            error: (!success).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn test_truncates_oldest_only() {
        let mut log = RotationAuditLog::new(3);
        let mut dropped = Vec::new();
        for n in 0..5 {
            let (seq, gone) = log.push(event(n, "k1", true));
            assert_eq!(seq, u64::from(n));
            dropped.extend(gone);
        }
        assert_eq!(dropped, vec![0, 1]);
        let ids: Vec<_> = log.events().into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["ev-2", "ev-3", "ev-4"]);
    }

    #[test]
    fn test_filters() {
        let mut log = RotationAuditLog::new(10);
        log.push(event(0, "k1", true));
        log.push(event(1, "k2", false));
        log.push(event(2, "k1", false));
        assert_eq!(log.for_key("k1").len(), 2);
        assert_eq!(log.failures().len(), 2);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_from_records_respects_capacity() {
        let records = vec![
            (7, event(7, "k", true)),
            (3, event(3, "k", true)),
            (5, event(5, "k", true)),
        ];
        let (mut log, dropped) = RotationAuditLog::from_records(records, 2);
        assert_eq!(dropped, vec![3]);
        assert_eq!(log.len(), 2);
        assert_eq!(log.events()[0].event_id, "ev-5");
        assert_eq!(log.push(event(8, "k", true)), (8, vec![5]));
    }
}
