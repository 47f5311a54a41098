//! Timer wheel.
//!
//! Time-ordered dispatch of tagged payloads. Insertion returns a stable
//! handle; cancellation through a handle is `O(log n)`. A cancelled or
//! expired handle is invalidated and must not be reused.
use std::collections::BTreeMap;

use oryx_common::time::{LocalDuration, LocalTime};

use crate::ConnectionId;

/// Payload of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The outbound dial schedule is due.
    Connect,
    /// The peer's ping sleep ended; send the next ping.
    SendPing(ConnectionId),
    /// No pong arrived in time; close the peer.
    CloseNoPong(ConnectionId),
    /// No reply arrived in the grace window; close the peer.
    CloseNoReply(ConnectionId),
    /// The peer's outstanding request expired.
    Expire(ConnectionId),
    /// The peer's throttled send queue may drain one buffer.
    ThrottledSend(ConnectionId),
}

/// Stable reference to one timer insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    deadline: LocalTime,
    seq: u64,
}

impl TimerHandle {
    /// The deadline this handle was inserted at.
    pub fn deadline(&self) -> LocalTime {
        self.deadline
    }
}

/// Ordered map from deadline to tagged payload.
#[derive(Debug, Default)]
pub struct Timer {
    entries: BTreeMap<(LocalTime, u64), TimerEvent>,
    seq: u64,
}

impl Timer {
    /// Create an empty wheel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` to fire at `now + delay`.
    pub fn insert(&mut self, now: LocalTime, delay: LocalDuration, event: TimerEvent) -> TimerHandle {
        self.insert_at(now + delay, event)
    }

    /// Schedule `event` to fire at `deadline`.
    pub fn insert_at(&mut self, deadline: LocalTime, event: TimerEvent) -> TimerHandle {
        let seq = self.seq;
        self.seq += 1;
        self.entries.insert((deadline, seq), event);
        TimerHandle { deadline, seq }
    }

    /// Cancel the insertion behind `handle`. Idempotent.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.entries.remove(&(handle.deadline, handle.seq));
    }

    /// Whether the insertion behind `handle` is still pending.
    pub fn contains(&self, handle: TimerHandle) -> bool {
        self.entries.contains_key(&(handle.deadline, handle.seq))
    }

    /// Remove and return every entry whose deadline has passed, in deadline
    /// order.
    pub fn pop_expired(&mut self, now: LocalTime) -> Vec<TimerEvent> {
        let mut expired = Vec::new();
        while let Some((&(deadline, seq), _)) = self.entries.first_key_value() {
            if deadline > now {
                break;
            }
            let event = self
                .entries
                .remove(&(deadline, seq))
                .expect("first key exists");
            expired.push(event);
        }
        expired
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&self) -> Option<LocalTime> {
        self.entries.first_key_value().map(|(&(d, _), _)| d)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: LocalTime = LocalTime::from_secs(1_000);

    #[test]
    fn test_expiry_order() {
        let mut timer = Timer::new();
        timer.insert(T0, LocalDuration::from_secs(30), TimerEvent::Connect);
        timer.insert(
            T0,
            LocalDuration::from_secs(10),
            TimerEvent::SendPing(ConnectionId(1)),
        );
        timer.insert(
            T0,
            LocalDuration::from_secs(20),
            TimerEvent::Expire(ConnectionId(2)),
        );

        let fired = timer.pop_expired(T0 + LocalDuration::from_secs(25));
        assert_eq!(
            fired,
            vec![
                TimerEvent::SendPing(ConnectionId(1)),
                TimerEvent::Expire(ConnectionId(2)),
            ]
        );
        assert_eq!(timer.len(), 1);
        assert_eq!(
            timer.next_deadline(),
            Some(T0 + LocalDuration::from_secs(30))
        );
    }

    #[test]
    fn test_cancel_is_stable_under_insertion() {
        let mut timer = Timer::new();
        let a = timer.insert(T0, LocalDuration::from_secs(5), TimerEvent::Connect);
        // Same deadline, different insertion.
        let b = timer.insert(
            T0,
            LocalDuration::from_secs(5),
            TimerEvent::SendPing(ConnectionId(7)),
        );

        timer.cancel(a);
        assert!(!timer.contains(a));
        assert!(timer.contains(b));

        let fired = timer.pop_expired(T0 + LocalDuration::from_secs(5));
        assert_eq!(fired, vec![TimerEvent::SendPing(ConnectionId(7))]);
    }

    #[test]
    fn test_cancel_after_expiry_is_noop() {
        let mut timer = Timer::new();
        let a = timer.insert(T0, LocalDuration::from_secs(1), TimerEvent::Connect);

        assert_eq!(timer.pop_expired(T0 + LocalDuration::from_secs(1)).len(), 1);
        timer.cancel(a);
        assert!(timer.is_empty());
    }

    #[test]
    fn test_same_instant_fires_in_insertion_order() {
        let mut timer = Timer::new();
        for i in 0..4 {
            timer.insert_at(T0, TimerEvent::SendPing(ConnectionId(i)));
        }
        let fired = timer.pop_expired(T0);
        let ids: Vec<_> = fired
            .iter()
            .map(|e| match e {
                TimerEvent::SendPing(ConnectionId(i)) => *i,
                _ => unreachable!(),
            })
            .collect();

        assert_eq!(ids, vec![0, 1, 2, 3]);
    }
}
