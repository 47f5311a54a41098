//! The cross-thread event queue.
//!
//! One mutex covers the queue, the work flag and the close reason; a
//! condition variable wakes the loop. This is the only shared state between
//! the loop and the outside world.
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use oryx_common::time::LocalTime;

use crate::error::ErrorCode;
use crate::event::Event;

#[derive(Default)]
struct Inner {
    events: VecDeque<Event>,
    haswork: bool,
    close_reason: Option<ErrorCode>,
}

/// Everything the loop pulled out of the queue in one tick.
pub struct Drained {
    /// Queued events, in FIFO order.
    pub events: VecDeque<Event>,
    /// Set once shutdown was requested.
    pub shutdown: Option<ErrorCode>,
}

/// Bounded-unbounded FIFO of loop inputs.
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl EventQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an event. Returns `false` iff the loop is shutting down, in
    /// which case the event is dropped.
    pub fn defer(&self, event: Event) -> bool {
        let mut inner = self.inner.lock().expect("queue mutex");
        if inner.close_reason.is_some() {
            return false;
        }
        inner.haswork = true;
        inner.events.push_back(event);
        self.cv.notify_one();
        true
    }

    /// Request shutdown. Wakes the loop; `defer` rejects from now on.
    pub fn shutdown(&self, reason: ErrorCode) {
        let mut inner = self.inner.lock().expect("queue mutex");
        inner.haswork = true;
        inner.close_reason.get_or_insert(reason);
        self.cv.notify_one();
    }

    /// Block until there is work or `deadline` passes, then drain.
    pub fn wait(&self, deadline: Option<LocalTime>) -> Drained {
        let mut inner = self.inner.lock().expect("queue mutex");
        loop {
            if inner.haswork {
                break;
            }
            let now = LocalTime::now();
            match deadline {
                Some(d) if now >= d => break,
                Some(d) => {
                    let timeout = std::time::Duration::from(d - now);
                    let (guard, _) = self
                        .cv
                        .wait_timeout(inner, timeout)
                        .expect("queue mutex");
                    inner = guard;
                }
                None => {
                    inner = self.cv.wait(inner).expect("queue mutex");
                }
            }
        }
        inner.haswork = false;
        Drained {
            events: std::mem::take(&mut inner.events),
            shutdown: inner.close_reason,
        }
    }

    /// Drain without blocking.
    pub fn try_drain(&self) -> Drained {
        let mut inner = self.inner.lock().expect("queue mutex");
        inner.haswork = false;
        Drained {
            events: std::mem::take(&mut inner.events),
            shutdown: inner.close_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order_is_preserved() {
        let queue = EventQueue::new();
        for n in 0..4 {
            queue.defer(Event::FailedOutbound(([10, 0, 0, n], 1).into()));
        }
        let drained = queue.try_drain();

        let octets: Vec<u8> = drained
            .events
            .iter()
            .map(|e| match e {
                Event::FailedOutbound(a) => match a.ip() {
                    std::net::IpAddr::V4(v4) => v4.octets()[3],
                    _ => unreachable!(),
                },
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(octets, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_defer_rejected_after_shutdown() {
        let queue = EventQueue::new();
        assert!(queue.defer(Event::FailedOutbound(([10, 0, 0, 1], 1).into())));

        queue.shutdown(ErrorCode::Shutdown);
        assert!(!queue.defer(Event::FailedOutbound(([10, 0, 0, 2], 1).into())));

        let drained = queue.try_drain();
        assert_eq!(drained.shutdown, Some(ErrorCode::Shutdown));
        assert_eq!(drained.events.len(), 1, "pre-shutdown events drain");
    }

    #[test]
    fn test_wait_wakes_on_defer() {
        let queue = Arc::new(EventQueue::new());
        let q = queue.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            q.defer(Event::FailedOutbound(([10, 0, 0, 1], 1).into()));
        });
        let drained = queue.wait(None);

        assert_eq!(drained.events.len(), 1);
        t.join().unwrap();
    }

    #[test]
    fn test_wait_respects_deadline() {
        let queue = EventQueue::new();
        let deadline = LocalTime::now() + oryx_common::time::LocalDuration::from_millis(30);
        let drained = queue.wait(Some(deadline));

        assert!(drained.events.is_empty());
        assert!(LocalTime::now() >= deadline);
    }
}
