//! Address manager.
//!
//! Keeps the address books (pinned, verified, failed-backoff) and the
//! outbound dial schedule. The loop keeps a single `Connect` timer armed at
//! [`AddressManager::wakeup_time`] and re-arms it whenever the schedule
//! changes: pin, unpin, dial failure, or newly learned addresses.
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use oryx_common::time::{LocalDuration, LocalTime};

use crate::peer::Link;

/// Delay before re-dialing a disconnected address.
const RECONNECT_DELAY: LocalDuration = LocalDuration::from_secs(5);
/// Shortest failure backoff.
const BACKOFF_MIN: LocalDuration = LocalDuration::from_secs(1);
/// Longest failure backoff.
const BACKOFF_MAX: LocalDuration = LocalDuration::from_mins(60);
/// While a dial is in flight its entry is pushed this far into the future.
const DIAL_GRACE: LocalDuration = LocalDuration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct DialState {
    due: LocalTime,
    attempts: u32,
}

/// Address books plus the outbound dial schedule.
#[derive(Debug)]
pub struct AddressManager {
    target_outbound: usize,
    rng: fastrand::Rng,
    pinned: BTreeSet<SocketAddr>,
    verified: BTreeSet<SocketAddr>,
    schedule: BTreeMap<SocketAddr, DialState>,
    connected_out: BTreeSet<SocketAddr>,
    connected_in: BTreeSet<SocketAddr>,
}

impl AddressManager {
    /// Create a manager seeded with pinned addresses to connect to.
    pub fn new(connect: Vec<SocketAddr>, target_outbound: usize, rng: fastrand::Rng) -> Self {
        let mut mgr = Self {
            target_outbound,
            rng,
            pinned: BTreeSet::new(),
            verified: BTreeSet::new(),
            schedule: BTreeMap::new(),
            connected_out: BTreeSet::new(),
            connected_in: BTreeSet::new(),
        };
        for addr in connect {
            mgr.pin(addr, LocalTime::default());
        }
        mgr
    }

    /// The next due dial, if any.
    pub fn wakeup_time(&self) -> Option<LocalTime> {
        self.schedule
            .iter()
            .filter(|(addr, _)| !self.is_connected(addr))
            .map(|(_, s)| s.due)
            .min()
    }

    /// Take every due address, up to the outbound capacity. Entries are
    /// pushed forward so an in-flight dial is not re-issued.
    pub fn pop_connect(&mut self, now: LocalTime) -> Vec<SocketAddr> {
        let mut capacity = self
            .target_outbound
            .saturating_sub(self.connected_out.len());
        let mut out = Vec::new();
        let due: Vec<SocketAddr> = self
            .schedule
            .iter()
            .filter(|(addr, s)| s.due <= now && !self.is_connected(addr))
            .map(|(a, _)| *a)
            .collect();
        for addr in due {
            if !self.pinned.contains(&addr) {
                if capacity == 0 {
                    continue;
                }
                capacity -= 1;
            }
            let state = self.schedule.get_mut(&addr).expect("entry exists");
            state.due = now + DIAL_GRACE;
            out.push(addr);
        }
        out
    }

    /// A connection to `addr` was established.
    pub fn on_connected(&mut self, addr: SocketAddr, link: Link) {
        match link {
            Link::Outbound => self.connected_out.insert(addr),
            Link::Inbound => self.connected_in.insert(addr),
        };
        if let Some(state) = self.schedule.get_mut(&addr) {
            state.attempts = 0;
        }
    }

    /// A connection to `addr` went away. Returns whether the dial schedule
    /// changed.
    pub fn on_disconnected(&mut self, addr: SocketAddr, link: Link, now: LocalTime) -> bool {
        match link {
            Link::Outbound => self.connected_out.remove(&addr),
            Link::Inbound => self.connected_in.remove(&addr),
        };
        if self.pinned.contains(&addr) || self.verified.contains(&addr) {
            self.schedule.insert(
                addr,
                DialState {
                    due: now + RECONNECT_DELAY,
                    attempts: 0,
                },
            );
            return true;
        }
        false
    }

    /// An outbound dial to `addr` failed. Returns whether the schedule
    /// changed.
    pub fn on_failed_outbound(&mut self, addr: SocketAddr, now: LocalTime) -> bool {
        if let Some(state) = self.schedule.get_mut(&addr) {
            state.attempts += 1;
            let backoff = BACKOFF_MIN * (1u64 << state.attempts.min(12));
            state.due = now + backoff.min(BACKOFF_MAX);
            true
        } else {
            false
        }
    }

    /// Pin an address: always kept in the dial schedule. Returns whether
    /// the schedule changed.
    pub fn pin(&mut self, addr: SocketAddr, now: LocalTime) -> bool {
        self.pinned.insert(addr);
        self.schedule
            .insert(addr, DialState { due: now, attempts: 0 })
            .is_none()
    }

    /// Unpin an address. Returns whether the schedule changed.
    pub fn unpin(&mut self, addr: SocketAddr) -> bool {
        self.pinned.remove(&addr);
        if !self.verified.contains(&addr) {
            return self.schedule.remove(&addr).is_some();
        }
        false
    }

    /// Queue peer-supplied addresses for verification dialing. Returns
    /// whether the schedule changed.
    pub fn queue_verification(&mut self, addrs: &[SocketAddr], now: LocalTime) -> bool {
        let mut changed = false;
        for addr in addrs {
            if self.schedule.contains_key(addr) || self.is_connected(addr) {
                continue;
            }
            self.schedule
                .insert(*addr, DialState { due: now, attempts: 0 });
            changed = true;
        }
        changed
    }

    /// Record that `addr` completed a handshake and is worth gossiping.
    pub fn mark_verified(&mut self, addr: SocketAddr) {
        self.verified.insert(addr);
    }

    /// Sample up to `k` verified addresses for a pong reply.
    pub fn sample_verified(&self, k: usize) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self.verified.iter().copied().collect();
        self.rng.shuffle(&mut addrs);
        addrs.truncate(k);
        addrs
    }

    /// Number of verified addresses.
    pub fn verified_len(&self) -> usize {
        self.verified.len()
    }

    fn is_connected(&self, addr: &SocketAddr) -> bool {
        self.connected_out.contains(addr) || self.connected_in.contains(addr)
    }
}
