//! Peer registry.
//!
//! Owns every peer record, keyed by connection id. Erasing only flags the
//! record; the map entry survives until end-of-tick garbage collection so
//! events already queued against the id resolve to nothing instead of to a
//! recycled peer.
use std::collections::BTreeMap;

use oryx_common::time::LocalTime;

use crate::error::ErrorCode;
use crate::peer::{Connection, Peer};
use crate::timer::TimerHandle;
use crate::ConnectionId;

/// All live peer records.
#[derive(Debug, Default)]
pub struct Connections {
    peers: BTreeMap<ConnectionId, Peer>,
}

impl Connections {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection. Fails on duplicate connection id or a second
    /// connection to the same address; the connection is returned so the
    /// caller can close it.
    pub fn insert(
        &mut self,
        con: Connection,
        init_timer: TimerHandle,
        now: LocalTime,
    ) -> Result<ConnectionId, (Connection, ErrorCode)> {
        if self.peers.contains_key(&con.id) {
            return Err((con, ErrorCode::Refused));
        }
        if self
            .peers
            .values()
            .any(|p| !p.erased && p.con.addr == con.addr)
        {
            return Err((con, ErrorCode::Refused));
        }
        let id = con.id;
        self.peers.insert(id, Peer::new(con, init_timer, now));
        Ok(id)
    }

    /// Look up a live peer.
    pub fn find(&mut self, id: ConnectionId) -> Option<&mut Peer> {
        self.peers.get_mut(&id).filter(|p| !p.erased)
    }

    /// Look up a live peer, immutably.
    pub fn get(&self, id: ConnectionId) -> Option<&Peer> {
        self.peers.get(&id).filter(|p| !p.erased)
    }

    /// Iterate over live peers.
    pub fn all(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| !p.erased)
    }

    /// Iterate over live peers, mutably.
    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut().filter(|p| !p.erased)
    }

    /// Iterate over peers that completed the handshake.
    pub fn initialized(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.initialized())
    }

    /// Iterate over initialized peers, mutably.
    pub fn initialized_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut().filter(|p| p.initialized())
    }

    /// Ids of all live peers, in id order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.all().map(|p| p.con.id).collect()
    }

    /// Number of live peers.
    pub fn len(&self) -> usize {
        self.all().count()
    }

    /// Whether no live peers exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of initialized peers.
    pub fn initialized_count(&self) -> usize {
        self.initialized().count()
    }

    /// Drop erased records.
    pub fn garbage_collect(&mut self) {
        self.peers.retain(|_, p| !p.erased);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Link, Transport};
    use crate::message::Message;
    use crate::timer::{Timer, TimerEvent};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&self, _msg: Message) {}
        fn close(&self, _reason: ErrorCode) {}
    }

    fn con(id: u64, last_octet: u8) -> Connection {
        Connection {
            id: ConnectionId(id),
            addr: ([127, 0, 0, last_octet], 8334).into(),
            link: Link::Inbound,
            transport: Box::new(NullTransport),
            erased: Arc::new(AtomicBool::new(false)),
        }
    }

    fn handle() -> TimerHandle {
        Timer::new().insert_at(LocalTime::from_secs(30), TimerEvent::Connect)
    }

    #[test]
    fn test_admission_rejects_duplicates() {
        let mut reg = Connections::new();
        let now = LocalTime::from_secs(0);

        reg.insert(con(1, 1), handle(), now).unwrap();
        let (_, code) = reg.insert(con(1, 2), handle(), now).unwrap_err();
        assert_eq!(code, ErrorCode::Refused);
        let (_, code) = reg.insert(con(2, 1), handle(), now).unwrap_err();
        assert_eq!(code, ErrorCode::Refused, "same address twice");
    }

    #[test]
    fn test_erased_peers_are_invisible_until_gc() {
        let mut reg = Connections::new();
        let now = LocalTime::from_secs(0);
        let id = reg.insert(con(1, 1), handle(), now).unwrap();

        reg.find(id).unwrap().mark_erased();
        assert!(reg.find(id).is_none());
        assert_eq!(reg.len(), 0);

        // The same address may reconnect even before garbage collection.
        reg.insert(con(2, 1), handle(), now).unwrap();

        reg.garbage_collect();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_initialized_filter() {
        let mut reg = Connections::new();
        let now = LocalTime::from_secs(0);
        reg.insert(con(1, 1), handle(), now).unwrap();

        assert_eq!(reg.initialized_count(), 0);
        assert_eq!(reg.len(), 1);
    }
}
