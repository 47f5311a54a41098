//! API surface.
//!
//! Other threads talk to the loop through a [`Handle`]: every call defers an
//! event carrying a reply channel and blocks on the answer. The loop never
//! blocks back; replies are sent from inside its handlers.
use crossbeam_channel as chan;
use thiserror::Error;

use std::net::SocketAddr;

use oryx_common::block::chain::{SignedSnapshot, SnapshotPriority};
use oryx_common::block::target::Worksum;
use oryx_common::time::LocalTime;
use oryx_common::Height;

use crate::error::ErrorCode;
use crate::event::{Event, InspectFn};
use crate::queue::EventQueue;
use crate::ConnectionId;

/// One peer, as reported to API callers.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Connection id.
    pub con_id: ConnectionId,
    /// Remote address.
    pub address: SocketAddr,
    /// Whether the handshake completed.
    pub initialized: bool,
    /// The peer's advertised chain length.
    pub chain_length: Height,
    /// The peer's advertised total work.
    pub worksum: Worksum,
    /// Highest snapshot priority the peer has shown us.
    pub their_snapshot_priority: SnapshotPriority,
    /// Highest snapshot priority the peer has acknowledged.
    pub acknowledged_snapshot_priority: SnapshotPriority,
    /// When the connection was registered.
    pub since: LocalTime,
}

/// Hashrate estimate, as reported to API callers.
#[derive(Debug, Clone, Copy)]
pub struct HashrateInfo {
    /// Number of blocks in the estimation window.
    pub n_blocks: usize,
    /// Estimated hashes per second.
    pub estimate: f64,
}

/// Error returned by [`Handle`] calls.
#[derive(Debug, Error)]
pub enum HandleError {
    /// The loop is shutting down and rejected the request.
    #[error("event loop is shutting down")]
    ShuttingDown,
    /// The loop dropped the reply channel.
    #[error("event loop dropped the reply")]
    Disconnected,
}

/// Cross-thread handle to a running loop.
#[derive(Clone)]
pub struct Handle {
    queue: std::sync::Arc<EventQueue>,
}

impl Handle {
    /// Wrap a queue.
    pub fn new(queue: std::sync::Arc<EventQueue>) -> Self {
        Self { queue }
    }

    /// Enqueue an event. Returns `false` iff the loop is shutting down.
    pub fn defer(&self, event: Event) -> bool {
        self.queue.defer(event)
    }

    /// Request shutdown.
    pub fn shutdown(&self, reason: ErrorCode) {
        self.queue.shutdown(reason);
    }

    /// List connected peers.
    pub fn get_peers(&self) -> Result<Vec<PeerInfo>, HandleError> {
        let (tx, rx) = chan::bounded(1);
        self.call(Event::GetPeers(tx), rx)
    }

    /// Whether the node considers itself synced.
    pub fn get_synced(&self) -> Result<bool, HandleError> {
        let (tx, rx) = chan::bounded(1);
        self.call(Event::GetSynced(tx), rx)
    }

    /// Hashrate estimate over the last `n` blocks.
    pub fn get_hashrate(&self, n: usize) -> Result<HashrateInfo, HandleError> {
        let (tx, rx) = chan::bounded(1);
        self.call(Event::GetHashrate { n, reply: tx }, rx)
    }

    /// Hashrate chart over `[from, to]` with the given window.
    pub fn get_hashrate_chart(
        &self,
        from: Height,
        to: Height,
        window: u32,
    ) -> Result<Vec<(Height, f64)>, HandleError> {
        let (tx, rx) = chan::bounded(1);
        self.call(
            Event::GetHashrateChart {
                from,
                to,
                window,
                reply: tx,
            },
            rx,
        )
    }

    /// The current signed snapshot, if any.
    pub fn get_signed_snapshot(&self) -> Result<Result<SignedSnapshot, ErrorCode>, HandleError> {
        let (tx, rx) = chan::bounded(1);
        self.call(Event::GetSignedSnapshot(tx), rx)
    }

    /// Run a closure against the loop state.
    pub fn inspect(&self, f: InspectFn) -> bool {
        self.defer(Event::Inspect(f))
    }

    fn call<T>(&self, event: Event, rx: chan::Receiver<T>) -> Result<T, HandleError> {
        if !self.defer(event) {
            return Err(HandleError::ShuttingDown);
        }
        rx.recv().map_err(|_| HandleError::Disconnected)
    }
}
