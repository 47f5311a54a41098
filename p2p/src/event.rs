//! Event queue entries.
//!
//! Every cross-thread input to the loop is one of these variants. API
//! callbacks carry their reply channel; inspection carries a closure run
//! against a read-only view of the loop.
use std::net::SocketAddr;

use crossbeam_channel as chan;

use oryx_common::block::chain::SignedSnapshot;
use oryx_common::block::header::Header;
use oryx_common::block::Body;
use oryx_common::Height;

use crate::api::{HashrateInfo, PeerInfo};
use crate::chains::{RollbackData, StageAndConsensus};
use crate::error::{ChainOffender, ErrorCode};
use crate::mempool::Log;
use crate::message::Inbound;
use crate::peer::Connection;
use crate::registry::Connections;
use crate::timer::Timer;
use crate::ConnectionId;

/// A consensus-chain mutation reported by the chain server.
#[derive(Debug, Clone)]
pub enum ChainAction {
    /// Headers were appended to consensus.
    Append {
        /// The appended headers, lowest first.
        headers: Vec<Header>,
    },
    /// Consensus forked.
    Fork {
        /// Highest height shared with the previous chain.
        fork_height: Height,
        /// Replacement headers above the fork height.
        headers: Vec<Header>,
    },
    /// Consensus rolled back below a signed snapshot.
    Rollback(RollbackData),
}

/// A serialized chain-state update: the mempool log plus the chain action.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    /// Mempool mutations accompanying the chain action.
    pub mempool_log: Log,
    /// The chain mutation.
    pub action: ChainAction,
}

/// The chain server's verdict on a staged block submission.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// Highest height accepted so far.
    pub accepted_upto: Height,
    /// Peers whose bodies failed chain-level validation.
    pub offenders: Vec<ChainOffender>,
}

/// Read-only view of the loop handed to inspection callbacks.
pub struct Inspector<'a> {
    /// Chain mirror.
    pub chains: &'a StageAndConsensus,
    /// Peer registry.
    pub connections: &'a Connections,
    /// Timer wheel.
    pub timer: &'a Timer,
    /// Requests currently held against the cap.
    pub active_requests: usize,
    /// Current sync verdict.
    pub synced: bool,
}

/// An inspection callback.
pub type InspectFn = Box<dyn FnOnce(Inspector<'_>) + Send>;

/// A cross-thread input to the loop.
pub enum Event {
    /// The transport established a connection.
    NewConnection(Connection),
    /// The transport delivered a message on a connection.
    Message {
        /// Source connection.
        con_id: ConnectionId,
        /// The framed message.
        inbound: Inbound,
    },
    /// The transport lost a connection.
    Released {
        /// The lost connection.
        con_id: ConnectionId,
        /// Why.
        error: ErrorCode,
    },
    /// The chain server mutated chain state.
    StateUpdate(StateUpdate),
    /// The chain server judged a staged submission.
    StageResult(StageResult),
    /// The chain server produced bodies for a peer's block request.
    ForwardBlockRep {
        /// The requesting peer.
        con_id: ConnectionId,
        /// The bodies, in height order.
        blocks: Vec<Body>,
    },
    /// An outbound dial failed.
    FailedOutbound(SocketAddr),
    /// Pin an address.
    PinAddress(SocketAddr),
    /// Unpin an address.
    UnpinAddress(SocketAddr),
    /// The chain server mutated the mempool without touching the chain.
    MempoolLog(Log),
    /// API: list peers.
    GetPeers(chan::Sender<Vec<PeerInfo>>),
    /// API: report the sync verdict.
    GetSynced(chan::Sender<bool>),
    /// API: estimate the hashrate over the last `n` blocks.
    GetHashrate {
        /// Window length in blocks.
        n: usize,
        /// Reply channel.
        reply: chan::Sender<HashrateInfo>,
    },
    /// API: hashrate chart over a height range.
    GetHashrateChart {
        /// First height.
        from: Height,
        /// Last height.
        to: Height,
        /// Blocks per chart point.
        window: u32,
        /// Reply channel.
        reply: chan::Sender<Vec<(Height, f64)>>,
    },
    /// API: the current signed snapshot.
    GetSignedSnapshot(chan::Sender<Result<SignedSnapshot, ErrorCode>>),
    /// Run a closure against the loop state.
    Inspect(InspectFn),
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewConnection(c) => write!(f, "NewConnection({:?})", c.id),
            Self::Message { con_id, inbound } => {
                write!(f, "Message({:?}, {})", con_id, inbound.msg.name())
            }
            Self::Released { con_id, error } => write!(f, "Released({:?}, {})", con_id, error),
            Self::StateUpdate(_) => write!(f, "StateUpdate"),
            Self::StageResult(r) => write!(f, "StageResult(upto {})", r.accepted_upto),
            Self::ForwardBlockRep { con_id, blocks } => {
                write!(f, "ForwardBlockRep({:?}, {} blocks)", con_id, blocks.len())
            }
            Self::FailedOutbound(a) => write!(f, "FailedOutbound({})", a),
            Self::PinAddress(a) => write!(f, "PinAddress({})", a),
            Self::UnpinAddress(a) => write!(f, "UnpinAddress({})", a),
            Self::MempoolLog(l) => write!(f, "MempoolLog({} actions)", l.len()),
            Self::GetPeers(_) => write!(f, "GetPeers"),
            Self::GetSynced(_) => write!(f, "GetSynced"),
            Self::GetHashrate { n, .. } => write!(f, "GetHashrate({})", n),
            Self::GetHashrateChart { from, to, .. } => {
                write!(f, "GetHashrateChart([{},{}])", from, to)
            }
            Self::GetSignedSnapshot(_) => write!(f, "GetSignedSnapshot"),
            Self::Inspect(_) => write!(f, "Inspect"),
        }
    }
}
