//! Typed wire messages.
//!
//! Byte-level codecs live in the transport; the loop sees parsed, typed
//! messages wrapped in a frame that carries the checksum verdict. Every
//! message that answers a request carries the request's nonce.
use std::net::SocketAddr;

use oryx_common::block::chain::{
    BatchSelector, Descriptor, HeaderRange, SignedSnapshot, SnapshotPriority,
};
use oryx_common::block::header::Header;
use oryx_common::block::target::Worksum;
use oryx_common::block::{Body, TxId};
use oryx_common::Height;

use crate::mempool::Entry;

/// Correlates replies with requests on one connection.
pub type Nonce = u64;

/// Handshake: the sender's chain descriptor. MUST be the first message in
/// each direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMsg {
    /// Fingerprint of the sender's chain.
    pub descriptor: Descriptor,
    /// Length of the sender's chain.
    pub chain_length: Height,
    /// Total work of the sender's chain.
    pub worksum: Worksum,
}

/// Liveness probe. Also piggybacks address/transaction gossip limits and the
/// sender's snapshot priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingMsg {
    /// Reply correlation.
    pub nonce: Nonce,
    /// Maximum addresses the sender wants back.
    pub max_addresses: u16,
    /// Maximum transaction ids the sender wants back.
    pub max_transactions: u16,
    /// The sender's signed-snapshot priority.
    pub snapshot_priority: SnapshotPriority,
}

/// Answer to a [`PingMsg`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongMsg {
    /// Nonce of the answered ping.
    pub nonce: Nonce,
    /// Sampled verified peer endpoints.
    pub addresses: Vec<SocketAddr>,
    /// Sampled mempool transaction ids.
    pub txids: Vec<TxId>,
}

/// Request for a contiguous run of headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchreqMsg {
    /// Reply correlation.
    pub nonce: Nonce,
    /// Which headers, of which chain.
    pub selector: BatchSelector,
}

/// Answer to a [`BatchreqMsg`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchrepMsg {
    /// Nonce of the answered request.
    pub nonce: Nonce,
    /// The requested headers, in height order.
    pub batch: Vec<Header>,
}

/// Lookup of a single header at (descriptor, height).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbereqMsg {
    /// Reply correlation.
    pub nonce: Nonce,
    /// Chain to look up in.
    pub descriptor: Descriptor,
    /// Height to look up.
    pub height: Height,
}

/// Answer to a [`ProbereqMsg`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProberepMsg {
    /// Nonce of the answered request.
    pub nonce: Nonce,
    /// The responder's current chain descriptor.
    pub current_descriptor: Descriptor,
    /// Header at the height on the responder's current chain, if any.
    pub current: Option<Header>,
    /// Header at the height under the requested descriptor, if known.
    pub requested: Option<Header>,
}

/// Request for a range of block bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockreqMsg {
    /// Reply correlation.
    pub nonce: Nonce,
    /// Heights requested, inclusive.
    pub range: HeaderRange,
}

/// Answer to a [`BlockreqMsg`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockrepMsg {
    /// Nonce of the answered request.
    pub nonce: Nonce,
    /// Bodies for the requested range, in height order.
    pub blocks: Vec<Body>,
}

/// The sender appended to its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendMsg {
    /// New chain length.
    pub chain_length: Height,
    /// New total work.
    pub worksum: Worksum,
}

/// The sender forked its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkMsg {
    /// Highest height shared with the previous chain.
    pub fork_height: Height,
    /// New chain length.
    pub chain_length: Height,
    /// New total work.
    pub worksum: Worksum,
    /// New chain descriptor.
    pub descriptor: Descriptor,
}

/// The sender shrank its chain below a signed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedPinRollbackMsg {
    /// The snapshot justifying the rollback.
    pub signed_snapshot: SignedSnapshot,
    /// The sender's new chain length.
    pub shrink_length: Height,
}

/// Announcement of new mempool transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnotifyMsg {
    /// Announced transaction ids.
    pub txids: Vec<TxId>,
}

/// Request for announced transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxreqMsg {
    /// Requested transaction ids.
    pub txids: Vec<TxId>,
}

/// Answer to a [`TxreqMsg`]. Entries the responder no longer has are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxrepMsg {
    /// Requested transactions, in request order.
    pub txs: Vec<Option<Entry>>,
}

/// A signed snapshot pushed by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderMsg {
    /// The pushed snapshot.
    pub signed_snapshot: SignedSnapshot,
}

/// Any message a peer can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake.
    Init(InitMsg),
    /// Liveness probe.
    Ping(PingMsg),
    /// Liveness answer.
    Pong(PongMsg),
    /// Header batch request.
    BatchReq(BatchreqMsg),
    /// Header batch reply.
    BatchRep(BatchrepMsg),
    /// Header lookup request.
    ProbeReq(ProbereqMsg),
    /// Header lookup reply.
    ProbeRep(ProberepMsg),
    /// Block body request.
    BlockReq(BlockreqMsg),
    /// Block body reply.
    BlockRep(BlockrepMsg),
    /// Chain append notification.
    Append(AppendMsg),
    /// Chain fork notification.
    Fork(ForkMsg),
    /// Chain rollback notification.
    SignedPinRollback(SignedPinRollbackMsg),
    /// Mempool announcement.
    TxNotify(TxnotifyMsg),
    /// Transaction request.
    TxReq(TxreqMsg),
    /// Transaction reply.
    TxRep(TxrepMsg),
    /// Signed snapshot push.
    Leader(LeaderMsg),
}

impl Message {
    /// Short message name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::BatchReq(_) => "batchreq",
            Self::BatchRep(_) => "batchrep",
            Self::ProbeReq(_) => "probereq",
            Self::ProbeRep(_) => "proberep",
            Self::BlockReq(_) => "blockreq",
            Self::BlockRep(_) => "blockrep",
            Self::Append(_) => "append",
            Self::Fork(_) => "fork",
            Self::SignedPinRollback(_) => "rollback",
            Self::TxNotify(_) => "txnotify",
            Self::TxReq(_) => "txreq",
            Self::TxRep(_) => "txrep",
            Self::Leader(_) => "leader",
        }
    }
}

/// Framing data the transport attaches to a parsed message.
///
/// The transport computes the checksum over the raw bytes while decoding;
/// the loop only compares it against the declared one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Checksum declared in the message frame.
    pub declared: u32,
    /// Checksum computed over the received bytes.
    pub computed: u32,
}

impl Frame {
    /// A frame whose checksums agree.
    pub fn intact() -> Self {
        Self {
            declared: 0,
            computed: 0,
        }
    }

    /// Whether the declared checksum matches the computed one.
    pub fn verify(&self) -> bool {
        self.declared == self.computed
    }
}

/// A parsed inbound message together with its frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// The parsed message.
    pub msg: Message,
    /// Framing data.
    pub frame: Frame,
}

impl From<Message> for Inbound {
    fn from(msg: Message) -> Self {
        Self {
            msg,
            frame: Frame::intact(),
        }
    }
}
