//! Per-peer connection state.
//!
//! A peer is either *awaiting-init* (pre-handshake), *idle*, or carrying
//! exactly one outstanding correlated request (its *job*). The job is a
//! tagged variant; replies are matched against it by nonce.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use oryx_common::block::chain::{BatchSelector, Descriptor, HeaderRange, SnapshotPriority};
use oryx_common::time::{LocalDuration, LocalTime};
use oryx_common::Height;

use crate::chains::PeerChain;
use crate::error::ErrorCode;
use crate::message::{Message, Nonce, PongMsg};
use crate::timer::TimerHandle;
use crate::ConnectionId;

/// Direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// The peer dialed us.
    Inbound,
    /// We dialed the peer.
    Outbound,
}

impl Link {
    /// Whether we initiated the connection.
    pub fn is_outbound(&self) -> bool {
        matches!(self, Link::Outbound)
    }
}

/// Send half of a peer connection, held by the loop.
pub trait Transport: Send {
    /// Queue a message for sending. Must not block.
    fn send(&self, msg: Message);
    /// Ask the transport to close the connection.
    fn close(&self, reason: ErrorCode);
}

/// Outbound connection establishment.
pub trait Dialer: Send {
    /// Start dialing an address. Completion or failure is reported back
    /// through the event queue.
    fn connect(&mut self, addr: SocketAddr);
}

/// A live connection as handed over by the transport.
pub struct Connection {
    /// Monotonic connection id.
    pub id: ConnectionId,
    /// Remote address.
    pub addr: SocketAddr,
    /// Connection direction.
    pub link: Link,
    /// Send half.
    pub transport: Box<dyn Transport>,
    /// Set by the loop once it relinquished interest; the transport reads
    /// it before touching loop-owned state.
    pub erased: Arc<AtomicBool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("link", &self.link)
            .finish()
    }
}

/// An outstanding header-probe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRequest {
    /// Reply correlation.
    pub nonce: Nonce,
    /// Chain probed.
    pub descriptor: Descriptor,
    /// Height probed.
    pub height: Height,
}

/// An outstanding header-batch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRequest {
    /// Reply correlation.
    pub nonce: Nonce,
    /// Which headers were requested.
    pub selector: BatchSelector,
    /// Minimum acceptable reply size.
    pub min_return: u32,
    /// Maximum acceptable reply size.
    pub max_return: u32,
}

/// An outstanding block-body request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    /// Reply correlation.
    pub nonce: Nonce,
    /// Heights requested.
    pub range: HeaderRange,
}

/// The peer's single outstanding request slot.
#[derive(Debug)]
pub enum Job {
    /// No request outstanding.
    Idle,
    /// Handshake pending; the timer closes the peer if INIT never arrives.
    AwaitInit {
        /// Close-no-reply timer.
        timer: TimerHandle,
    },
    /// A probe is in flight.
    Probe {
        /// The request.
        req: ProbeRequest,
        /// Expire or close-no-reply timer.
        timer: TimerHandle,
        /// Counted against the active-request cap.
        active: bool,
        /// The expire timer already fired once.
        expired: bool,
    },
    /// A header batch is in flight.
    Batch {
        /// The request.
        req: BatchRequest,
        /// Expire or close-no-reply timer.
        timer: TimerHandle,
        /// Counted against the active-request cap.
        active: bool,
        /// The expire timer already fired once.
        expired: bool,
    },
    /// A block range is in flight.
    Blocks {
        /// The request.
        req: BlockRequest,
        /// Expire or close-no-reply timer.
        timer: TimerHandle,
        /// Counted against the active-request cap.
        active: bool,
        /// The expire timer already fired once.
        expired: bool,
    },
}

impl Job {
    /// Whether the peer has not completed the handshake yet.
    pub fn awaiting_init(&self) -> bool {
        matches!(self, Job::AwaitInit { .. })
    }

    /// Whether a request slot is free.
    pub fn is_idle(&self) -> bool {
        matches!(self, Job::Idle)
    }

    /// The job's pending timer, if any.
    pub fn timer(&self) -> Option<TimerHandle> {
        match self {
            Job::Idle => None,
            Job::AwaitInit { timer }
            | Job::Probe { timer, .. }
            | Job::Batch { timer, .. }
            | Job::Blocks { timer, .. } => Some(*timer),
        }
    }

    /// Whether the job still counts against the active-request cap.
    pub fn is_active(&self) -> bool {
        match self {
            Job::Probe { active, .. } | Job::Batch { active, .. } | Job::Blocks { active, .. } => {
                *active
            }
            _ => false,
        }
    }

    /// Mark the job expired: it no longer counts as active, and its timer
    /// was replaced with a close-no-reply timer.
    pub fn mark_expired(&mut self, new_timer: TimerHandle) {
        match self {
            Job::Probe { timer, active, expired, .. }
            | Job::Batch { timer, active, expired, .. }
            | Job::Blocks { timer, active, expired, .. } => {
                *timer = new_timer;
                *active = false;
                *expired = true;
            }
            Job::Idle | Job::AwaitInit { .. } => {}
        }
    }

    /// Take the probe request if `nonce` matches, freeing the slot.
    pub fn pop_probe(&mut self, nonce: Nonce) -> Result<(ProbeRequest, TimerHandle, bool), ErrorCode> {
        match self {
            Job::Probe { req, timer, active, .. } if req.nonce == nonce => {
                let out = (*req, *timer, *active);
                *self = Job::Idle;
                Ok(out)
            }
            _ => Err(ErrorCode::Unrequested),
        }
    }

    /// Take the batch request if `nonce` matches, freeing the slot.
    pub fn pop_batch(&mut self, nonce: Nonce) -> Result<(BatchRequest, TimerHandle, bool), ErrorCode> {
        match self {
            Job::Batch { req, timer, active, .. } if req.nonce == nonce => {
                let out = (*req, *timer, *active);
                *self = Job::Idle;
                Ok(out)
            }
            _ => Err(ErrorCode::Unrequested),
        }
    }

    /// Take the block request if `nonce` matches, freeing the slot.
    pub fn pop_blocks(&mut self, nonce: Nonce) -> Result<(BlockRequest, TimerHandle, bool), ErrorCode> {
        match self {
            Job::Blocks { req, timer, active, .. } if req.nonce == nonce => {
                let out = (*req, *timer, *active);
                *self = Job::Idle;
                Ok(out)
            }
            _ => Err(ErrorCode::Unrequested),
        }
    }
}

/// Per-peer ping cycle.
#[derive(Debug)]
pub enum PingState {
    /// First ping not sent yet.
    Fresh,
    /// Ping sent; the timer closes the peer if no pong arrives.
    AwaitingPong {
        /// Nonce of the outstanding ping.
        nonce: Nonce,
        /// Snapshot priority the ping carried.
        snapshot_priority: SnapshotPriority,
        /// Close-no-pong timer.
        timer: TimerHandle,
    },
    /// Pong received; the timer fires the next ping.
    Sleeping {
        /// Send-ping timer.
        timer: TimerHandle,
    },
}

impl PingState {
    /// The pending timer, if any.
    pub fn timer(&self) -> Option<TimerHandle> {
        match self {
            PingState::Fresh => None,
            PingState::AwaitingPong { timer, .. } | PingState::Sleeping { timer } => Some(*timer),
        }
    }

    /// Check a pong against the outstanding ping. On success returns the
    /// snapshot priority the answered ping carried.
    pub fn check(&self, pong: &PongMsg) -> Result<SnapshotPriority, ErrorCode> {
        match self {
            PingState::AwaitingPong {
                nonce,
                snapshot_priority,
                ..
            } if *nonce == pong.nonce => Ok(*snapshot_priority),
            _ => Err(ErrorCode::Unrequested),
        }
    }
}

/// Per-peer throttled send queue.
///
/// Replies to peer-initiated requests are spaced by a minimum gap; buffers
/// violating the gap are queued and drained one per timer expiry. This
/// bounds the outbound byte rate a peer can induce.
#[derive(Debug, Default)]
pub struct Throttle {
    queue: std::collections::VecDeque<(Message, LocalDuration)>,
    next_due: LocalTime,
    timer: Option<TimerHandle>,
}

/// What to do after queueing a throttled send.
#[derive(Debug, PartialEq, Eq)]
pub enum ThrottleOutcome {
    /// Send the message immediately.
    SendNow(Message),
    /// A drain timer must be armed at the given deadline.
    ArmTimer(LocalTime),
    /// A drain timer is already armed.
    Pending,
}

impl Throttle {
    /// Accept a message with a minimum gap to the next send.
    pub fn push(&mut self, msg: Message, gap: LocalDuration, now: LocalTime) -> ThrottleOutcome {
        if self.queue.is_empty() && now >= self.next_due {
            self.next_due = now + gap;
            return ThrottleOutcome::SendNow(msg);
        }
        let due = self.next_due;
        self.queue.push_back((msg, gap));
        if self.timer.is_none() {
            ThrottleOutcome::ArmTimer(due)
        } else {
            ThrottleOutcome::Pending
        }
    }

    /// Record the armed drain timer.
    pub fn set_timer(&mut self, timer: TimerHandle) {
        self.timer = Some(timer);
    }

    /// The armed drain timer, if any.
    pub fn timer(&self) -> Option<TimerHandle> {
        self.timer
    }

    /// Drain one buffer on timer expiry. Returns the message to send and
    /// the deadline to re-arm at if the queue is still non-empty.
    pub fn drain(&mut self, now: LocalTime) -> (Option<Message>, Option<LocalTime>) {
        self.timer = None;
        match self.queue.pop_front() {
            None => (None, None),
            Some((msg, gap)) => {
                self.next_due = now + gap;
                let rearm = (!self.queue.is_empty()).then_some(self.next_due);
                (Some(msg), rearm)
            }
        }
    }
}

/// Inbound ping rate limiter: a bounded number of pings per window.
#[derive(Debug)]
pub struct PingLimiter {
    window_start: LocalTime,
    count: u32,
}

/// Window length of the ping limiter.
const PING_WINDOW: LocalDuration = LocalDuration::from_secs(60);
/// Pings allowed per window.
const PINGS_PER_WINDOW: u32 = 12;

impl PingLimiter {
    /// A fresh limiter.
    pub fn new(now: LocalTime) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    /// Account for one inbound ping.
    pub fn ping(&mut self, now: LocalTime) -> Result<(), ErrorCode> {
        if now - self.window_start >= PING_WINDOW {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        if self.count > PINGS_PER_WINDOW {
            Err(ErrorCode::Flood)
        } else {
            Ok(())
        }
    }
}

/// Everything the loop knows about one peer.
#[derive(Debug)]
pub struct Peer {
    /// The underlying connection.
    pub con: Connection,
    /// When the connection was registered.
    pub connected_since: LocalTime,
    /// Our view of the peer's chain. `None` until INIT.
    pub chain: Option<PeerChain>,
    /// The single outstanding request slot.
    pub job: Job,
    /// Ping cycle state.
    pub ping: PingState,
    /// Throttled send queue.
    pub throttle: Throttle,
    /// Inbound ping rate limiter.
    pub ping_limiter: PingLimiter,
    /// Nonce of the peer's last block request, for tagging the
    /// asynchronously produced reply.
    pub last_nonce: Nonce,
    /// Highest snapshot priority the peer has shown us.
    pub their_snapshot_priority: SnapshotPriority,
    /// Highest snapshot priority the peer has acknowledged.
    pub acknowledged_snapshot_priority: SnapshotPriority,
    /// The loop dropped this peer; the entry awaits garbage collection.
    pub erased: bool,
}

impl Peer {
    /// Create the record for a freshly admitted connection.
    pub fn new(con: Connection, init_timer: TimerHandle, now: LocalTime) -> Self {
        Self {
            con,
            connected_since: now,
            chain: None,
            job: Job::AwaitInit { timer: init_timer },
            ping: PingState::Fresh,
            throttle: Throttle::default(),
            ping_limiter: PingLimiter::new(now),
            last_nonce: 0,
            their_snapshot_priority: SnapshotPriority::default(),
            acknowledged_snapshot_priority: SnapshotPriority::default(),
            erased: false,
        }
    }

    /// Whether the handshake completed.
    pub fn initialized(&self) -> bool {
        self.chain.is_some() && !self.erased
    }

    /// Send a message, unless the peer was already erased.
    pub fn send(&self, msg: Message) {
        if !self.erased {
            self.con.transport.send(msg);
        }
    }

    /// Flip the erased flags, relinquishing interest in the connection.
    pub fn mark_erased(&mut self) {
        self.erased = true;
        self.con.erased.store(true, Ordering::Release);
    }
}
