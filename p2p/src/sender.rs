//! Request issuance.
//!
//! Downloaders decide *what* to ask *whom*; the [`RequestSender`] owns the
//! mechanics shared by every request kind: nonce allocation, the expiry
//! timer, the one-job-per-peer slot, and the global active-request cap.
use oryx_common::block::chain::{BatchSelector, Descriptor, HeaderRange};
use oryx_common::time::{LocalDuration, LocalTime};
use oryx_common::Height;

use crate::message::{BatchreqMsg, BlockreqMsg, Message, ProbereqMsg};
use crate::peer::{BatchRequest, BlockRequest, Job, Peer, ProbeRequest};
use crate::timer::{Timer, TimerEvent};

/// Capability handed to the downloaders while they assign work.
pub struct RequestSender<'a> {
    /// The loop's timer wheel.
    pub timer: &'a mut Timer,
    /// Count of requests held against the cap.
    pub active_requests: &'a mut usize,
    /// The cap.
    pub max_requests: usize,
    /// Current loop time.
    pub now: LocalTime,
    /// Nonce source.
    pub rng: &'a fastrand::Rng,
    /// How long a peer has to answer before its request expires.
    pub reply_timeout: LocalDuration,
}

impl RequestSender<'_> {
    /// Whether the active-request cap is exhausted.
    pub fn finished(&self) -> bool {
        *self.active_requests >= self.max_requests
    }

    /// Issue a probe. Probes occupy the peer's job slot but do not count
    /// against the cap.
    pub fn send_probe(&mut self, peer: &mut Peer, descriptor: Descriptor, height: Height) {
        debug_assert!(peer.job.is_idle());
        let nonce = self.rng.u64(..);
        let timer = self.timer.insert(
            self.now,
            self.reply_timeout,
            TimerEvent::Expire(peer.con.id),
        );
        let req = ProbeRequest {
            nonce,
            descriptor,
            height,
        };
        peer.job = Job::Probe {
            req,
            timer,
            active: false,
            expired: false,
        };
        peer.send(Message::ProbeReq(ProbereqMsg {
            nonce,
            descriptor,
            height,
        }));
    }

    /// Issue a header-batch request, counted against the cap.
    pub fn send_batch(&mut self, peer: &mut Peer, selector: BatchSelector) {
        debug_assert!(peer.job.is_idle());
        debug_assert!(!self.finished());
        let nonce = self.rng.u64(..);
        let timer = self.timer.insert(
            self.now,
            self.reply_timeout,
            TimerEvent::Expire(peer.con.id),
        );
        let req = BatchRequest {
            nonce,
            selector,
            min_return: selector.length,
            max_return: selector.length,
        };
        peer.job = Job::Batch {
            req,
            timer,
            active: true,
            expired: false,
        };
        *self.active_requests += 1;
        peer.send(Message::BatchReq(BatchreqMsg { nonce, selector }));
    }

    /// Issue a block-range request, counted against the cap.
    pub fn send_blocks(&mut self, peer: &mut Peer, range: HeaderRange) {
        debug_assert!(peer.job.is_idle());
        debug_assert!(!self.finished());
        let nonce = self.rng.u64(..);
        let timer = self.timer.insert(
            self.now,
            self.reply_timeout,
            TimerEvent::Expire(peer.con.id),
        );
        peer.job = Job::Blocks {
            req: BlockRequest { nonce, range },
            timer,
            active: true,
            expired: false,
        };
        *self.active_requests += 1;
        peer.send(Message::BlockReq(BlockreqMsg { nonce, range }));
    }
}
