//! Chain state as seen by the loop.
//!
//! The loop mirrors two chains: *consensus* (the accepted chain, updated
//! only by chain-server notifications) and *stage* (a heavier candidate
//! under block download). For every peer it additionally tracks a
//! *descripted* view of the peer's chain together with two fork ranges
//! recording where agreement with our chains is still unproven.
use nonempty::NonEmpty;

use oryx_common::block::chain::{
    BatchSelector, Descriptor, HeaderRange, Headerchain, SignedSnapshot,
};
use oryx_common::block::header::{Header, Params};
use oryx_common::block::target::Worksum;
use oryx_common::block::{BlockHash, Body};
use oryx_common::Height;

use crate::error::{ChainError, ErrorCode};
use crate::mempool::Entry;
use crate::message::{AppendMsg, ForkMsg, InitMsg, ProberepMsg, SignedPinRollbackMsg};
use crate::ConnectionId;

/// Half-open height interval `[lower, upper)` within which agreement between
/// two chains is unproven.
///
/// `lower - 1` is the highest proven agreement; `upper` is the lowest height
/// at which agreement is impossible or disproven. Probes narrow the interval
/// from both ends; it is *converged* once empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkRange {
    lower: Height,
    upper: Height,
}

impl ForkRange {
    /// A range spanning `[lower, upper)`.
    pub fn new(lower: Height, upper: Height) -> Self {
        Self {
            lower,
            upper: upper.max(lower),
        }
    }

    /// A converged range with the given fork height.
    pub fn converged_at(fork_height: Height) -> Self {
        Self::new(fork_height + 1, fork_height + 1)
    }

    /// Lower bound (first unproven height).
    pub fn lower(&self) -> Height {
        self.lower
    }

    /// Upper bound (first impossible height).
    pub fn upper(&self) -> Height {
        self.upper
    }

    /// Whether the interval is empty.
    pub fn converged(&self) -> bool {
        self.lower >= self.upper
    }

    /// Highest proven agreement height. Meaningful once converged.
    pub fn fork_height(&self) -> Height {
        self.lower - 1
    }

    /// Bisection point to probe next, strictly within the interval.
    pub fn probe_height(&self) -> Option<Height> {
        if self.converged() {
            None
        } else {
            Some(self.lower + (self.upper - self.lower) / 2)
        }
    }

    /// Record proven agreement at `height`.
    pub fn on_match(&mut self, height: Height) {
        self.lower = self.lower.max(height + 1);
        self.upper = self.upper.max(self.lower);
    }

    /// Record proven disagreement at `height`.
    pub fn on_mismatch(&mut self, height: Height) {
        self.upper = self.upper.min(height);
        self.lower = self.lower.min(self.upper);
    }

    /// Re-limit the interval after either chain changed length.
    fn relimit(&mut self, max_upper: Height) {
        self.upper = max_upper;
        self.lower = self.lower.min(self.upper);
    }
}

/// A peer's chain as advertised: fingerprint, length, total work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descripted {
    /// Chain fingerprint.
    pub descriptor: Descriptor,
    /// Chain length.
    pub length: Height,
    /// Total work claimed.
    pub worksum: Worksum,
}

/// Our view of one peer's chain.
#[derive(Debug, Clone)]
pub struct PeerChain {
    /// The advertised chain.
    pub descripted: Descripted,
    consensus_fork: ForkRange,
    stage_fork: ForkRange,
}

impl PeerChain {
    /// Build the initial view from the peer's INIT message.
    pub fn new(init: &InitMsg, chains: &StageAndConsensus) -> Self {
        let descripted = Descripted {
            descriptor: init.descriptor,
            length: init.chain_length,
            worksum: init.worksum,
        };
        let mut chain = Self {
            descripted,
            consensus_fork: ForkRange::new(1, 1),
            stage_fork: ForkRange::new(1, 1),
        };
        chain.consensus_fork = chain.full_range(chains.consensus());
        chain.stage_fork = chain.full_range(chains.stage());
        chain.align(chains);
        chain
    }

    /// Equal descriptors mean identical histories: agreement up to the
    /// shorter chain needs no probing.
    fn align(&mut self, chains: &StageAndConsensus) {
        if self.descripted.descriptor == chains.descriptor() {
            let agreed = self.descripted.length.min(chains.consensus().length());
            self.consensus_fork = ForkRange::converged_at(agreed);
        }
    }

    fn full_range(&self, ours: &Headerchain) -> ForkRange {
        ForkRange::new(1, self.descripted.length.min(ours.length()) + 1)
    }

    /// Fork range against our consensus chain.
    pub fn consensus_fork_range(&self) -> &ForkRange {
        &self.consensus_fork
    }

    /// Fork range against our stage chain.
    pub fn stage_fork_range(&self) -> &ForkRange {
        &self.stage_fork
    }

    /// Worksum consistency: a peer whose whole chain is a proven prefix of
    /// ours must claim exactly the work of that prefix.
    fn check_worksum(&self, chains: &StageAndConsensus) -> Result<(), ChainError> {
        let d = &self.descripted;
        if self.consensus_fork.converged()
            && self.consensus_fork.fork_height() == d.length
            && d.length <= chains.consensus().length()
            && d.worksum != chains.consensus().work_at(d.length)
        {
            return Err(ChainError {
                code: ErrorCode::BadWork,
                height: d.length,
            });
        }
        Ok(())
    }

    /// The peer announced an append to its chain.
    pub fn on_peer_append(
        &mut self,
        m: &AppendMsg,
        chains: &StageAndConsensus,
    ) -> Result<(), ChainError> {
        if m.chain_length <= self.descripted.length || m.worksum <= self.descripted.worksum {
            return Err(ChainError {
                code: ErrorCode::BadWork,
                height: m.chain_length,
            });
        }
        self.descripted.length = m.chain_length;
        self.descripted.worksum = m.worksum;
        self.consensus_fork.relimit(self.descripted.length.min(chains.consensus().length()) + 1);
        self.stage_fork.relimit(self.descripted.length.min(chains.stage().length()) + 1);
        self.align(chains);
        self.check_worksum(chains)
    }

    /// The peer announced a fork of its chain.
    pub fn on_peer_fork(
        &mut self,
        m: &ForkMsg,
        chains: &StageAndConsensus,
    ) -> Result<(), ChainError> {
        if m.fork_height >= m.chain_length || m.descriptor <= self.descripted.descriptor {
            return Err(ChainError {
                code: ErrorCode::BadWork,
                height: m.fork_height,
            });
        }
        self.descripted = Descripted {
            descriptor: m.descriptor,
            length: m.chain_length,
            worksum: m.worksum,
        };
        // Agreement above the peer's fork height is void.
        self.consensus_fork = ForkRange::new(
            self.consensus_fork.lower().min(m.fork_height + 1),
            self.descripted.length.min(chains.consensus().length()) + 1,
        );
        self.stage_fork = ForkRange::new(
            self.stage_fork.lower().min(m.fork_height + 1),
            self.descripted.length.min(chains.stage().length()) + 1,
        );
        self.align(chains);
        Ok(())
    }

    /// The peer announced a snapshot-justified shrink of its chain.
    pub fn on_peer_shrink(&mut self, m: &SignedPinRollbackMsg, chains: &StageAndConsensus) {
        self.descripted.length = m.shrink_length;
        self.descripted.descriptor = self.descripted.descriptor.bumped();
        self.consensus_fork.relimit(m.shrink_length.min(chains.consensus().length()) + 1);
        self.stage_fork.relimit(m.shrink_length.min(chains.stage().length()) + 1);
        self.align(chains);
    }

    /// Our consensus chain appended.
    pub fn on_consensus_append(&mut self, chains: &StageAndConsensus) -> Result<(), ChainError> {
        self.consensus_fork.relimit(self.descripted.length.min(chains.consensus().length()) + 1);
        self.align(chains);
        self.check_worksum(chains)
    }

    /// Our consensus chain forked at `fork_height`.
    pub fn on_consensus_fork(
        &mut self,
        fork_height: Height,
        chains: &StageAndConsensus,
    ) -> Result<(), ChainError> {
        self.consensus_fork = ForkRange::new(
            self.consensus_fork.lower().min(fork_height + 1),
            self.descripted.length.min(chains.consensus().length()) + 1,
        );
        self.align(chains);
        self.check_worksum(chains)
    }

    /// Our consensus chain shrank.
    pub fn on_consensus_shrink(&mut self, chains: &StageAndConsensus) {
        let upper = self.descripted.length.min(chains.consensus().length()) + 1;
        self.consensus_fork = ForkRange::new(self.consensus_fork.lower().min(upper), upper);
        self.align(chains);
    }

    /// Our stage chain was replaced.
    pub fn on_stage_set(&mut self, chains: &StageAndConsensus) {
        self.stage_fork = self.full_range(chains.stage());
    }

    /// A probe reply narrowed the fork ranges.
    pub fn on_proberep(
        &mut self,
        height: Height,
        rep: &ProberepMsg,
        chains: &StageAndConsensus,
    ) -> Result<(), ChainError> {
        if let Some(header) = &rep.requested {
            let theirs = header.block_hash();
            if let Some(ours) = chains.consensus().hash_at(height) {
                if ours == theirs {
                    self.consensus_fork.on_match(height);
                } else {
                    self.consensus_fork.on_mismatch(height);
                }
            }
            if let Some(ours) = chains.stage().hash_at(height) {
                if ours == theirs {
                    self.stage_fork.on_match(height);
                } else {
                    self.stage_fork.on_mismatch(height);
                }
            }
        }
        self.check_worksum(chains)
    }
}

/// Rollback notification payload from the chain server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackData {
    /// The snapshot that forced the rollback.
    pub signed_snapshot: SignedSnapshot,
    /// Consensus length after the rollback.
    pub new_length: Height,
}

/// The loop's mirror of consensus plus the stage candidate.
///
/// Invariant: `stage.total_work() >= consensus.total_work()`; when equal the
/// two chains are identical.
#[derive(Debug)]
pub struct StageAndConsensus {
    params: Params,
    consensus: Headerchain,
    descriptor: Descriptor,
    stage: Headerchain,
    signed_snapshot: Option<SignedSnapshot>,
}

impl StageAndConsensus {
    /// A fresh mirror rooted at the genesis hash.
    pub fn new(genesis_hash: BlockHash, params: Params) -> Self {
        Self::from_consensus(Headerchain::new(genesis_hash), params)
    }

    /// A mirror seeded with an existing consensus chain.
    pub fn from_consensus(consensus: Headerchain, params: Params) -> Self {
        let stage = consensus.clone();
        Self {
            params,
            consensus,
            descriptor: Descriptor::initial(),
            stage,
            signed_snapshot: None,
        }
    }

    /// The accepted chain.
    pub fn consensus(&self) -> &Headerchain {
        &self.consensus
    }

    /// The candidate chain under block download.
    pub fn stage(&self) -> &Headerchain {
        &self.stage
    }

    /// Our chain fingerprint.
    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    /// Consensus parameters.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The best signed snapshot we know.
    pub fn signed_snapshot(&self) -> Option<&SignedSnapshot> {
        self.signed_snapshot.as_ref()
    }

    /// Apply a consensus append and return the broadcast message.
    pub fn update_consensus_append(&mut self, headers: &[Header]) -> Result<AppendMsg, ChainError> {
        self.consensus.append(headers).map_err(|_| ChainError {
            code: ErrorCode::BadWork,
            height: self.consensus.length() + 1,
        })?;
        self.follow_stage();
        Ok(AppendMsg {
            chain_length: self.consensus.length(),
            worksum: self.consensus.total_work(),
        })
    }

    /// Apply a consensus fork and return the broadcast message.
    pub fn update_consensus_fork(
        &mut self,
        fork_height: Height,
        headers: &[Header],
    ) -> Result<ForkMsg, ChainError> {
        self.consensus.shrink(fork_height);
        self.consensus.append(headers).map_err(|_| ChainError {
            code: ErrorCode::BadWork,
            height: fork_height + 1,
        })?;
        self.descriptor = self.descriptor.bumped();
        self.follow_stage();
        Ok(ForkMsg {
            fork_height,
            chain_length: self.consensus.length(),
            worksum: self.consensus.total_work(),
            descriptor: self.descriptor,
        })
    }

    /// Apply a snapshot rollback. Returns the broadcast message if consensus
    /// actually shrank.
    pub fn update_consensus_rollback(
        &mut self,
        rd: &RollbackData,
    ) -> Option<SignedPinRollbackMsg> {
        self.signed_snapshot = Some(rd.signed_snapshot);
        if rd.new_length >= self.consensus.length() {
            return None;
        }
        self.consensus.shrink(rd.new_length);
        self.descriptor = self.descriptor.bumped();
        if self.stage.total_work() < self.consensus.total_work()
            || !rd.signed_snapshot.compatible(&self.stage)
        {
            self.stage = self.consensus.clone();
        }
        Some(SignedPinRollbackMsg {
            signed_snapshot: rd.signed_snapshot,
            shrink_length: rd.new_length,
        })
    }

    /// Replace the stage with a heavier candidate. Returns the fork height
    /// between the candidate and consensus.
    pub fn update_stage(&mut self, candidate: Headerchain) -> Height {
        debug_assert!(candidate.total_work() >= self.consensus.total_work());
        let fork_height = self.fork_height_with_consensus(&candidate);
        self.stage = candidate;
        fork_height
    }

    fn follow_stage(&mut self) {
        if self.stage.total_work() <= self.consensus.total_work() {
            self.stage = self.consensus.clone();
        }
    }

    fn fork_height_with_consensus(&self, other: &Headerchain) -> Height {
        let max = self.consensus.length().min(other.length());
        let mut fork = 0;
        for h in 1..=max {
            if self.consensus.hash_at(h) == other.hash_at(h) {
                fork = h;
            } else {
                break;
            }
        }
        fork
    }
}

/// One block handed to the chain server for staging, tagged with its
/// supplier so chain-level offenses can be attributed.
#[derive(Debug, Clone)]
pub struct StagedBlock {
    /// Block height.
    pub height: Height,
    /// The staged header.
    pub header: Header,
    /// The downloaded body.
    pub body: Body,
    /// Peer that supplied the body.
    pub supplier: ConnectionId,
}

/// A contiguous run of downloaded blocks submitted for validation.
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// Heights covered, inclusive.
    pub range: HeaderRange,
    /// The blocks, in height order.
    pub blocks: NonEmpty<StagedBlock>,
}

/// The chain server, as the loop sees it.
///
/// Synchronous reads are used only for probe and batch replies; everything
/// else is posted to the server's own queue and answered later through the
/// event queue.
pub trait ChainServer {
    /// Read headers for a batch request.
    fn get_headers(&self, selector: &BatchSelector) -> Vec<Header>;
    /// Read a header of a historical descriptor.
    fn get_descriptor_header(&self, descriptor: Descriptor, height: Height) -> Option<Header>;
    /// Fetch bodies for a peer's block request; the reply arrives as an
    /// event.
    fn async_get_blocks(&mut self, con_id: ConnectionId, range: HeaderRange);
    /// Submit downloaded blocks; the verdict arrives as a stage-result
    /// event.
    fn async_stage_request(&mut self, request: StageRequest);
    /// Propagate a leader snapshot.
    fn async_set_signed_checkpoint(&mut self, snapshot: SignedSnapshot);
    /// Forward received transactions to the mempool.
    fn async_put_mempool(&mut self, txs: Vec<Entry>);
    /// Block until the server wound down.
    fn shutdown_join(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use oryx_common::block::chain::SnapshotPriority;
    use oryx_common::block::target::{Target, TargetV1};
    use oryx_common::block::TxRoot;

    fn mk_headers(chain: &Headerchain, n: usize, salt: u32) -> Vec<Header> {
        let mut out = Vec::new();
        let mut prev = chain.tip_hash();
        for i in 0..n {
            let h = Header {
                prev_blockhash: prev,
                target: Target::V1(TargetV1::new(8, 0x00FF_FFFF)),
                merkle_root: TxRoot::all_zeros(),
                version: 1,
                time: 1000 + i as u32 * 600,
                nonce: salt + i as u32,
            };
            prev = h.block_hash();
            out.push(h);
        }
        out
    }

    fn chains_with(n: usize) -> StageAndConsensus {
        let mut chains = StageAndConsensus::new(BlockHash::all_zeros(), Params::default());
        let headers = mk_headers(chains.consensus(), n, 0);
        chains.update_consensus_append(&headers).unwrap();
        chains
    }

    #[test]
    fn test_fork_range_bisection() {
        let mut range = ForkRange::new(1, 101);

        while let Some(h) = range.probe_height() {
            // The probed chain agrees with ours up to height 60.
            if h <= 60 {
                range.on_match(h);
            } else {
                range.on_mismatch(h);
            }
        }
        assert!(range.converged());
        assert_eq!(range.fork_height(), 60);
    }

    #[test]
    fn test_fork_range_probe_strictly_inside() {
        let range = ForkRange::new(5, 6);
        assert_eq!(range.probe_height(), Some(5));

        let converged = ForkRange::converged_at(4);
        assert_eq!(converged.probe_height(), None);
        assert_eq!(converged.fork_height(), 4);
    }

    #[test]
    fn test_stage_follows_consensus() {
        let chains = chains_with(3);

        assert_eq!(chains.stage().length(), 3);
        assert_eq!(chains.stage().total_work(), chains.consensus().total_work());
    }

    #[test]
    fn test_fork_bumps_descriptor() {
        let mut chains = chains_with(5);
        let before = chains.descriptor();
        let branch = {
            let mut base = chains.consensus().clone();
            base.shrink(3);
            mk_headers(&base, 4, 1000)
        };
        let msg = chains.update_consensus_fork(3, &branch).unwrap();

        assert_eq!(msg.fork_height, 3);
        assert_eq!(msg.chain_length, 7);
        assert_eq!(chains.descriptor(), before.bumped());
    }

    #[test]
    fn test_rollback_shrinks_and_pins() {
        let mut chains = chains_with(8);
        // The snapshot pins a block we never had: the stage is dropped too.
        let snapshot = SignedSnapshot {
            priority: SnapshotPriority {
                importance: 5,
                height: 4,
            },
            block_hash: BlockHash([0xCC; 32]),
        };
        let msg = chains
            .update_consensus_rollback(&RollbackData {
                signed_snapshot: snapshot,
                new_length: 4,
            })
            .unwrap();

        assert_eq!(msg.shrink_length, 4);
        assert_eq!(chains.consensus().length(), 4);
        assert_eq!(chains.stage().length(), 4, "incompatible stage is dropped");
        assert_eq!(chains.signed_snapshot().unwrap().priority.importance, 5);
    }

    #[test]
    fn test_rollback_keeps_compatible_heavier_stage() {
        let mut chains = chains_with(8);
        let snapshot = SignedSnapshot {
            priority: SnapshotPriority {
                importance: 5,
                height: 4,
            },
            block_hash: chains.consensus().hash_at(4).unwrap(),
        };
        chains
            .update_consensus_rollback(&RollbackData {
                signed_snapshot: snapshot,
                new_length: 4,
            })
            .unwrap();

        assert_eq!(chains.consensus().length(), 4);
        assert_eq!(
            chains.stage().length(),
            8,
            "a compatible heavier stage survives the rollback"
        );
    }

    #[test]
    fn test_update_stage_fork_height() {
        let mut chains = chains_with(5);
        let mut candidate = chains.consensus().clone();
        candidate.shrink(2);
        let branch = mk_headers(&candidate, 6, 7777);
        candidate.append(&branch).unwrap();

        assert_eq!(chains.update_stage(candidate), 2);
        assert_eq!(chains.stage().length(), 8);
    }

    #[test]
    fn test_peer_chain_init_same_descriptor() {
        let chains = chains_with(5);
        let init = InitMsg {
            descriptor: chains.descriptor(),
            chain_length: 5,
            worksum: chains.consensus().total_work(),
        };
        let view = PeerChain::new(&init, &chains);

        assert!(view.consensus_fork_range().converged());
        assert_eq!(view.consensus_fork_range().fork_height(), 5);
    }

    #[test]
    fn test_peer_chain_append_must_grow() {
        let chains = chains_with(5);
        let init = InitMsg {
            descriptor: Descriptor(9),
            chain_length: 5,
            worksum: chains.consensus().total_work(),
        };
        let mut view = PeerChain::new(&init, &chains);
        let bad = AppendMsg {
            chain_length: 5,
            worksum: chains.consensus().total_work(),
        };

        assert!(view.on_peer_append(&bad, &chains).is_err());
    }

    #[test]
    fn test_peer_chain_proberep_narrows() {
        let chains = chains_with(10);
        let init = InitMsg {
            descriptor: Descriptor(9),
            chain_length: 10,
            worksum: chains.consensus().total_work(),
        };
        let mut view = PeerChain::new(&init, &chains);
        assert!(!view.consensus_fork_range().converged());

        let h = view.consensus_fork_range().probe_height().unwrap();
        let rep = ProberepMsg {
            nonce: 1,
            current_descriptor: Descriptor(9),
            current: chains.consensus().get_header(h).copied(),
            requested: chains.consensus().get_header(h).copied(),
        };
        view.on_proberep(h, &rep, &chains).unwrap();

        assert!(view.consensus_fork_range().lower() > h);
    }
}
