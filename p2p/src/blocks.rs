//! Block downloader.
//!
//! Consumes a staged header chain and fans body requests out across peers:
//! a sliding focus window of heights is kept filled with per-peer range
//! assignments (pairwise disjoint by construction), replies are validated
//! against the staged headers, and every completed contiguous prefix is
//! submitted to the chain server. The chain server's verdict advances the
//! window or returns offenders.
use std::collections::BTreeMap;

use log::debug;

use oryx_common::block::chain::{HeaderRange, Headerchain};
use oryx_common::block::target::Worksum;
use oryx_common::block::Body;
use oryx_common::Height;

use crate::chains::{StageRequest, StagedBlock};
use crate::error::{ChainOffender, ErrorCode};
use crate::peer::BlockRequest;
use crate::registry::Connections;
use crate::sender::RequestSender;
use crate::ConnectionId;

#[derive(Debug)]
enum Slot {
    Pending,
    Assigned(ConnectionId),
    Received { body: Body, supplier: ConnectionId },
}

#[derive(Debug)]
struct Active {
    chain: Headerchain,
    focus_lower: Height,
    submitted_upto: Height,
    slots: BTreeMap<Height, Slot>,
}

/// The block download state machine.
#[derive(Debug)]
pub struct BlockDownload {
    window: u32,
    max_range: u32,
    min_worksum: Worksum,
    state: Option<Active>,
}

impl BlockDownload {
    /// Create a downloader with the given focus window width and maximum
    /// heights per request.
    pub fn new(window: u32, max_range: u32) -> Self {
        Self {
            window,
            max_range,
            min_worksum: Worksum::zero(),
            state: None,
        }
    }

    /// Start downloading bodies for a freshly staged chain. Bodies at or
    /// below `fork_height` are already part of consensus.
    pub fn init(&mut self, chain: Headerchain, fork_height: Height) {
        if fork_height >= chain.length() {
            self.state = None;
            return;
        }
        debug!(
            target: "p2p",
            "block download [{},{}]",
            fork_height + 1,
            chain.length()
        );
        self.state = Some(Active {
            chain,
            focus_lower: fork_height + 1,
            submitted_upto: fork_height,
            slots: BTreeMap::new(),
        });
    }

    /// Abandon the download (stage replaced, incompatible snapshot, or
    /// rollback).
    pub fn reset(&mut self) {
        self.state = None;
    }

    /// Whether a download is in progress.
    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    /// Work of the chain this download would complete, if any.
    pub fn reachable_worksum(&self) -> Worksum {
        self.state
            .as_ref()
            .map(|a| a.chain.total_work())
            .unwrap_or_default()
    }

    /// Gate peers below this claimed work out of body serving.
    pub fn set_min_worksum(&mut self, worksum: Worksum) {
        self.min_worksum = worksum;
    }

    /// Assign unclaimed heights of the focus window to idle eligible peers.
    pub fn do_block_requests(&mut self, connections: &mut Connections, sender: &mut RequestSender) {
        let min_worksum = self.min_worksum;
        let max_range = self.max_range;
        let Some(active) = &mut self.state else {
            return;
        };
        let focus_upper = (active.focus_lower + self.window - 1).min(active.chain.length());
        for height in active.focus_lower..=focus_upper {
            active.slots.entry(height).or_insert(Slot::Pending);
        }

        let mut peers: Vec<_> = connections
            .initialized_mut()
            .filter(|p| p.job.is_idle())
            .filter(|p| {
                p.chain
                    .as_ref()
                    .is_some_and(|c| c.descripted.worksum >= min_worksum)
            })
            .collect();
        peers.sort_by(|a, b| {
            let wa = a.chain.as_ref().map(|c| c.descripted.worksum);
            let wb = b.chain.as_ref().map(|c| c.descripted.worksum);
            wb.cmp(&wa).then(a.con.id.cmp(&b.con.id))
        });

        for peer in peers {
            if sender.finished() {
                break;
            }
            let reach = peer
                .chain
                .as_ref()
                .map(|c| c.descripted.length)
                .unwrap_or_default();
            let Some(range) = Self::lowest_unassigned_run(&active.slots, max_range, reach) else {
                continue;
            };
            for height in range.lower..=range.upper {
                active.slots.insert(height, Slot::Assigned(peer.con.id));
            }
            sender.send_blocks(peer, range);
        }
    }

    fn lowest_unassigned_run(
        slots: &BTreeMap<Height, Slot>,
        max_range: u32,
        reach: Height,
    ) -> Option<HeaderRange> {
        let mut run: Option<HeaderRange> = None;
        for (&height, slot) in slots {
            if height > reach {
                break;
            }
            let pending = matches!(slot, Slot::Pending);
            match run {
                None if pending => run = Some(HeaderRange::new(height, height)),
                None => {}
                Some(ref mut r) if pending && height == r.upper + 1 && r.len() < max_range => {
                    r.upper = height;
                }
                Some(_) => break,
            }
        }
        run
    }

    /// Validate a body reply against the staged headers and store it.
    pub fn on_blockreq_reply(
        &mut self,
        con_id: ConnectionId,
        req: &BlockRequest,
        blocks: Vec<Body>,
    ) -> Result<(), ErrorCode> {
        let Some(active) = &mut self.state else {
            return Ok(());
        };
        if blocks.len() != req.range.len() as usize {
            return Err(ErrorCode::InvBody);
        }
        for (i, body) in blocks.into_iter().enumerate() {
            let height = req.range.lower + i as Height;
            if !body.within_size_bound() {
                return Err(ErrorCode::BlockSize);
            }
            let Some(header) = active.chain.get_header(height) else {
                continue;
            };
            if body.merkle_root() != header.merkle_root {
                return Err(ErrorCode::InvBody);
            }
            match active.slots.get(&height) {
                Some(Slot::Assigned(id)) if *id == con_id => {
                    active.slots.insert(
                        height,
                        Slot::Received {
                            body,
                            supplier: con_id,
                        },
                    );
                }
                Some(Slot::Pending) => {
                    active.slots.insert(
                        height,
                        Slot::Received {
                            body,
                            supplier: con_id,
                        },
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Take the completed contiguous prefix for submission, if any.
    pub fn pop_stage(&mut self) -> Option<StageRequest> {
        let active = self.state.as_mut()?;
        let mut blocks = Vec::new();
        let mut height = active.focus_lower;
        while let Some(Slot::Received { .. }) = active.slots.get(&height) {
            let Some(Slot::Received { body, supplier }) = active.slots.remove(&height) else {
                unreachable!()
            };
            let header = *active.chain.get_header(height).expect("staged header");
            blocks.push(StagedBlock {
                height,
                header,
                body,
                supplier,
            });
            height += 1;
        }
        let blocks = nonempty::NonEmpty::from_vec(blocks)?;
        let range = HeaderRange::new(active.focus_lower, height - 1);
        active.focus_lower = height;
        active.submitted_upto = range.upper;
        Some(StageRequest { range, blocks })
    }

    /// Absorb the chain server's verdict. Returns the offenders to close.
    pub fn on_stage_result(
        &mut self,
        accepted_upto: Height,
        offenders: &[ChainOffender],
    ) -> Vec<ChainOffender> {
        let Some(active) = &mut self.state else {
            return offenders.to_vec();
        };
        if accepted_upto >= active.chain.length() {
            // Everything reached the chain server; the consensus update
            // arrives separately.
            self.state = None;
            return offenders.to_vec();
        }
        if !offenders.is_empty() && accepted_upto < active.submitted_upto {
            // Validation stopped early: everything past the accepted
            // prefix must be fetched again.
            active.focus_lower = accepted_upto + 1;
            active.submitted_upto = accepted_upto;
            let culprits: Vec<ConnectionId> =
                offenders.iter().map(|o| o.con_id).collect();
            active.slots.retain(|_, slot| match slot {
                Slot::Received { supplier, .. } => !culprits.contains(supplier),
                _ => true,
            });
        }
        offenders.to_vec()
    }

    /// Release a peer's assignments back into the pool.
    pub fn on_blockreq_expire(&mut self, con_id: ConnectionId) {
        self.release(con_id);
    }

    /// Drop a peer. Returns whether its assignments were released.
    pub fn erase(&mut self, con_id: ConnectionId) -> bool {
        self.release(con_id)
    }

    fn release(&mut self, con_id: ConnectionId) -> bool {
        let Some(active) = &mut self.state else {
            return false;
        };
        let mut released = false;
        for slot in active.slots.values_mut() {
            if matches!(slot, Slot::Assigned(id) if *id == con_id) {
                *slot = Slot::Pending;
                released = true;
            }
        }
        released
    }

    /// Invariant check: no two peers hold overlapping assignments.
    #[cfg(test)]
    fn assignments(&self) -> Vec<(Height, ConnectionId)> {
        self.state
            .as_ref()
            .map(|a| {
                a.slots
                    .iter()
                    .filter_map(|(h, s)| match s {
                        Slot::Assigned(id) => Some((*h, *id)),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
