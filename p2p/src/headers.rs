//! Header downloader.
//!
//! Drives two per-peer state machines toward a heavier stage chain:
//!
//! * **Probing** collapses a peer's fork range by bisection, one probe at a
//!   time, until the highest agreed height with our consensus is known.
//! * **Batch requesting** pulls contiguous header runs from peers whose
//!   chains claim strictly more work than the current gate, validating
//!   encoding, proof of work, linkage and declared work.
//!
//! A single *pending* candidate is assembled at a time, identified by its
//! descriptor; any peer advertising that descriptor may serve the next
//! batch. Once the candidate's computed work exceeds the gate and its tip is
//! reached, it is handed out through [`HeaderDownload::pop_data`].
use log::debug;

use oryx_common::block::chain::{AppendError, BatchSelector, Descriptor, Headerchain};
use oryx_common::block::header::{Header, Params};
use oryx_common::block::target::Worksum;
use oryx_common::Height;

use crate::chains::StageAndConsensus;
use crate::error::{ChainError, ErrorCode};
use crate::peer::BatchRequest;
use crate::registry::Connections;
use crate::sender::RequestSender;
use crate::ConnectionId;

/// A candidate chain being assembled.
#[derive(Debug)]
struct Pending {
    descriptor: Descriptor,
    chain: Headerchain,
    target_length: Height,
    target_worksum: Worksum,
    in_flight: Option<ConnectionId>,
}

/// The header download state machine.
#[derive(Debug)]
pub struct HeaderDownload {
    params: Params,
    batch_size: u32,
    min_worksum: Worksum,
    members: std::collections::BTreeSet<ConnectionId>,
    pending: Option<Pending>,
    completed: Option<Headerchain>,
}

impl HeaderDownload {
    /// Create a downloader.
    pub fn new(params: Params, batch_size: u32, min_worksum: Worksum) -> Self {
        Self {
            params,
            batch_size,
            min_worksum,
            members: Default::default(),
            pending: None,
            completed: None,
        }
    }

    /// Register an initialized peer.
    pub fn insert(&mut self, con_id: ConnectionId) {
        self.members.insert(con_id);
    }

    /// Drop a peer. Returns whether it was registered.
    pub fn erase(&mut self, con_id: ConnectionId) -> bool {
        if let Some(pending) = &mut self.pending {
            if pending.in_flight == Some(con_id) {
                pending.in_flight = None;
            }
        }
        self.members.remove(&con_id)
    }

    /// Number of registered peers.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Raise the work gate. Candidates at or below it are discarded.
    pub fn set_min_worksum(&mut self, worksum: Worksum) {
        self.min_worksum = worksum;
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.target_worksum <= worksum)
        {
            self.pending = None;
        }
        if self
            .completed
            .as_ref()
            .is_some_and(|c| c.total_work() <= worksum)
        {
            self.completed = None;
        }
    }

    /// Whether header download still has work to do.
    pub fn is_active(&self, connections: &Connections) -> bool {
        self.pending.is_some()
            || self.completed.is_some()
            || connections.initialized().any(|p| {
                p.chain
                    .as_ref()
                    .is_some_and(|c| c.descripted.worksum > self.min_worksum)
            })
    }

    /// Take a completed heavier chain, if one is ready.
    pub fn pop_data(&mut self) -> Option<Headerchain> {
        self.completed.take()
    }

    /// Issue probes to idle peers whose consensus fork range is open.
    pub fn do_probe_requests(
        &mut self,
        connections: &mut Connections,
        sender: &mut RequestSender,
    ) {
        for peer in connections.initialized_mut() {
            if !peer.job.is_idle() {
                continue;
            }
            let Some(chain) = &peer.chain else { continue };
            if let Some(height) = chain.consensus_fork_range().probe_height() {
                let descriptor = chain.descripted.descriptor;
                sender.send_probe(peer, descriptor, height);
            }
        }
    }

    /// Issue the next header-batch request, selecting or re-selecting the
    /// pending candidate as needed.
    pub fn do_header_requests(
        &mut self,
        connections: &mut Connections,
        sender: &mut RequestSender,
        chains: &StageAndConsensus,
    ) {
        if self.completed.is_some() {
            return;
        }
        // A candidate nobody can serve anymore is abandoned.
        if let Some(pending) = &self.pending {
            if pending.in_flight.is_none() && self.serving_peer(connections, pending).is_none() {
                debug!(target: "p2p", "abandoning header candidate with descriptor {}", pending.descriptor);
                self.pending = None;
            }
        }
        if self.pending.is_none() {
            self.pending = self.select_candidate(connections, chains);
        }
        let Some(pending) = &mut self.pending else {
            return;
        };
        if pending.in_flight.is_some() || sender.finished() {
            return;
        }
        let start = pending.chain.length() + 1;
        if start > pending.target_length {
            return;
        }
        let length = self.batch_size.min(pending.target_length - start + 1);
        let selector = BatchSelector {
            descriptor: pending.descriptor,
            start,
            length,
        };
        // Eligible servers, best work first, connection id breaking ties.
        let mut servers: Vec<_> = connections
            .initialized_mut()
            .filter(|p| p.job.is_idle())
            .filter(|p| {
                p.chain.as_ref().is_some_and(|c| {
                    c.descripted.descriptor == selector.descriptor
                        && c.descripted.length >= selector.end() - 1
                })
            })
            .collect();
        servers.sort_by(|a, b| {
            let wa = a.chain.as_ref().map(|c| c.descripted.worksum);
            let wb = b.chain.as_ref().map(|c| c.descripted.worksum);
            wb.cmp(&wa).then(a.con.id.cmp(&b.con.id))
        });
        if let Some(peer) = servers.into_iter().next() {
            pending.in_flight = Some(peer.con.id);
            sender.send_batch(peer, selector);
        }
    }

    /// Validate and absorb a header batch.
    ///
    /// Stale replies (the candidate moved on) are ignored. A validation
    /// failure discards the candidate and reports the peer.
    pub fn on_response(
        &mut self,
        con_id: ConnectionId,
        req: BatchRequest,
        batch: Vec<Header>,
        chains: &StageAndConsensus,
    ) -> Result<(), ChainError> {
        let Some(pending) = &mut self.pending else {
            return Ok(());
        };
        if pending.in_flight != Some(con_id)
            || req.selector.descriptor != pending.descriptor
            || req.selector.start != pending.chain.length() + 1
        {
            return Ok(());
        }
        pending.in_flight = None;

        let result = Self::absorb(&self.params, pending, &req, batch);
        match result {
            Ok(()) => {
                if pending.chain.length() >= pending.target_length {
                    if pending.chain.total_work() != pending.target_worksum {
                        let height = pending.target_length;
                        self.pending = None;
                        return Err(ChainError {
                            code: ErrorCode::BadWork,
                            height,
                        });
                    }
                    let done = self.pending.take().expect("pending exists");
                    if done.chain.total_work() > self.min_worksum
                        && done.chain.total_work() > chains.consensus().total_work()
                    {
                        self.completed = Some(done.chain);
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.pending = None;
                Err(e)
            }
        }
    }

    fn absorb(
        params: &Params,
        pending: &mut Pending,
        req: &BatchRequest,
        batch: Vec<Header>,
    ) -> Result<(), ChainError> {
        let start = req.selector.start;
        let mut prev_target = pending.chain.get_header(start - 1).map(|h| h.target);
        for (i, header) in batch.iter().enumerate() {
            let height = start + i as Height;
            let err = |code| ChainError { code, height };
            if !params.encoding_ok(height, &header.target) || !header.target.valid() {
                return Err(err(ErrorCode::BadWork));
            }
            if let Some(prev) = prev_target {
                if header.target != prev && !params.retarget_boundary(height) {
                    return Err(err(ErrorCode::BadWork));
                }
            }
            if !header.pow_ok() {
                return Err(err(ErrorCode::BadWork));
            }
            prev_target = Some(header.target);
        }
        pending.chain.append(&batch).map_err(|e| match e {
            AppendError::BrokenLink(height) => ChainError {
                code: ErrorCode::BadWork,
                height,
            },
        })
    }

    /// The peer's batch request expired; free the candidate's slot.
    pub fn on_request_expire(&mut self, con_id: ConnectionId, _req: &BatchRequest) {
        if let Some(pending) = &mut self.pending {
            if pending.in_flight == Some(con_id) {
                pending.in_flight = None;
            }
        }
    }

    /// A probe request expired. The peer's fork range is unchanged; the
    /// probe is re-issued on the next planning pass.
    pub fn on_probe_expire(&mut self, _con_id: ConnectionId) {}

    fn serving_peer(&self, connections: &Connections, pending: &Pending) -> Option<ConnectionId> {
        connections
            .initialized()
            .filter(|p| {
                p.chain.as_ref().is_some_and(|c| {
                    c.descripted.descriptor == pending.descriptor
                        && c.descripted.length >= pending.target_length
                })
            })
            .map(|p| p.con.id)
            .next()
    }

    fn select_candidate(
        &self,
        connections: &Connections,
        chains: &StageAndConsensus,
    ) -> Option<Pending> {
        let mut candidates: Vec<_> = connections
            .initialized()
            .filter_map(|p| p.chain.as_ref().map(|c| (p.con.id, c)))
            .filter(|(_, c)| c.descripted.worksum > self.min_worksum)
            .filter(|(_, c)| c.consensus_fork_range().converged())
            .collect();
        candidates.sort_by(|(ida, a), (idb, b)| {
            b.descripted
                .worksum
                .cmp(&a.descripted.worksum)
                .then(ida.cmp(idb))
        });
        let (_, view) = candidates.first()?;
        let fork_height = view.consensus_fork_range().fork_height();
        let mut chain = chains.consensus().clone();
        chain.shrink(fork_height);
        debug!(
            target: "p2p",
            "new header candidate: descriptor {}, heights [{},{}]",
            view.descripted.descriptor,
            fork_height + 1,
            view.descripted.length
        );
        Some(Pending {
            descriptor: view.descripted.descriptor,
            chain,
            target_length: view.descripted.length,
            target_worksum: view.descripted.worksum,
            in_flight: None,
        })
    }
}
