//! The event loop.
//!
//! One worker thread owns every peer record, both downloaders and the timer
//! wheel. All cross-thread input arrives through the event queue; handlers
//! run to completion and never block. Within one tick, expired timers fire
//! before queued events; across ticks, event insertion order is preserved.
use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_channel as chan;
use log::{debug, info, warn};

use oryx_common::block::chain::Headerchain;
use oryx_common::block::header::{Header, Params};
use oryx_common::time::{LocalDuration, LocalTime};
use oryx_common::Height;

use crate::addrmgr::AddressManager;
use crate::api::{Handle, HashrateInfo, PeerInfo};
use crate::blocks::BlockDownload;
use crate::chains::{ChainServer, PeerChain, RollbackData, StageAndConsensus};
use crate::error::{ChainOffender, ErrorCode};
use crate::event::{ChainAction, Event, Inspector, StageResult, StateUpdate};
use crate::headers::HeaderDownload;
use crate::mempool::{Action, Entry, Log, Mempool};
use crate::message::{
    AppendMsg, BatchrepMsg, BatchreqMsg, BlockrepMsg, BlockreqMsg, ForkMsg, Inbound, InitMsg,
    LeaderMsg, Message, PingMsg, PongMsg, ProberepMsg, ProbereqMsg, SignedPinRollbackMsg,
    TxnotifyMsg, TxrepMsg, TxreqMsg,
};
use crate::peer::{BatchRequest, Connection, Dialer, Job, PingState, ThrottleOutcome, Transport as _};
use crate::queue::EventQueue;
use crate::registry::Connections;
use crate::sender::RequestSender;
use crate::timer::{Timer, TimerEvent, TimerHandle};
use crate::ConnectionId;

/// Loop configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Consensus parameters.
    pub params: Params,
    /// Pinned addresses to dial at startup.
    pub connect: Vec<SocketAddr>,
    /// Target number of outbound connections.
    pub target_outbound: usize,
    /// Cap on concurrently outstanding counted requests.
    pub max_requests: usize,
    /// Headers per batch request.
    pub header_batch_size: u32,
    /// Width of the block download focus window.
    pub block_window: u32,
    /// Maximum heights per block request.
    pub block_batch_size: u32,
    /// How long a fresh peer has to deliver INIT.
    pub init_timeout: LocalDuration,
    /// How long a peer has to answer a request before it expires.
    pub reply_timeout: LocalDuration,
    /// Grace window after expiry before the peer is closed.
    pub reply_grace: LocalDuration,
    /// Sleep between a pong and the next ping.
    pub ping_sleep: LocalDuration,
    /// How long to wait for a pong.
    pub pong_timeout: LocalDuration,
    /// Minimum gap between header-batch replies.
    pub batch_reply_throttle: LocalDuration,
    /// Minimum gap between block replies.
    pub block_reply_throttle: LocalDuration,
    /// Minimum gap between transaction replies.
    pub tx_reply_throttle: LocalDuration,
    /// Addresses requested per ping, and cap on addresses served per pong.
    pub max_addresses: u16,
    /// Transaction ids requested per ping.
    pub max_transactions: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            params: Params::default(),
            connect: Vec::new(),
            target_outbound: 8,
            max_requests: 10,
            header_batch_size: 800,
            block_window: 64,
            block_batch_size: 8,
            init_timeout: LocalDuration::from_secs(30),
            reply_timeout: LocalDuration::from_secs(30),
            reply_grace: LocalDuration::from_mins(2),
            ping_sleep: LocalDuration::from_secs(10),
            pong_timeout: LocalDuration::from_mins(1),
            batch_reply_throttle: LocalDuration::from_secs(2),
            block_reply_throttle: LocalDuration::from_secs(1),
            tx_reply_throttle: LocalDuration::from_secs(1),
            max_addresses: 20,
            max_transactions: 8,
        }
    }
}

/// Published sync verdict, recomputed at the end of every tick.
#[derive(Debug, Default)]
struct SyncState {
    has_connections: bool,
    header_active: bool,
    block_active: bool,
    published: Option<bool>,
}

impl SyncState {
    fn synced(&self) -> bool {
        self.has_connections && !self.header_active && !self.block_active
    }

    /// Absorb the new inputs; returns the verdict if it changed.
    fn update(&mut self, has_connections: bool, header: bool, block: bool) -> Option<bool> {
        self.has_connections = has_connections;
        self.header_active = header;
        self.block_active = block;
        let synced = self.synced();
        if self.published != Some(synced) {
            self.published = Some(synced);
            Some(synced)
        } else {
            None
        }
    }
}

enum ExpiredJob {
    Probe,
    Batch(BatchRequest),
    Blocks,
    None,
}

/// The peer coordination core.
pub struct Eventloop<S, D> {
    chain_server: S,
    dialer: D,
    queue: Arc<EventQueue>,
    config: Config,
    clock: LocalTime,
    rng: fastrand::Rng,
    timer: Timer,
    wakeup_timer: Option<TimerHandle>,
    chains: StageAndConsensus,
    mempool: Mempool,
    connections: Connections,
    addrmgr: AddressManager,
    header_download: HeaderDownload,
    block_download: BlockDownload,
    active_requests: usize,
    sync_state: SyncState,
    on_sync_change: Option<chan::Sender<bool>>,
}

impl<S: ChainServer, D: Dialer> Eventloop<S, D> {
    /// Build a loop around an existing consensus chain.
    pub fn new(
        chain_server: S,
        dialer: D,
        consensus: Headerchain,
        config: Config,
        rng: fastrand::Rng,
    ) -> Self {
        let chains = StageAndConsensus::from_consensus(consensus, config.params);
        let addrmgr = AddressManager::new(
            config.connect.clone(),
            config.target_outbound,
            rng.clone(),
        );
        let header_download = HeaderDownload::new(
            config.params,
            config.header_batch_size,
            chains.consensus().total_work(),
        );
        let block_download = BlockDownload::new(config.block_window, config.block_batch_size);
        info!(
            target: "p2p",
            "chain info: length {}, work {}",
            chains.consensus().length(),
            chains.consensus().total_work()
        );

        Self {
            chain_server,
            dialer,
            queue: Arc::new(EventQueue::new()),
            config,
            clock: LocalTime::default(),
            rng,
            timer: Timer::new(),
            wakeup_timer: None,
            chains,
            mempool: Mempool::new(),
            connections: Connections::new(),
            addrmgr,
            header_download,
            block_download,
            active_requests: 0,
            sync_state: SyncState::default(),
            on_sync_change: None,
        }
    }

    /// Publish sync-state transitions to the given channel.
    pub fn on_sync_change(&mut self, tx: chan::Sender<bool>) {
        self.on_sync_change = Some(tx);
    }

    /// A handle other threads can defer events through.
    pub fn handle(&self) -> Handle {
        Handle::new(self.queue.clone())
    }

    /// Spawn the worker thread.
    pub fn start(self) -> std::thread::JoinHandle<()>
    where
        S: Send + 'static,
        D: 'static,
    {
        std::thread::Builder::new()
            .name("eventloop".into())
            .spawn(move || self.run())
            .expect("spawning the loop thread")
    }

    /// Run until shutdown.
    pub fn run(mut self) {
        self.clock = LocalTime::now();
        self.connect_scheduled();
        self.update_wakeup();
        loop {
            let drained = self.queue.wait(self.timer.next_deadline());
            self.clock = LocalTime::now();
            let shutdown = drained.shutdown;
            self.work(drained.events.into_iter().collect());
            if let Some(reason) = shutdown {
                self.shutdown(reason);
                return;
            }
        }
    }

    /// Advance the loop by one input, at the given time. Expired timers
    /// fire first, as in the run loop.
    pub fn step(&mut self, now: LocalTime, event: Event) {
        self.clock = now;
        self.work(vec![event]);
    }

    /// Fire whatever timers are due at the given time.
    pub fn advance(&mut self, now: LocalTime) {
        self.clock = now;
        self.work(Vec::new());
    }

    fn work(&mut self, events: Vec<Event>) {
        for expired in self.timer.pop_expired(self.clock) {
            self.handle_timeout(expired);
        }
        for event in events {
            self.handle_event(event);
        }
        self.connections.garbage_collect();
        self.update_sync_state();
    }

    fn shutdown(&mut self, reason: ErrorCode) {
        debug!(target: "p2p", "shutdown: closing {} connections", self.connections.len());
        for id in self.connections.ids() {
            self.close(id, reason);
        }
        self.connections.garbage_collect();
        self.chain_server.shutdown_join();
    }

    // ---- accessors ------------------------------------------------------

    /// The consensus chain mirror.
    pub fn consensus(&self) -> &Headerchain {
        self.chains.consensus()
    }

    /// The chain mirror.
    pub fn chains(&self) -> &StageAndConsensus {
        &self.chains
    }

    /// The peer registry.
    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    /// Current sync verdict.
    pub fn synced(&self) -> bool {
        self.sync_state.synced()
    }

    /// Requests currently held against the cap.
    pub fn active_requests(&self) -> usize {
        self.active_requests
    }

    /// The timer wheel.
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    // ---- event dispatch -------------------------------------------------

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::NewConnection(con) => self.handle_new_connection(con),
            Event::Message { con_id, inbound } => self.handle_message(con_id, inbound),
            Event::Released { con_id, error } => {
                if self.connections.find(con_id).is_some() {
                    self.erase(con_id, error);
                }
            }
            Event::StateUpdate(update) => self.handle_state_update(update),
            Event::StageResult(result) => self.handle_stage_result(result),
            Event::ForwardBlockRep { con_id, blocks } => {
                let nonce = match self.connections.find(con_id) {
                    Some(peer) => peer.last_nonce,
                    None => return,
                };
                let gap = self.config.block_reply_throttle;
                self.send_throttled(con_id, Message::BlockRep(BlockrepMsg { nonce, blocks }), gap);
            }
            Event::FailedOutbound(addr) => {
                if self.addrmgr.on_failed_outbound(addr, self.clock) {
                    self.update_wakeup();
                }
                self.connect_scheduled();
            }
            Event::PinAddress(addr) => {
                self.addrmgr.pin(addr, self.clock);
                self.update_wakeup();
            }
            Event::UnpinAddress(addr) => {
                self.addrmgr.unpin(addr);
                self.update_wakeup();
            }
            Event::MempoolLog(log) => self.handle_mempool_log(log),
            Event::GetPeers(reply) => {
                let peers = self.peer_infos();
                reply.send(peers).ok();
            }
            Event::GetSynced(reply) => {
                reply.send(self.sync_state.synced()).ok();
            }
            Event::GetHashrate { n, reply } => {
                reply
                    .send(HashrateInfo {
                        n_blocks: n,
                        estimate: self.chains.consensus().hashrate(n),
                    })
                    .ok();
            }
            Event::GetHashrateChart {
                from,
                to,
                window,
                reply,
            } => {
                reply
                    .send(self.chains.consensus().hashrate_chart(from, to, window))
                    .ok();
            }
            Event::GetSignedSnapshot(reply) => {
                let result = self
                    .chains
                    .signed_snapshot()
                    .copied()
                    .ok_or(ErrorCode::NotFound);
                reply.send(result).ok();
            }
            Event::Inspect(f) => {
                f(Inspector {
                    chains: &self.chains,
                    connections: &self.connections,
                    timer: &self.timer,
                    active_requests: self.active_requests,
                    synced: self.sync_state.synced(),
                });
            }
        }
    }

    fn handle_new_connection(&mut self, con: Connection) {
        let addr = con.addr;
        let link = con.link;
        let id = con.id;
        let init_timer =
            self.timer
                .insert(self.clock, self.config.init_timeout, TimerEvent::CloseNoReply(id));
        match self.connections.insert(con, init_timer, self.clock) {
            Ok(id) => {
                self.addrmgr.on_connected(addr, link);
                self.update_wakeup();
                self.connect_scheduled();
                debug!(target: "p2p", "{} connected ({:?})", addr, id);
                self.send_init(id);
            }
            Err((con, code)) => {
                self.timer.cancel(init_timer);
                con.transport.close(code);
            }
        }
    }

    fn handle_message(&mut self, con_id: ConnectionId, inbound: Inbound) {
        if self.connections.find(con_id).is_none() {
            return;
        }
        if let Err(code) = self.dispatch_message(con_id, inbound) {
            self.close(con_id, code);
            self.do_requests();
        }
    }

    fn dispatch_message(&mut self, con_id: ConnectionId, inbound: Inbound) -> Result<(), ErrorCode> {
        if !inbound.frame.verify() {
            return Err(ErrorCode::Checksum);
        }
        let msg = inbound.msg;
        // The first message must be INIT, and only the first.
        let awaiting_init = self
            .connections
            .find(con_id)
            .map(|p| p.job.awaiting_init())
            .unwrap_or(false);
        match (&msg, awaiting_init) {
            (Message::Init(_), false) => return Err(ErrorCode::InvInit),
            (Message::Init(_), true) => {}
            (_, true) => {
                warn!(target: "p2p", "{:?}: expected init, got {}", con_id, msg.name());
                return Err(ErrorCode::NoInit);
            }
            (_, false) => {}
        }
        debug!(target: "p2p", "{:?} handle {}", con_id, msg.name());
        match msg {
            Message::Init(m) => self.handle_init(con_id, m),
            Message::Ping(m) => self.handle_ping(con_id, m),
            Message::Pong(m) => self.handle_pong(con_id, m),
            Message::BatchReq(m) => self.handle_batchreq(con_id, m),
            Message::BatchRep(m) => self.handle_batchrep(con_id, m),
            Message::ProbeReq(m) => self.handle_probereq(con_id, m),
            Message::ProbeRep(m) => self.handle_proberep(con_id, m),
            Message::BlockReq(m) => self.handle_blockreq(con_id, m),
            Message::BlockRep(m) => self.handle_blockrep(con_id, m),
            Message::Append(m) => self.handle_append(con_id, m),
            Message::Fork(m) => self.handle_fork(con_id, m),
            Message::SignedPinRollback(m) => self.handle_rollback(con_id, m),
            Message::TxNotify(m) => self.handle_txnotify(con_id, m),
            Message::TxReq(m) => self.handle_txreq(con_id, m),
            Message::TxRep(m) => self.handle_txrep(con_id, m),
            Message::Leader(m) => self.handle_leader(con_id, m),
        }
    }

    // ---- message handlers -----------------------------------------------

    fn handle_init(&mut self, con_id: ConnectionId, m: InitMsg) -> Result<(), ErrorCode> {
        let (timer, addr) = {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            let timer = peer.job.timer().expect("awaiting-init job carries a timer");
            peer.job = Job::Idle;
            peer.chain = Some(PeerChain::new(&m, &self.chains));
            (timer, peer.con.addr)
        };
        self.timer.cancel(timer);
        self.addrmgr.mark_verified(addr);
        self.header_download.insert(con_id);
        info!(
            target: "p2p",
            "Connected to {} peers (new peer {})",
            self.header_download.size(),
            addr
        );
        self.send_ping_await_pong(con_id);
        self.do_requests();
        Ok(())
    }

    fn handle_ping(&mut self, con_id: ConnectionId, m: PingMsg) -> Result<(), ErrorCode> {
        {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            peer.ping_limiter.ping(self.clock)?;
            if peer.their_snapshot_priority < m.snapshot_priority {
                peer.their_snapshot_priority = m.snapshot_priority;
            }
        }
        let n = m.max_addresses.min(self.config.max_addresses) as usize;
        let addresses = self.addrmgr.sample_verified(n);
        let txids = self.mempool.sample(m.max_transactions as usize);
        debug!(target: "p2p", "{:?}: answering ping with {} addresses", con_id, addresses.len());
        if let Some(peer) = self.connections.find(con_id) {
            peer.send(Message::Pong(PongMsg {
                nonce: m.nonce,
                addresses,
                txids,
            }));
        }
        self.consider_send_snapshot(con_id);
        Ok(())
    }

    fn handle_pong(&mut self, con_id: ConnectionId, m: PongMsg) -> Result<(), ErrorCode> {
        let acked = {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            peer.ping.check(&m)?
        };
        self.received_pong_sleep_ping(con_id);
        let unseen = self.mempool.filter_new(&m.txids);
        {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            if peer.acknowledged_snapshot_priority < acked {
                peer.acknowledged_snapshot_priority = acked;
            }
            if !unseen.is_empty() {
                peer.send(Message::TxReq(TxreqMsg { txids: unseen }));
            }
        }
        if self.addrmgr.queue_verification(&m.addresses, self.clock) {
            self.update_wakeup();
        }
        self.connect_scheduled();
        Ok(())
    }

    fn handle_batchreq(&mut self, con_id: ConnectionId, m: BatchreqMsg) -> Result<(), ErrorCode> {
        let batch = if m.selector.descriptor == self.chains.descriptor() {
            self.chains
                .consensus()
                .get_headers(m.selector.start, m.selector.end())
        } else {
            self.chain_server.get_headers(&m.selector)
        };
        let gap = self.config.batch_reply_throttle;
        self.send_throttled(
            con_id,
            Message::BatchRep(BatchrepMsg {
                nonce: m.nonce,
                batch,
            }),
            gap,
        );
        Ok(())
    }

    fn handle_batchrep(&mut self, con_id: ConnectionId, m: BatchrepMsg) -> Result<(), ErrorCode> {
        let (req, timer, active) = {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            peer.job.pop_batch(m.nonce)?
        };
        self.timer.cancel(timer);
        if active {
            self.active_requests -= 1;
        }
        let len = m.batch.len() as u32;
        if len < req.min_return || len > req.max_return {
            warn!(
                target: "p2p",
                "{:?}: batch of {} outside [{},{}]",
                con_id, len, req.min_return, req.max_return
            );
            return Err(ErrorCode::BatchSize);
        }
        if let Err(e) = self
            .header_download
            .on_response(con_id, req, m.batch, &self.chains)
        {
            warn!(target: "p2p", "{:?}: bad header batch: {}", con_id, e);
            return Err(e.code);
        }
        self.initialize_block_download();
        self.do_requests();
        Ok(())
    }

    fn handle_probereq(&mut self, con_id: ConnectionId, m: ProbereqMsg) -> Result<(), ErrorCode> {
        let current = self.chains.consensus().get_header(m.height).copied();
        let requested = if m.descriptor == self.chains.descriptor() {
            current
        } else {
            self.chain_server.get_descriptor_header(m.descriptor, m.height)
        };
        let rep = ProberepMsg {
            nonce: m.nonce,
            current_descriptor: self.chains.descriptor(),
            current,
            requested,
        };
        self.send_throttled(con_id, Message::ProbeRep(rep), LocalDuration::from_secs(0));
        Ok(())
    }

    fn handle_proberep(&mut self, con_id: ConnectionId, m: ProberepMsg) -> Result<(), ErrorCode> {
        let (req, timer, active) = {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            peer.job.pop_probe(m.nonce)?
        };
        self.timer.cancel(timer);
        if active {
            self.active_requests -= 1;
        }
        {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            let Some(chain) = peer.chain.as_mut() else {
                return Err(ErrorCode::Unrequested);
            };
            if m.requested.is_none()
                && req.descriptor == chain.descripted.descriptor
                && req.height <= chain.descripted.length
            {
                return Err(ErrorCode::Empty);
            }
            chain
                .on_proberep(req.height, &m, &self.chains)
                .map_err(|e| e.code)?;
        }
        self.do_requests();
        Ok(())
    }

    fn handle_blockreq(&mut self, con_id: ConnectionId, m: BlockreqMsg) -> Result<(), ErrorCode> {
        {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            peer.last_nonce = m.nonce;
        }
        self.chain_server.async_get_blocks(con_id, m.range);
        Ok(())
    }

    fn handle_blockrep(&mut self, con_id: ConnectionId, m: BlockrepMsg) -> Result<(), ErrorCode> {
        let (req, timer, active) = {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            peer.job.pop_blocks(m.nonce)?
        };
        self.timer.cancel(timer);
        if active {
            self.active_requests -= 1;
        }
        self.block_download
            .on_blockreq_reply(con_id, &req, m.blocks)?;
        self.process_blockdownload_stage();
        self.do_requests();
        Ok(())
    }

    fn handle_append(&mut self, con_id: ConnectionId, m: AppendMsg) -> Result<(), ErrorCode> {
        {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            let Some(chain) = peer.chain.as_mut() else {
                return Ok(());
            };
            chain.on_peer_append(&m, &self.chains).map_err(|e| e.code)?;
        }
        self.do_requests();
        Ok(())
    }

    fn handle_fork(&mut self, con_id: ConnectionId, m: ForkMsg) -> Result<(), ErrorCode> {
        {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            let Some(chain) = peer.chain.as_mut() else {
                return Ok(());
            };
            chain.on_peer_fork(&m, &self.chains).map_err(|e| e.code)?;
        }
        self.do_requests();
        Ok(())
    }

    fn handle_rollback(
        &mut self,
        con_id: ConnectionId,
        m: SignedPinRollbackMsg,
    ) -> Result<(), ErrorCode> {
        {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            let Some(chain) = peer.chain.as_mut() else {
                return Ok(());
            };
            // A rollback must shrink, and must not claim to abandon a chain
            // segment the snapshot is actually compatible with.
            if chain.descripted.length <= m.shrink_length {
                return Err(ErrorCode::BadRollbackLen);
            }
            let ss = &m.signed_snapshot;
            if chain.stage_fork_range().lower() > ss.priority.height {
                if ss.compatible(self.chains.stage()) {
                    return Err(ErrorCode::BadRollback);
                }
            } else if chain.consensus_fork_range().lower() > ss.priority.height
                && ss.compatible(self.chains.consensus())
            {
                return Err(ErrorCode::BadRollback);
            }
            chain.on_peer_shrink(&m, &self.chains);
        }
        self.do_requests();
        Ok(())
    }

    fn handle_txnotify(&mut self, con_id: ConnectionId, m: TxnotifyMsg) -> Result<(), ErrorCode> {
        let unseen = self.mempool.filter_new(&m.txids);
        if !unseen.is_empty() {
            if let Some(peer) = self.connections.find(con_id) {
                peer.send(Message::TxReq(TxreqMsg { txids: unseen }));
            }
        }
        self.do_requests();
        Ok(())
    }

    fn handle_txreq(&mut self, con_id: ConnectionId, m: TxreqMsg) -> Result<(), ErrorCode> {
        let txs: Vec<Option<Entry>> = m
            .txids
            .iter()
            .map(|txid| self.mempool.get(txid).cloned())
            .collect();
        if !txs.is_empty() {
            let gap = self.config.tx_reply_throttle;
            self.send_throttled(con_id, Message::TxRep(TxrepMsg { txs }), gap);
        }
        Ok(())
    }

    fn handle_txrep(&mut self, _con_id: ConnectionId, m: TxrepMsg) -> Result<(), ErrorCode> {
        let txs: Vec<Entry> = m.txs.into_iter().flatten().collect();
        if !txs.is_empty() {
            self.chain_server.async_put_mempool(txs);
        }
        self.do_requests();
        Ok(())
    }

    fn handle_leader(&mut self, con_id: ConnectionId, m: LeaderMsg) -> Result<(), ErrorCode> {
        {
            let Some(peer) = self.connections.find(con_id) else {
                return Ok(());
            };
            if m.signed_snapshot.priority <= peer.acknowledged_snapshot_priority {
                return Err(ErrorCode::LowPriority);
            }
            peer.acknowledged_snapshot_priority = m.signed_snapshot.priority;
            if peer.their_snapshot_priority < m.signed_snapshot.priority {
                peer.their_snapshot_priority = m.signed_snapshot.priority;
            }
        }
        self.chain_server
            .async_set_signed_checkpoint(m.signed_snapshot);
        Ok(())
    }

    // ---- chain updates --------------------------------------------------

    fn handle_state_update(&mut self, update: StateUpdate) {
        self.mempool.apply_log(&update.mempool_log);
        match update.action {
            ChainAction::Append { headers } => self.update_chain_append(headers),
            ChainAction::Fork {
                fork_height,
                headers,
            } => self.update_chain_fork(fork_height, headers),
            ChainAction::Rollback(rd) => self.update_chain_rollback(rd),
        }
    }

    fn update_chain_append(&mut self, headers: Vec<Header>) {
        let msg = match self.chains.update_consensus_append(&headers) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(target: "p2p", "stale consensus append ignored: {}", e);
                return;
            }
        };
        self.log_chain_length();
        let mut bad = Vec::new();
        for peer in self.connections.all_mut() {
            if let Some(chain) = peer.chain.as_mut() {
                if let Err(e) = chain.on_consensus_append(&self.chains) {
                    bad.push((peer.con.id, e));
                    continue;
                }
            }
            peer.send(Message::Append(msg));
        }
        for (id, e) in bad {
            self.close(id, e.code);
        }
        for id in self.initialized_ids() {
            self.consider_send_snapshot(id);
        }
        self.coordinate_sync();
        self.do_requests();
    }

    fn update_chain_fork(
        &mut self,
        fork_height: Height,
        headers: Vec<Header>,
    ) {
        let msg = match self.chains.update_consensus_fork(fork_height, headers.as_slice()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(target: "p2p", "stale consensus fork ignored: {}", e);
                return;
            }
        };
        self.log_chain_length();
        let mut bad = Vec::new();
        for peer in self.connections.all_mut() {
            if let Some(chain) = peer.chain.as_mut() {
                if let Err(e) = chain.on_consensus_fork(fork_height, &self.chains) {
                    bad.push((peer.con.id, e));
                    continue;
                }
            }
            peer.send(Message::Fork(msg));
        }
        for (id, e) in bad {
            self.close(id, e.code);
        }
        self.coordinate_sync();
        self.do_requests();
    }

    fn update_chain_rollback(&mut self, rd: RollbackData) {
        let stage_incompatible = !rd.signed_snapshot.compatible(self.chains.stage());
        if let Some(msg) = self.chains.update_consensus_rollback(&rd) {
            self.log_chain_length();
            for peer in self.connections.all_mut() {
                if let Some(chain) = peer.chain.as_mut() {
                    chain.on_consensus_shrink(&self.chains);
                }
                peer.send(Message::SignedPinRollback(msg));
            }
        }
        if stage_incompatible {
            self.block_download.reset();
            for peer in self.connections.initialized_mut() {
                if let Some(chain) = peer.chain.as_mut() {
                    chain.on_stage_set(&self.chains);
                }
            }
        }
        for id in self.initialized_ids() {
            self.consider_send_snapshot(id);
        }
        self.coordinate_sync();
        self.initialize_block_download();
        self.do_requests();
    }

    fn handle_stage_result(&mut self, result: StageResult) {
        let offenders = self
            .block_download
            .on_stage_result(result.accepted_upto, &result.offenders);
        for offender in offenders {
            self.close_offender(offender);
        }
        self.process_blockdownload_stage();
        self.do_requests();
    }

    fn handle_mempool_log(&mut self, log: Log) {
        self.mempool.apply_log(&log);
        let mut entries: Vec<&Entry> = log
            .iter()
            .filter_map(|a| match a {
                Action::Put(entry) => Some(entry),
                Action::Erase(_) => None,
            })
            .collect();
        entries.sort_by(|a, b| {
            a.transaction_height
                .cmp(&b.transaction_height)
                .then(a.txid.cmp(&b.txid))
        });
        let txids: Vec<_> = entries.iter().map(|e| e.txid).collect();
        if txids.is_empty() {
            return;
        }
        for peer in self.connections.initialized_mut() {
            peer.send(Message::TxNotify(TxnotifyMsg {
                txids: txids.clone(),
            }));
        }
    }

    // ---- sync coordination ----------------------------------------------

    fn coordinate_sync(&mut self) {
        let consensus = self.chains.consensus().total_work();
        let reachable = self.block_download.reachable_worksum();
        self.header_download
            .set_min_worksum(consensus.max(reachable));
        self.block_download.set_min_worksum(consensus);
    }

    fn initialize_block_download(&mut self) {
        let Some(candidate) = self.header_download.pop_data() else {
            return;
        };
        info!(
            target: "p2p",
            "Syncing... (height {} of {})",
            self.chains.consensus().length(),
            candidate.length()
        );
        let fork_height = self.chains.update_stage(candidate);
        for peer in self.connections.initialized_mut() {
            if let Some(chain) = peer.chain.as_mut() {
                chain.on_stage_set(&self.chains);
            }
        }
        self.block_download
            .init(self.chains.stage().clone(), fork_height);
        self.coordinate_sync();
        self.process_blockdownload_stage();
    }

    fn process_blockdownload_stage(&mut self) {
        if let Some(request) = self.block_download.pop_stage() {
            self.chain_server.async_stage_request(request);
        }
    }

    fn do_requests(&mut self) {
        let mut sender = RequestSender {
            timer: &mut self.timer,
            active_requests: &mut self.active_requests,
            max_requests: self.config.max_requests,
            now: self.clock,
            rng: &self.rng,
            reply_timeout: self.config.reply_timeout,
        };
        self.header_download
            .do_header_requests(&mut self.connections, &mut sender, &self.chains);
        self.block_download
            .do_block_requests(&mut self.connections, &mut sender);
        self.header_download
            .do_probe_requests(&mut self.connections, &mut sender);
    }

    fn update_sync_state(&mut self) {
        let has_connections = self.connections.initialized_count() > 0;
        let header = self.header_download.is_active(&self.connections);
        let block = self.block_download.is_active();
        if let Some(synced) = self.sync_state.update(has_connections, header, block) {
            info!(target: "p2p", "synced = {}", synced);
            if let Some(tx) = &self.on_sync_change {
                tx.send(synced).ok();
            }
        }
    }

    fn log_chain_length(&self) {
        let synced = self.chains.consensus().length();
        let total = self.chains.stage().length();
        if synced < total {
            info!(target: "p2p", "Syncing... (height {} of {})", synced, total);
        } else if synced == total {
            info!(target: "p2p", "Synced. (height {}).", synced);
        }
    }

    // ---- timers ---------------------------------------------------------

    fn handle_timeout(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Connect => {
                self.wakeup_timer = None;
                self.connect_scheduled();
                self.update_wakeup();
            }
            TimerEvent::SendPing(id) => {
                if self.connections.find(id).is_some() {
                    self.send_ping_await_pong(id);
                }
            }
            TimerEvent::CloseNoPong(id) | TimerEvent::CloseNoReply(id) => {
                if self.connections.find(id).is_some() {
                    self.close(id, ErrorCode::Timeout);
                    self.do_requests();
                }
            }
            TimerEvent::Expire(id) => self.handle_expire(id),
            TimerEvent::ThrottledSend(id) => self.handle_throttled_send(id),
        }
    }

    fn handle_expire(&mut self, con_id: ConnectionId) {
        let expired = {
            let Some(peer) = self.connections.find(con_id) else {
                return;
            };
            if peer.job.is_active() {
                self.active_requests -= 1;
            }
            let grace = self
                .timer
                .insert(self.clock, self.config.reply_grace, TimerEvent::CloseNoReply(con_id));
            peer.job.mark_expired(grace);
            match &peer.job {
                Job::Probe { .. } => ExpiredJob::Probe,
                Job::Batch { req, .. } => ExpiredJob::Batch(*req),
                Job::Blocks { .. } => ExpiredJob::Blocks,
                Job::Idle | Job::AwaitInit { .. } => ExpiredJob::None,
            }
        };
        match expired {
            ExpiredJob::Probe => self.header_download.on_probe_expire(con_id),
            ExpiredJob::Batch(req) => self.header_download.on_request_expire(con_id, &req),
            ExpiredJob::Blocks => self.block_download.on_blockreq_expire(con_id),
            ExpiredJob::None => return,
        }
        self.do_requests();
    }

    fn handle_throttled_send(&mut self, con_id: ConnectionId) {
        let Some(peer) = self.connections.find(con_id) else {
            return;
        };
        let (msg, rearm) = peer.throttle.drain(self.clock);
        if let Some(msg) = msg {
            peer.send(msg);
        }
        if let Some(deadline) = rearm {
            let timer = self
                .timer
                .insert_at(deadline, TimerEvent::ThrottledSend(con_id));
            peer.throttle.set_timer(timer);
        }
    }

    fn send_ping_await_pong(&mut self, con_id: ConnectionId) {
        let nonce = self.rng.u64(..);
        let snapshot_priority = self
            .chains
            .signed_snapshot()
            .map(|s| s.priority)
            .unwrap_or_default();
        let timer =
            self.timer
                .insert(self.clock, self.config.pong_timeout, TimerEvent::CloseNoPong(con_id));
        let max_addresses = self.config.max_addresses;
        let max_transactions = self.config.max_transactions;
        let old = {
            let Some(peer) = self.connections.find(con_id) else {
                self.timer.cancel(timer);
                return;
            };
            let old = peer.ping.timer();
            peer.ping = PingState::AwaitingPong {
                nonce,
                snapshot_priority,
                timer,
            };
            peer.send(Message::Ping(PingMsg {
                nonce,
                max_addresses,
                max_transactions,
                snapshot_priority,
            }));
            old
        };
        if let Some(old) = old {
            self.timer.cancel(old);
        }
    }

    fn received_pong_sleep_ping(&mut self, con_id: ConnectionId) {
        let timer = self
            .timer
            .insert(self.clock, self.config.ping_sleep, TimerEvent::SendPing(con_id));
        let old = {
            let Some(peer) = self.connections.find(con_id) else {
                self.timer.cancel(timer);
                return;
            };
            let old = peer.ping.timer();
            peer.ping = PingState::Sleeping { timer };
            old
        };
        if let Some(old) = old {
            self.timer.cancel(old);
        }
    }

    // ---- connection management ------------------------------------------

    fn send_init(&mut self, con_id: ConnectionId) {
        let msg = Message::Init(InitMsg {
            descriptor: self.chains.descriptor(),
            chain_length: self.chains.consensus().length(),
            worksum: self.chains.consensus().total_work(),
        });
        if let Some(peer) = self.connections.find(con_id) {
            peer.send(msg);
        }
    }

    fn consider_send_snapshot(&mut self, con_id: ConnectionId) {
        let Some(snapshot) = self.chains.signed_snapshot().copied() else {
            return;
        };
        if let Some(peer) = self.connections.find(con_id) {
            if peer.their_snapshot_priority < snapshot.priority {
                peer.send(Message::Leader(LeaderMsg {
                    signed_snapshot: snapshot,
                }));
                peer.their_snapshot_priority = snapshot.priority;
            }
        }
    }

    fn send_throttled(&mut self, con_id: ConnectionId, msg: Message, gap: LocalDuration) {
        let Some(peer) = self.connections.find(con_id) else {
            return;
        };
        match peer.throttle.push(msg, gap, self.clock) {
            ThrottleOutcome::SendNow(msg) => peer.send(msg),
            ThrottleOutcome::ArmTimer(deadline) => {
                let timer = self
                    .timer
                    .insert_at(deadline, TimerEvent::ThrottledSend(con_id));
                peer.throttle.set_timer(timer);
            }
            ThrottleOutcome::Pending => {}
        }
    }

    fn close_offender(&mut self, offender: ChainOffender) {
        debug!(
            target: "p2p",
            "closing offender {:?}: {}",
            offender.con_id, offender.error
        );
        self.close(offender.con_id, offender.error.code);
    }

    fn close(&mut self, con_id: ConnectionId, reason: ErrorCode) {
        if let Some(peer) = self.connections.find(con_id) {
            peer.con.transport.close(reason);
        }
        self.erase(con_id, reason);
    }

    fn erase(&mut self, con_id: ConnectionId, error: ErrorCode) {
        let (timers, was_active, addr, link) = {
            let Some(peer) = self.connections.find(con_id) else {
                return;
            };
            let mut timers = Vec::new();
            if let Some(t) = peer.job.timer() {
                timers.push(t);
            }
            if let Some(t) = peer.ping.timer() {
                timers.push(t);
            }
            if let Some(t) = peer.throttle.timer() {
                timers.push(t);
            }
            let was_active = peer.job.is_active();
            let addr = peer.con.addr;
            let link = peer.con.link;
            peer.mark_erased();
            (timers, was_active, addr, link)
        };
        for timer in timers {
            self.timer.cancel(timer);
        }
        if was_active {
            self.active_requests -= 1;
        }
        if self.header_download.erase(con_id) {
            info!(
                target: "p2p",
                "Connected to {} peers (closed connection to {}, reason: {})",
                self.header_download.size(),
                addr,
                error.name()
            );
        }
        if self.block_download.erase(con_id) {
            self.coordinate_sync();
        }
        if self.addrmgr.on_disconnected(addr, link, self.clock) {
            self.update_wakeup();
        }
    }

    // ---- outbound dialing -----------------------------------------------

    fn connect_scheduled(&mut self) {
        for addr in self.addrmgr.pop_connect(self.clock) {
            debug!(target: "p2p", "dialing {}", addr);
            self.dialer.connect(addr);
        }
    }

    fn update_wakeup(&mut self) {
        let wakeup = self.addrmgr.wakeup_time();
        if let (Some(timer), Some(due)) = (self.wakeup_timer, wakeup) {
            if timer.deadline() == due {
                return;
            }
        }
        if let Some(timer) = self.wakeup_timer.take() {
            self.timer.cancel(timer);
        }
        if let Some(due) = wakeup {
            self.wakeup_timer = Some(self.timer.insert_at(due, TimerEvent::Connect));
        }
    }

    // ---- api ------------------------------------------------------------

    fn peer_infos(&self) -> Vec<PeerInfo> {
        self.connections
            .all()
            .map(|peer| {
                let (chain_length, worksum) = peer
                    .chain
                    .as_ref()
                    .map(|c| (c.descripted.length, c.descripted.worksum))
                    .unwrap_or_default();
                PeerInfo {
                    con_id: peer.con.id,
                    address: peer.con.addr,
                    initialized: peer.initialized(),
                    chain_length,
                    worksum,
                    their_snapshot_priority: peer.their_snapshot_priority,
                    acknowledged_snapshot_priority: peer.acknowledged_snapshot_priority,
                    since: peer.connected_since,
                }
            })
            .collect()
    }

    fn initialized_ids(&self) -> Vec<ConnectionId> {
        self.connections.initialized().map(|p| p.con.id).collect()
    }
}
