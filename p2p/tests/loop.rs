//! End-to-end coordinator scenarios over a mock transport and chain server.
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use oryx_common::block::chain::{
    BatchSelector, Descriptor, HeaderRange, Headerchain, SignedSnapshot, SnapshotPriority,
};
use oryx_common::block::header::Header;
use oryx_common::block::target::{Target, TargetV1};
use oryx_common::block::{BlockHash, Body, TxRoot};
use oryx_common::time::{LocalDuration, LocalTime};
use oryx_common::Height;

use oryx_p2p::chains::{ChainServer, StageRequest};
use oryx_p2p::event::{ChainAction, Event, StageResult, StateUpdate};
use oryx_p2p::mempool::Entry;
use oryx_p2p::message::{
    BatchrepMsg, BlockrepMsg, BlockreqMsg, Frame, Inbound, InitMsg, LeaderMsg, Message, PingMsg,
    PongMsg, ProberepMsg,
};
use oryx_p2p::peer::{Connection, Dialer, Link, Transport};
use oryx_p2p::{Config, ConnectionId, ErrorCode, Eventloop};

// ---- world: a mined chain with bodies ----------------------------------

struct World {
    chain: Headerchain,
    bodies: Vec<Body>,
}

impl World {
    fn new(n: usize) -> Self {
        let mut chain = Headerchain::new(BlockHash::all_zeros());
        let mut bodies = Vec::new();
        let mut prev = chain.tip_hash();
        for i in 0..n {
            let body = Body(vec![(i % 251) as u8; 24]);
            let header = mine(prev, body.merkle_root(), 1_700_000_000 + i as u32 * 600);
            prev = header.block_hash();
            chain.append(&[header]).unwrap();
            bodies.push(body);
        }
        Self { chain, bodies }
    }

    fn headers(&self, from: Height, to: Height) -> Vec<Header> {
        self.chain.get_headers(from, to + 1)
    }

    fn prefix(&self, n: Height) -> Headerchain {
        let mut chain = self.chain.clone();
        chain.shrink(n);
        chain
    }

    fn body(&self, height: Height) -> Body {
        self.bodies[height as usize - 1].clone()
    }

    /// A world sharing this one's first `at` blocks, extended with `extra`
    /// fresh blocks.
    fn fork(&self, at: Height, extra: usize) -> Self {
        let mut chain = self.prefix(at);
        let mut bodies = self.bodies[..at as usize].to_vec();
        let mut prev = chain.tip_hash();
        for i in 0..extra {
            let body = Body(vec![0xB0 ^ (i % 251) as u8; 32]);
            let header = mine(prev, body.merkle_root(), 1_800_000_000 + i as u32 * 600);
            prev = header.block_hash();
            chain.append(&[header]).unwrap();
            bodies.push(body);
        }
        Self { chain, bodies }
    }
}

fn mine(prev: BlockHash, merkle_root: TxRoot, time: u32) -> Header {
    let mut header = Header {
        prev_blockhash: prev,
        target: Target::V1(TargetV1::new(0, 0x00FF_FFFF)),
        merkle_root,
        version: 1,
        time,
        nonce: 0,
    };
    while !header.pow_ok() {
        header.nonce += 1;
    }
    header
}

// ---- mocks --------------------------------------------------------------

#[derive(Default)]
struct ServerLog {
    get_blocks: Vec<(ConnectionId, HeaderRange)>,
    staged: Vec<StageRequest>,
    checkpoints: Vec<SignedSnapshot>,
    mempool: Vec<Vec<Entry>>,
    joined: bool,
}

#[derive(Clone)]
struct MockServer {
    log: Arc<Mutex<ServerLog>>,
}

impl ChainServer for MockServer {
    fn get_headers(&self, _selector: &BatchSelector) -> Vec<Header> {
        Vec::new()
    }

    fn get_descriptor_header(&self, _descriptor: Descriptor, _height: Height) -> Option<Header> {
        None
    }

    fn async_get_blocks(&mut self, con_id: ConnectionId, range: HeaderRange) {
        self.log.lock().unwrap().get_blocks.push((con_id, range));
    }

    fn async_stage_request(&mut self, request: StageRequest) {
        self.log.lock().unwrap().staged.push(request);
    }

    fn async_set_signed_checkpoint(&mut self, snapshot: SignedSnapshot) {
        self.log.lock().unwrap().checkpoints.push(snapshot);
    }

    fn async_put_mempool(&mut self, txs: Vec<Entry>) {
        self.log.lock().unwrap().mempool.push(txs);
    }

    fn shutdown_join(&mut self) {
        self.log.lock().unwrap().joined = true;
    }
}

#[derive(Clone, Default)]
struct MockDialer {
    dialed: Arc<Mutex<Vec<SocketAddr>>>,
}

impl Dialer for MockDialer {
    fn connect(&mut self, addr: SocketAddr) {
        self.dialed.lock().unwrap().push(addr);
    }
}

struct MockTransport {
    sent: Arc<Mutex<Vec<Message>>>,
    closed: Arc<Mutex<Option<ErrorCode>>>,
}

impl Transport for MockTransport {
    fn send(&self, msg: Message) {
        self.sent.lock().unwrap().push(msg);
    }

    fn close(&self, reason: ErrorCode) {
        self.closed.lock().unwrap().get_or_insert(reason);
    }
}

struct TestPeer {
    id: ConnectionId,
    sent: Arc<Mutex<Vec<Message>>>,
    closed: Arc<Mutex<Option<ErrorCode>>>,
}

impl TestPeer {
    fn drain(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    fn closed(&self) -> Option<ErrorCode> {
        *self.closed.lock().unwrap()
    }
}

// ---- harness ------------------------------------------------------------

struct Harness {
    node: Eventloop<MockServer, MockDialer>,
    now: LocalTime,
    next_id: u64,
    server: Arc<Mutex<ServerLog>>,
    suppliers: std::collections::BTreeSet<ConnectionId>,
}

impl Harness {
    fn new(consensus: Headerchain, config: Config) -> Self {
        let log = Arc::new(Mutex::new(ServerLog::default()));
        let node = Eventloop::new(
            MockServer { log: log.clone() },
            MockDialer::default(),
            consensus,
            config,
            fastrand::Rng::with_seed(0xfeed),
        );
        Self {
            node,
            now: LocalTime::from_secs(1_000_000),
            next_id: 0,
            server: log,
            suppliers: Default::default(),
        }
    }

    fn config() -> Config {
        Config {
            // Keep liveness timers out of the way of request scenarios.
            pong_timeout: LocalDuration::from_mins(10),
            ..Config::default()
        }
    }

    fn connect(&mut self) -> TestPeer {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(None));
        let con = Connection {
            id,
            addr: ([10, 0, (self.next_id >> 8) as u8, self.next_id as u8], 8334).into(),
            link: Link::Inbound,
            transport: Box::new(MockTransport {
                sent: sent.clone(),
                closed: closed.clone(),
            }),
            erased: Arc::new(AtomicBool::new(false)),
        };
        self.node.step(self.now, Event::NewConnection(con));
        TestPeer { id, sent, closed }
    }

    fn deliver(&mut self, peer: &TestPeer, msg: Message) {
        self.node.step(
            self.now,
            Event::Message {
                con_id: peer.id,
                inbound: Inbound::from(msg),
            },
        );
    }

    fn step(&mut self, event: Event) {
        self.node.step(self.now, event);
    }

    fn tick(&mut self, duration: LocalDuration) {
        self.now = self.now + duration;
        self.node.advance(self.now);
    }

    /// Register a peer claiming the first `length` blocks of `world`.
    fn init_peer(&mut self, peer: &TestPeer, world: &World, length: Height) {
        self.deliver(
            peer,
            Message::Init(InitMsg {
                descriptor: Descriptor(1),
                chain_length: length,
                worksum: world.chain.work_at(length),
            }),
        );
    }

    /// Answer every outstanding request the node sent to `peer` from the
    /// world chain. Returns the number of requests answered.
    fn answer(&mut self, peer: &TestPeer, world: &World) -> usize {
        let mut replies = Vec::new();
        for msg in peer.drain() {
            match msg {
                Message::Ping(PingMsg { nonce, .. }) => {
                    replies.push(Message::Pong(PongMsg {
                        nonce,
                        addresses: Vec::new(),
                        txids: Vec::new(),
                    }));
                }
                Message::BatchReq(m) => {
                    let to = m.selector.end() - 1;
                    replies.push(Message::BatchRep(BatchrepMsg {
                        nonce: m.nonce,
                        batch: world.headers(m.selector.start, to),
                    }));
                }
                Message::ProbeReq(m) => {
                    replies.push(Message::ProbeRep(ProberepMsg {
                        nonce: m.nonce,
                        current_descriptor: Descriptor(1),
                        current: world.chain.get_header(m.height).copied(),
                        requested: world.chain.get_header(m.height).copied(),
                    }));
                }
                Message::BlockReq(m) => {
                    let blocks = (m.range.lower..=m.range.upper).map(|h| world.body(h)).collect();
                    replies.push(Message::BlockRep(BlockrepMsg {
                        nonce: m.nonce,
                        blocks,
                    }));
                }
                _ => {}
            }
        }
        let n = replies.len();
        for reply in replies {
            self.deliver(peer, reply);
        }
        n
    }

    /// Let staged submissions succeed: acknowledge them and feed the
    /// resulting consensus appends back into the loop.
    fn run_chain_server(&mut self, world: &World) -> usize {
        let staged: Vec<StageRequest> = {
            let mut log = self.server.lock().unwrap();
            log.staged.drain(..).collect()
        };
        let n = staged.len();
        for request in staged {
            self.suppliers
                .extend(request.blocks.iter().map(|b| b.supplier));
            self.step(Event::StageResult(StageResult {
                accepted_upto: request.range.upper,
                offenders: Vec::new(),
            }));
            let headers = world.headers(request.range.lower, request.range.upper);
            let action = if request.range.lower == self.node.consensus().length() + 1 {
                ChainAction::Append { headers }
            } else {
                ChainAction::Fork {
                    fork_height: request.range.lower - 1,
                    headers,
                }
            };
            self.step(Event::StateUpdate(StateUpdate {
                mempool_log: Vec::new(),
                action,
            }));
        }
        n
    }

    /// Drive requests and chain-server acknowledgements to quiescence.
    fn pump(&mut self, peers: &[&TestPeer], world: &World) {
        for _ in 0..200 {
            let mut progress = 0;
            for peer in peers {
                progress += self.answer(peer, world);
            }
            progress += self.run_chain_server(world);
            if progress == 0 {
                break;
            }
        }
    }
}

// ---- scenarios ----------------------------------------------------------

#[test]
fn test_happy_sync_two_peers() {
    let world = World::new(100);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let p1 = h.connect();
    let p2 = h.connect();
    h.init_peer(&p1, &world, 100);
    h.init_peer(&p2, &world, 100);

    h.pump(&[&p1, &p2], &world);

    assert_eq!(h.node.consensus().length(), 100);
    assert_eq!(h.node.consensus().tip_hash(), world.chain.tip_hash());
    assert!(h.node.synced());
    assert!(p1.closed().is_none());
    assert!(p2.closed().is_none());
    assert!(h.node.active_requests() <= 10);
    // Body requests were fanned out across both peers.
    assert!(h.suppliers.contains(&p1.id));
    assert!(h.suppliers.contains(&p2.id));
}

#[test]
fn test_forked_peer_is_probed_then_adopted() {
    // Our chain has 60 blocks; the peer follows a heavier branch that
    // diverged at height 40.
    let ours = World::new(60);
    let theirs = ours.fork(40, 30);
    assert!(theirs.chain.total_work() > ours.chain.total_work());

    let mut h = Harness::new(ours.prefix(60), Harness::config());
    let peer = h.connect();
    h.deliver(
        &peer,
        Message::Init(InitMsg {
            descriptor: Descriptor(2),
            chain_length: theirs.chain.length(),
            worksum: theirs.chain.total_work(),
        }),
    );

    // Bisection probes must stay strictly inside the fork range and
    // converge on the divergence point before any headers are requested.
    let mut probes = 0;
    for _ in 0..32 {
        if h.answer(&peer, &theirs) == 0 {
            break;
        }
        probes += 1;
    }
    assert!(probes >= 2, "bisection takes several probes");
    assert!(peer.closed().is_none());

    h.pump(&[&peer], &theirs);
    assert_eq!(h.node.consensus().length(), 70);
    assert_eq!(h.node.consensus().tip_hash(), theirs.chain.tip_hash());
    assert!(h.node.synced());
}

#[test]
fn test_header_liar_is_closed_others_continue() {
    let world = World::new(60);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let liar = h.connect();
    let honest = h.connect();
    // The liar claims the most work, so it is asked first.
    h.deliver(
        &liar,
        Message::Init(InitMsg {
            descriptor: Descriptor(1),
            chain_length: 60,
            worksum: world.chain.work_at(60) + Target::V1(TargetV1::new(8, 0x00FF_FFFF)).work(),
        }),
    );
    h.init_peer(&honest, &world, 60);

    // Find the batch request to the liar and answer with a batch whose
    // header at height 55 carries a target that breaks the difficulty rule.
    let req = liar
        .drain()
        .into_iter()
        .find_map(|m| match m {
            Message::BatchReq(m) => Some(m),
            _ => None,
        })
        .expect("liar is asked for headers");
    assert_eq!(req.selector.start, 51);
    let mut batch = world.headers(51, 60);
    batch[4].target = Target::V1(TargetV1::new(1, 0x00FF_FFFF));
    h.deliver(
        &liar,
        Message::BatchRep(BatchrepMsg {
            nonce: req.nonce,
            batch,
        }),
    );

    assert_eq!(liar.closed(), Some(ErrorCode::BadWork));
    assert_eq!(h.node.consensus().length(), 50, "chain unchanged");

    // The honest peer finishes the job.
    h.pump(&[&honest], &world);
    assert_eq!(h.node.consensus().length(), 60);
    assert!(honest.closed().is_none());
}

#[test]
fn test_request_timeout_frees_slot_then_closes() {
    let world = World::new(60);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let silent = h.connect();
    let backup = h.connect();
    h.init_peer(&silent, &world, 60);
    h.init_peer(&backup, &world, 60);

    let asked_silent = silent
        .drain()
        .iter()
        .any(|m| matches!(m, Message::BatchReq(_)));
    assert!(asked_silent, "first peer is asked");
    assert_eq!(h.node.active_requests(), 1);

    // The request expires: the slot is freed and immediately reused.
    h.tick(LocalDuration::from_secs(30));
    let asked_backup = backup
        .drain()
        .iter()
        .any(|m| matches!(m, Message::BatchReq(_)));
    assert!(asked_backup, "freed slot is reused by the backup peer");
    assert_eq!(h.node.active_requests(), 1);
    assert!(silent.closed().is_none(), "grace window still open");

    // Nothing arrives within the grace window: the peer is closed.
    h.tick(LocalDuration::from_mins(2));
    assert_eq!(silent.closed(), Some(ErrorCode::Timeout));
    assert!(backup.closed().is_none());
}

#[test]
fn test_throttled_block_replies_drain_in_order() {
    let world = World::new(50);
    let mut h = Harness::new(world.prefix(50), {
        Config {
            block_reply_throttle: LocalDuration::from_secs(2),
            ..Harness::config()
        }
    });

    let peer = h.connect();
    h.init_peer(&peer, &world, 50);
    peer.drain();

    h.deliver(
        &peer,
        Message::BlockReq(BlockreqMsg {
            nonce: 7,
            range: HeaderRange::new(1, 2),
        }),
    );
    h.deliver(
        &peer,
        Message::BlockReq(BlockreqMsg {
            nonce: 8,
            range: HeaderRange::new(3, 4),
        }),
    );
    let requests: Vec<(ConnectionId, HeaderRange)> =
        h.server.lock().unwrap().get_blocks.drain(..).collect();
    assert_eq!(requests.len(), 2);

    // The chain server produces both replies back to back.
    for (con_id, range) in requests {
        let blocks = (range.lower..=range.upper).map(|x| world.body(x)).collect();
        h.step(Event::ForwardBlockRep { con_id, blocks });
    }

    // First reply goes out immediately, the second is throttled.
    let sent: Vec<Message> = peer.drain();
    assert_eq!(
        sent.iter()
            .filter(|m| matches!(m, Message::BlockRep(_)))
            .count(),
        1
    );

    h.tick(LocalDuration::from_secs(2));
    let sent: Vec<Message> = peer.drain();
    let reps: Vec<&BlockrepMsg> = sent
        .iter()
        .filter_map(|m| match m {
            Message::BlockRep(m) => Some(m),
            _ => None,
        })
        .collect();
    assert_eq!(reps.len(), 1, "queued reply drains on the throttle timer");
    assert_eq!(reps[0].nonce, 8, "replies keep their request order");
}

#[test]
fn test_stale_rollback_resets_block_download() {
    let world = World::new(80);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let peer = h.connect();
    h.init_peer(&peer, &world, 80);

    // Complete the header download so block download is active in [51,80].
    let req = peer
        .drain()
        .into_iter()
        .find_map(|m| match m {
            Message::BatchReq(m) => Some(m),
            _ => None,
        })
        .expect("header batch requested");
    h.deliver(
        &peer,
        Message::BatchRep(BatchrepMsg {
            nonce: req.nonce,
            batch: world.headers(51, 80),
        }),
    );
    assert_eq!(h.node.chains().stage().length(), 80);
    assert!(peer
        .drain()
        .iter()
        .any(|m| matches!(m, Message::BlockReq(_))));

    // A signed rollback to height 40, incompatible with the stage.
    let snapshot = SignedSnapshot {
        priority: SnapshotPriority {
            importance: 9,
            height: 40,
        },
        block_hash: BlockHash([0xAA; 32]),
    };
    h.step(Event::StateUpdate(StateUpdate {
        mempool_log: Vec::new(),
        action: ChainAction::Rollback(oryx_p2p::chains::RollbackData {
            signed_snapshot: snapshot,
            new_length: 40,
        }),
    }));

    assert_eq!(h.node.consensus().length(), 40);
    assert_eq!(h.node.chains().stage().length(), 40, "stage invalidated");

    let sent = peer.drain();
    assert!(
        sent.iter()
            .any(|m| matches!(m, Message::SignedPinRollback(_))),
        "rollback is broadcast"
    );
    let req = sent
        .iter()
        .find_map(|m| match m {
            Message::BatchReq(m) => Some(m),
            _ => None,
        })
        .expect("headers re-requested");
    assert_eq!(req.selector.start, 41, "download restarts above the pin");
}

#[test]
fn test_leader_upgrade_roundtrip() {
    let world = World::new(50);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let sender = h.connect();
    let other = h.connect();
    h.init_peer(&sender, &world, 50);
    h.init_peer(&other, &world, 50);
    sender.drain();
    other.drain();

    let snapshot = SignedSnapshot {
        priority: SnapshotPriority {
            importance: 5,
            height: 40,
        },
        block_hash: world.chain.hash_at(40).unwrap(),
    };
    h.deliver(
        &sender,
        Message::Leader(LeaderMsg {
            signed_snapshot: snapshot,
        }),
    );
    assert_eq!(h.server.lock().unwrap().checkpoints.len(), 1);
    assert!(sender.closed().is_none());

    // The chain server adopts the snapshot and rolls consensus back.
    h.step(Event::StateUpdate(StateUpdate {
        mempool_log: Vec::new(),
        action: ChainAction::Rollback(oryx_p2p::chains::RollbackData {
            signed_snapshot: snapshot,
            new_length: 40,
        }),
    }));
    assert_eq!(h.node.consensus().length(), 40);

    let to_other = other.drain();
    assert!(
        to_other.iter().any(|m| matches!(m, Message::Leader(_))),
        "peers that have not seen the snapshot get it pushed"
    );
    assert!(
        !sender
            .drain()
            .iter()
            .any(|m| matches!(m, Message::Leader(_))),
        "the sender already knows it"
    );

    // A second leader message with no higher priority closes the peer.
    h.deliver(
        &sender,
        Message::Leader(LeaderMsg {
            signed_snapshot: snapshot,
        }),
    );
    assert_eq!(sender.closed(), Some(ErrorCode::LowPriority));
}

// ---- laws ---------------------------------------------------------------

#[test]
fn test_ping_pong_reschedules_and_never_closes() {
    let world = World::new(50);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let peer = h.connect();
    h.init_peer(&peer, &world, 50);

    let ping = peer
        .drain()
        .into_iter()
        .find_map(|m| match m {
            Message::Ping(m) => Some(m),
            _ => None,
        })
        .expect("first ping is immediate");
    h.deliver(
        &peer,
        Message::Pong(PongMsg {
            nonce: ping.nonce,
            addresses: Vec::new(),
            txids: Vec::new(),
        }),
    );
    assert!(peer.closed().is_none());

    // After the sleep, the next ping fires.
    h.tick(LocalDuration::from_secs(10));
    assert!(peer
        .drain()
        .iter()
        .any(|m| matches!(m, Message::Ping(_))));
    assert!(peer.closed().is_none());
}

#[test]
fn test_mismatched_pong_nonce_closes() {
    let world = World::new(50);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let peer = h.connect();
    h.init_peer(&peer, &world, 50);

    h.deliver(
        &peer,
        Message::Pong(PongMsg {
            nonce: 0xDEAD,
            addresses: Vec::new(),
            txids: Vec::new(),
        }),
    );
    assert_eq!(peer.closed(), Some(ErrorCode::Unrequested));
}

#[test]
fn test_duplicate_append_is_idempotent() {
    let world = World::new(60);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let append = ChainAction::Append {
        headers: world.headers(51, 55),
    };
    h.step(Event::StateUpdate(StateUpdate {
        mempool_log: Vec::new(),
        action: append.clone(),
    }));
    assert_eq!(h.node.consensus().length(), 55);
    let tip = h.node.consensus().tip_hash();

    h.step(Event::StateUpdate(StateUpdate {
        mempool_log: Vec::new(),
        action: append,
    }));
    assert_eq!(h.node.consensus().length(), 55);
    assert_eq!(h.node.consensus().tip_hash(), tip);
}

// ---- sequencing and framing --------------------------------------------

#[test]
fn test_first_message_must_be_init() {
    let world = World::new(50);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let peer = h.connect();
    h.deliver(
        &peer,
        Message::Ping(PingMsg {
            nonce: 1,
            max_addresses: 4,
            max_transactions: 4,
            snapshot_priority: SnapshotPriority::default(),
        }),
    );
    assert_eq!(peer.closed(), Some(ErrorCode::NoInit));
}

#[test]
fn test_repeated_init_closes() {
    let world = World::new(50);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let peer = h.connect();
    h.init_peer(&peer, &world, 50);
    assert!(peer.closed().is_none());

    h.init_peer(&peer, &world, 50);
    assert_eq!(peer.closed(), Some(ErrorCode::InvInit));
}

#[test]
fn test_checksum_mismatch_closes() {
    let world = World::new(50);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let peer = h.connect();
    h.node.step(
        h.now,
        Event::Message {
            con_id: peer.id,
            inbound: Inbound {
                msg: Message::Init(InitMsg {
                    descriptor: Descriptor(1),
                    chain_length: 50,
                    worksum: world.chain.work_at(50),
                }),
                frame: Frame {
                    declared: 1,
                    computed: 2,
                },
            },
        },
    );
    assert_eq!(peer.closed(), Some(ErrorCode::Checksum));
}

#[test]
fn test_unrequested_reply_closes() {
    let world = World::new(50);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let peer = h.connect();
    h.init_peer(&peer, &world, 50);
    h.deliver(
        &peer,
        Message::BatchRep(BatchrepMsg {
            nonce: 0xBEEF,
            batch: Vec::new(),
        }),
    );
    assert_eq!(peer.closed(), Some(ErrorCode::Unrequested));
}

#[test]
fn test_init_deadline_closes_silent_connection() {
    let world = World::new(50);
    let mut h = Harness::new(world.prefix(50), Harness::config());

    let peer = h.connect();
    h.tick(LocalDuration::from_secs(30));
    assert_eq!(peer.closed(), Some(ErrorCode::Timeout));
}

// ---- threaded lifecycle -------------------------------------------------

#[test]
fn test_threaded_shutdown_joins_chain_server() {
    let world = World::new(10);
    let h = Harness::new(world.prefix(10), Harness::config());
    let server = h.server.clone();

    let handle = h.node.handle();
    let thread = h.node.start();

    assert_eq!(handle.get_synced().unwrap(), false);
    handle.shutdown(ErrorCode::Shutdown);
    thread.join().unwrap();

    assert!(server.lock().unwrap().joined);
    assert!(!handle.defer(Event::FailedOutbound(([10, 0, 0, 1], 1).into())));
}
