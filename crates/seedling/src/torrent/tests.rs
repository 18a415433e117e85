use bytes::{Bytes, BytesMut};
use tokio_util::codec::Encoder;

use super::*;
use crate::peer::{test_transport::MemoryTransport, Handshake, Message, MessageCodec};

const LOCAL_ID: PeerId = PeerId([1u8; 20]);
const PIECE_LEN: u32 = 2 * BLOCK_LEN;

#[derive(Clone)]
struct Offline;

impl Announcer for Offline {
    async fn get(&self, _url: &str) -> Result<Vec<u8>, Error> {
        Err(Error::TrackerResponse("offline".to_owned()))
    }
}

struct Harness {
    session: Session<Offline>,
    cm: ConnectionManager,
    client_rx: mpsc::UnboundedReceiver<ClientMsg>,
    tracker_rx: mpsc::UnboundedReceiver<(InfoHash, TrackerEvent)>,
}

/// A torrent of `pieces` pieces of two blocks each, without a tracker.
fn torrent(pieces: usize) -> Vec<u8> {
    torrent_with_announce(pieces, None)
}

fn torrent_with_announce(pieces: usize, announce: Option<&str>) -> Vec<u8> {
    let mut out = b"d".to_vec();
    if let Some(url) = announce {
        out.extend(format!("8:announce{}:{url}", url.len()).as_bytes());
    }
    out.extend(b"4:infod");
    out.extend(format!("6:lengthi{}e4:name4:test", pieces as u64 * PIECE_LEN as u64).as_bytes());
    out.extend(format!("12:piece lengthi{PIECE_LEN}e").as_bytes());
    out.extend(format!("6:pieces{}:", pieces * 20).as_bytes());
    out.extend(vec![0u8; pieces * 20]);
    out.extend(b"ee");
    out
}

fn harness(pieces: usize) -> Harness {
    harness_for(&torrent(pieces))
}

fn harness_for(torrent: &[u8]) -> Harness {
    let meta = MetaInfo::from_bytes(torrent).unwrap();
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (disk_tx, _) = mpsc::unbounded_channel();
    let (tracker_tx, tracker_rx) = mpsc::unbounded_channel();

    let ctx = SessionCtx {
        local_peer_id: LOCAL_ID,
        client_tx,
        disk_tx,
        tracker_tx,
        announcer: Offline,
        rng_seed: Some(7),
    };

    Harness {
        session: Session::new(meta, "unused", ctx),
        cm: ConnectionManager::new(250, LOCAL_ID),
        client_rx,
        tracker_rx,
    }
}

fn bitfield(len: usize, ones: &[usize]) -> Bitfield {
    let mut bits = Bitfield::from_piece(len);
    for i in ones {
        bits.set(*i, true);
    }
    bits
}

/// Skip the disk scan, the session goes straight to the network stage.
fn ready(h: &mut Harness, completed: &[usize]) {
    let bits = bitfield(h.session.piece_count(), completed);
    h.session.state = SessionState::Preparing;
    h.session.full_verification_done(bits, Some(6881), &mut h.cm);
}

fn encode(msgs: Vec<Message>) -> BytesMut {
    let mut buf = BytesMut::new();
    for msg in msgs {
        MessageCodec.encode(msg, &mut buf).unwrap();
    }
    buf
}

/// An inbound peer announcing `pieces`, then sending `msgs`.
fn add_peer(h: &mut Harness, pieces: &[usize], msgs: Vec<Message>) -> (ConnId, MemoryTransport) {
    let pipe = MemoryTransport::default();
    let id = h.cm.next_id();
    let addr = SocketAddr::from(([10, 0, 0, 1], 7000 + id as u16));
    let mut conn = PeerConnection::new_inbound(id, addr, LOCAL_ID, Box::new(pipe.clone()));

    let hash = h.session.info_hash();
    let mut wire = Handshake::new(hash, PeerId([100 + id as u8; 20])).serialize().unwrap().to_vec();
    let bits = bitfield(h.session.piece_count(), pieces);
    let mut all = Vec::new();
    if bits.any() {
        all.push(Message::Bitfield(bits.to_wire().into()));
    }
    all.extend(msgs);
    wire.extend_from_slice(&encode(all));
    pipe.push(&wire);

    conn.read_from_socket(usize::MAX);
    assert!(conn.take_events().contains(&PeerEvent::InfoHashReceived(hash)));
    assert!(h.session.setup_incoming_connection(conn, &mut h.cm).is_ok());
    (id, pipe)
}

/// Let the connection read what the peer sent and handle the events.
fn deliver(h: &mut Harness, id: ConnId, pipe: &MemoryTransport, msgs: Vec<Message>) {
    pipe.push(&encode(msgs));
    let conn = h.session.connections.get_mut(&id).unwrap();
    conn.rearm();
    conn.read_from_socket(usize::MAX);
    h.session.process_events(&mut h.cm);
}

fn requested(h: &Harness, id: ConnId) -> Vec<BlockInfo> {
    h.session.connection(id).unwrap().requested_blocks().to_vec()
}

fn block(index: u32, bit: u32) -> Message {
    Message::Piece(Block {
        index,
        begin: bit * BLOCK_LEN,
        data: Bytes::from(vec![index as u8; BLOCK_LEN as usize]),
    })
}

#[test]
fn warming_up_requests_from_a_piece_the_peer_has() {
    let mut h = harness(8);
    ready(&mut h, &[]);
    assert_eq!(h.session.state(), SessionState::Searching);

    let (id, _pipe) = add_peer(&mut h, &[2], vec![Message::Unchoke]);
    assert_eq!(h.session.state(), SessionState::WarmingUp);

    let blocks = requested(&h, id);
    assert_eq!(blocks.len(), MAX_BLOCKS_IN_MULTI_MODE);
    assert!(blocks.iter().all(|b| b.index == 2 && b.len == BLOCK_LEN));
    assert!(h.session.pending_pieces[&2].in_progress);
    assert_eq!(h.cm.len(), 1);
}

#[test]
fn warming_up_takes_the_most_common_piece() {
    let mut h = harness(8);
    ready(&mut h, &[]);

    // choked peers only count towards availability
    add_peer(&mut h, &[1, 5], vec![]);
    add_peer(&mut h, &[5], vec![]);
    let (id, pipe) = add_peer(&mut h, &[1, 3, 5], vec![]);
    assert_eq!(h.session.state(), SessionState::WarmingUp);
    assert!(h.session.payloads.is_empty());

    deliver(&mut h, id, &pipe, vec![Message::Unchoke]);
    assert_eq!(h.session.payloads.get(&id), Some(&vec![5]));
    assert!(requested(&h, id).iter().all(|b| b.index == 5));
}

#[test]
fn availability_picks_rarest_or_most_common() {
    let mut h = harness(8);
    ready(&mut h, &[]);
    add_peer(&mut h, &[1, 5], vec![]);
    add_peer(&mut h, &[5], vec![]);
    add_peer(&mut h, &[1, 3, 5], vec![]);

    assert_eq!(h.session.pick_by_availability(&[1, 3, 5], false), Some(3));
    assert_eq!(h.session.pick_by_availability(&[1, 3, 5], true), Some(5));
    assert_eq!(h.session.pick_by_availability(&[1, 5], false), Some(1));
    // nobody has piece 7
    assert_eq!(h.session.pick_by_availability(&[3, 7], false), Some(7));
    assert_eq!(h.session.pick_by_availability(&[], true), None);
}

#[test]
fn block_cancels_the_same_request_to_other_peers() {
    let mut h = harness(8);
    ready(&mut h, &[]);

    let (a, pa) = add_peer(&mut h, &[2], vec![Message::Unchoke]);
    let (b, _pb) = add_peer(&mut h, &[2], vec![Message::Unchoke]);
    assert_eq!(h.session.state(), SessionState::WarmingUp);

    // while warming up both peers are asked for both blocks of piece 2
    let both = vec![BlockInfo::new(2, 0, BLOCK_LEN), BlockInfo::new(2, BLOCK_LEN, BLOCK_LEN)];
    let mut asked_b = requested(&h, b);
    asked_b.sort();
    assert_eq!(asked_b, both);
    assert_eq!(requested(&h, a).len(), 2);

    deliver(&mut h, a, &pa, vec![block(2, 0)]);
    assert!(h.session.pending_pieces[&2].completed_blocks[0]);
    assert_eq!(requested(&h, b), vec![both[1]]);
    assert_eq!(requested(&h, a), vec![both[1]]);
}

#[test]
fn timed_out_claims_go_to_another_peer() {
    let mut h = harness(8);
    ready(&mut h, &[0, 1, 2, 3, 4, 5]);

    let (a, _pa) = add_peer(&mut h, &[6], vec![Message::Unchoke]);
    assert_eq!(requested(&h, a).len(), 2);
    assert!(h.session.pending_pieces[&6].in_progress);

    // the only piece b has is claimed by a
    let (b, _pb) = add_peer(&mut h, &[6], vec![Message::Unchoke]);
    assert!(requested(&h, b).is_empty());

    // a never answers its requests
    let later = Instant::now() + crate::peer::PENDING_REQUEST_TIMEOUT + Duration::from_secs(1);
    h.session.tick(later, &mut h.cm);

    assert!(h.session.connection(a).is_none());
    assert_eq!(h.cm.len(), 1);
    let blocks = requested(&h, b);
    assert_eq!(blocks.len(), 2);
    assert!(blocks.iter().all(|info| info.index == 6));
    assert_eq!(h.session.payloads.get(&b), Some(&vec![6]));
}

#[test]
fn peer_that_never_unchokes_is_dropped() {
    let mut h = harness(4);
    ready(&mut h, &[]);

    let (id, _pipe) = add_peer(&mut h, &[0, 1], vec![]);
    let conn = h.session.connection(id).unwrap();
    assert!(conn.state().contains(PeerWireState::INTERESTED_IN_PEER));
    assert!(conn.requested_blocks().is_empty());

    let later = Instant::now() + crate::peer::PENDING_REQUEST_TIMEOUT + Duration::from_secs(1);
    h.session.tick(later, &mut h.cm);
    assert!(h.session.connection(id).is_none());
    assert!(h.cm.is_empty());
}

#[test]
fn top_four_and_one_optimistic_unchoke() {
    let mut h = harness(8);
    ready(&mut h, &[0, 1, 2, 3]);

    let ids: Vec<ConnId> =
        (0..6).map(|_| add_peer(&mut h, &[], vec![Message::Interested]).0).collect();

    // the first peer was unchoked when it connected, it is also the fastest
    for (rank, id) in ids.iter().enumerate() {
        let conn = h.session.connections.get_mut(id).unwrap();
        conn.counter_mut().record_download((6 - rank as u64) * 16_000);
    }

    h.session.schedule_uploads();

    let unchoked: Vec<ConnId> = ids
        .iter()
        .copied()
        .filter(|id| {
            let conn = h.session.connection(*id).unwrap();
            !conn.state().contains(PeerWireState::CHOKING_PEER)
        })
        .collect();

    assert_eq!(unchoked.len(), MAX_UPLOADS + 1);
    for id in &ids[..MAX_UPLOADS] {
        assert!(unchoked.contains(id));
    }
}

#[test]
fn duplicate_blocks_are_ignored() {
    let mut h = harness(8);
    ready(&mut h, &[0, 1, 2, 3, 4, 5]);
    let (id, pipe) = add_peer(&mut h, &[6], vec![Message::Unchoke]);

    deliver(&mut h, id, &pipe, vec![block(6, 0)]);
    assert_eq!(h.session.state(), SessionState::Downloading);
    let piece = h.session.pending_pieces[&6].clone();
    assert!(piece.completed_blocks[0]);
    assert!(!piece.requested_blocks[0]);
    assert!(piece.requested_blocks[1]);

    deliver(&mut h, id, &pipe, vec![block(6, 0)]);
    assert_eq!(h.session.pending_pieces[&6], piece);
    assert_eq!(h.session.payloads.get(&id), Some(&vec![6]));
    assert_eq!(requested(&h, id).len(), 1);
}

#[test]
fn verified_pieces_lead_to_endgame_then_seeding() {
    let mut h = harness(8);
    ready(&mut h, &[0, 1, 2, 3, 4, 5]);
    let (id, pipe) = add_peer(&mut h, &[6, 7], vec![Message::Unchoke]);

    let mut blocks = requested(&h, id);
    blocks.sort();
    assert_eq!(blocks.len(), 4);

    for info in &blocks {
        deliver(&mut h, id, &pipe, vec![block(info.index, info.begin / BLOCK_LEN)]);
    }
    // both pieces are waiting for the hash check
    assert!(h.session.payloads.is_empty());
    assert_eq!(h.session.pending_pieces.len(), 2);

    h.session.handle_disk_event(DiskEvent::PieceVerified { piece: 6, ok: true }, &mut h.cm);
    assert_eq!(h.session.state(), SessionState::Endgame);
    assert!(h.session.completed_pieces()[6]);
    assert!(!h.session.pending_pieces.contains_key(&6));

    h.session.handle_disk_event(DiskEvent::PieceVerified { piece: 7, ok: true }, &mut h.cm);
    assert_eq!(h.session.state(), SessionState::Seeding);

    let stats = h.session.stats();
    assert_eq!(stats.progress, 100);
    assert_eq!(stats.completed_pieces, 8);
    assert_eq!(stats.downloaded, h.session.counter.total_downloaded);

    let conn = h.session.connection(id).unwrap();
    assert!(!conn.state().contains(PeerWireState::INTERESTED_IN_PEER));
}

#[test]
fn failed_hash_check_downloads_the_piece_again() {
    let mut h = harness(8);
    ready(&mut h, &[0, 1, 2, 3, 4, 5, 7]);
    let (id, pipe) = add_peer(&mut h, &[6], vec![Message::Unchoke]);

    deliver(&mut h, id, &pipe, vec![block(6, 0), block(6, 1)]);
    assert!(requested(&h, id).is_empty());

    h.session.handle_disk_event(DiskEvent::PieceVerified { piece: 6, ok: false }, &mut h.cm);
    assert!(!h.session.completed_pieces()[6]);

    let piece = &h.session.pending_pieces[&6];
    assert_eq!(piece.blocks_left(), 2);
    assert!(piece.in_progress);
    assert_eq!(requested(&h, id).len(), 2);
}

#[test]
fn choke_releases_the_claims() {
    let mut h = harness(8);
    ready(&mut h, &[0, 1, 2, 3, 4, 5]);
    let (id, pipe) = add_peer(&mut h, &[6], vec![Message::Unchoke]);
    assert!(h.session.pending_pieces[&6].in_progress);

    deliver(&mut h, id, &pipe, vec![Message::Choke]);
    let piece = &h.session.pending_pieces[&6];
    assert!(!piece.in_progress);
    assert!(piece.requested_blocks.not_any());
    assert!(h.session.payloads.is_empty());
}

#[test]
fn resume_state_round_trip() {
    let mut h = harness(8);
    h.session.completed = bitfield(8, &[0, 3]);
    h.session.incomplete = !h.session.completed.clone();

    let mut partial = Piece::new(5, PIECE_LEN);
    partial.completed_blocks.set(0, true);
    partial.requested_blocks.set(1, true);
    h.session.pending_pieces.insert(5, partial);
    // untouched pieces are not saved
    h.session.pending_pieces.insert(6, Piece::new(6, PIECE_LEN));

    let state = h.session.dumped_state();

    let mut fresh = harness(8);
    fresh.session.set_dumped_state(&state).unwrap();
    assert_eq!(fresh.session.completed, h.session.completed);
    assert_eq!(fresh.session.incomplete.count_ones(), 6);
    assert_eq!(fresh.session.pending_pieces.keys().copied().collect::<Vec<_>>(), vec![5]);

    let piece = &fresh.session.pending_pieces[&5];
    assert_eq!(piece.completed_blocks, bitfield(2, &[0]));
    assert!(piece.requested_blocks.not_any());
    assert!(!piece.in_progress);
}

#[test]
fn invalid_resume_state_is_discarded() {
    let mut h = harness(8);
    h.session.completed = bitfield(8, &[1]);
    let state = h.session.dumped_state();

    let mut wrong_version = state.clone();
    wrong_version[1] = 1;
    let mut truncated = state.clone();
    truncated.pop();
    // a torrent of another size
    let other = harness(4).session.dumped_state();

    for bad in [wrong_version, truncated, other, vec![]] {
        let mut fresh = harness(8);
        assert!(matches!(
            fresh.session.set_dumped_state(&bad),
            Err(Error::ResumeStateInvalid)
        ));
        assert!(fresh.session.completed.not_any());
        assert!(fresh.session.pending_pieces.is_empty());
    }
}

#[test]
fn peer_list_skips_ourselves_and_is_pruned() {
    let mut h = harness(4);
    h.session.listen_port = 6881;
    let mut cm = ConnectionManager::new(1, LOCAL_ID);

    let peers: Vec<(SocketAddr, Option<PeerId>)> = [
        "127.0.0.1:6881",
        "10.0.0.1:1",
        "10.0.0.1:1",
        "10.0.0.2:2",
        "10.0.0.3:3",
        "10.0.0.4:4",
    ]
    .iter()
    .map(|a| (a.parse().unwrap(), None))
    .collect();
    h.session.add_to_peer_list(peers, &mut cm);

    // at most 3 peers per allowed connection, the oldest go first
    let addrs: Vec<String> = h.session.peers().iter().map(|p| p.addr.to_string()).collect();
    assert_eq!(addrs, vec!["10.0.0.2:2", "10.0.0.3:3", "10.0.0.4:4"]);
    assert!(h.session.connections.is_empty());
}

#[test]
fn interesting_peers_weigh_more() {
    let mut h = harness(10);
    let now = Instant::now();
    let addr = |port: u16| SocketAddr::from(([10, 0, 0, 1], port));

    let mut unknown = PeerDescriptor::new(addr(1), None, 10);
    unknown.interesting = true;

    let mut slow = PeerDescriptor::new(addr(2), None, 10);
    slow.connect_start = Some(now);
    slow.connect_time = Some(Duration::from_secs(10));
    slow.num_completed_pieces = 2;

    let mut recent = PeerDescriptor::new(addr(3), None, 10);
    recent.last_visited = Some(now);

    let mut boring = PeerDescriptor::new(addr(4), None, 10);
    boring.interesting = false;

    h.session.peers = vec![unknown, slow, recent, boring];
    let weighed = h.session.weighed_free_peers(now + Duration::from_secs(1));

    let count = |port| weighed.iter().filter(|a| **a == addr(port)).count();
    assert_eq!(count(1), 3);
    assert_eq!(count(2), 2);
    assert_eq!(count(3), 0);
    assert_eq!(count(4), 1);
}

#[tokio::test]
async fn refused_peers_are_forgotten() {
    let mut h = harness(4);
    h.cm.set_max_connections(1_000_000);
    ready(&mut h, &[]);

    // a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    h.session.add_to_peer_list(vec![(addr, None)], &mut h.cm);
    assert_eq!(h.session.state(), SessionState::Connecting);
    assert_eq!(h.session.connections.len(), 1);
    assert!(h.session.peers()[0].last_visited.is_some());

    let Some(ClientMsg::PeerConnected { info_hash, id, result }) = h.client_rx.recv().await else {
        panic!("expected a connect result");
    };
    assert_eq!(info_hash, h.session.info_hash());
    let result = result.map(|s| Box::new(s) as Box<dyn Transport>);
    assert!(result.is_err());

    h.session.on_connected(id, result, &mut h.cm);
    assert!(h.session.connections.is_empty());
    assert!(h.session.peers().is_empty());
    assert!(h.cm.is_empty());
}

#[test]
fn pause_and_stop() {
    let mut h = harness(4);
    ready(&mut h, &[0]);
    let (id, _pipe) = add_peer(&mut h, &[1], vec![]);

    h.session.set_paused(true, &mut h.cm);
    assert_eq!(h.session.state(), SessionState::Paused);
    assert!(h.session.connection(id).is_none());
    assert!(h.cm.is_empty());

    // paused sessions do not take new peers
    let conn = PeerConnection::new_inbound(
        h.cm.next_id(),
        "10.0.0.9:9".parse().unwrap(),
        LOCAL_ID,
        Box::new(MemoryTransport::default()),
    );
    assert!(h.session.setup_incoming_connection(conn, &mut h.cm).is_err());

    h.session.set_paused(false, &mut h.cm);
    assert_eq!(h.session.state(), SessionState::Searching);

    // without a tracker there is nothing to wait for
    h.session.stop(&mut h.cm);
    assert_eq!(h.session.state(), SessionState::Idle);
}

#[tokio::test]
async fn stop_waits_for_the_tracker() {
    let mut h = harness_for(&torrent_with_announce(4, Some("http://tracker.test/announce")));
    ready(&mut h, &[]);
    assert!(h.session.tracker.is_some());

    h.session.stop(&mut h.cm);
    assert_eq!(h.session.state(), SessionState::Stopping);

    // the offline tracker reports its failed announces, then that it quit
    loop {
        let (info_hash, event) = h.tracker_rx.recv().await.unwrap();
        assert_eq!(info_hash, h.session.info_hash());
        let stopped = event == TrackerEvent::Stopped;
        h.session.handle_tracker_event(event, &mut h.cm);
        if stopped {
            break;
        }
        assert_eq!(h.session.state(), SessionState::Stopping);
    }
    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(h.session.tracker.is_none());
}

#[test]
fn file_errors_pause_the_session() {
    let mut h = harness(4);
    ready(&mut h, &[]);

    h.session.handle_disk_event(
        DiskEvent::Error { read_id: None, message: "disk full".to_owned() },
        &mut h.cm,
    );
    assert_eq!(h.session.state(), SessionState::Paused);
    assert_eq!(h.session.error().map(|e| e.0), Some(ErrorCode::FileError));
}

#[test]
fn no_listen_port_fails_the_session() {
    let mut h = harness(4);
    h.session.state = SessionState::Preparing;
    h.session.full_verification_done(bitfield(4, &[]), None, &mut h.cm);
    assert_eq!(h.session.state(), SessionState::Failed);
    assert_eq!(h.session.error().map(|e| e.0), Some(ErrorCode::ServerError));
}
