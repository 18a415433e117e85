//! Torrent that is hosted by the [`Client`].
//!
//! A [`Session`] owns everything about one torrent: the disk worker, the
//! peer list, the open connections and the pieces being downloaded. Its
//! methods are synchronous and only called from the control loop of the
//! [`Client`], so none of this state is shared with another task.
//!
//! [`Client`]: crate::client::Client
mod resume;
mod scheduler;
mod types;

// re-exports
pub use resume::RESUME_VERSION;
pub use types::*;

use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use hashbrown::HashMap;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    client::ClientMsg,
    connection_manager::ConnectionManager,
    counter::Counter,
    disk::{DiskEvent, DiskStore, DiskTx},
    error::Error,
    metainfo::MetaInfo,
    peer::{
        Block, BlockInfo, ConnId, PeerConnection, PeerEvent, PeerId, PeerWireState, Transport,
        BLOCK_LEN, CONNECT_TIMEOUT,
    },
    rate_controller::RateLimited,
    tracker::{Announcer, Tracker, TrackerEvent, TrackerMsg, TrackerTx, TransferStats},
    utils::percent,
};

/// Blocks requested from one peer at the same time.
pub const MAX_BLOCKS_IN_PROGRESS: usize = 5;

/// Same as [`MAX_BLOCKS_IN_PROGRESS`] while warming up or in endgame,
/// where blocks are requested from several peers.
pub const MAX_BLOCKS_IN_MULTI_MODE: usize = 2;

pub const MAX_CONNECTION_PER_PEER: usize = 1;

/// A peer is not dialed again before this.
pub const MINIMUM_TIME_BEFORE_REVISIT: Duration = Duration::from_secs(30);

/// Peers unchoked by rank.
pub const MAX_UPLOADS: usize = 4;

pub const UPLOAD_SCHEDULE_INTERVAL: Duration = Duration::from_secs(10);

/// Endgame starts when fewer pieces than this are incomplete.
pub const END_GAME_PIECES: usize = 5;

/// Delay of a peer connection round that is not urgent.
pub const PEER_CONNECTOR_DELAY: Duration = Duration::from_secs(10);

/// Largest block a peer may ask for.
pub const MAX_REQUEST_LEN: u32 = 8 * BLOCK_LEN;

/// Peers faster than this, in bytes per second, survive pruning.
const ACTIVE_PEER_RATE: u64 = 1024;

/// Everything a session needs from the process around it.
#[derive(Clone)]
pub struct SessionCtx<A: Announcer> {
    pub local_peer_id: PeerId,
    pub client_tx: mpsc::UnboundedSender<ClientMsg>,
    pub disk_tx: DiskTx,
    pub tracker_tx: TrackerTx,
    pub announcer: A,
    /// Makes piece and peer selection deterministic.
    pub rng_seed: Option<u64>,
}

pub struct Session<A: Announcer> {
    meta: MetaInfo,
    info_hash: InfoHash,
    download_dir: PathBuf,
    ctx: SessionCtx<A>,

    state: SessionState,
    error: Option<(ErrorCode, String)>,
    verification: u8,
    listen_port: u16,

    disk: Option<DiskStore>,
    tracker: Option<mpsc::UnboundedSender<TrackerMsg>>,
    transfer_stats: Arc<TransferStats>,

    completed: Bitfield,
    incomplete: Bitfield,
    pending_pieces: BTreeMap<u32, Piece>,
    /// Pieces each connection is working on.
    payloads: BTreeMap<ConnId, Vec<u32>>,
    /// Disk reads to answer, by read id.
    read_ids: HashMap<u64, ConnId>,

    connections: BTreeMap<ConnId, PeerConnection>,
    peers: Vec<PeerDescriptor>,

    counter: Counter,
    rng: StdRng,
    scheduler_called: bool,
    next_peer_connect: Option<Instant>,
    next_upload_schedule: Option<Instant>,
    next_rotate: Instant,
}

impl<A: Announcer> Session<A> {
    pub fn new(meta: MetaInfo, download_dir: impl Into<PathBuf>, ctx: SessionCtx<A>) -> Self {
        let piece_count = meta.info.piece_count();
        let rng = match ctx.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            info_hash: meta.info_hash,
            meta,
            download_dir: download_dir.into(),
            ctx,
            state: SessionState::Idle,
            error: None,
            verification: 0,
            listen_port: 0,
            disk: None,
            tracker: None,
            transfer_stats: Arc::default(),
            completed: Bitfield::from_piece(piece_count),
            incomplete: Bitfield::from_piece(piece_count),
            pending_pieces: BTreeMap::new(),
            payloads: BTreeMap::new(),
            read_ids: HashMap::new(),
            connections: BTreeMap::new(),
            peers: Vec::new(),
            counter: Counter::session(),
            rng,
            scheduler_called: false,
            next_peer_connect: None,
            next_upload_schedule: None,
            next_rotate: Instant::now() + Counter::SESSION_TICK,
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn meta(&self) -> &MetaInfo {
        &self.meta
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn error(&self) -> Option<&(ErrorCode, String)> {
        self.error.as_ref()
    }

    pub fn completed_pieces(&self) -> &Bitfield {
        &self.completed
    }

    pub fn peers(&self) -> &[PeerDescriptor] {
        &self.peers
    }

    pub fn connection(&self, id: ConnId) -> Option<&PeerConnection> {
        self.connections.get(&id)
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut PeerConnection> {
        self.connections.values_mut()
    }

    fn piece_count(&self) -> usize {
        self.completed.len()
    }

    /// Inbound connections are only handed to a session that can talk to
    /// peers.
    pub fn is_accepting(&self) -> bool {
        self.state.is_active() && self.state != SessionState::Preparing
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("{} {} -> {}", self.meta.info.name, self.state, state);
            self.state = state;
        }
    }

    fn set_error(&mut self, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        warn!("{} {code:?}: {message}", self.meta.info.name);
        self.error = Some((code, message));
    }

    fn is_multi_mode(&self) -> bool {
        matches!(self.state, SessionState::WarmingUp | SessionState::Endgame)
    }

    fn max_blocks_in_progress(&self) -> usize {
        if self.is_multi_mode() {
            MAX_BLOCKS_IN_MULTI_MODE
        } else {
            MAX_BLOCKS_IN_PROGRESS
        }
    }

    /// Few pieces are left and most of them are already being downloaded.
    fn should_enter_endgame(&self) -> bool {
        let incomplete = self.incomplete.count_ones();
        incomplete < END_GAME_PIECES && self.pending_pieces.len() * 2 > incomplete
    }

    fn bytes_left(&self) -> u64 {
        let done: u64 = self
            .completed
            .iter_ones()
            .map(|i| self.meta.info.piece_length_at(i) as u64)
            .sum();
        self.meta.info.total_size().saturating_sub(done)
    }

    /// Spawn the disk worker and check what is already on disk.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.state != SessionState::Idle {
            return Ok(());
        }

        let mut disk = DiskStore::spawn(
            self.info_hash,
            self.meta.info.clone(),
            self.download_dir.clone(),
            self.completed.clone(),
            self.ctx.disk_tx.clone(),
        )?;
        disk.start_verification();
        self.disk = Some(disk);
        self.error = None;
        self.set_state(SessionState::Preparing);
        Ok(())
    }

    /// The initial scan finished. `listen_port` is the port of the
    /// listener, `None` if no port could be bound.
    pub fn full_verification_done(
        &mut self,
        completed: Bitfield,
        listen_port: Option<u16>,
        cm: &mut ConnectionManager,
    ) {
        if self.state != SessionState::Preparing {
            return;
        }

        if completed.len() == self.piece_count() {
            self.completed = completed;
        }
        self.incomplete = !self.completed.clone();
        self.verification = 100;

        // the hashes win over what the resume state said was partial
        let completed = &self.completed;
        self.pending_pieces.retain(|index, _| !completed.safe_get(*index as usize));

        self.transfer_stats.update(
            self.counter.total_uploaded,
            self.counter.total_downloaded,
            self.bytes_left(),
        );
        self.next_upload_schedule = Some(Instant::now() + UPLOAD_SCHEDULE_INTERVAL);

        let Some(port) = listen_port else {
            self.set_error(ErrorCode::ServerError, "could not listen on any port");
            self.set_state(SessionState::Failed);
            return;
        };
        self.listen_port = port;

        if self.completed.all() {
            self.set_state(SessionState::Seeding);
        } else {
            self.set_state(SessionState::Searching);
        }

        self.start_tracker(port);

        if !self.peers.is_empty() {
            self.connect_to_peers(cm);
        }
    }

    fn start_tracker(&mut self, port: u16) {
        let Some(url) = self.meta.announce.clone() else {
            debug!("{} has no tracker", self.meta.info.name);
            return;
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            self.set_error(ErrorCode::InvalidTrackerError, format!("unsupported tracker {url}"));
            return;
        }

        let (tracker, tx) = Tracker::new(
            self.ctx.announcer.clone(),
            url,
            self.info_hash,
            self.ctx.local_peer_id,
            port,
            self.transfer_stats.clone(),
            self.ctx.tracker_tx.clone(),
        );
        tokio::spawn(tracker.run());
        self.tracker = Some(tx);
    }

    /// Abort every connection and shut down. The session is Idle once the
    /// tracker confirmed the stop announce.
    pub fn stop(&mut self, cm: &mut ConnectionManager) {
        if matches!(self.state, SessionState::Stopping | SessionState::Idle) {
            return;
        }
        self.set_state(SessionState::Stopping);
        self.abort_all(cm);
        self.next_peer_connect = None;

        if let Some(mut disk) = self.disk.take() {
            disk.shutdown();
        }

        match self.tracker.take() {
            Some(tracker) if tracker.send(TrackerMsg::Stop).is_ok() => {}
            _ => self.set_state(SessionState::Idle),
        }
    }

    pub fn set_paused(&mut self, paused: bool, cm: &mut ConnectionManager) {
        if paused {
            if !self.is_accepting() {
                return;
            }
            self.set_state(SessionState::Paused);
            self.abort_all(cm);
        } else {
            if self.state != SessionState::Paused {
                return;
            }
            if self.completed.all() {
                self.set_state(SessionState::Seeding);
            } else {
                self.set_state(SessionState::Searching);
            }
            self.connect_to_peers(cm);
        }
    }

    fn abort_all(&mut self, cm: &mut ConnectionManager) {
        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.abort(Error::Aborted);
            }
            self.remove_client(id, false, cm);
        }
    }

    fn handle_file_error(&mut self, message: String, cm: &mut ConnectionManager) {
        if self.state == SessionState::Paused {
            return;
        }
        self.set_paused(true, cm);
        self.set_error(ErrorCode::FileError, message);
    }

    pub fn handle_disk_event(&mut self, event: DiskEvent, cm: &mut ConnectionManager) {
        match event {
            DiskEvent::DataRead { id, piece, offset, data } => {
                let Some(conn_id) = self.read_ids.remove(&id) else {
                    return;
                };
                let Some(conn) = self.connections.get_mut(&conn_id) else {
                    return;
                };
                if !conn.state().contains(PeerWireState::CHOKING_PEER) {
                    conn.send_block(Block { index: piece, begin: offset, data: data.into() });
                }
            }
            DiskEvent::PieceVerified { piece, ok } => self.piece_verified(piece, ok),
            DiskEvent::VerificationProgress(p) => self.verification = p,
            // answered by the client, which owns the listener
            DiskEvent::VerificationDone { .. } => {}
            DiskEvent::Error { read_id, message } => {
                if let Some(id) = read_id {
                    self.read_ids.remove(&id);
                }
                self.handle_file_error(message, cm);
            }
            DiskEvent::Failed(message) => {
                self.abort_all(cm);
                self.disk = None;
                self.set_error(ErrorCode::FileError, message);
                self.set_state(SessionState::Failed);
            }
        }
        self.process_events(cm);
    }

    pub fn handle_tracker_event(&mut self, event: TrackerEvent, cm: &mut ConnectionManager) {
        match event {
            TrackerEvent::Peers(peers) => self.add_to_peer_list(peers, cm),
            TrackerEvent::Warning(w) => warn!("tracker warning: {w}"),
            TrackerEvent::Failure(reason) => {
                self.set_error(ErrorCode::InvalidTrackerError, reason);
            }
            TrackerEvent::Error(e) => warn!("tracker error: {e}"),
            TrackerEvent::Stopped => {
                self.tracker = None;
                if self.state == SessionState::Stopping {
                    self.set_state(SessionState::Idle);
                }
            }
        }
        self.process_events(cm);
    }

    /// Add peers from the tracker or the user.
    pub fn add_to_peer_list(
        &mut self,
        peers: Vec<(SocketAddr, Option<PeerId>)>,
        cm: &mut ConnectionManager,
    ) {
        let piece_count = self.piece_count();

        for (addr, id) in peers {
            let ip = addr.ip();
            if (ip.is_loopback() || ip.is_unspecified()) && addr.port() == self.listen_port {
                // our own listener
                continue;
            }
            if self.peers.iter().any(|p| p.addr == addr) {
                continue;
            }
            self.peers.push(PeerDescriptor::new(addr, id, piece_count));
        }

        let max_peers = cm.max_connections() * 3;
        if self.peers.len() > max_peers {
            let mut too_many = self.peers.len() - max_peers;

            let active: Vec<SocketAddr> = self
                .connections
                .values()
                .filter(|c| c.download_rate() + c.upload_rate() > ACTIVE_PEER_RATE)
                .map(|c| c.addr())
                .collect();

            // inactive peers go first, then the oldest ones
            self.peers.retain(|p| {
                if too_many > 0 && !active.contains(&p.addr) {
                    too_many -= 1;
                    false
                } else {
                    true
                }
            });
            self.peers.drain(..too_many.min(self.peers.len()));
        }

        if self.is_accepting() {
            if matches!(self.state, SessionState::Searching | SessionState::WarmingUp) {
                self.connect_to_peers(cm);
            } else {
                self.call_peer_connector();
            }
        }
    }

    /// Schedule a connection round, at most one every
    /// [`PEER_CONNECTOR_DELAY`].
    fn call_peer_connector(&mut self) {
        if self.next_peer_connect.is_none() {
            self.next_peer_connect = Some(Instant::now() + PEER_CONNECTOR_DELAY);
        }
    }

    /// Run the download scheduler once the current events are handled.
    fn call_scheduler(&mut self) {
        self.scheduler_called = true;
    }

    /// Dial `addr` in the background, the result comes back as
    /// [`ClientMsg::PeerConnected`].
    fn spawn_connect(&self, id: ConnId, addr: SocketAddr) {
        let tx = self.ctx.client_tx.clone();
        let info_hash = self.info_hash;
        tokio::spawn(async move {
            let result = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(io::ErrorKind::TimedOut.into()),
            };
            let _ = tx.send(ClientMsg::PeerConnected { info_hash, id, result });
        });
    }

    /// Result of an outbound connect started by the peer connector.
    pub fn on_connected(
        &mut self,
        id: ConnId,
        result: io::Result<Box<dyn Transport>>,
        cm: &mut ConnectionManager,
    ) {
        match result {
            Ok(transport) => {
                let Some(conn) = self.connections.get_mut(&id) else {
                    // paused or stopped in the meantime
                    return;
                };
                conn.attach(transport);
                self.setup_outgoing_connection(id);
            }
            Err(e) => {
                let refused = e.kind() == io::ErrorKind::ConnectionRefused;
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.abort(e.into());
                }
                self.remove_client(id, refused, cm);
            }
        }
        self.process_events(cm);
    }

    fn setup_outgoing_connection(&mut self, id: ConnId) {
        let now = Instant::now();
        let (info_hash, piece_count) = (self.info_hash, self.piece_count());

        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if let Some(peer) = self.peers.iter_mut().find(|p| p.addr == conn.addr()) {
            peer.connect_time = peer.connect_start.map(|start| now.duration_since(start));
        }

        conn.initialize(info_hash, piece_count);
        conn.send_piece_list(&self.completed);
        debug!("{} connected to {}", self.meta.info.name, conn.addr());

        self.after_connection_setup();
    }

    /// Adopt a routed inbound connection. Returns the connection back when
    /// the session does not accept connections.
    pub fn setup_incoming_connection(
        &mut self,
        mut conn: PeerConnection,
        cm: &mut ConnectionManager,
    ) -> Result<(), PeerConnection> {
        if !self.is_accepting() {
            return Err(conn);
        }

        let id = conn.id();
        conn.initialize(self.info_hash, self.piece_count());
        conn.send_piece_list(&self.completed);
        debug!("{} accepted {}", self.meta.info.name, conn.addr());
        self.connections.insert(id, conn);
        cm.add_connection(id);

        self.after_connection_setup();
        if self.connections.len() == 1 {
            self.schedule_uploads();
        }
        self.process_events(cm);
        Ok(())
    }

    fn after_connection_setup(&mut self) {
        if matches!(self.state, SessionState::Searching | SessionState::Connecting) {
            if self.completed.not_any() {
                self.set_state(SessionState::WarmingUp);
            } else if self.should_enter_endgame() {
                self.set_state(SessionState::Endgame);
            }
        }
    }

    /// Forget a connection and give its pieces back to the scheduler.
    fn remove_client(&mut self, id: ConnId, refused: bool, cm: &mut ConnectionManager) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };

        if refused {
            self.peers.retain(|p| p.addr != conn.addr());
        }

        if let Some(pieces) = self.payloads.remove(&id) {
            for index in pieces {
                if let Some(piece) = self.pending_pieces.get_mut(&index) {
                    piece.release();
                }
            }
            // someone else can take over
            self.call_scheduler();
        }

        self.read_ids.retain(|_, conn_id| *conn_id != id);
        cm.remove_connection(id);
        self.call_peer_connector();
    }

    /// Handle what the connections did since the last call, then run the
    /// scheduler if someone asked for it.
    pub fn process_events(&mut self, cm: &mut ConnectionManager) {
        let mut scheduled = false;
        loop {
            let batch: Vec<(ConnId, Vec<PeerEvent>)> = self
                .connections
                .iter_mut()
                .map(|(id, conn)| (*id, conn.take_events()))
                .filter(|(_, events)| !events.is_empty())
                .collect();

            if batch.is_empty() {
                if self.scheduler_called && !scheduled {
                    scheduled = true;
                    self.schedule_downloads();
                    continue;
                }
                return;
            }

            for (id, events) in batch {
                for event in events {
                    self.handle_peer_event(id, event, cm);
                }
            }
        }
    }

    fn handle_peer_event(&mut self, id: ConnId, event: PeerEvent, cm: &mut ConnectionManager) {
        match event {
            PeerEvent::Disconnected => self.remove_client(id, false, cm),
            PeerEvent::PiecesAvailable => self.peer_pieces_available(id),
            PeerEvent::Choked => self.peer_choked(id),
            PeerEvent::Unchoked => {
                if self.state != SessionState::Seeding {
                    self.call_scheduler();
                }
            }
            PeerEvent::BlockRequested(info) => self.peer_requests_block(id, info),
            PeerEvent::BlockReceived(block) => self.block_received(id, block),
            PeerEvent::BytesReceived(n) => self.counter.record_download(n as u64),
            PeerEvent::BytesWritten(n) => self.counter.record_upload(n as u64),
            // the upload scheduler reads the interest flags directly
            PeerEvent::Interested | PeerEvent::NotInterested => {}
            PeerEvent::InfoHashReceived(_) => {}
        }
    }

    fn peer_pieces_available(&mut self, id: ConnId) {
        let piece_count = self.piece_count();
        let seeding = self.state == SessionState::Seeding;

        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let pieces = conn.pieces().clone();
        let have = pieces.count_ones();
        let mut peer = self.peers.iter_mut().find(|p| p.addr == conn.addr());

        if let Some(peer) = peer.as_mut() {
            peer.pieces = pieces.clone();
            peer.num_completed_pieces = have;
        }

        if have == piece_count {
            if let Some(peer) = peer.as_mut() {
                peer.seed = true;
            }
            if seeding {
                // two seeds have nothing to say to each other
                conn.abort(Error::Aborted);
            } else {
                if let Some(peer) = peer {
                    peer.interesting = true;
                }
                if !conn.state().contains(PeerWireState::INTERESTED_IN_PEER) {
                    conn.send_interested();
                }
            }
            return;
        }

        let interested = pieces.iter_ones().any(|i| !self.completed.safe_get(i));
        if interested {
            if !conn.state().contains(PeerWireState::INTERESTED_IN_PEER) {
                if let Some(peer) = peer {
                    peer.interesting = true;
                }
                conn.send_interested();
            }

            let in_progress: usize = self
                .payloads
                .get(&id)
                .into_iter()
                .flatten()
                .filter_map(|index| self.pending_pieces.get(index))
                .filter(|p| p.in_progress)
                .map(|p| p.requested_blocks.count_ones())
                .sum();
            if in_progress == 0 {
                self.schedule_piece_for_client(id);
            }
        } else if conn.state().contains(PeerWireState::INTERESTED_IN_PEER) {
            if let Some(peer) = peer {
                peer.interesting = false;
            }
            conn.send_not_interested();
        }
    }

    /// We forget every block asked to a peer that chokes us, and its pieces
    /// become available to the other connections.
    fn peer_choked(&mut self, id: ConnId) {
        if let Some(pieces) = self.payloads.remove(&id) {
            for index in pieces {
                if let Some(piece) = self.pending_pieces.get_mut(&index) {
                    piece.release();
                }
            }
            self.call_scheduler();
        }
    }

    fn peer_requests_block(&mut self, id: ConnId, info: BlockInfo) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        if conn.state().contains(PeerWireState::CHOKING_PEER) {
            return;
        }
        if !self.completed.safe_get(info.index as usize) {
            return;
        }
        let piece_len = self.meta.info.piece_length_at(info.index as usize) as u64;
        if info.len == 0
            || info.len > MAX_REQUEST_LEN
            || info.begin as u64 + info.len as u64 > piece_len
        {
            debug!("{} asked for an invalid block {info:?}", conn.addr());
            return;
        }

        if let Some(disk) = self.disk.as_mut() {
            let read_id = disk.read(info.index, info.begin, info.len);
            self.read_ids.insert(read_id, id);
        }
    }

    fn block_received(&mut self, id: ConnId, block: Block) {
        if block.data.is_empty() {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.abort(Error::MessageResponse);
            }
            return;
        }

        let index = block.index;
        let bit = (block.begin / BLOCK_LEN) as usize;
        let wanted = self.pending_pieces.get(&index).is_some_and(|p| {
            block.begin % BLOCK_LEN == 0
                && bit < p.block_count()
                && block.data.len() as u32 == p.block_len(bit)
                && !p.completed_blocks[bit]
        });
        if !wanted {
            // a duplicate or a block we never asked for
            self.request_more(id);
            return;
        }

        if self.is_multi_mode() {
            let info = block.info();
            let others: Vec<ConnId> = self
                .payloads
                .iter()
                .filter(|(other, pieces)| **other != id && pieces.contains(&index))
                .map(|(other, _)| *other)
                .collect();
            for other in others {
                if let Some(conn) = self.connections.get_mut(&other) {
                    if conn.requested_blocks().contains(&info) {
                        conn.cancel_request(info);
                    }
                }
            }
        }

        if !matches!(self.state, SessionState::Downloading | SessionState::Endgame)
            && self.completed.any()
        {
            self.set_state(SessionState::Downloading);
        }

        if let Some(disk) = self.disk.as_mut() {
            disk.write(index, block.begin, block.data.to_vec());
        }

        let Some(piece) = self.pending_pieces.get_mut(&index) else {
            return;
        };
        piece.completed_blocks.set(bit, true);
        piece.requested_blocks.set(bit, false);

        if piece.blocks_left() == 0 {
            debug!("{} piece {index} downloaded", self.meta.info.name);
            if let Some(disk) = self.disk.as_mut() {
                disk.verify_piece(index);
            }
            self.remove_from_payloads(index);
        }

        self.request_more(id);
    }

    fn remove_from_payloads(&mut self, index: u32) {
        for pieces in self.payloads.values_mut() {
            pieces.retain(|i| *i != index);
        }
        self.payloads.retain(|_, pieces| !pieces.is_empty());
    }

    fn piece_verified(&mut self, index: u32, ok: bool) {
        self.remove_from_payloads(index);

        if !ok {
            debug!("{} piece {index} failed the hash check", self.meta.info.name);
            if let Some(piece) = self.pending_pieces.get_mut(&index) {
                piece.reset();
            }
            self.call_scheduler();
            return;
        }

        let i = index as usize;
        if i >= self.piece_count() || self.completed[i] {
            return;
        }

        self.pending_pieces.remove(&index);
        self.completed.set(i, true);
        self.incomplete.set(i, false);

        let incomplete = &self.incomplete;
        for peer in self.peers.iter_mut().filter(|p| p.interesting) {
            peer.interesting = peer.pieces.iter_ones().any(|p| incomplete.safe_get(p));
        }

        for conn in self.connections.values_mut() {
            if conn.is_connected() && !conn.pieces().safe_get(i) {
                conn.send_piece_notification(index);
            }
        }

        self.transfer_stats.update(
            self.counter.total_uploaded,
            self.counter.total_downloaded,
            self.bytes_left(),
        );

        if self.completed.all() {
            if self.state != SessionState::Seeding {
                info!("{} download complete", self.meta.info.name);
                self.set_state(SessionState::Seeding);
                if let Some(tracker) = &self.tracker {
                    let _ = tracker.send(TrackerMsg::Completed);
                }
                for conn in self.connections.values_mut() {
                    if conn.state().contains(PeerWireState::INTERESTED_IN_PEER) {
                        conn.send_not_interested();
                    }
                }
            }
        } else {
            if self.completed.count_ones() == 1 {
                self.set_state(SessionState::Downloading);
            } else if self.should_enter_endgame() {
                self.set_state(SessionState::Endgame);
            }
            self.call_scheduler();
        }
    }

    /// Timers of the session and of its connections.
    pub fn tick(&mut self, now: Instant, cm: &mut ConnectionManager) {
        for conn in self.connections.values_mut() {
            conn.poll_timers(now);
        }

        if now >= self.next_rotate {
            if !self.counter.is_idle() {
                self.counter.rotate();
            }
            self.next_rotate = now + Counter::SESSION_TICK;
        }

        if self.is_accepting() {
            if self.next_upload_schedule.is_some_and(|at| now >= at) {
                self.schedule_uploads();
                self.next_upload_schedule = Some(now + UPLOAD_SCHEDULE_INTERVAL);
            }
            if self.next_peer_connect.is_some_and(|at| now >= at) {
                self.connect_to_peers(cm);
            }
        }

        self.transfer_stats.update(
            self.counter.total_uploaded,
            self.counter.total_downloaded,
            self.bytes_left(),
        );

        self.process_events(cm);
    }

    pub fn stats(&self) -> TorrentStats {
        let piece_count = self.piece_count();
        let completed_pieces = self.completed.count_ones();
        TorrentStats {
            name: self.meta.info.name.clone(),
            info_hash: self.info_hash,
            state: self.state,
            error: self.error.clone(),
            progress: percent(completed_pieces as u64, piece_count as u64),
            verification: self.verification,
            completed_pieces,
            piece_count,
            size: self.meta.info.total_size(),
            downloaded: self.counter.total_downloaded,
            uploaded: self.counter.total_uploaded,
            download_rate: self.counter.download_rate(),
            upload_rate: self.counter.upload_rate(),
            connections: self.connections.values().filter(|c| c.is_connected()).count(),
            peers: self.peers.len(),
            seeds: self.peers.iter().filter(|p| p.seed).count(),
        }
    }
}

#[cfg(test)]
mod tests;
