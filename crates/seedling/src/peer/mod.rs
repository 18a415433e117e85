//! A remote peer in the network that downloads and uploads data.
//!
//! [`PeerConnection`] is the protocol state machine of one TCP connection.
//! It never touches the socket on its own: the [`RateController`] decides
//! how many bytes may be read or written on each tick, and the owner of the
//! connection drains the [`PeerEvent`]s it produced afterwards.
//!
//! [`RateController`]: crate::rate_controller::RateController
mod codec;
mod types;

// re-exports
pub use codec::*;
pub use types::*;

use std::{collections::VecDeque, io, mem, net::SocketAddr, time::Duration};

use bytes::{BufMut, BytesMut};
use tokio::{net::TcpStream, time::Instant};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    counter::Counter,
    error::Error,
    rate_controller::RateLimited,
    torrent::InfoHash,
};

/// Time to wait for an `unchoke` or a `piece` after `interested` or
/// `request`.
pub const PENDING_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Inactivity allowed after the handshake was sent.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Inactivity allowed before the handshake was sent.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Buffered blocks above this size choke and unchoke the peer, which drops
/// every block it asked for.
pub const MAX_PENDING_BLOCK_BYTES: usize = 32 * BLOCK_LEN as usize;

const READ_CHUNK: usize = 16 * 1024;

/// Non-blocking byte stream under a [`PeerConnection`].
///
/// `recv` returns `Ok(0)` when the remote closed the stream and
/// [`io::ErrorKind::WouldBlock`] when nothing can be moved right now.
pub trait Transport: Send {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Bytes accepted by `send` that are still buffered below us.
    fn queued(&self) -> usize {
        0
    }
}

impl Transport for TcpStream {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }
}

/// State of one peer wire connection.
pub struct PeerConnection {
    id: ConnId,
    addr: SocketAddr,
    direction: Direction,
    transport: Option<Box<dyn Transport>>,

    local_peer_id: PeerId,
    info_hash: Option<InfoHash>,
    peer_id: Option<PeerId>,
    state: PeerWireState,
    /// Pieces the peer has.
    pieces: Bitfield,

    sent_handshake: bool,
    received_handshake: bool,
    got_peer_id: bool,
    /// Inbound connection waiting for its owner to call `initialize`.
    awaiting_init: bool,

    incoming: BytesMut,
    outgoing: BytesMut,
    /// Encoded `piece` messages not moved to `outgoing` yet.
    pending_blocks: VecDeque<(BlockInfo, BytesMut)>,
    pending_block_bytes: usize,
    /// Blocks we asked for and did not receive yet.
    requested: Vec<BlockInfo>,

    timeout: Duration,
    last_activity: Instant,
    keep_alive_at: Option<Instant>,
    pending_request_deadline: Option<Instant>,
    next_rotate: Instant,
    counter: Counter,
    read_blocked: bool,

    close_reason: Option<Error>,
    events: Vec<PeerEvent>,
}

impl PeerConnection {
    fn new(
        id: ConnId,
        addr: SocketAddr,
        direction: Direction,
        local_peer_id: PeerId,
        transport: Option<Box<dyn Transport>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            direction,
            transport,
            local_peer_id,
            info_hash: None,
            peer_id: None,
            state: PeerWireState::default(),
            pieces: Bitfield::new(),
            sent_handshake: false,
            received_handshake: false,
            got_peer_id: false,
            awaiting_init: false,
            incoming: BytesMut::new(),
            outgoing: BytesMut::new(),
            pending_blocks: VecDeque::new(),
            pending_block_bytes: 0,
            requested: Vec::new(),
            timeout: CONNECT_TIMEOUT,
            last_activity: now,
            keep_alive_at: None,
            pending_request_deadline: None,
            next_rotate: now + Counter::PEER_TICK,
            counter: Counter::peer(),
            read_blocked: false,
            close_reason: None,
            events: Vec::new(),
        }
    }

    /// A connection we are opening, the transport is attached once the
    /// TCP connect finished.
    pub fn new_outbound(id: ConnId, addr: SocketAddr, local_peer_id: PeerId) -> Self {
        Self::new(id, addr, Direction::Outbound, local_peer_id, None)
    }

    /// A connection accepted by the listener. The torrent is unknown until
    /// the handshake names it.
    pub fn new_inbound(
        id: ConnId,
        addr: SocketAddr,
        local_peer_id: PeerId,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self::new(id, addr, Direction::Inbound, local_peer_id, Some(transport))
    }

    /// Hand the connected socket to an outbound connection.
    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
        self.last_activity = Instant::now();
        if self.info_hash.is_some() && !self.sent_handshake {
            self.send_handshake();
        }
    }

    /// Bind the connection to a torrent and send our handshake if the
    /// socket is connected.
    pub fn initialize(&mut self, info_hash: InfoHash, piece_count: usize) {
        self.info_hash = Some(info_hash);
        self.pieces = Bitfield::from_piece(piece_count);

        if self.transport.is_some() && !self.sent_handshake {
            self.send_handshake();
        }

        if self.awaiting_init {
            self.awaiting_init = false;
            self.process_incoming();
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn info_hash(&self) -> Option<InfoHash> {
        self.info_hash
    }

    pub fn state(&self) -> PeerWireState {
        self.state
    }

    /// Pieces the peer announced.
    pub fn pieces(&self) -> &Bitfield {
        &self.pieces
    }

    /// Blocks requested from the peer that did not arrive yet.
    pub fn requested_blocks(&self) -> &[BlockInfo] {
        &self.requested
    }

    pub fn download_rate(&self) -> u64 {
        self.counter.download_rate()
    }

    pub fn upload_rate(&self) -> u64 {
        self.counter.upload_rate()
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    #[cfg(test)]
    pub(crate) fn counter_mut(&mut self) -> &mut Counter {
        &mut self.counter
    }

    /// The TCP connect did not finish yet.
    pub fn is_connecting(&self) -> bool {
        self.transport.is_none() && self.close_reason.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.is_some()
    }

    pub fn close_reason(&self) -> Option<&Error> {
        self.close_reason.as_ref()
    }

    /// Drain what happened since the last call.
    pub fn take_events(&mut self) -> Vec<PeerEvent> {
        mem::take(&mut self.events)
    }

    /// Close the connection, the owner sees a [`PeerEvent::Disconnected`].
    pub fn abort(&mut self, reason: Error) {
        if self.close_reason.is_some() {
            return;
        }
        debug!("{:?} connection {} to {} closed: {reason}", self.direction, self.id, self.addr);
        self.transport = None;
        self.outgoing.clear();
        self.pending_blocks.clear();
        self.pending_block_bytes = 0;
        self.close_reason = Some(reason);
        self.events.push(PeerEvent::Disconnected);
    }

    fn send_handshake(&mut self) {
        let Some(info_hash) = self.info_hash else {
            return;
        };
        match Handshake::new(info_hash, self.local_peer_id).serialize() {
            Ok(bytes) => {
                self.outgoing.extend_from_slice(&bytes);
                self.sent_handshake = true;
                self.timeout = CLIENT_TIMEOUT;
            }
            Err(e) => self.abort(e),
        }
    }

    fn queue(&mut self, msg: Message) {
        if let Err(e) = MessageCodec.encode(msg, &mut self.outgoing) {
            self.abort(e);
        }
    }

    /// Send our bitfield, only when we have at least one piece.
    pub fn send_piece_list(&mut self, completed: &Bitfield) {
        if completed.any() {
            self.queue(Message::Bitfield(completed.to_wire().into()));
        }
    }

    pub fn send_keep_alive(&mut self) {
        self.queue(Message::KeepAlive);
    }

    /// Stop serving the peer. The peer assumes every pending request is
    /// lost, so the buffered blocks are dropped.
    pub fn choke_peer(&mut self) {
        self.queue(Message::Choke);
        self.state.insert(PeerWireState::CHOKING_PEER);
        self.pending_blocks.clear();
        self.pending_block_bytes = 0;
    }

    pub fn unchoke_peer(&mut self) {
        self.queue(Message::Unchoke);
        self.state.remove(PeerWireState::CHOKING_PEER);
    }

    /// A choking peer has to unchoke us before the pending request timeout.
    pub fn send_interested(&mut self) {
        self.queue(Message::Interested);
        self.state.insert(PeerWireState::INTERESTED_IN_PEER);
        if self.state.contains(PeerWireState::CHOKED_BY_PEER) {
            self.pending_request_deadline = Some(Instant::now() + PENDING_REQUEST_TIMEOUT);
        }
    }

    pub fn send_not_interested(&mut self) {
        self.queue(Message::NotInterested);
        self.state.remove(PeerWireState::INTERESTED_IN_PEER);
    }

    /// Tell the peer we have a new piece.
    pub fn send_piece_notification(&mut self, index: u32) {
        self.queue(Message::Have(index));
    }

    pub fn request_block(&mut self, info: BlockInfo) {
        self.queue(Message::Request(info));
        self.requested.push(info);
        self.pending_request_deadline = Some(Instant::now() + PENDING_REQUEST_TIMEOUT);
    }

    pub fn cancel_request(&mut self, info: BlockInfo) {
        self.queue(Message::Cancel(info));
        self.requested.retain(|b| *b != info);
    }

    /// Buffer a block for the peer, it is written when the rate controller
    /// allows it.
    pub fn send_block(&mut self, block: Block) {
        let info = block.info();
        let mut buf = BytesMut::with_capacity(block.data.len() + 13);
        if let Err(e) = MessageCodec.encode(Message::Piece(block), &mut buf) {
            self.abort(e);
            return;
        }
        self.pending_block_bytes += buf.len();
        self.pending_blocks.push_back((info, buf));

        if self.pending_block_bytes > MAX_PENDING_BLOCK_BYTES {
            // the peer asks faster than we can upload
            self.choke_peer();
            self.unchoke_peer();
        }
    }

    /// Check the timers of the connection, aborting it when one expired.
    pub fn poll_timers(&mut self, now: Instant) {
        if self.is_closed() || self.transport.is_none() {
            return;
        }

        if now >= self.last_activity + self.timeout {
            self.abort(Error::Timeout);
            return;
        }

        if let Some(deadline) = self.pending_request_deadline {
            if now >= deadline {
                self.abort(Error::RequestTimeout);
                return;
            }
        }

        if let Some(at) = self.keep_alive_at {
            if now >= at {
                self.send_keep_alive();
                self.keep_alive_at = Some(now + KEEP_ALIVE_INTERVAL);
            }
        }

        if now >= self.next_rotate {
            if !self.counter.is_idle() {
                self.counter.rotate();
            }
            self.next_rotate = now + Counter::PEER_TICK;
        }
    }

    /// Feed bytes as if they were read from the socket.
    fn received(&mut self, bytes: &[u8]) {
        self.incoming.put_slice(bytes);
        self.counter.record_download(bytes.len() as u64);
        self.last_activity = Instant::now();
        self.events.push(PeerEvent::BytesReceived(bytes.len()));
        self.process_incoming();
    }

    fn process_incoming(&mut self) {
        loop {
            if self.is_closed() || self.awaiting_init {
                return;
            }

            if !self.received_handshake {
                let header = match HandshakeCodec.decode(&mut self.incoming) {
                    Ok(Some(header)) => header,
                    Ok(None) => return,
                    Err(e) => return self.abort(e),
                };
                self.received_handshake = true;

                match self.info_hash {
                    None => {
                        trace!("{} handshake for {:?}", self.addr, header.info_hash);
                        self.awaiting_init = true;
                        self.events.push(PeerEvent::InfoHashReceived(header.info_hash));
                        return;
                    }
                    Some(ours) if ours != header.info_hash => {
                        return self.abort(Error::InfoHashMismatch);
                    }
                    Some(_) => {}
                }
                if !self.sent_handshake {
                    self.send_handshake();
                }
                continue;
            }

            if !self.got_peer_id {
                if self.incoming.len() < 20 {
                    return;
                }
                let raw = self.incoming.split_to(20);
                let mut id = [0u8; 20];
                id.copy_from_slice(&raw);
                let id = PeerId(id);
                if id == self.local_peer_id {
                    return self.abort(Error::SelfConnection);
                }
                self.peer_id = Some(id);
                self.got_peer_id = true;
                self.keep_alive_at = Some(Instant::now() + KEEP_ALIVE_INTERVAL);
                continue;
            }

            match MessageCodec.decode(&mut self.incoming) {
                Ok(Some(msg)) => self.handle_message(msg),
                Ok(None) => return,
                Err(e) => return self.abort(e),
            }
        }
    }

    fn handle_message(&mut self, msg: Message) {
        trace!("{} <- {msg:?}", self.addr);
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.state.insert(PeerWireState::CHOKED_BY_PEER);
                self.requested.clear();
                self.pending_request_deadline = None;
                self.events.push(PeerEvent::Choked);
            }
            Message::Unchoke => {
                self.state.remove(PeerWireState::CHOKED_BY_PEER);
                self.pending_request_deadline = None;
                self.events.push(PeerEvent::Unchoked);
            }
            Message::Interested => {
                self.state.insert(PeerWireState::PEER_IS_INTERESTED);
                self.events.push(PeerEvent::Interested);
            }
            Message::NotInterested => {
                self.state.remove(PeerWireState::PEER_IS_INTERESTED);
                self.events.push(PeerEvent::NotInterested);
            }
            Message::Have(index) => {
                if self.pieces.safe_set(index as usize) {
                    self.events.push(PeerEvent::PiecesAvailable);
                }
            }
            Message::Bitfield(bits) => {
                self.pieces.merge_wire(&bits);
                self.events.push(PeerEvent::PiecesAvailable);
            }
            Message::Request(info) => {
                self.events.push(PeerEvent::BlockRequested(info));
            }
            Message::Piece(block) => {
                let info = block.info();
                self.requested.retain(|b| *b != info);
                self.pending_request_deadline = None;
                self.events.push(PeerEvent::BlockReceived(block));
            }
            Message::Cancel(info) => {
                let before = self.pending_blocks.len();
                self.pending_blocks.retain(|(b, _)| *b != info);
                if self.pending_blocks.len() != before {
                    self.pending_block_bytes =
                        self.pending_blocks.iter().map(|(_, buf)| buf.len()).sum();
                }
            }
        }
    }
}

impl RateLimited for PeerConnection {
    fn is_connected(&self) -> bool {
        self.transport.is_some() && self.close_reason.is_none()
    }

    fn rearm(&mut self) {
        self.read_blocked = false;
    }

    fn can_transfer_more(&self) -> bool {
        self.socket_bytes_available() > 0
            || !self.outgoing.is_empty()
            || !self.pending_blocks.is_empty()
    }

    /// A socket does not tell how much it holds, a socket that did not
    /// block on the last read is assumed to have more.
    fn socket_bytes_available(&self) -> usize {
        if self.is_connected() && !self.read_blocked {
            usize::MAX
        } else {
            0
        }
    }

    fn bytes_to_write(&self) -> usize {
        self.transport.as_ref().map(|t| t.queued()).unwrap_or(0)
    }

    fn read_from_socket(&mut self, max: usize) -> usize {
        let mut total = 0;
        let mut buf = [0u8; READ_CHUNK];

        while total < max {
            let Some(transport) = self.transport.as_mut() else {
                break;
            };
            let len = READ_CHUNK.min(max - total);
            match transport.recv(&mut buf[..len]) {
                Ok(0) => {
                    self.abort(Error::PeerClosedSocket);
                    break;
                }
                Ok(n) => {
                    total += n;
                    self.received(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_blocked = true;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.abort(e.into());
                    break;
                }
            }
        }
        total
    }

    fn write_to_socket(&mut self, max: usize) -> usize {
        let mut total = 0;

        while total < max {
            if self.outgoing.is_empty() {
                let Some((_, block)) = self.pending_blocks.pop_front() else {
                    break;
                };
                self.pending_block_bytes -= block.len();
                self.outgoing = block;
            }

            let Some(transport) = self.transport.as_mut() else {
                break;
            };
            let len = self.outgoing.len().min(max - total);
            match transport.send(&self.outgoing[..len]) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = self.outgoing.split_to(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.abort(e.into());
                    break;
                }
            }
        }

        if total > 0 {
            self.counter.record_upload(total as u64);
            self.events.push(PeerEvent::BytesWritten(total));
        }
        total
    }
}


#[cfg(test)]
mod tests {
    use bytes::{Buf, Bytes};

    use super::{test_transport::MemoryTransport, *};

    const INFO_HASH: InfoHash = InfoHash([3u8; 20]);
    const REMOTE_ID: PeerId = PeerId([9u8; 20]);
    const LOCAL_ID: PeerId = PeerId([1u8; 20]);

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    fn encode(msgs: Vec<Message>) -> BytesMut {
        let mut buf = BytesMut::new();
        for msg in msgs {
            MessageCodec.encode(msg, &mut buf).unwrap();
        }
        buf
    }

    /// Outbound connection that finished the handshake.
    fn connected() -> (PeerConnection, MemoryTransport) {
        let pipe = MemoryTransport::default();
        let mut conn = PeerConnection::new_outbound(0, addr(), LOCAL_ID);
        conn.initialize(INFO_HASH, 10);
        conn.attach(Box::new(pipe.clone()));

        pipe.push(&Handshake::new(INFO_HASH, REMOTE_ID).serialize().unwrap());
        conn.read_from_socket(usize::MAX);
        conn.write_to_socket(usize::MAX);
        let sent = pipe.take_sent();
        assert_eq!(sent.len(), HANDSHAKE_LEN);
        assert_eq!(conn.peer_id(), Some(REMOTE_ID));
        conn.take_events();
        (conn, pipe)
    }

    fn feed(conn: &mut PeerConnection, pipe: &MemoryTransport, msgs: Vec<Message>) {
        pipe.push(&encode(msgs));
        conn.rearm();
        conn.read_from_socket(usize::MAX);
    }

    fn decode_sent(pipe: &MemoryTransport) -> Vec<Message> {
        let mut buf = pipe.take_sent();
        let mut out = vec![];
        while let Some(msg) = MessageCodec.decode(&mut buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn handshake_and_state_messages() {
        let (mut conn, pipe) = connected();
        assert!(conn.state().contains(PeerWireState::CHOKED_BY_PEER));

        feed(&mut conn, &pipe, vec![Message::Unchoke, Message::Interested]);
        assert!(!conn.state().contains(PeerWireState::CHOKED_BY_PEER));
        assert!(conn.state().contains(PeerWireState::PEER_IS_INTERESTED));
        assert_eq!(
            conn.take_events()
                .into_iter()
                .filter(|e| !matches!(e, PeerEvent::BytesReceived(_)))
                .collect::<Vec<_>>(),
            vec![PeerEvent::Unchoked, PeerEvent::Interested]
        );
    }

    #[test]
    fn have_and_bitfield_out_of_range() {
        let (mut conn, pipe) = connected();

        // 10 pieces, the last byte claims pieces 10..16 that do not exist
        feed(
            &mut conn,
            &pipe,
            vec![
                Message::Bitfield(Bytes::from_static(&[0b1000_0000, 0b0111_1111])),
                Message::Have(3),
                Message::Have(10),
                Message::Have(u32::MAX),
            ],
        );

        assert!(!conn.is_closed());
        assert_eq!(conn.pieces().len(), 10);
        assert_eq!(conn.pieces().iter_ones().collect::<Vec<_>>(), vec![0, 3, 9]);
    }

    #[test]
    fn interested_without_unchoke_times_out() {
        let (mut conn, pipe) = connected();
        conn.send_interested();
        conn.request_block(BlockInfo::new(0, 0, BLOCK_LEN));

        // keep the connection alive, only the pending request expires
        let start = Instant::now();
        conn.poll_timers(start + Duration::from_secs(30));
        assert!(!conn.is_closed());

        conn.poll_timers(start + PENDING_REQUEST_TIMEOUT + Duration::from_secs(1));
        assert!(conn.is_closed());
        assert!(matches!(conn.close_reason(), Some(Error::RequestTimeout)));
        assert!(conn.take_events().contains(&PeerEvent::Disconnected));
        assert!(!conn.is_connected());
        drop(pipe);
    }

    #[test]
    fn unchoke_and_piece_clear_the_pending_deadline() {
        let (mut conn, pipe) = connected();
        conn.send_interested();
        feed(&mut conn, &pipe, vec![Message::Unchoke]);

        let info = BlockInfo::new(1, 0, 4);
        conn.request_block(info);
        assert_eq!(conn.requested_blocks(), &[info]);

        feed(
            &mut conn,
            &pipe,
            vec![Message::Piece(Block { index: 1, begin: 0, data: Bytes::from_static(b"abcd") })],
        );
        assert!(conn.requested_blocks().is_empty());
        assert!(conn
            .take_events()
            .iter()
            .any(|e| matches!(e, PeerEvent::BlockReceived(b) if b.info() == info)));

        // nothing is pending anymore, only the inactivity timeout applies
        conn.poll_timers(Instant::now() + PENDING_REQUEST_TIMEOUT + Duration::from_secs(1));
        assert!(!conn.is_closed());
    }

    #[test]
    fn choke_drops_requested_blocks() {
        let (mut conn, pipe) = connected();
        conn.request_block(BlockInfo::new(0, 0, BLOCK_LEN));
        conn.request_block(BlockInfo::new(0, BLOCK_LEN, BLOCK_LEN));

        feed(&mut conn, &pipe, vec![Message::Choke]);
        assert!(conn.requested_blocks().is_empty());
        assert!(conn.take_events().contains(&PeerEvent::Choked));
    }

    #[test]
    fn connecting_to_ourselves() {
        let pipe = MemoryTransport::default();
        let mut conn = PeerConnection::new_outbound(0, addr(), LOCAL_ID);
        conn.initialize(INFO_HASH, 10);
        conn.attach(Box::new(pipe.clone()));

        pipe.push(&Handshake::new(INFO_HASH, LOCAL_ID).serialize().unwrap());
        conn.read_from_socket(usize::MAX);
        assert!(matches!(conn.close_reason(), Some(Error::SelfConnection)));
    }

    #[test]
    fn info_hash_mismatch() {
        let pipe = MemoryTransport::default();
        let mut conn = PeerConnection::new_outbound(0, addr(), LOCAL_ID);
        conn.initialize(INFO_HASH, 10);
        conn.attach(Box::new(pipe.clone()));

        pipe.push(&Handshake::new(InfoHash([4u8; 20]), REMOTE_ID).serialize().unwrap());
        conn.read_from_socket(usize::MAX);
        assert!(matches!(conn.close_reason(), Some(Error::InfoHashMismatch)));
    }

    #[test]
    fn inbound_waits_for_initialize() {
        let pipe = MemoryTransport::default();
        let mut conn = PeerConnection::new_inbound(7, addr(), LOCAL_ID, Box::new(pipe.clone()));

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&Handshake::new(INFO_HASH, REMOTE_ID).serialize().unwrap());
        wire.extend(encode(vec![Message::Have(2)]));
        pipe.push(&wire);
        conn.read_from_socket(usize::MAX);

        assert!(conn.take_events().contains(&PeerEvent::InfoHashReceived(INFO_HASH)));
        assert_eq!(conn.peer_id(), None);

        conn.initialize(INFO_HASH, 4);
        assert_eq!(conn.peer_id(), Some(REMOTE_ID));
        assert!(conn.pieces()[2]);

        conn.write_to_socket(usize::MAX);
        let mut sent = pipe.take_sent();
        let handshake = Handshake::deserialize(&sent.split_to(HANDSHAKE_LEN)).unwrap();
        assert_eq!(handshake.info_hash, INFO_HASH);
        assert_eq!(handshake.peer_id, LOCAL_ID);
    }

    #[test]
    fn oversized_message_aborts() {
        let (mut conn, pipe) = connected();
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_SIZE as u32 + 1);
        pipe.push(&buf);
        conn.read_from_socket(usize::MAX);
        assert!(matches!(conn.close_reason(), Some(Error::MessageTooLarge(_))));
    }

    #[test]
    fn remote_close() {
        let (mut conn, pipe) = connected();
        pipe.close();
        conn.rearm();
        conn.read_from_socket(100);
        assert!(matches!(conn.close_reason(), Some(Error::PeerClosedSocket)));
    }

    #[test]
    fn blocks_are_sent_within_the_budget() {
        let (mut conn, pipe) = connected();
        let uploaded = conn.counter().total_uploaded;
        conn.send_block(Block { index: 0, begin: 0, data: Bytes::from(vec![7u8; 100]) });
        assert!(conn.can_transfer_more());

        assert_eq!(conn.write_to_socket(50), 50);
        assert_eq!(conn.write_to_socket(1000), 13 + 100 - 50);
        assert_eq!(conn.counter().total_uploaded - uploaded, 113);

        let mut sent = pipe.take_sent();
        assert_eq!(sent.get_u32(), 109);
        assert_eq!(sent.get_u8(), MessageId::Piece as u8);
    }

    #[test]
    fn cancel_drops_a_buffered_block() {
        let (mut conn, pipe) = connected();
        conn.send_block(Block { index: 0, begin: 0, data: Bytes::from(vec![1u8; 10]) });
        conn.send_block(Block { index: 0, begin: 10, data: Bytes::from(vec![2u8; 10]) });

        feed(&mut conn, &pipe, vec![Message::Cancel(BlockInfo::new(0, 0, 10))]);
        conn.write_to_socket(usize::MAX);

        let sent = decode_sent(&pipe);
        assert_eq!(
            sent,
            vec![Message::Piece(Block { index: 0, begin: 10, data: Bytes::from(vec![2u8; 10]) })]
        );
    }

    #[test]
    fn too_many_buffered_blocks_choke_and_unchoke() {
        let (mut conn, pipe) = connected();
        conn.unchoke_peer();

        for i in 0..32 {
            conn.send_block(Block {
                index: 0,
                begin: i * BLOCK_LEN,
                data: Bytes::from(vec![0u8; BLOCK_LEN as usize]),
            });
        }

        // the buffered blocks are gone, only the state messages remain
        conn.write_to_socket(usize::MAX);
        assert_eq!(decode_sent(&pipe), vec![Message::Unchoke, Message::Choke, Message::Unchoke]);
        assert!(!conn.state().contains(PeerWireState::CHOKING_PEER));
        assert!(conn.pending_blocks.is_empty());
    }

    #[test]
    fn keep_alive_is_sent() {
        let (mut conn, pipe) = connected();
        conn.poll_timers(Instant::now() + KEEP_ALIVE_INTERVAL + Duration::from_secs(1));
        conn.write_to_socket(usize::MAX);
        assert_eq!(decode_sent(&pipe), vec![Message::KeepAlive]);
    }

    #[test]
    fn inactivity_timeout() {
        let (mut conn, _pipe) = connected();
        conn.poll_timers(Instant::now() + CLIENT_TIMEOUT + Duration::from_secs(1));
        assert!(matches!(conn.close_reason(), Some(Error::Timeout)));
    }
}
