//! Piece, upload and peer selection of a [`Session`].
use std::{cmp::Reverse, iter, net::SocketAddr};

use rand::{rngs::StdRng, seq::SliceRandom, Rng};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{
    Piece, Session, SessionState, ACTIVE_PEER_RATE, MAX_CONNECTION_PER_PEER, MAX_UPLOADS,
    MINIMUM_TIME_BEFORE_REVISIT,
};
use crate::{
    bitfield::BitfieldExt,
    connection_manager::ConnectionManager,
    error::Error,
    peer::{BlockInfo, ConnId, PeerConnection, PeerWireState, BLOCK_LEN},
    rate_controller::RateLimited,
    tracker::Announcer,
};

/// Below this many pending pieces, warming up peers do not share pieces.
const WARM_UP_SHARED_PIECES: usize = 4;

impl<A: Announcer> Session<A> {
    /// Give work to every connection that can take more.
    pub(super) fn schedule_downloads(&mut self) {
        self.scheduler_called = false;
        if !self.is_accepting() || self.state == SessionState::Seeding {
            return;
        }

        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            self.schedule_piece_for_client(id);
        }
    }

    /// Pick a piece for the connection `id` and request blocks from it.
    pub(super) fn schedule_piece_for_client(&mut self, id: ConnId) {
        let max_blocks = self.max_blocks_in_progress();
        let exempt_claims = self.state == SessionState::WarmingUp;

        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        if !conn.is_connected() || conn.state().contains(PeerWireState::CHOKED_BY_PEER) {
            return;
        }
        let in_flight = conn.requested_blocks().len();
        if in_flight >= max_blocks {
            return;
        }
        let peer_pieces = conn.pieces().clone();
        // uploading peers keep their own pieces during endgame
        let exempt_claims = exempt_claims
            || (self.state == SessionState::Endgame && conn.upload_rate() < ACTIVE_PEER_RATE);

        let current: Vec<u32> = self.payloads.get(&id).cloned().unwrap_or_default();

        // a piece that was handed over but not started yet
        if in_flight == 0 {
            let waiting = current
                .iter()
                .copied()
                .find(|i| self.pending_pieces.get(i).is_some_and(|p| !p.in_progress));
            if let Some(index) = waiting {
                if let Some(piece) = self.pending_pieces.get_mut(&index) {
                    piece.in_progress = true;
                }
                self.request_more(id);
                return;
            }
        }

        // warming up peers all work on the same few pieces
        if self.state == SessionState::WarmingUp
            && self.pending_pieces.len() >= WARM_UP_SHARED_PIECES
        {
            let shared = match current.first() {
                Some(index) => Some(*index),
                None => {
                    let choices: Vec<u32> = self
                        .pending_pieces
                        .keys()
                        .copied()
                        .filter(|i| peer_pieces.safe_get(*i as usize))
                        .collect();
                    choices.choose(&mut self.rng).copied()
                }
            };

            if let Some(index) = shared {
                let Some(piece) = self.pending_pieces.get_mut(&index) else {
                    return;
                };
                if piece.blocks_left() == in_flight {
                    return;
                }
                piece.in_progress = true;
                self.add_payload(id, index);
                self.request_more(id);
                return;
            }
        }

        let candidates: Vec<usize> = self
            .incomplete
            .iter_ones()
            .filter(|i| peer_pieces.safe_get(*i))
            .filter(|i| !current.contains(&(*i as u32)))
            .filter(|i| {
                exempt_claims
                    || !self.pending_pieces.get(&(*i as u32)).is_some_and(|p| p.in_progress)
            })
            .collect();

        if candidates.is_empty() {
            // idle until the peer gets something interesting
            return;
        }

        let multi = self.is_multi_mode();
        let partial: Vec<u32> = candidates
            .iter()
            .map(|i| *i as u32)
            .filter(|i| self.pending_pieces.get(i).is_some_and(|p| !p.in_progress || multi))
            .collect();

        let resumed = partial.choose(&mut self.rng).copied();
        let index = match resumed {
            Some(index) => Some(index as usize),
            None if self.state == SessionState::WarmingUp => {
                self.pick_by_availability(&candidates, true)
            }
            None if self.rng.gen_range(0..4) == 0 => self.pick_by_availability(&candidates, false),
            None => candidates.choose(&mut self.rng).copied(),
        };
        let index = index.unwrap_or(candidates[0]) as u32;
        let length = self.meta.info.piece_length_at(index as usize);
        let piece = self.pending_pieces.entry(index).or_insert_with(|| Piece::new(index, length));
        piece.in_progress = true;
        trace!("connection {id} scheduled piece {index}");

        self.add_payload(id, index);
        self.request_more(id);
    }

    /// Most common or rarest candidate across the open connections, ties
    /// are broken at random.
    pub(super) fn pick_by_availability(
        &mut self,
        candidates: &[usize],
        most_common: bool,
    ) -> Option<usize> {
        let mut occurrences = vec![0usize; self.piece_count()];
        for conn in self.connections.values() {
            for i in conn.pieces().iter_ones() {
                if let Some(n) = occurrences.get_mut(i) {
                    *n += 1;
                }
            }
        }

        let counts = candidates.iter().map(|i| occurrences[*i]);
        let target = if most_common { counts.max() } else { counts.min() }?;

        let extremes: Vec<usize> =
            candidates.iter().copied().filter(|i| occurrences[*i] == target).collect();
        extremes.choose(&mut self.rng).copied()
    }

    fn add_payload(&mut self, id: ConnId, index: u32) {
        let pieces = self.payloads.entry(id).or_default();
        if !pieces.contains(&index) {
            pieces.push(index);
        }
    }

    /// Fill the block quota of `id` from the pieces it works on.
    pub(super) fn request_more(&mut self, id: ConnId) {
        let multi = self.is_multi_mode();
        let max_blocks = self.max_blocks_in_progress();

        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !conn.is_connected() || conn.state().contains(PeerWireState::CHOKED_BY_PEER) {
            return;
        }

        let pieces: Vec<u32> = self
            .payloads
            .get(&id)
            .into_iter()
            .flatten()
            .copied()
            .filter(|i| self.pending_pieces.get(i).is_some_and(|p| p.in_progress || multi))
            .collect();

        if pieces.is_empty() {
            if self.incomplete.any() {
                self.call_scheduler();
            }
            return;
        }

        let mut in_flight = conn.requested_blocks().len();
        if in_flight >= max_blocks {
            return;
        }

        for index in pieces {
            let Some(piece) = self.pending_pieces.get_mut(&index) else {
                continue;
            };
            in_flight += request_blocks(conn, piece, max_blocks - in_flight, multi, &mut self.rng);
            if in_flight >= max_blocks {
                break;
            }
        }

        if in_flight < max_blocks && self.state != SessionState::WarmingUp {
            self.call_scheduler();
        }
    }

    /// Unchoke the best peers and one random interested peer.
    ///
    /// Peers are ranked by how fast they send to us, or how fast we send
    /// to them once seeding. Seeds never need anything from us.
    pub(super) fn schedule_uploads(&mut self) {
        let piece_count = self.piece_count();
        let seeding = self.state == SessionState::Seeding;

        let mut ranked: Vec<(u64, ConnId)> = self
            .connections
            .values()
            .filter(|c| c.is_connected() && c.pieces().count_ones() != piece_count)
            .map(|c| {
                let rate = if seeding { c.upload_rate() } else { c.download_rate() };
                (rate, c.id())
            })
            .collect();
        ranked.sort_by_key(|(rate, id)| (Reverse(*rate), *id));

        let mut optimistic = Vec::new();
        for (rank, (_, id)) in ranked.into_iter().enumerate() {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            let choking = conn.state().contains(PeerWireState::CHOKING_PEER);

            if rank < MAX_UPLOADS {
                if choking {
                    conn.unchoke_peer();
                }
                continue;
            }

            if !choking {
                // make room for better peers once in a while
                if self.rng.gen_range(0..10) == 0 {
                    conn.abort(Error::Aborted);
                } else {
                    conn.choke_peer();
                }
                continue;
            }

            if conn.state().contains(PeerWireState::PEER_IS_INTERESTED) {
                optimistic.push(id);
            }
        }

        if let Some(id) = optimistic.choose(&mut self.rng) {
            if let Some(conn) = self.connections.get_mut(id) {
                trace!("optimistic unchoke of {}", conn.addr());
                conn.unchoke_peer();
            }
        }
    }

    /// Peers we may dial, the more interesting ones are listed more than
    /// once.
    pub(super) fn weighed_free_peers(&self, now: Instant) -> Vec<SocketAddr> {
        let piece_count = self.piece_count() as i64;
        let seeding = self.state == SessionState::Seeding;

        let mut points: Vec<(i64, SocketAddr)> = Vec::new();
        for peer in &self.peers {
            let open = self
                .connections
                .values()
                .filter(|c| c.addr() == peer.addr && !c.is_closed())
                .count();
            if open >= MAX_CONNECTION_PER_PEER {
                continue;
            }
            if peer
                .last_visited
                .is_some_and(|at| now.duration_since(at) < MINIMUM_TIME_BEFORE_REVISIT)
            {
                continue;
            }

            let mut score = 0;
            if peer.interesting {
                score += peer.num_completed_pieces as i64;
                if seeding {
                    score = piece_count - score;
                }
                // an unknown peer is as good as a seed
                if peer.connect_start.is_none() {
                    score += piece_count;
                }
                let secs = peer.connect_time.map(|d| d.as_secs() as i64).unwrap_or(0);
                if secs < 5 {
                    score += (piece_count / 10) * (5 - secs);
                }
            }
            points.push((score, peer.addr));
        }
        points.sort_by_key(|(score, _)| *score);

        // consecutive scores become levels one apart
        let mut weighed = Vec::new();
        let mut lowest = 0;
        let mut level = 0;
        for (score, addr) in points {
            if score > lowest {
                lowest = score;
                level += 1;
            }
            weighed.extend(iter::repeat(addr).take(level + 1));
        }
        weighed
    }

    /// Open a random number of outbound connections.
    pub(super) fn connect_to_peers(&mut self, cm: &mut ConnectionManager) {
        self.next_peer_connect = None;
        if !self.is_accepting() {
            return;
        }

        let now = Instant::now();
        let mut weighed = self.weighed_free_peers(now);
        if self.state == SessionState::Searching && !weighed.is_empty() {
            self.set_state(SessionState::Connecting);
        }
        let bound = (cm.max_connections() / 2).max(2);

        while !weighed.is_empty()
            && cm.can_add_connection()
            && self.rng.gen_range(0..bound) != 0
        {
            let addr = weighed[self.rng.gen_range(0..weighed.len())];
            weighed.retain(|a| *a != addr);

            let id = cm.next_id();
            cm.add_connection(id);
            if let Some(peer) = self.peers.iter_mut().find(|p| p.addr == addr) {
                peer.connect_start = Some(now);
                peer.last_visited = Some(now);
            }

            debug!("{} connecting to {addr}", self.meta.info.name);
            let conn = PeerConnection::new_outbound(id, addr, self.ctx.local_peer_id);
            self.connections.insert(id, conn);
            self.spawn_connect(id, addr);
        }

        if !weighed.is_empty() {
            self.call_peer_connector();
        }
    }
}

/// Request up to `max` blocks of `piece`. In multi mode blocks already
/// asked to other peers are asked again, in random order.
fn request_blocks(
    conn: &mut PeerConnection,
    piece: &mut Piece,
    max: usize,
    multi: bool,
    rng: &mut StdRng,
) -> usize {
    let block_info = |bit: usize| {
        BlockInfo::new(piece.index, bit as u32 * BLOCK_LEN, piece.block_len(bit))
    };

    let mut bits: Vec<usize> = (0..piece.block_count())
        .filter(|b| !piece.completed_blocks[*b] && !piece.requested_blocks[*b])
        .collect();

    if bits.is_empty() {
        if !multi {
            return 0;
        }
        bits = (0..piece.block_count())
            .filter(|b| !piece.completed_blocks[*b])
            .filter(|b| !conn.requested_blocks().contains(&block_info(*b)))
            .collect();
    }

    if multi {
        bits.shuffle(rng);
    }

    let count = max.min(bits.len());
    for bit in &bits[..count] {
        conn.request_block(block_info(*bit));
    }
    for bit in &bits[..count] {
        piece.requested_blocks.set(*bit, true);
    }
    count
}
