use std::fmt::Display;

use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};
use speedy::{Readable, Writable};

use crate::torrent::InfoHash;

/// Identifier of a connection, unique for the lifetime of the process.
pub type ConnId = u64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Azureus-style id: client tag, version, then random characters.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-SD0100-");
        for (dst, c) in id[8..].iter_mut().zip(rand::thread_rng().sample_iter(Alphanumeric)) {
            *dst = c;
        }
        Self(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = &'static str;
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let buff: [u8; 20] =
            value.try_into().map_err(|_| "The peer id must have exactly 20 bytes")?;
        Ok(PeerId(buff))
    }
}

/// The representation of a [`Block`].
///
/// When we ask a peer to give us a [`Block`], we send this struct,
/// and the peer sends a [`Block`] back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes. <= 16 KiB
    pub len: u32,
}

impl BlockInfo {
    pub fn new(index: u32, begin: u32, len: u32) -> Self {
        Self { index, begin, len }
    }
}

/// A Block is a subset of a Piece,
/// pieces are subsets of the entire Torrent data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub data: Bytes,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo::new(self.index, self.begin, self.data.len() as u32)
    }
}

/// Who opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Choke and interest flags of a connection, they are independent of
/// each other.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerWireState(u8);

impl PeerWireState {
    /// We do not serve the peer.
    pub const CHOKING_PEER: Self = Self(0b0001);
    /// We want pieces the peer has.
    pub const INTERESTED_IN_PEER: Self = Self(0b0010);
    /// The peer does not serve us.
    pub const CHOKED_BY_PEER: Self = Self(0b0100);
    /// The peer wants pieces we have.
    pub const PEER_IS_INTERESTED: Self = Self(0b1000);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl Default for PeerWireState {
    /// Both sides of the connection start off as choked and not
    /// interested in the other.
    fn default() -> Self {
        Self(Self::CHOKING_PEER.0 | Self::CHOKED_BY_PEER.0)
    }
}

impl std::fmt::Debug for PeerWireState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerWireState")
            .field("choking_peer", &self.contains(Self::CHOKING_PEER))
            .field("interested_in_peer", &self.contains(Self::INTERESTED_IN_PEER))
            .field("choked_by_peer", &self.contains(Self::CHOKED_BY_PEER))
            .field("peer_is_interested", &self.contains(Self::PEER_IS_INTERESTED))
            .finish()
    }
}

/// What happened on a connection, drained by its owner after every
/// transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// An inbound handshake named this torrent, the owner must route the
    /// connection and call `initialize`.
    InfoHashReceived(InfoHash),
    /// The connection was aborted, the reason is in `close_reason`.
    Disconnected,
    /// The peer's bitfield changed after `have` or `bitfield`.
    PiecesAvailable,
    Choked,
    Unchoked,
    Interested,
    NotInterested,
    BlockRequested(BlockInfo),
    BlockReceived(Block),
    BytesReceived(usize),
    BytesWritten(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_state_flags() {
        let mut state = PeerWireState::default();
        assert!(state.contains(PeerWireState::CHOKING_PEER));
        assert!(state.contains(PeerWireState::CHOKED_BY_PEER));
        assert!(!state.contains(PeerWireState::INTERESTED_IN_PEER));

        state.insert(PeerWireState::PEER_IS_INTERESTED);
        state.remove(PeerWireState::CHOKING_PEER);
        assert!(state.contains(PeerWireState::PEER_IS_INTERESTED));
        assert!(!state.contains(PeerWireState::CHOKING_PEER));
        assert!(state.contains(PeerWireState::CHOKED_BY_PEER));
    }

    #[test]
    fn generated_peer_id() {
        let id = PeerId::generate();
        assert_eq!(&id.0[..8], b"-SD0100-");
        assert!(id.0[8..].iter().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, PeerId::generate());
    }
}
