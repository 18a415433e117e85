use std::{
    fmt::Display,
    net::SocketAddr,
    ops::Deref,
    str::FromStr,
    time::Duration,
};

use speedy::{Readable, Writable};
use tokio::time::Instant;

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    peer::{PeerId, BLOCK_LEN},
};

/// SHA-1 of the raw `info` dictionary, identifies a swarm.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for InfoHash {
    type Error = &'static str;
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let buff: [u8; 20] = value
            .try_into()
            .map_err(|_| "The infohash must have exactly 20 bytes")?;
        Ok(InfoHash(buff))
    }
}

impl FromStr for InfoHash {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let buff = hex::decode(s).map_err(|e| e.to_string())?;
        InfoHash::try_from(buff.as_slice()).map_err(str::to_owned)
    }
}

/// Lifecycle of a torrent session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    #[default]
    Idle,
    Paused,
    Stopping,
    /// The disk worker is checking the data already on disk.
    Preparing,
    Searching,
    Connecting,
    /// No piece is complete yet.
    WarmingUp,
    Downloading,
    /// Few pieces are left, blocks are requested from several peers.
    Endgame,
    Seeding,
    /// A fatal error happened, see [`ErrorCode`].
    Failed,
}

impl SessionState {
    /// States in which the session talks to peers.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            Self::Idle | Self::Paused | Self::Stopping | Self::Failed
        )
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Paused => "Paused",
            Self::Stopping => "Stopping",
            Self::Preparing => "Preparing",
            Self::Searching => "Searching",
            Self::Connecting => "Connecting",
            Self::WarmingUp => "Warming up",
            Self::Downloading => "Downloading",
            Self::Endgame => "Final stage",
            Self::Seeding => "Seeding",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Stable code of a session-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    UnknownError,
    TorrentParseError,
    InvalidTrackerError,
    FileError,
    ServerError,
}

/// Snapshot of a session, built on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentStats {
    pub name: String,
    pub info_hash: InfoHash,
    pub state: SessionState,
    pub error: Option<(ErrorCode, String)>,
    /// Percent of the pieces that are complete.
    pub progress: u8,
    /// Percent of the initial scan, while Preparing.
    pub verification: u8,
    pub completed_pieces: usize,
    pub piece_count: usize,
    pub size: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub connections: usize,
    pub peers: usize,
    pub seeds: usize,
}

/// A piece that is being downloaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    pub index: u32,
    pub length: u32,
    pub completed_blocks: Bitfield,
    pub requested_blocks: Bitfield,
    pub in_progress: bool,
}

impl Piece {
    pub fn new(index: u32, length: u32) -> Self {
        let blocks = length.div_ceil(BLOCK_LEN) as usize;
        Self {
            index,
            length,
            completed_blocks: Bitfield::from_piece(blocks),
            requested_blocks: Bitfield::from_piece(blocks),
            in_progress: false,
        }
    }

    pub fn block_count(&self) -> usize {
        self.completed_blocks.len()
    }

    /// Blocks that are not complete yet.
    pub fn blocks_left(&self) -> usize {
        self.completed_blocks.count_zeros()
    }

    /// Length of block `bit`, only the last one may be shorter.
    pub fn block_len(&self, bit: usize) -> u32 {
        let rest = self.length % BLOCK_LEN;
        if rest != 0 && bit + 1 == self.block_count() {
            rest
        } else {
            BLOCK_LEN
        }
    }

    /// Forget every request, keeping the completed blocks.
    pub fn release(&mut self) {
        self.in_progress = false;
        self.requested_blocks.fill(false);
    }

    /// Forget everything, used when the hash check failed.
    pub fn reset(&mut self) {
        self.release();
        self.completed_blocks.fill(false);
    }
}

/// A peer announced by the tracker or added by hand.
#[derive(Debug, Clone)]
pub struct PeerDescriptor {
    pub addr: SocketAddr,
    pub id: Option<PeerId>,
    /// The peer has pieces that we need, or we do not know yet.
    pub interesting: bool,
    pub seed: bool,
    pub last_visited: Option<Instant>,
    pub connect_start: Option<Instant>,
    /// How long the last outbound connect took.
    pub connect_time: Option<Duration>,
    pub pieces: Bitfield,
    pub num_completed_pieces: usize,
}

impl PeerDescriptor {
    pub fn new(addr: SocketAddr, id: Option<PeerId>, piece_count: usize) -> Self {
        Self {
            addr,
            id,
            interesting: true,
            seed: false,
            last_visited: None,
            connect_start: None,
            connect_time: None,
            pieces: Bitfield::from_piece(piece_count),
            num_completed_pieces: 0,
        }
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.id == other.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_blocks() {
        let piece = Piece::new(3, BLOCK_LEN * 2 + 100);
        assert_eq!(piece.block_count(), 3);
        assert_eq!(piece.block_len(0), BLOCK_LEN);
        assert_eq!(piece.block_len(2), 100);

        let piece = Piece::new(0, BLOCK_LEN * 2);
        assert_eq!(piece.block_count(), 2);
        assert_eq!(piece.block_len(1), BLOCK_LEN);
    }

    #[test]
    fn info_hash_hex() {
        let hash = InfoHash([0xab; 20]);
        let s = hash.to_string();
        assert_eq!(s.len(), 40);
        assert_eq!(s.parse::<InfoHash>().unwrap(), hash);
        assert!("abcd".parse::<InfoHash>().is_err());
    }
}
