//! Resume state of a session.
//!
//! Layout, big endian: a `u16` version, the bitfield of completed pieces,
//! then one record per partially downloaded piece with its index, its
//! length and the bitfield of its completed blocks. A bitfield is a `u32`
//! bit count followed by the bits, MSB first.
use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

use super::{Piece, Session, SessionState};
use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    metainfo::Info,
    tracker::Announcer,
};

pub const RESUME_VERSION: u16 = 2;

impl<A: Announcer> Session<A> {
    /// Snapshot of the download progress, see [`Session::set_dumped_state`].
    pub fn dumped_state(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(RESUME_VERSION);
        put_bitfield(&mut buf, &self.completed);

        for piece in self.pending_pieces.values() {
            let done = piece.completed_blocks.count_ones();
            if done == 0 || done == piece.block_count() {
                continue;
            }
            buf.put_i32(piece.index as i32);
            buf.put_i32(piece.length as i32);
            put_bitfield(&mut buf, &piece.completed_blocks);
        }

        buf.to_vec()
    }

    /// Restore the progress saved by [`Session::dumped_state`], before the
    /// session is started.
    ///
    /// Nothing is kept from a state that is not valid, the initial scan then
    /// finds what is on disk.
    pub fn set_dumped_state(&mut self, state: &[u8]) -> Result<(), Error> {
        if self.state != SessionState::Idle {
            warn!("resume state ignored, {} is {}", self.meta.info.name, self.state);
            return Ok(());
        }

        let (completed, pieces) = parse(state, &self.meta.info)?;
        debug!(
            "{} resumed with {} pieces and {} partial pieces",
            self.meta.info.name,
            completed.count_ones(),
            pieces.len()
        );

        self.incomplete = !completed.clone();
        self.completed = completed;
        self.pending_pieces = pieces.into_iter().map(|p| (p.index, p)).collect();
        Ok(())
    }
}

fn put_bitfield(buf: &mut BytesMut, bits: &Bitfield) {
    buf.put_u32(bits.len() as u32);
    buf.put_slice(&bits.to_wire());
}

fn get_bitfield(buf: &mut &[u8]) -> Result<Bitfield, Error> {
    if buf.remaining() < 4 {
        return Err(Error::ResumeStateInvalid);
    }
    let len = buf.get_u32() as usize;
    let bytes = len.div_ceil(8);
    if buf.remaining() < bytes {
        return Err(Error::ResumeStateInvalid);
    }

    let mut bits = Bitfield::from_piece(len);
    bits.merge_wire(&buf[..bytes]);
    buf.advance(bytes);
    Ok(bits)
}

fn parse(mut buf: &[u8], info: &Info) -> Result<(Bitfield, Vec<Piece>), Error> {
    if buf.remaining() < 2 || buf.get_u16() != RESUME_VERSION {
        return Err(Error::ResumeStateInvalid);
    }

    let completed = get_bitfield(&mut buf)?;
    if completed.len() != info.piece_count() {
        return Err(Error::ResumeStateInvalid);
    }

    let mut pieces: Vec<Piece> = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 8 {
            return Err(Error::ResumeStateInvalid);
        }
        let index = buf.get_i32();
        let length = buf.get_i32();
        let blocks = get_bitfield(&mut buf)?;

        let index = usize::try_from(index).map_err(|_| Error::ResumeStateInvalid)?;
        if index >= info.piece_count()
            || completed[index]
            || length < 0
            || length as u32 != info.piece_length_at(index)
            || pieces.iter().any(|p| p.index as usize == index)
        {
            return Err(Error::ResumeStateInvalid);
        }

        let mut piece = Piece::new(index as u32, length as u32);
        if blocks.len() != piece.block_count() {
            return Err(Error::ResumeStateInvalid);
        }
        piece.completed_blocks = blocks;
        pieces.push(piece);
    }

    Ok((completed, pieces))
}
