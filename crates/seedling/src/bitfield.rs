//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait BitfieldExt {
    /// A cleared bitfield of `len` bits.
    fn from_piece(len: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; len]
    }

    /// Set every bit of `payload` that falls inside `self`.
    ///
    /// Bits past the end are dropped, some clients pad or even claim
    /// pieces that do not exist.
    fn merge_wire(&mut self, payload: &[u8]);

    /// Set `index` if it is in range, returns whether it was.
    fn safe_set(&mut self, index: usize) -> bool;

    /// `false` for out of range indices.
    fn safe_get(&self, index: usize) -> bool;

    /// Wire representation, MSB first and zero padded to a byte boundary.
    fn to_wire(&self) -> Vec<u8>;
}

impl BitfieldExt for Bitfield {
    fn merge_wire(&mut self, payload: &[u8]) {
        let incoming = payload.view_bits::<Msb0>();
        for index in incoming.iter_ones() {
            if index < self.len() {
                self.set(index, true);
            }
        }
    }

    fn safe_set(&mut self, index: usize) -> bool {
        if index < self.len() {
            self.set(index, true);
            true
        } else {
            false
        }
    }

    fn safe_get(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }

    fn to_wire(&self) -> Vec<u8> {
        let mut copy = self.clone();
        copy.set_uninitialized(false);
        copy.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_piece() {
        let bitfield = Bitfield::from_piece(1407);
        assert_eq!(bitfield.len(), 1407);
        assert_eq!(bitfield.count_ones(), 0);
    }

    #[test]
    fn out_of_range_bits_are_ignored() {
        let mut bitfield = Bitfield::from_piece(10);
        bitfield.merge_wire(&[0b1000_0000, 0b0111_1111, 0xFF]);

        assert_eq!(bitfield.len(), 10);
        assert!(bitfield[0]);
        assert!(!bitfield[8]);
        assert!(bitfield[9]);
        assert_eq!(bitfield.count_ones(), 2);

        assert!(!bitfield.safe_set(10));
        assert!(bitfield.safe_set(3));
        assert!(bitfield.safe_get(3));
        assert!(!bitfield.safe_get(400));
    }

    #[test]
    fn wire_format_is_msb_first() {
        let mut bitfield = Bitfield::from_piece(10);
        bitfield.set(0, true);
        bitfield.set(9, true);
        assert_eq!(bitfield.to_wire(), vec![0b1000_0000, 0b0100_0000]);
    }
}
