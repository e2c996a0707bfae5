use crate::error::BitSetError;
use bitvec::prelude::*;
use std::fmt::{self, Debug};

/// Fixed size set of piece numbers, laid out the way the `bitfield` message wants it: piece 0 is
/// the high bit of the first byte.
#[derive(Clone, PartialEq, Eq)]
pub struct BitSet {
    bits: BitBox<u8, Msb0>,
}

impl BitSet {
    pub fn new(size: usize) -> Self {
        BitSet {
            bits: bitbox![u8, Msb0; 0; size],
        }
    }

    /// Interpret a wire bitfield for `size` pieces. The byte count must be exactly `ceil(size/8)`;
    /// spare bits at the end are cleared.
    pub fn from_bytes(bytes: &[u8], size: usize) -> Option<Self> {
        if bytes.len() != size.div_ceil(8) {
            return None;
        }

        let mut bits = BitVec::<u8, Msb0>::from_slice(bytes);
        bits.truncate(size);
        Some(BitSet {
            bits: bits.into_boxed_bitslice(),
        })
    }

    pub fn size(&self) -> usize {
        self.bits.len()
    }

    pub fn get(&self, index: usize) -> Result<bool, BitSetError> {
        self.bits.get(index).map(|b| *b).ok_or(BitSetError {
            index,
            size: self.size(),
        })
    }

    pub fn set(&mut self, index: usize) -> Result<(), BitSetError> {
        let size = self.size();
        let mut bit = self.bits.get_mut(index).ok_or(BitSetError { index, size })?;
        *bit = true;
        Ok(())
    }

    /// `get` that treats anything out of range as absent
    pub fn has(&self, index: u32) -> bool {
        self.get(index as usize).unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.bits.all()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter_ones().map(|i| i as u32)
    }

    /// Bytes suitable for a `bitfield` message, spare bits are zero
    pub fn to_bytes(&self) -> Box<[u8]> {
        let mut bytes = vec![0u8; self.size().div_ceil(8)];
        for i in self.bits.iter_ones() {
            bytes[i / 8] |= 0x80 >> (i % 8);
        }
        bytes.into_boxed_slice()
    }
}

impl Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitSet({}/{})", self.count(), self.size())
    }
}
