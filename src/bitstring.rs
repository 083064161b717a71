//! Fixed-length bit strings used as prefix tree keys.
//!
//! Bits are numbered from the most significant bit of the first byte, so bit
//! `i` lives in byte `i / 8` under mask `0x80 >> (i % 8)`.  Storage is always
//! exactly `ceil(len / 8)` bytes and bits beyond `len` are kept clear.

use std::fmt;

use crate::field::Zp;

/// An ordered, fixed-length sequence of bits.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bitstring {
    bits: usize,
    buf: Vec<u8>,
}

impl Bitstring {
    /// Creates an all-zero bit string of the given length.
    pub fn new(bits: usize) -> Self {
        Bitstring {
            bits,
            buf: vec![0u8; bits.div_ceil(8)],
        }
    }

    /// Creates a bit string of `bits` bits from `bytes`.
    ///
    /// Missing bytes are zero filled, surplus bytes ignored, and bits past
    /// the end are masked off.
    pub fn from_bytes(bits: usize, bytes: &[u8]) -> Self {
        let mut out = Bitstring::new(bits);
        let n = out.buf.len().min(bytes.len());
        out.buf[..n].copy_from_slice(&bytes[..n]);
        out.mask_tail();
        out
    }

    /// Key of an element: its little-endian encoding read as a bit string
    /// as long as the field modulus.
    pub fn from_zp(z: &Zp) -> Self {
        Bitstring::from_bytes(z.modulus().bits() as usize, &z.to_bytes())
    }

    fn mask_tail(&mut self) {
        let rem = self.bits % 8;
        if rem != 0 {
            if let Some(last) = self.buf.last_mut() {
                *last &= 0xffu8 << (8 - rem);
            }
        }
    }

    /// Length in bits.
    pub fn len(&self) -> usize {
        self.bits
    }

    /// Whether the bit string has zero length.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Packed bytes, `ceil(len / 8)` of them.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Reads bit `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of range.
    pub fn get(&self, i: usize) -> bool {
        assert!(i < self.bits, "bit {i} out of range {}", self.bits);
        self.buf[i / 8] & (0x80 >> (i % 8)) != 0
    }

    /// Sets bit `i`.
    pub fn set(&mut self, i: usize) {
        assert!(i < self.bits, "bit {i} out of range {}", self.bits);
        self.buf[i / 8] |= 0x80 >> (i % 8);
    }

    /// Clears bit `i`.
    pub fn unset(&mut self, i: usize) {
        assert!(i < self.bits, "bit {i} out of range {}", self.bits);
        self.buf[i / 8] &= !(0x80 >> (i % 8));
    }

    /// Toggles bit `i`.
    pub fn flip(&mut self, i: usize) {
        assert!(i < self.bits, "bit {i} out of range {}", self.bits);
        self.buf[i / 8] ^= 0x80 >> (i % 8);
    }

    /// The first `bits` bits as a new bit string.
    pub fn prefix(&self, bits: usize) -> Bitstring {
        let bits = bits.min(self.bits);
        Bitstring::from_bytes(bits, &self.buf)
    }

    /// Whether `self` is a prefix of `other`.
    pub fn is_prefix_of(&self, other: &Bitstring) -> bool {
        self.bits <= other.bits && other.prefix(self.bits) == *self
    }

    /// Key of child `index` when `quantum` bits are appended.
    ///
    /// Bit `j` of `index` becomes key bit `len + j`.
    pub fn child(&self, quantum: usize, index: usize) -> Bitstring {
        let start = self.bits;
        let mut out = Bitstring::from_bytes(start + quantum, &self.buf);
        for j in 0..quantum {
            if (index >> j) & 1 == 1 {
                out.set(start + j);
            }
        }
        out
    }

    /// Reads `quantum` bits starting at `start` as a child index, with
    /// bit `start + j` contributing `1 << j`.
    pub fn child_index(&self, start: usize, quantum: usize) -> usize {
        (0..quantum)
            .filter(|j| start + j < self.bits && self.get(start + j))
            .fold(0, |acc, j| acc | (1 << j))
    }
}

impl fmt::Display for Bitstring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.bits {
            f.write_str(if self.get(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for Bitstring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitstring({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::p_sks;

    #[test]
    fn test_set_get_msb_first() {
        let mut bs = Bitstring::new(10);
        bs.set(0);
        bs.set(9);
        assert_eq!(bs.bytes(), &[0x80, 0x40]);
        assert_eq!(bs.to_string(), "1000000001");
        bs.flip(0);
        bs.unset(9);
        assert_eq!(bs.to_string(), "0000000000");
    }

    #[test]
    fn test_from_bytes_masks_tail() {
        let bs = Bitstring::from_bytes(4, &[0xff, 0xff]);
        assert_eq!(bs.bytes(), &[0xf0]);
        assert_eq!(bs.len(), 4);
        let padded = Bitstring::from_bytes(16, &[0xa5]);
        assert_eq!(padded.bytes(), &[0xa5, 0x00]);
    }

    #[test]
    fn test_element_key_reads_low_byte_first() {
        let p = p_sks();
        for (low, want) in [(0x00, "00"), (0x45, "01"), (0x85, "10"), (0xc5, "11")] {
            let z = Zp::from_i64(&p, 0x1200 + low);
            assert_eq!(Bitstring::from_zp(&z).prefix(2).to_string(), want);
        }
        assert_eq!(Bitstring::from_zp(&Zp::from_i64(&p, 1)).len(), 129);
    }

    #[test]
    fn test_child_keys_and_index() {
        let root = Bitstring::new(0);
        let c = root.child(2, 1);
        assert_eq!(c.to_string(), "10");
        let cc = c.child(2, 2);
        assert_eq!(cc.to_string(), "1001");
        assert_eq!(cc.child_index(2, 2), 2);
        assert!(c.is_prefix_of(&cc));
        assert!(!root.child(2, 3).is_prefix_of(&cc));
    }
}
