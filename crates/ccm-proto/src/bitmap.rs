//! Fixed-width membership bitmap and its wire codec.
//!
//! Connectivity and membership are exchanged as bitmaps over UUID space:
//! bit `u` set means "node with UUID `u`". On the wire a bitmap travels as
//! a fixed-length lowercase hex string so it survives any text-oriented
//! transport unchanged.

use bitvec::prelude::*;

use crate::constants::{BITMAP_WIRE_LEN, MAXNODE};
use crate::error::{CcmError, CcmResult};

/// A set of node UUIDs, `MAXNODE` bits wide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeBitmap {
    bits: BitVec<u8, Msb0>,
}

impl NodeBitmap {
    pub fn new() -> Self {
        Self {
            bits: bitvec![u8, Msb0; 0; MAXNODE],
        }
    }

    /// A bitmap containing exactly one UUID.
    pub fn solo(uuid: usize) -> Self {
        let mut bm = Self::new();
        bm.mark(uuid);
        bm
    }

    pub fn mark(&mut self, uuid: usize) {
        self.bits.set(uuid, true);
    }

    pub fn clear(&mut self, uuid: usize) {
        self.bits.set(uuid, false);
    }

    pub fn test(&self, uuid: usize) -> bool {
        uuid < MAXNODE && self.bits[uuid]
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    /// Iterate the set UUIDs in ascending order.
    pub fn uuids(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// True when every UUID in `other` is also in `self`.
    pub fn contains_all(&self, other: &NodeBitmap) -> bool {
        other.uuids().all(|u| self.test(u))
    }

    /// Encode as a fixed-length lowercase hex string.
    pub fn to_wire(&self) -> String {
        let mut s = String::with_capacity(BITMAP_WIRE_LEN);
        for byte in self.bits.as_raw_slice() {
            s.push_str(&format!("{:02x}", byte));
        }
        s
    }

    /// Decode the wire form. Rejects anything that is not exactly
    /// `BITMAP_WIRE_LEN` hex characters.
    pub fn from_wire(s: &str) -> CcmResult<Self> {
        if s.len() != BITMAP_WIRE_LEN || !s.is_ascii() {
            return Err(CcmError::BadBitmap);
        }
        let mut bm = Self::new();
        let raw = bm.bits.as_raw_mut_slice();
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(|_| CcmError::BadBitmap)?;
            raw[i] = u8::from_str_radix(pair, 16).map_err(|_| CcmError::BadBitmap)?;
        }
        Ok(bm)
    }
}

impl Default for NodeBitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_test_clear() {
        let mut bm = NodeBitmap::new();
        assert!(bm.is_empty());
        bm.mark(0);
        bm.mark(17);
        bm.mark(MAXNODE - 1);
        assert!(bm.test(17));
        assert!(!bm.test(16));
        assert_eq!(bm.count(), 3);
        bm.clear(17);
        assert!(!bm.test(17));
        assert_eq!(bm.uuids().collect::<Vec<_>>(), vec![0, MAXNODE - 1]);
    }

    #[test]
    fn test_wire_round_trip() {
        let mut bm = NodeBitmap::new();
        for u in [0, 3, 8, 21, 40, 63] {
            bm.mark(u);
        }
        let wire = bm.to_wire();
        assert_eq!(wire.len(), BITMAP_WIRE_LEN);
        let back = NodeBitmap::from_wire(&wire).unwrap();
        assert_eq!(back, bm);
        // and string -> bitmap -> string is the identity on valid strings
        assert_eq!(back.to_wire(), wire);
    }

    #[test]
    fn test_wire_rejects_garbage() {
        assert!(NodeBitmap::from_wire("").is_err());
        assert!(NodeBitmap::from_wire(&"zz".repeat(BITMAP_WIRE_LEN / 2)).is_err());
        assert!(NodeBitmap::from_wire(&"00".repeat(BITMAP_WIRE_LEN)).is_err());
    }

    #[test]
    fn test_contains_all() {
        let mut big = NodeBitmap::new();
        let mut small = NodeBitmap::new();
        for u in [1, 2, 5] {
            big.mark(u);
        }
        small.mark(2);
        assert!(big.contains_all(&small));
        small.mark(9);
        assert!(!big.contains_all(&small));
        assert!(big.contains_all(&NodeBitmap::new()));
    }
}
