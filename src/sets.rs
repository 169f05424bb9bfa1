//! Compact population containers
//!
//! Two dense containers back the per-field histograms: [`CountSet`] keeps an
//! 8-bit saturating counter per cell, [`BitSet`] keeps presence only. Both
//! report their *effective* population (non-empty cells) and serialize to a
//! compact base64 string so that histograms whose domain reaches 2²³ cells
//! stay storable inside the analysis document.
//!
//! Counter overflow in a [`CountSet`] saturates silently at 255; downstream
//! derivations only consume `effective()`, which saturation does not change.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A dense vector of 8-bit saturating counters over a bounded domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountSet {
    counts: Vec<u8>,
}

impl CountSet {
    /// Create a zero-filled set over `[0, len)`.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            counts: vec![0; len],
        }
    }

    /// Reset to a zero-filled set over `[0, len)`.
    pub fn resize(&mut self, len: usize) {
        self.counts = vec![0; len];
    }

    /// Domain size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether the domain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Increment cell `i`, saturating at 255.
    ///
    /// # Panics
    ///
    /// Panics if `i` is outside the domain; that is a programming error.
    pub fn add(&mut self, i: usize) {
        let c = &mut self.counts[i];
        *c = c.saturating_add(1);
    }

    /// Counter value of cell `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is outside the domain.
    #[must_use]
    pub fn get(&self, i: usize) -> u8 {
        self.counts[i]
    }

    /// Number of non-zero cells.
    #[must_use]
    pub fn effective(&self) -> u32 {
        let mut o = 0;
        for &v in &self.counts {
            if v != 0 {
                o += 1;
            }
        }
        o
    }

    /// The raw counter bytes; the length is the domain size.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.counts
    }

    /// Rebuild from raw counter bytes.
    #[must_use]
    pub fn from_bytes(counts: Vec<u8>) -> Self {
        Self { counts }
    }
}

impl Serialize for CountSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.counts.is_empty() {
            serializer.serialize_str("")
        } else {
            serializer.serialize_str(&STANDARD_NO_PAD.encode(&self.counts))
        }
    }
}

impl<'de> Deserialize<'de> for CountSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Self::default());
        }
        let counts = STANDARD_NO_PAD
            .decode(&s)
            .map_err(|e| D::Error::custom(format!("invalid count set encoding: {e}")))?;
        Ok(Self { counts })
    }
}

/// A dense bit vector over a bounded domain.
///
/// Eight times smaller than a byte-per-cell histogram; used when the domain
/// would make counters too large (the mantissa of F32 has 2²³ cells).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    len: usize,
    bits: Vec<u64>,
}

impl BitSet {
    /// Create a zero-filled set over `[0, len)`.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            len,
            bits: vec![0; len.div_ceil(64)],
        }
    }

    /// Reset to a zero-filled set over `[0, len)`.
    pub fn resize(&mut self, len: usize) {
        self.len = len;
        self.bits = vec![0; len.div_ceil(64)];
    }

    /// Domain size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the domain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set bit `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is outside the domain; that is a programming error.
    pub fn set(&mut self, i: usize) {
        assert!(i < self.len, "bit {i} out of range {}", self.len);
        self.bits[i / 64] |= 1 << (i % 64);
    }

    /// Read bit `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is outside the domain.
    #[must_use]
    pub fn get(&self, i: usize) -> bool {
        assert!(i < self.len, "bit {i} out of range {}", self.len);
        self.bits[i / 64] & (1 << (i % 64)) != 0
    }

    /// Number of set bits.
    #[must_use]
    pub fn effective(&self) -> u32 {
        self.bits.iter().map(|v| v.count_ones()).sum()
    }

    /// Expand into one boolean per cell.
    #[must_use]
    pub fn expand(&self) -> Vec<bool> {
        (0..self.len).map(|i| self.get(i)).collect()
    }

    /// The wire payload: one byte holding `len % 64` (0 encodes 64)
    /// followed by the words in little-endian order. Empty for `len == 0`.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        if self.len == 0 {
            return Vec::new();
        }
        let mut d = Vec::with_capacity(1 + self.bits.len() * 8);
        #[allow(clippy::cast_possible_truncation)]
        d.push((self.len % 64) as u8);
        for v in &self.bits {
            d.extend_from_slice(&v.to_le_bytes());
        }
        d
    }

    /// Rebuild from a wire payload; `None` when the payload is malformed.
    #[must_use]
    pub fn from_payload(d: &[u8]) -> Option<Self> {
        if d.is_empty() {
            return Some(Self::default());
        }
        let (&first, words) = d.split_first()?;
        if first > 63 || words.is_empty() || words.len() % 8 != 0 {
            return None;
        }
        let last = if first == 0 { 64 } else { usize::from(first) };
        let bits: Vec<u64> = words
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("8-byte chunk")))
            .collect();
        let len = (bits.len() - 1) * 64 + last;
        Some(Self { len, bits })
    }
}

/// Wire form: one byte holding `len % 64` (0 encodes 64) followed by the
/// 64-bit words in little-endian order, base64 without padding. The empty
/// set is the empty string.
impl Serialize for BitSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.len == 0 {
            return serializer.serialize_str("");
        }
        serializer.serialize_str(&STANDARD_NO_PAD.encode(self.to_payload()))
    }
}

impl<'de> Deserialize<'de> for BitSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Self::default());
        }
        let d = STANDARD_NO_PAD
            .decode(&s)
            .map_err(|e| D::Error::custom(format!("invalid bit set encoding: {e}")))?;
        Self::from_payload(&d).ok_or_else(|| D::Error::custom("invalid bit set encoding"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_count_set_basics() {
        let mut c = CountSet::new(16);
        assert_eq!(c.len(), 16);
        assert_eq!(c.effective(), 0);
        c.add(3);
        c.add(3);
        c.add(9);
        assert_eq!(c.get(3), 2);
        assert_eq!(c.get(9), 1);
        assert_eq!(c.get(0), 0);
        assert_eq!(c.effective(), 2);
        c.resize(4);
        assert_eq!(c.effective(), 0);
    }

    #[test]
    fn test_count_set_saturates() {
        let mut c = CountSet::new(2);
        for _ in 0..300 {
            c.add(1);
        }
        assert_eq!(c.get(1), 255);
        assert_eq!(c.effective(), 1);
    }

    #[test]
    fn test_count_set_serde_roundtrip() {
        let mut c = CountSet::new(5);
        c.add(0);
        c.add(4);
        let json = serde_json::to_string(&c).expect("serialize");
        let back: CountSet = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, c);
    }

    #[test]
    fn test_count_set_empty_is_empty_string() {
        let json = serde_json::to_string(&CountSet::default()).expect("serialize");
        assert_eq!(json, "\"\"");
        let back: CountSet = serde_json::from_str(&json).expect("deserialize");
        assert!(back.is_empty());
    }

    #[test]
    fn test_bit_set_basics() {
        let mut b = BitSet::new(100);
        assert_eq!(b.len(), 100);
        b.set(10);
        b.set(50);
        b.set(99);
        assert!(b.get(10) && b.get(50) && b.get(99));
        assert!(!b.get(0) && !b.get(11) && !b.get(51));
        assert_eq!(b.effective(), 3);

        let bits = b.expand();
        assert_eq!(bits.len(), 100);
        for (i, &set) in bits.iter().enumerate() {
            assert_eq!(set, i == 10 || i == 50 || i == 99, "bit {i}");
        }
    }

    #[test]
    fn test_bit_set_out_of_range_panics() {
        let b = BitSet::new(64);
        assert!(std::panic::catch_unwind(|| b.get(64)).is_err());
    }

    #[test]
    fn test_bit_set_serde_roundtrip_lengths() {
        for len in [0usize, 1, 63, 64, 65, 192] {
            let mut b = BitSet::new(len);
            for i in (0..len).step_by(3) {
                b.set(i);
            }
            let json = serde_json::to_string(&b).expect("serialize");
            let back: BitSet = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(back.len(), len, "len {len}");
            for i in 0..len {
                assert_eq!(back.get(i), b.get(i), "len {len} bit {i}");
            }
        }
    }

    #[test]
    fn test_bit_set_empty_is_empty_string() {
        let json = serde_json::to_string(&BitSet::default()).expect("serialize");
        assert_eq!(json, "\"\"");
        let back: BitSet = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.len(), 0);
    }

    #[test]
    fn test_bit_set_rejects_garbage() {
        assert!(serde_json::from_str::<BitSet>("\"!!!\"").is_err());
        // First byte above 63 is not a valid tail length.
        let bad = serde_json::to_string(&STANDARD_NO_PAD.encode([200u8, 0, 0, 0, 0, 0, 0, 0, 0]))
            .expect("serialize");
        assert!(serde_json::from_str::<BitSet>(&bad).is_err());
    }

    proptest! {
        #[test]
        fn prop_bit_set_roundtrip(len in 0usize..300, seed in any::<u64>()) {
            let mut b = BitSet::new(len);
            let mut state = seed;
            for i in 0..len {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                if state & 1 == 1 {
                    b.set(i);
                }
            }
            let json = serde_json::to_string(&b).expect("serialize");
            let back: BitSet = serde_json::from_str(&json).expect("deserialize");
            prop_assert_eq!(back, b);
        }
    }
}
