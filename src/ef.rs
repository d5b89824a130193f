//! Elias-Fano coding of monotone u64 sequences.
//!
//! Postings lists in `.ef` files store the txNums at which a key was
//! touched. Values split into `low_bits` low bits, packed densely, and
//! high bits, unary-coded in a bit vector where the i-th set bit at
//! position `p` encodes `high = p - i`. `search` finds the smallest
//! element >= a bound without decoding the whole list.

use crate::error::{Result, StrataError};

pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub fn take_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut out = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| StrataError::Corruption("truncated varint".into()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(StrataError::Corruption("varint overflow".into()));
        }
        out |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(out);
        }
        shift += 7;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EliasFano {
    count: u64,
    max: u64,
    low_bits: u8,
    lower: Vec<u64>,
    upper: Vec<u64>,
}

fn low_bits_for(count: u64, max: u64) -> u8 {
    if count == 0 {
        return 0;
    }
    let ratio = (max + 1) / count;
    if ratio <= 1 {
        0
    } else {
        63 - ratio.leading_zeros() as u8
    }
}

fn words_for_bits(bits: u64) -> usize {
    ((bits + 63) / 64) as usize
}

fn set_bits(words: &mut [u64], bit_pos: u64, value: u64, width: u8) {
    if width == 0 {
        return;
    }
    let word = (bit_pos / 64) as usize;
    let offset = (bit_pos % 64) as u32;
    words[word] |= value << offset;
    let spill = offset + u32::from(width);
    if spill > 64 {
        words[word + 1] |= value >> (64 - offset);
    }
}

fn get_bits(words: &[u64], bit_pos: u64, width: u8) -> u64 {
    if width == 0 {
        return 0;
    }
    let mask = if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };
    let word = (bit_pos / 64) as usize;
    let offset = (bit_pos % 64) as u32;
    let mut out = words[word] >> offset;
    let spill = offset + u32::from(width);
    if spill > 64 {
        out |= words[word + 1] << (64 - offset);
    }
    out & mask
}

impl EliasFano {
    pub fn from_sorted(values: &[u64]) -> Self {
        let count = values.len() as u64;
        let max = values.last().copied().unwrap_or(0);
        let low_bits = low_bits_for(count, max);
        let mut lower = vec![0u64; words_for_bits(count * u64::from(low_bits))];
        let mut upper = vec![0u64; words_for_bits(count + (max >> low_bits) + 1)];
        let low_mask = if low_bits == 0 {
            0
        } else {
            (1u64 << low_bits) - 1
        };
        for (i, &v) in values.iter().enumerate() {
            let i = i as u64;
            set_bits(&mut lower, i * u64::from(low_bits), v & low_mask, low_bits);
            let high = v >> low_bits;
            let pos = high + i;
            upper[(pos / 64) as usize] |= 1u64 << (pos % 64);
        }
        Self {
            count,
            max,
            low_bits,
            lower,
            upper,
        }
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn max(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn min(&self) -> Option<u64> {
        self.iter().next()
    }

    pub fn iter(&self) -> EfIter<'_> {
        EfIter {
            ef: self,
            index: 0,
            upper_pos: 0,
        }
    }

    /// Smallest element >= `bound`, if any.
    pub fn search(&self, bound: u64) -> Option<u64> {
        if self.count == 0 || bound > self.max {
            return None;
        }
        self.iter().find(|&v| v >= bound)
    }

    pub fn to_vec(&self) -> Vec<u64> {
        self.iter().collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_uvarint(&mut out, self.count);
        if self.count == 0 {
            return out;
        }
        put_uvarint(&mut out, self.max);
        for word in &self.lower {
            out.extend_from_slice(&word.to_le_bytes());
        }
        for word in &self.upper {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let count = take_uvarint(buf, &mut pos)?;
        if count == 0 {
            return Ok(Self::from_sorted(&[]));
        }
        let max = take_uvarint(buf, &mut pos)?;
        let low_bits = low_bits_for(count, max);
        let lower_words = words_for_bits(count * u64::from(low_bits));
        let upper_words = words_for_bits(count + (max >> low_bits) + 1);
        let need = pos + (lower_words + upper_words) * 8;
        if buf.len() < need {
            return Err(StrataError::Corruption(format!(
                "elias-fano payload truncated: have {}, need {need}",
                buf.len()
            )));
        }
        let mut read_words = |n: usize| -> Vec<u64> {
            let mut words = Vec::with_capacity(n);
            for _ in 0..n {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[pos..pos + 8]);
                pos += 8;
                words.push(u64::from_le_bytes(raw));
            }
            words
        };
        let lower = read_words(lower_words);
        let upper = read_words(upper_words);
        Ok(Self {
            count,
            max,
            low_bits,
            lower,
            upper,
        })
    }
}

pub struct EfIter<'a> {
    ef: &'a EliasFano,
    index: u64,
    upper_pos: u64,
}

impl Iterator for EfIter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.index >= self.ef.count {
            return None;
        }
        // Advance to the next set bit, skipping zero stretches a word at
        // a time.
        loop {
            let word_idx = (self.upper_pos / 64) as usize;
            if word_idx >= self.ef.upper.len() {
                // Fewer set bits than advertised; treat as exhausted.
                self.index = self.ef.count;
                return None;
            }
            let shifted = self.ef.upper[word_idx] >> (self.upper_pos % 64);
            if shifted == 0 {
                self.upper_pos = (self.upper_pos / 64 + 1) * 64;
                continue;
            }
            self.upper_pos += u64::from(shifted.trailing_zeros());
            break;
        }
        let high = self.upper_pos - self.index;
        let low = get_bits(
            &self.ef.lower,
            self.index * u64::from(self.ef.low_bits),
            self.ef.low_bits,
        );
        self.index += 1;
        self.upper_pos += 1;
        Some((high << self.ef.low_bits) | low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::BTreeSet;

    #[test]
    fn round_trips_small_sequences() {
        for values in [
            vec![],
            vec![0],
            vec![3, 7, 11, 19],
            vec![0, 1, 2, 3, 4, 5],
            vec![1_000_000_000],
        ] {
            let ef = EliasFano::from_sorted(&values);
            assert_eq!(ef.to_vec(), values);
            let decoded = EliasFano::decode(&ef.encode()).expect("decode");
            assert_eq!(decoded.to_vec(), values);
        }
    }

    #[test]
    fn round_trips_random_sequences() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let mut set = BTreeSet::new();
            for _ in 0..rng.gen_range(1..200) {
                set.insert(rng.gen_range(0u64..100_000));
            }
            let values: Vec<u64> = set.into_iter().collect();
            let ef = EliasFano::from_sorted(&values);
            assert_eq!(ef.to_vec(), values);
            assert_eq!(ef.max(), values.last().copied());
            assert_eq!(ef.min(), values.first().copied());
        }
    }

    #[test]
    fn search_finds_lower_bound() {
        let values = vec![3, 7, 11, 19];
        let ef = EliasFano::from_sorted(&values);
        assert_eq!(ef.search(0), Some(3));
        assert_eq!(ef.search(3), Some(3));
        assert_eq!(ef.search(4), Some(7));
        assert_eq!(ef.search(11), Some(11));
        assert_eq!(ef.search(12), Some(19));
        assert_eq!(ef.search(19), Some(19));
        assert_eq!(ef.search(20), None);
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let ef = EliasFano::from_sorted(&[5, 9, 100]);
        let encoded = ef.encode();
        let err = EliasFano::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));
    }

    #[test]
    fn varint_round_trip() {
        let mut buf = Vec::new();
        for v in [0u64, 1, 127, 128, 300, u64::MAX] {
            buf.clear();
            put_uvarint(&mut buf, v);
            let mut pos = 0;
            assert_eq!(take_uvarint(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }
}
