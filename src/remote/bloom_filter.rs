use std::fmt::{Display, Formatter};

use md5::{Digest, Md5};

/// Why a Bloom filter sent by the backend cannot be used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilterError {
    message: String,
}

impl BloomFilterError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for BloomFilterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BloomFilterError {}

/// Probabilistic set of document names the backend considers unchanged,
/// hashed with MD5 double hashing.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: i32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> Result<Self, BloomFilterError> {
        if !(0..8).contains(&padding) {
            return Err(BloomFilterError::new(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(BloomFilterError::new(format!("Invalid hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(BloomFilterError::new(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(BloomFilterError::new(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let digest = Md5::digest(value.as_bytes());
        let mut low = [0u8; 8];
        let mut high = [0u8; 8];
        low.copy_from_slice(&digest[..8]);
        high.copy_from_slice(&digest[8..]);
        let hash1 = u64::from_le_bytes(low);
        let hash2 = u64::from_le_bytes(high);

        (0..self.hash_count as u64).all(|index| {
            let combined = hash1.wrapping_add(hash2.wrapping_mul(index));
            self.is_bit_set(combined % self.bit_count)
        })
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BITMAP: [u8; 8] = [72, 0, 4, 36, 0, 128, 33, 0];

    fn name(id: u32) -> String {
        format!("projects/p/databases/d/documents/coll/doc{id}")
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(BloomFilter::new(vec![1], 8, 1).is_err());
        assert!(BloomFilter::new(vec![1], -1, 1).is_err());
        assert!(BloomFilter::new(vec![1], 0, -1).is_err());
        assert!(BloomFilter::new(vec![1], 0, 0).is_err());
        assert!(BloomFilter::new(Vec::new(), 1, 0).is_err());
        assert!(BloomFilter::new(Vec::new(), 0, 0).is_ok());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain(""));
        assert!(!filter.might_contain(&name(1)));
    }

    #[test]
    fn contains_inserted_names() {
        let filter = BloomFilter::new(BITMAP.to_vec(), 0, 3).unwrap();
        assert_eq!(filter.bit_count(), 64);
        for id in 1..=3 {
            assert!(filter.might_contain(&name(id)), "doc{id} should be present");
        }
        assert!(!filter.might_contain(&name(4)));
        assert!(!filter.might_contain(&name(10)));
    }
}
