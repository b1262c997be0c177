/// Default key hash. Folds every byte into the seed the way
/// `boost::hash_combine` does.
pub fn local_hash(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |seed, &byte| {
        seed ^ u64::from(byte)
            .wrapping_add(0x9e37_79b9)
            .wrapping_add(seed << 6)
            .wrapping_add(seed >> 2)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_hashes_to_zero() {
        assert_eq!(local_hash(b""), 0);
    }

    #[test]
    fn single_byte() {
        assert_eq!(local_hash(b"a"), 0x61 + 0x9e37_79b9);
    }

    #[test]
    fn repeated_keys_spread() {
        let mut seen = std::collections::HashSet::new();
        for len in 1..=64 {
            assert!(seen.insert(local_hash("q".repeat(len).as_bytes())));
        }
    }
}
