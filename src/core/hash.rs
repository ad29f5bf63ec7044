//! Stable short hashes for paths and request fingerprints.

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// STABLE FNV-1a HASHING
/// Same input gives the same value across processes, so hashes can be handed
/// out to clients and resolved later.
pub fn fnv1a(key: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// 12 hex digits.
pub fn short_hash(key: &str) -> String {
    let full = format!("{:016x}", fnv1a(key));
    full[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash_is_stable() {
        assert_eq!(short_hash("movies/ABC-123"), short_hash("movies/ABC-123"));
        assert_ne!(short_hash("movies/ABC-123"), short_hash("movies/ABC-124"));
        assert_eq!(short_hash("").len(), 12);
    }

    #[test]
    fn test_known_vector() {
        // FNV-1a 64 of "a"
        assert_eq!(fnv1a("a"), 0xaf63dc4c8601ec8c);
    }
}
