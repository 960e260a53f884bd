//! Maps file paths to storage table buckets.  Paths are first hashed
//! with xxh3, then remixed with a keyed multiplicative hash, and
//! finally mapped to the bucket range with a fixed point
//! multiplication, which relies on the high bits of the mixed hash
//! (the well-distributed ones).
use xxhash_rust::xxh3::xxh3_64;

/// Maps values in `[0, u64::MAX]` to `[0, domain)` linearly.
///
/// As a special case, this function returns 0 instead of erroring out
/// when `domain == 0`.
#[inline(always)]
const fn reduce(x: u64, domain: usize) -> usize {
    ((domain as u128 * x as u128) >> 64) as usize
}

/// A `KeyHash` remixes path hashes with a pseudorandom odd multiplier
/// and addend, so that buckets are picked from the high bits of a
/// multiply-add-shift hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct KeyHash {
    multiplier: u64,
    addend: u64,
}

impl KeyHash {
    /// Deterministically derives the mixing parameters from the
    /// SHA-256 hash of `seed`.
    pub const fn new_keyed(seed: &[u8]) -> KeyHash {
        use extendhash::sha256;

        let hash = sha256::compute_hash(seed);
        let multiplier = [
            hash[0], hash[1], hash[2], hash[3], hash[4], hash[5], hash[6], hash[7],
        ];
        let addend = [
            hash[8], hash[9], hash[10], hash[11], hash[12], hash[13], hash[14], hash[15],
        ];

        KeyHash {
            multiplier: u64::from_le_bytes(multiplier) | 1,
            addend: u64::from_le_bytes(addend),
        }
    }

    #[inline(always)]
    fn mix(&self, value: u64) -> u64 {
        value
            .wrapping_mul(self.multiplier)
            .wrapping_add(self.addend)
    }

    /// Returns the bucket index for `key`, in `[0, buckets)`.
    #[inline]
    pub fn bucket(&self, key: &str, buckets: usize) -> usize {
        reduce(self.mix(xxh3_64(key.as_bytes())), buckets)
    }
}

/// Smoke test the `reduce` function.
#[test]
fn test_reduce() {
    assert_eq!(reduce(0, 0), 0);
    assert_eq!(reduce(u64::MAX, 0), 0);

    assert_eq!(reduce(0, 17), 0);
    assert_eq!(reduce(u64::MAX / 17, 17), 0);
    assert_eq!(reduce(1 + u64::MAX / 17, 17), 1);
    assert_eq!(reduce(u64::MAX, 17), 16);
}

/// The same key always lands in the same bucket, and the bucket is
/// always in range.
#[test]
fn test_bucket_in_range() {
    const H: KeyHash = KeyHash::new_keyed(b"test");

    for buckets in [1usize, 2, 7, 64, 1000] {
        for i in 0..200 {
            let key = format!("/tmp/file-{}", i);
            let bucket = H.bucket(&key, buckets);

            assert!(bucket < buckets);
            assert_eq!(bucket, H.bucket(&key, buckets));
        }
    }
}

/// Similar paths should spread over the buckets: with 1000 keys in 8
/// buckets, every bucket should see some keys.
#[test]
fn test_bucket_spread() {
    const H: KeyHash = KeyHash::new_keyed(b"spread");

    let mut counts = [0usize; 8];
    for i in 0..1000 {
        counts[H.bucket(&format!("/data/{}", i), counts.len())] += 1;
    }

    assert!(counts.iter().all(|&count| count > 50), "{:?}", counts);
}

/// Different seeds give different mixers.
#[test]
fn test_new_keyed() {
    let h1 = KeyHash::new_keyed(b"h1");
    let h2 = KeyHash::new_keyed(b"h2");

    assert!(h1 != h2);
    assert_eq!(h1.multiplier & 1, 1);
    assert!(h1.mix(42) != h2.mix(42));
}
