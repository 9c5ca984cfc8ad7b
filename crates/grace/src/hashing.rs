//! Deterministic hashing for names and runtime values.
//!
//! The compiler and VM share one 64-bit name hash: function identity, class
//! identity, file identity and namespace segments are all `name_hash` values
//! emitted as constants at compile time and compared at run time, so both
//! sides must use the same seeded state.
//!
//! Value hashing (for Dict keys and Set elements) must be consistent with
//! `==`, which widens between `Int` and `Float` and treats a `Char` as equal
//! to the one-character `String`. Both equivalences are folded here before
//! hashing.

use std::hash::{BuildHasher, Hash, Hasher};

use ahash::RandomState;

fn fixed_state() -> RandomState {
    RandomState::with_seeds(
        0x0117_9c53_b5a5_8a4d,
        0x3f1e_8b3c_9d27_66e1,
        0x8d9b_42f0_13ca_55a2,
        0x61c8_8646_80b5_83eb,
    )
}

/// Hashes an identifier, file path, or namespace segment.
pub(crate) fn name_hash(name: &str) -> u64 {
    fixed_state().hash_one(name)
}

pub(crate) fn hash_i64(value: i64) -> u64 {
    fixed_state().hash_one(value)
}

pub(crate) fn hash_bool(value: bool) -> u64 {
    fixed_state().hash_one(value)
}

/// Hashes a float so that integral floats collide with the equal `Int`.
#[expect(clippy::cast_possible_truncation, reason = "integral check precedes the cast")]
pub(crate) fn hash_f64(value: f64) -> u64 {
    if value.fract() == 0.0 && value >= i64::MIN as f64 && value <= i64::MAX as f64 {
        hash_i64(value as i64)
    } else {
        fixed_state().hash_one(value.to_bits())
    }
}

/// Hashes string content; a `Char` hashes through here as its one-character
/// string so `'a'` and `"a"` land in the same bucket.
pub(crate) fn hash_str(value: &str) -> u64 {
    let mut hasher = fixed_state().build_hasher();
    value.hash(&mut hasher);
    hasher.finish()
}

pub(crate) fn hash_char(value: char) -> u64 {
    let mut buf = [0u8; 4];
    hash_str(value.encode_utf8(&mut buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_hash_is_stable_within_process() {
        assert_eq!(name_hash("main"), name_hash("main"));
        assert_ne!(name_hash("main"), name_hash("main2"));
    }

    #[test]
    fn integral_float_hashes_like_int() {
        assert_eq!(hash_f64(42.0), hash_i64(42));
        assert_ne!(hash_f64(42.5), hash_i64(42));
    }

    #[test]
    fn char_hashes_like_single_char_string() {
        assert_eq!(hash_char('a'), hash_str("a"));
    }
}
