//! SHA-256 checksums for chunked snapshots.

use std::fmt::Write;

use sha2::{Digest, Sha256};

/// SHA-256 of a snapshot's UTF-8 bytes as a lowercase hex string.
pub fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

/// Compare a received checksum against the text, ignoring hex case.
pub fn matches(text: &str, expected: &str) -> bool {
    sha256_hex(text).eq_ignore_ascii_case(expected.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_matches_is_case_insensitive() {
        assert!(matches(
            "abc",
            "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"
        ));
        assert!(!matches("abd", &sha256_hex("abc")));
    }
}
