//! 32-byte hash newtype
//!
//! Hashes live in memory in the byte order they are hashed and serialized in;
//! user-facing hex is the reverse byte order, as everywhere in the Bitcoin
//! protocol family.

use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse the user-facing (reversed) hex form.
    pub fn from_display_hex(s: &str) -> Option<Hash256> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let mut h = [0u8; 32];
        for (i, b) in bytes.iter().rev().enumerate() {
            h[i] = *b;
        }
        Some(Hash256(h))
    }

    /// User-facing hex: reversed byte order.
    pub fn to_display_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Hash256(bytes)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_hex_roundtrip() {
        let s = "1a91e3dace36e2be3bf030a65679fe821aa1d6ef92e7c9902eb318182c355691";
        let h = Hash256::from_display_hex(s).unwrap();
        assert_eq!(h.to_display_hex(), s);
        // internal order is reversed: display's trailing byte comes first
        assert_eq!(h.0[0], 0x91);
        assert_eq!(h.0[31], 0x1a);
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(Hash256::from_display_hex("abcd").is_none());
        assert!(Hash256::from_display_hex("zz").is_none());
    }
}
