//! BIP-32 hierarchical deterministic key tree
//!
//! The master key is derived with HMAC-SHA512 keyed by `"Dogecoin seed"`
//! (overridable for chain variants; standard Bitcoin trees use
//! `"Bitcoin seed"`). Extended keys serialize to the 78-byte big-endian
//! layout behind base58check, with chain-specific version prefixes.

use crate::chainparams::ChainParams;
use crate::crypto::{self, CryptoError};
use crate::keys::PublicKey;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Child indices at or above this bit are hardened.
pub const HARDENED_CHILD: u32 = 0x8000_0000;

/// Default HMAC key for master-from-seed derivation.
pub const MASTER_SEED_KEY: &[u8] = b"Dogecoin seed";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Bip32Error {
    #[error("seed produced an invalid master key, retry with new entropy")]
    InvalidSeed,

    #[error("derived child key is invalid, retry with the next index")]
    WeakChild,

    #[error("hardened derivation requires a private key")]
    HardenedFromPublic,

    #[error("malformed derivation path")]
    PathSyntax,

    #[error("extended key version does not match the chain")]
    VersionMismatch,

    #[error("node carries no private key")]
    NoPrivateKey,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// One node of the HD key tree.
///
/// Immutable after construction; derivation returns a new node.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HdNode {
    depth: u8,
    fingerprint: u32,
    child_num: u32,
    chain_code: [u8; 32],
    private_key: Option<[u8; 32]>,
    public_key: [u8; 33],
}

impl std::fmt::Debug for HdNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HdNode")
            .field("depth", &self.depth)
            .field("fingerprint", &self.fingerprint)
            .field("child_num", &self.child_num)
            .field("private_key", &self.private_key.map(|_| "<redacted>"))
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl HdNode {
    /// Derive the master node from a seed with the default HMAC key.
    pub fn from_seed(seed: &[u8]) -> Result<HdNode, Bip32Error> {
        HdNode::from_seed_with_key(seed, MASTER_SEED_KEY)
    }

    /// Derive the master node with a caller-supplied HMAC key.
    pub fn from_seed_with_key(seed: &[u8], hmac_key: &[u8]) -> Result<HdNode, Bip32Error> {
        let mut i = crypto::hmac_sha512(hmac_key, seed);
        let mut private_key = [0u8; 32];
        private_key.copy_from_slice(&i[..32]);
        if !crypto::verify_private_key(&private_key) {
            i.zeroize();
            private_key.zeroize();
            return Err(Bip32Error::InvalidSeed);
        }
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&i[32..]);
        i.zeroize();

        let public_key = crypto::derive_public_key(&private_key)?;
        Ok(HdNode {
            depth: 0,
            fingerprint: 0,
            child_num: 0,
            chain_code,
            private_key: Some(private_key),
            public_key,
        })
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn fingerprint(&self) -> u32 {
        self.fingerprint
    }

    pub fn child_num(&self) -> u32 {
        self.child_num
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    pub fn private_key_bytes(&self) -> Option<&[u8; 32]> {
        self.private_key.as_ref()
    }

    pub fn public_key_bytes(&self) -> &[u8; 33] {
        &self.public_key
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_slice(&self.public_key).expect("node holds a valid point")
    }

    /// HASH160 of the compressed public key.
    pub fn hash160(&self) -> [u8; 20] {
        crypto::hash160(&self.public_key)
    }

    pub fn p2pkh_address(&self, chain: &ChainParams) -> String {
        self.public_key().p2pkh_address(chain)
    }

    /// A copy of this node with the private key removed.
    pub fn strip_private(&self) -> HdNode {
        let mut node = self.clone();
        node.private_key = None;
        node
    }

    /// Derive child `index`; CKDpriv when a private key is present,
    /// CKDpub otherwise.
    pub fn derive_child(&self, index: u32) -> Result<HdNode, Bip32Error> {
        match self.private_key {
            Some(ref key) => self.ckd_private(key, index),
            None => self.ckd_public(index),
        }
    }

    fn parent_fingerprint(&self) -> u32 {
        let hash = crypto::hash160(&self.public_key);
        u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
    }

    fn ckd_private(&self, parent_key: &[u8; 32], index: u32) -> Result<HdNode, Bip32Error> {
        let mut data = Vec::with_capacity(37);
        if index >= HARDENED_CHILD {
            data.push(0x00);
            data.extend_from_slice(parent_key);
        } else {
            data.extend_from_slice(&self.public_key);
        }
        data.extend_from_slice(&index.to_be_bytes());

        let mut i = crypto::hmac_sha512(&self.chain_code, &data);
        data.zeroize();

        let mut il = [0u8; 32];
        il.copy_from_slice(&i[..32]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&i[32..]);
        i.zeroize();

        if !crypto::verify_private_key(&il) {
            il.zeroize();
            return Err(Bip32Error::WeakChild);
        }
        let child_key = match crypto::private_key_tweak_add(parent_key, &il) {
            Ok(key) => key,
            Err(_) => {
                il.zeroize();
                return Err(Bip32Error::WeakChild);
            }
        };
        il.zeroize();

        let public_key = crypto::derive_public_key(&child_key)?;
        Ok(HdNode {
            depth: self.depth + 1,
            fingerprint: self.parent_fingerprint(),
            child_num: index,
            chain_code,
            private_key: Some(child_key),
            public_key,
        })
    }

    fn ckd_public(&self, index: u32) -> Result<HdNode, Bip32Error> {
        if index >= HARDENED_CHILD {
            return Err(Bip32Error::HardenedFromPublic);
        }
        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(&self.public_key);
        data.extend_from_slice(&index.to_be_bytes());

        let i = crypto::hmac_sha512(&self.chain_code, &data);
        let mut il = [0u8; 32];
        il.copy_from_slice(&i[..32]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&i[32..]);

        if !crypto::verify_private_key(&il) {
            return Err(Bip32Error::WeakChild);
        }
        let public_key = crypto::public_key_tweak_add(&self.public_key, &il)
            .map_err(|_| Bip32Error::WeakChild)?;

        Ok(HdNode {
            depth: self.depth + 1,
            fingerprint: self.parent_fingerprint(),
            child_num: index,
            chain_code,
            private_key: None,
            public_key,
        })
    }

    /// Derive along a textual path (see [`parse_path`]).
    pub fn derive_path(&self, path: &str) -> Result<HdNode, Bip32Error> {
        let components = parse_path(path)?;
        let mut node = self.clone();
        for index in components {
            node = node.derive_child(index)?;
        }
        Ok(node)
    }

    fn serialize_raw(&self, version: u32, public: bool) -> Result<[u8; 78], Bip32Error> {
        let mut out = [0u8; 78];
        out[0..4].copy_from_slice(&version.to_be_bytes());
        out[4] = self.depth;
        out[5..9].copy_from_slice(&self.fingerprint.to_be_bytes());
        out[9..13].copy_from_slice(&self.child_num.to_be_bytes());
        out[13..45].copy_from_slice(&self.chain_code);
        if public {
            out[45..78].copy_from_slice(&self.public_key);
        } else {
            let key = self.private_key.as_ref().ok_or(Bip32Error::NoPrivateKey)?;
            out[45] = 0;
            out[46..78].copy_from_slice(key);
        }
        Ok(out)
    }

    /// Base58check string with the chain's public version prefix.
    pub fn serialize_public(&self, chain: &ChainParams) -> String {
        let raw = self
            .serialize_raw(chain.bip32_pubkey_version, true)
            .expect("public serialization never fails");
        crypto::base58check_encode(&raw)
    }

    /// Base58check string with the chain's private version prefix.
    pub fn serialize_private(&self, chain: &ChainParams) -> Result<String, Bip32Error> {
        let mut raw = self.serialize_raw(chain.bip32_privkey_version, false)?;
        let encoded = crypto::base58check_encode(&raw);
        raw.zeroize();
        Ok(encoded)
    }

    /// Decode an extended key string, validating the version against `chain`.
    pub fn deserialize(encoded: &str, chain: &ChainParams) -> Result<HdNode, Bip32Error> {
        let mut raw = crypto::base58check_decode(encoded)?;
        if raw.len() != 78 {
            raw.zeroize();
            return Err(Bip32Error::VersionMismatch);
        }
        let version = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let depth = raw[4];
        let fingerprint = u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]);
        let child_num = u32::from_be_bytes([raw[9], raw[10], raw[11], raw[12]]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&raw[13..45]);

        let node = if version == chain.bip32_pubkey_version {
            let mut public_key = [0u8; 33];
            public_key.copy_from_slice(&raw[45..78]);
            if !crypto::verify_public_key(&public_key) {
                raw.zeroize();
                return Err(CryptoError::InvalidPublicKey.into());
            }
            HdNode {
                depth,
                fingerprint,
                child_num,
                chain_code,
                private_key: None,
                public_key,
            }
        } else if version == chain.bip32_privkey_version {
            if raw[45] != 0 {
                raw.zeroize();
                return Err(Bip32Error::VersionMismatch);
            }
            let mut private_key = [0u8; 32];
            private_key.copy_from_slice(&raw[46..78]);
            if !crypto::verify_private_key(&private_key) {
                raw.zeroize();
                private_key.zeroize();
                return Err(CryptoError::InvalidKey.into());
            }
            let public_key = crypto::derive_public_key(&private_key)?;
            HdNode {
                depth,
                fingerprint,
                child_num,
                chain_code,
                private_key: Some(private_key),
                public_key,
            }
        } else {
            raw.zeroize();
            return Err(Bip32Error::VersionMismatch);
        };
        raw.zeroize();
        Ok(node)
    }
}

/// Parse a derivation path such as `m/44'/3'/0'/0/2`.
///
/// The leading `m/` is required; use [`parse_path_relative`] for bare paths.
pub fn parse_path(path: &str) -> Result<Vec<u32>, Bip32Error> {
    let rest = path.strip_prefix("m/").ok_or(Bip32Error::PathSyntax)?;
    parse_components(rest, None)
}

/// Parse a path without the `m/` anchor, optionally substituting a wildcard
/// component (`*` or `*'`) with `wildcard_child`.
pub fn parse_path_relative(
    path: &str,
    wildcard_child: Option<u32>,
) -> Result<Vec<u32>, Bip32Error> {
    let rest = path.strip_prefix("m/").unwrap_or(path);
    parse_components(rest, wildcard_child)
}

fn parse_components(path: &str, wildcard_child: Option<u32>) -> Result<Vec<u32>, Bip32Error> {
    if path.is_empty() {
        return Err(Bip32Error::PathSyntax);
    }
    let mut out = Vec::new();
    for component in path.split('/') {
        if component.is_empty() {
            return Err(Bip32Error::PathSyntax);
        }
        let (body, hardened) = match component.strip_suffix(&['\'', 'h', 'H', 'p'][..]) {
            Some(body) => (body, true),
            None => (component, false),
        };
        let index = if body == "*" {
            wildcard_child.ok_or(Bip32Error::PathSyntax)?
        } else {
            if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Bip32Error::PathSyntax);
            }
            let value: u64 = body.parse().map_err(|_| Bip32Error::PathSyntax)?;
            if value > u64::from(u32::MAX) {
                return Err(Bip32Error::PathSyntax);
            }
            value as u32
        };
        if hardened && index >= HARDENED_CHILD {
            return Err(Bip32Error::PathSyntax);
        }
        out.push(if hardened { index + HARDENED_CHILD } else { index });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chainparams::MAINNET;

    fn test_master() -> HdNode {
        HdNode::from_seed(&hex::decode("000102030405060708090a0b0c0d0e0f").unwrap()).unwrap()
    }

    #[test]
    fn test_master_properties() {
        let node = test_master();
        assert_eq!(node.depth(), 0);
        assert_eq!(node.fingerprint(), 0);
        assert_eq!(node.child_num(), 0);
        assert!(node.has_private_key());
    }

    #[test]
    fn test_ckdpub_matches_ckdpriv() {
        let master = test_master();
        for index in [0u32, 1, 7, 1000] {
            let private_child = master.derive_child(index).unwrap();
            let public_child = master.strip_private().derive_child(index).unwrap();
            assert_eq!(
                private_child.public_key_bytes(),
                public_child.public_key_bytes()
            );
            assert_eq!(private_child.chain_code(), public_child.chain_code());
            assert_eq!(private_child.fingerprint(), public_child.fingerprint());
        }
    }

    #[test]
    fn test_hardened_from_public_fails() {
        let public_only = test_master().strip_private();
        assert_eq!(
            public_only.derive_child(HARDENED_CHILD).unwrap_err(),
            Bip32Error::HardenedFromPublic
        );
    }

    #[test]
    fn test_path_parsing() {
        assert_eq!(parse_path("m/0").unwrap(), vec![0]);
        assert_eq!(
            parse_path("m/44'/3h/0H/1p/2").unwrap(),
            vec![
                44 + HARDENED_CHILD,
                3 + HARDENED_CHILD,
                HARDENED_CHILD,
                1 + HARDENED_CHILD,
                2
            ]
        );
        assert_eq!(parse_path("0/1"), Err(Bip32Error::PathSyntax));
        assert_eq!(parse_path("m/"), Err(Bip32Error::PathSyntax));
        assert_eq!(parse_path("m/abc"), Err(Bip32Error::PathSyntax));
        assert_eq!(parse_path("m/4294967296"), Err(Bip32Error::PathSyntax));
        // relative form allows bare components and wildcards
        assert_eq!(parse_path_relative("0/1", None).unwrap(), vec![0, 1]);
        assert_eq!(
            parse_path_relative("0/*'", Some(9)).unwrap(),
            vec![0, 9 + HARDENED_CHILD]
        );
        assert_eq!(parse_path_relative("*", None), Err(Bip32Error::PathSyntax));
    }

    #[test]
    fn test_serialize_roundtrip_dogecoin_prefix() {
        let master = test_master();
        let xprv = master.serialize_private(&MAINNET).unwrap();
        assert!(xprv.starts_with("dgpv"), "unexpected prefix {}", xprv);
        let xpub = master.serialize_public(&MAINNET);
        assert!(xpub.starts_with("dgub"), "unexpected prefix {}", xpub);

        let restored = HdNode::deserialize(&xprv, &MAINNET).unwrap();
        assert_eq!(restored.serialize_private(&MAINNET).unwrap(), xprv);
        assert_eq!(
            restored.public_key_bytes(),
            master.public_key_bytes()
        );

        let restored_pub = HdNode::deserialize(&xpub, &MAINNET).unwrap();
        assert!(!restored_pub.has_private_key());
        assert_eq!(restored_pub.serialize_public(&MAINNET), xpub);
    }

    #[test]
    fn test_deserialize_version_mismatch() {
        let master = test_master();
        let xprv = master.serialize_private(&MAINNET).unwrap();
        assert_eq!(
            HdNode::deserialize(&xprv, &crate::chainparams::TESTNET).unwrap_err(),
            Bip32Error::VersionMismatch
        );
    }
}
