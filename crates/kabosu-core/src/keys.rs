//! Private/public key types, WIF encoding and address forms

use crate::chainparams::ChainParams;
use crate::crypto::{self, CryptoError};
use bech32::{FromBase32, ToBase32, Variant};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("WIF string too short or malformed")]
    WifFormat,

    #[error("WIF prefix does not match the configured chain")]
    WifPrefixMismatch,

    #[error("unknown address encoding: {0}")]
    UnknownAddress(String),
}

/// A secp256k1 secret key. The backing bytes are wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    bytes: [u8; 32],
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey").field("bytes", &"<redacted>").finish()
    }
}

impl PrivateKey {
    /// Rejection-sample a fresh key.
    pub fn generate() -> PrivateKey {
        PrivateKey {
            bytes: crypto::generate_private_key(),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Result<PrivateKey, KeyError> {
        if !crypto::verify_private_key(&bytes) {
            return Err(CryptoError::InvalidKey.into());
        }
        Ok(PrivateKey { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn public_key(&self) -> PublicKey {
        // the scalar was validated at construction time
        let bytes = crypto::derive_public_key(&self.bytes).expect("key validated on construction");
        PublicKey { bytes }
    }

    /// Base58check of `secret_prefix || key || 0x01` (compressed-key marker).
    pub fn to_wif(&self, chain: &ChainParams) -> String {
        let mut payload = [0u8; 34];
        payload[0] = chain.b58_prefix_secret;
        payload[1..33].copy_from_slice(&self.bytes);
        payload[33] = 1;
        let encoded = crypto::base58check_encode(&payload);
        payload.zeroize();
        encoded
    }

    pub fn from_wif(wif: &str, chain: &ChainParams) -> Result<PrivateKey, KeyError> {
        if wif.len() < 50 {
            return Err(KeyError::WifFormat);
        }
        let mut payload = crypto::base58check_decode(wif)?;
        if payload.len() < 33 {
            payload.zeroize();
            return Err(KeyError::WifFormat);
        }
        if payload[0] != chain.b58_prefix_secret {
            payload.zeroize();
            return Err(KeyError::WifPrefixMismatch);
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&payload[1..33]);
        payload.zeroize();
        PrivateKey::from_bytes(bytes)
    }

    pub fn sign_hash(&self, hash: &[u8; 32]) -> Result<[u8; 64], KeyError> {
        Ok(crypto::sign_hash(&self.bytes, hash)?)
    }

    pub fn sign_hash_recoverable(&self, hash: &[u8; 32]) -> Result<([u8; 64], u8), KeyError> {
        Ok(crypto::sign_hash_recoverable(&self.bytes, hash)?)
    }
}

/// A compressed secp256k1 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    bytes: [u8; 33],
}

impl PublicKey {
    pub fn from_slice(bytes: &[u8]) -> Result<PublicKey, KeyError> {
        if bytes.len() != 33 || !crypto::verify_public_key(bytes) {
            return Err(CryptoError::InvalidPublicKey.into());
        }
        let mut out = [0u8; 33];
        out.copy_from_slice(bytes);
        Ok(PublicKey { bytes: out })
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.bytes
    }

    pub fn hash160(&self) -> [u8; 20] {
        crypto::hash160(&self.bytes)
    }

    /// `base58check(pubkey_prefix || HASH160(pubkey))`
    pub fn p2pkh_address(&self, chain: &ChainParams) -> String {
        let mut payload = [0u8; 21];
        payload[0] = chain.b58_prefix_pubkey_address;
        payload[1..].copy_from_slice(&self.hash160());
        crypto::base58check_encode(&payload)
    }

    /// Native segwit v0 address with the chain's HRP.
    pub fn p2wpkh_address(&self, chain: &ChainParams) -> String {
        encode_witness_address(chain.bech32_hrp, 0, &self.hash160())
    }

    /// The P2WPKH program wrapped in P2SH.
    pub fn p2sh_p2wpkh_address(&self, chain: &ChainParams) -> String {
        // redeem script: OP_0 <20-byte key hash>
        let mut redeem = Vec::with_capacity(22);
        redeem.push(0x00);
        redeem.push(0x14);
        redeem.extend_from_slice(&self.hash160());

        let mut payload = [0u8; 21];
        payload[0] = chain.b58_prefix_script_address;
        payload[1..].copy_from_slice(&crypto::hash160(&redeem));
        crypto::base58check_encode(&payload)
    }

    pub fn verify_signature_der(&self, hash: &[u8; 32], der_sig: &[u8]) -> bool {
        crypto::verify_signature_der(&self.bytes, hash, der_sig)
    }
}

/// The destination a textual address pays to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressPayload {
    PubkeyHash([u8; 20]),
    ScriptHash([u8; 20]),
    WitnessV0(Vec<u8>),
}

/// Decode a base58check or bech32 address for the given chain.
pub fn decode_address(address: &str, chain: &ChainParams) -> Result<AddressPayload, KeyError> {
    if let Ok(payload) = crypto::base58check_decode(address) {
        if payload.len() == 21 {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&payload[1..]);
            if payload[0] == chain.b58_prefix_pubkey_address {
                return Ok(AddressPayload::PubkeyHash(hash));
            }
            if payload[0] == chain.b58_prefix_script_address {
                return Ok(AddressPayload::ScriptHash(hash));
            }
        }
        return Err(KeyError::UnknownAddress(address.to_string()));
    }

    if let Ok((hrp, data, Variant::Bech32)) = bech32::decode(address) {
        if hrp == chain.bech32_hrp && !data.is_empty() && data[0].to_u8() == 0 {
            let program = Vec::<u8>::from_base32(&data[1..])
                .map_err(|_| KeyError::UnknownAddress(address.to_string()))?;
            if program.len() == 20 || program.len() == 32 {
                return Ok(AddressPayload::WitnessV0(program));
            }
        }
    }

    Err(KeyError::UnknownAddress(address.to_string()))
}

fn encode_witness_address(hrp: &str, version: u8, program: &[u8]) -> String {
    let mut data = vec![bech32::u5::try_from_u8(version).expect("witness version < 32")];
    data.extend(program.to_base32());
    bech32::encode(hrp, data, Variant::Bech32).expect("static hrp is valid")
}
