//! Hashing, base58check and ECDSA wrappers
//!
//! Thin layer over `sha2`/`ripemd`/`hmac` and `secp256k1`. Key material is
//! always big-endian; signatures are normalized to low-S per BIP-62 and
//! high-S signatures are rejected on verification.

use base58::{FromBase58, ToBase58};
use hmac::{Hmac, Mac};
use rand::RngCore;
use ripemd::Ripemd160;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId, Signature};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid private key")]
    InvalidKey,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid recovery id")]
    InvalidRecoveryId,

    #[error("base58 decode failed")]
    Base58,

    #[error("base58check checksum mismatch")]
    ChecksumMismatch,
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA256(SHA256(x)), the chain's block/tx/checksum hash.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(data)).into()
}

/// RIPEMD160(SHA256(x)), used for addresses and key fingerprints.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

pub fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Base58 with a trailing 4-byte sha256d checksum.
pub fn base58check_encode(payload: &[u8]) -> String {
    let checksum = sha256d(payload);
    let mut data = Vec::with_capacity(payload.len() + 4);
    data.extend_from_slice(payload);
    data.extend_from_slice(&checksum[..4]);
    data.to_base58()
}

/// Decode and strip the checksum, failing if it does not match.
pub fn base58check_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    let data = s.from_base58().map_err(|_| CryptoError::Base58)?;
    if data.len() < 4 {
        return Err(CryptoError::Base58);
    }
    let (payload, checksum) = data.split_at(data.len() - 4);
    if sha256d(payload)[..4] != *checksum {
        return Err(CryptoError::ChecksumMismatch);
    }
    Ok(payload.to_vec())
}

/// True if `bytes` is a valid secp256k1 secret scalar in [1, n-1].
pub fn verify_private_key(bytes: &[u8; 32]) -> bool {
    SecretKey::from_slice(bytes).is_ok()
}

/// Rejection-sample 32 random bytes until they form a valid scalar.
pub fn generate_private_key() -> [u8; 32] {
    let mut rng = rand::thread_rng();
    let mut key = [0u8; 32];
    loop {
        rng.fill_bytes(&mut key);
        if verify_private_key(&key) {
            return key;
        }
    }
}

/// Compressed 33-byte public key for a private key.
pub fn derive_public_key(privkey: &[u8; 32]) -> Result<[u8; 33], CryptoError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(privkey).map_err(|_| CryptoError::InvalidKey)?;
    Ok(PublicKey::from_secret_key(&secp, &sk).serialize())
}

/// True if `bytes` parses as a point on the curve (33 or 65 bytes).
pub fn verify_public_key(bytes: &[u8]) -> bool {
    PublicKey::from_slice(bytes).is_ok()
}

/// 64-byte compact ECDSA signature over a 32-byte digest, low-S.
pub fn sign_hash(privkey: &[u8; 32], hash: &[u8; 32]) -> Result<[u8; 64], CryptoError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(privkey).map_err(|_| CryptoError::InvalidKey)?;
    let msg = Message::from_digest_slice(hash).map_err(|_| CryptoError::InvalidSignature)?;
    let sig = secp.sign_ecdsa(&msg, &sk);
    Ok(sig.serialize_compact())
}

/// Compact signature plus its recovery id.
pub fn sign_hash_recoverable(
    privkey: &[u8; 32],
    hash: &[u8; 32],
) -> Result<([u8; 64], u8), CryptoError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(privkey).map_err(|_| CryptoError::InvalidKey)?;
    let msg = Message::from_digest_slice(hash).map_err(|_| CryptoError::InvalidSignature)?;
    let sig = secp.sign_ecdsa_recoverable(&msg, &sk);
    let (recid, compact) = sig.serialize_compact();
    Ok((compact, recid.to_i32() as u8))
}

/// Recover the compressed public key that produced a recoverable signature.
pub fn recover_public_key(
    sig: &[u8; 64],
    hash: &[u8; 32],
    recid: u8,
) -> Result<[u8; 33], CryptoError> {
    let secp = Secp256k1::new();
    let recid = RecoveryId::from_i32(i32::from(recid)).map_err(|_| CryptoError::InvalidRecoveryId)?;
    let sig =
        RecoverableSignature::from_compact(sig, recid).map_err(|_| CryptoError::InvalidSignature)?;
    let msg = Message::from_digest_slice(hash).map_err(|_| CryptoError::InvalidSignature)?;
    let pubkey = secp
        .recover_ecdsa(&msg, &sig)
        .map_err(|_| CryptoError::InvalidSignature)?;
    Ok(pubkey.serialize())
}

/// `(key + tweak) mod n`, failing on an invalid tweak or a zero result.
pub fn private_key_tweak_add(key: &[u8; 32], tweak: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let sk = SecretKey::from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
    let scalar =
        secp256k1::Scalar::from_be_bytes(*tweak).map_err(|_| CryptoError::InvalidKey)?;
    let tweaked = sk.add_tweak(&scalar).map_err(|_| CryptoError::InvalidKey)?;
    Ok(tweaked.secret_bytes())
}

/// `point + tweak·G`, failing on an invalid tweak or the point at infinity.
pub fn public_key_tweak_add(pubkey: &[u8; 33], tweak: &[u8; 32]) -> Result<[u8; 33], CryptoError> {
    let secp = Secp256k1::new();
    let pk = PublicKey::from_slice(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    let scalar =
        secp256k1::Scalar::from_be_bytes(*tweak).map_err(|_| CryptoError::InvalidKey)?;
    let tweaked = pk
        .add_exp_tweak(&secp, &scalar)
        .map_err(|_| CryptoError::InvalidKey)?;
    Ok(tweaked.serialize())
}

/// Verify a DER signature against a digest, rejecting high-S encodings.
pub fn verify_signature_der(pubkey: &[u8], hash: &[u8; 32], der_sig: &[u8]) -> bool {
    let secp = Secp256k1::new();
    let Ok(pk) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(sig) = Signature::from_der(der_sig) else {
        return false;
    };
    let mut low_s = sig;
    low_s.normalize_s();
    if low_s != sig {
        // S > n/2 is non-standard (BIP-62)
        return false;
    }
    let Ok(msg) = Message::from_digest_slice(hash) else {
        return false;
    };
    secp.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

/// Convert a 64-byte compact signature to normalized DER.
pub fn compact_to_der(sig: &[u8; 64]) -> Result<Vec<u8>, CryptoError> {
    let mut sig = Signature::from_compact(sig).map_err(|_| CryptoError::InvalidSignature)?;
    sig.normalize_s();
    Ok(sig.serialize_der().to_vec())
}
