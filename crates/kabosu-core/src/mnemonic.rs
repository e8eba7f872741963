//! BIP-39 mnemonic encoding and seed derivation
//!
//! Entropy of 128–256 bits maps to 12–24 words; the checksum is the leading
//! `entropy_bits / 32` bits of SHA256(entropy). Seed derivation is
//! PBKDF2-HMAC-SHA512 over the NFKD-normalized sentence with 2048 rounds.

use crate::crypto::sha256;
use crate::wordlist::Wordlist;
use rand::RngCore;
use sha2::Sha512;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroize;

/// PBKDF2 round count fixed by BIP-39.
pub const PBKDF2_ROUNDS: u32 = 2048;

/// Passphrases beyond this many bytes are refused rather than truncated.
pub const MAX_PASSPHRASE_BYTES: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MnemonicError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid word count: {0}")]
    BadWordCount(usize),

    #[error("word not in list: {0}")]
    UnknownWord(String),

    #[error("mnemonic checksum mismatch")]
    ChecksumMismatch,

    #[error("passphrase exceeds {MAX_PASSPHRASE_BYTES} bytes")]
    PassphraseTooLong,

    #[error("bad wordlist: {0}")]
    WordlistInvalid(String),
}

fn checksum_bits(entropy_len: usize) -> usize {
    entropy_len * 8 / 32
}

/// Encode entropy as a mnemonic sentence.
pub fn mnemonic_from_entropy(
    entropy: &[u8],
    wordlist: &Wordlist,
) -> Result<String, MnemonicError> {
    if entropy.len() % 4 != 0 || entropy.len() < 16 || entropy.len() > 32 {
        // report the word count this entropy would map to
        return Err(MnemonicError::BadWordCount(entropy.len() * 3 / 4));
    }

    // entropy followed by the checksum byte; only the top bits of the
    // checksum are consumed
    let mut bits = Vec::with_capacity(entropy.len() + 1);
    bits.extend_from_slice(entropy);
    bits.push(sha256(entropy)[0]);

    let word_count = (entropy.len() * 8 + checksum_bits(entropy.len())) / 11;
    let mut words = Vec::with_capacity(word_count);
    for w in 0..word_count {
        let mut index = 0usize;
        for b in 0..11 {
            let bit = w * 11 + b;
            index <<= 1;
            if bits[bit / 8] & (1 << (7 - bit % 8)) != 0 {
                index |= 1;
            }
        }
        // indices are 11 bits, always within the 2048-entry table
        let word = wordlist
            .word(index)
            .ok_or_else(|| MnemonicError::WordlistInvalid("table shorter than 2048".into()))?;
        words.push(word.to_string());
    }
    bits.zeroize();

    let delimiter = wordlist.delimiter().to_string();
    Ok(words.join(&delimiter))
}

/// Generate a fresh mnemonic from `strength` bits of system entropy.
pub fn generate_mnemonic(strength: usize, wordlist: &Wordlist) -> Result<String, MnemonicError> {
    if strength % 32 != 0 || !(128..=256).contains(&strength) {
        return Err(MnemonicError::BadWordCount(strength * 3 / 32));
    }
    let mut entropy = vec![0u8; strength / 8];
    rand::thread_rng().fill_bytes(&mut entropy);
    let mnemonic = mnemonic_from_entropy(&entropy, wordlist);
    entropy.zeroize();
    mnemonic
}

/// Decode a mnemonic back to its entropy, verifying the checksum.
pub fn mnemonic_to_entropy(
    mnemonic: &str,
    wordlist: &Wordlist,
) -> Result<Vec<u8>, MnemonicError> {
    let words: Vec<&str> = mnemonic.split_whitespace().collect();
    if !matches!(words.len(), 12 | 15 | 18 | 21 | 24) {
        return Err(MnemonicError::BadWordCount(words.len()));
    }

    let total_bits = words.len() * 11;
    let mut bits = vec![0u8; (total_bits + 7) / 8];
    for (w, word) in words.iter().enumerate() {
        let index = wordlist
            .find(word)
            .ok_or_else(|| MnemonicError::UnknownWord((*word).to_string()))?;
        for b in 0..11 {
            if index & (1 << (10 - b)) != 0 {
                let bit = w * 11 + b;
                bits[bit / 8] |= 1 << (7 - bit % 8);
            }
        }
    }

    let cs_bits = total_bits / 33;
    let entropy_len = cs_bits * 4;
    let entropy = bits[..entropy_len].to_vec();

    // compare the leading checksum bits against SHA256(entropy)
    let expected = sha256(&entropy)[0];
    let stored = bits[entropy_len];
    let mask = 0xffu8 << (8 - cs_bits);
    bits.zeroize();
    if (expected & mask) != (stored & mask) {
        return Err(MnemonicError::ChecksumMismatch);
    }

    Ok(entropy)
}

/// True when the sentence has a valid word count, known words and checksum.
pub fn mnemonic_check(mnemonic: &str, wordlist: &Wordlist) -> bool {
    mnemonic_to_entropy(mnemonic, wordlist).is_ok()
}

/// PBKDF2-HMAC-SHA512 seed derivation.
///
/// Both the sentence and the `"mnemonic" || passphrase` salt are NFKD
/// normalized; ASCII input passes through unchanged.
pub fn mnemonic_to_seed(mnemonic: &str, passphrase: &str) -> Result<[u8; 64], MnemonicError> {
    if passphrase.len() > MAX_PASSPHRASE_BYTES {
        return Err(MnemonicError::PassphraseTooLong);
    }

    let mut password = nfkd(mnemonic);
    let mut salt = String::with_capacity(8 + passphrase.len());
    salt.push_str("mnemonic");
    salt.push_str(passphrase);
    let mut salt = nfkd(&salt);

    let mut seed = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt.as_bytes(), PBKDF2_ROUNDS, &mut seed);
    password.zeroize();
    salt.zeroize();
    Ok(seed)
}

fn nfkd(s: &str) -> String {
    if s.is_ascii() {
        s.to_string()
    } else {
        s.nfkd().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wordlist::Language;

    fn english() -> Wordlist {
        Wordlist::builtin(Language::English)
    }

    #[test]
    fn test_all_abandon_vector() {
        let entropy = [0u8; 16];
        let mnemonic = mnemonic_from_entropy(&entropy, &english()).unwrap();
        assert_eq!(
            mnemonic,
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"
        );

        let seed = mnemonic_to_seed(&mnemonic, "TREZOR").unwrap();
        assert_eq!(
            hex::encode(seed),
            "c55257c360c07c72029aebc1b53c05ed0362ada38ead3e3e9efa3708e53495531f09a6987599d18264c1e1c92f2cf141630c7a3c4ab7c81b2f001698e7463b04"
        );
    }

    #[test]
    fn test_entropy_roundtrip() {
        for len in [16usize, 20, 24, 28, 32] {
            let entropy: Vec<u8> = (0..len as u8).map(|i| i.wrapping_mul(37)).collect();
            let mnemonic = mnemonic_from_entropy(&entropy, &english()).unwrap();
            assert!(mnemonic_check(&mnemonic, &english()));
            assert_eq!(mnemonic_to_entropy(&mnemonic, &english()).unwrap(), entropy);
        }
    }

    #[test]
    fn test_bad_entropy_lengths() {
        assert_eq!(
            mnemonic_from_entropy(&[0u8; 15], &english()).unwrap_err(),
            MnemonicError::BadWordCount(11)
        );
        assert_eq!(
            mnemonic_from_entropy(&[0u8; 36], &english()).unwrap_err(),
            MnemonicError::BadWordCount(27)
        );
        assert_eq!(
            generate_mnemonic(100, &english()).unwrap_err(),
            MnemonicError::BadWordCount(9)
        );
    }

    #[test]
    fn test_bad_word_count() {
        assert_eq!(
            mnemonic_to_entropy("abandon abandon about", &english()).unwrap_err(),
            MnemonicError::BadWordCount(3)
        );
    }

    #[test]
    fn test_unknown_word() {
        let sentence = "doge doge doge doge doge doge doge doge doge doge doge doge";
        assert_eq!(
            mnemonic_to_entropy(sentence, &english()).unwrap_err(),
            MnemonicError::UnknownWord("doge".to_string())
        );
    }

    #[test]
    fn test_checksum_mismatch() {
        // valid words, wrong final word for the checksum
        let sentence = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon";
        assert_eq!(
            mnemonic_to_entropy(sentence, &english()).unwrap_err(),
            MnemonicError::ChecksumMismatch
        );
    }

    #[test]
    fn test_passphrase_bound() {
        let long = "x".repeat(MAX_PASSPHRASE_BYTES + 1);
        assert_eq!(
            mnemonic_to_seed("abandon", &long).unwrap_err(),
            MnemonicError::PassphraseTooLong
        );
    }

    #[test]
    fn test_seed_is_deterministic() {
        let mnemonic = generate_mnemonic(256, &english()).unwrap();
        assert_eq!(mnemonic.split_whitespace().count(), 24);
        let a = mnemonic_to_seed(&mnemonic, "passphrase").unwrap();
        let b = mnemonic_to_seed(&mnemonic, "passphrase").unwrap();
        assert_eq!(a, b);
        let c = mnemonic_to_seed(&mnemonic, "other").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_japanese_delimiter() {
        let list = Wordlist::builtin(Language::Japanese);
        let mnemonic = mnemonic_from_entropy(&[0u8; 16], &list).unwrap();
        assert!(mnemonic.contains('\u{3000}'));
        assert!(!mnemonic.contains(' '));
        assert!(mnemonic_check(&mnemonic, &list));
    }
}
