//! Kabosu Core
//!
//! Dogecoin primitives for wallets and SPV clients:
//!
//! - secp256k1 keys, WIF and the chain's address forms
//! - BIP-32 hierarchical deterministic key tree (Dogecoin seed variant)
//! - BIP-39 mnemonics across ten wordlists
//! - script classification and the standard output templates
//! - transaction (de)serialization, SIGHASH and signing
//! - block headers with merged-mining (AuxPoW) verification
//!
//! Everything here is pure and synchronous; networking and persistence live
//! in the `kabosu-spv` and `kabosu-wallet` crates.

pub mod bip32;
pub mod block;
pub mod chainparams;
pub mod crypto;
pub mod hash;
pub mod keys;
pub mod mnemonic;
pub mod script;
pub mod serialize;
pub mod tx;
pub mod wordlist;

pub use chainparams::ChainParams;
pub use hash::Hash256;
