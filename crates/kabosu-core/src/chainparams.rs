//! Chain parameters for the supported Dogecoin networks

use crate::hash::Hash256;

/// A known-good block used to bound header sync.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    pub height: u32,
    /// Display-order (reversed) hex of the block hash.
    pub hash: &'static str,
    /// Block header timestamp.
    pub timestamp: u32,
}

impl Checkpoint {
    pub fn block_hash(&self) -> Hash256 {
        Hash256::from_display_hex(self.hash).expect("checkpoint hash constant")
    }
}

/// Per-network constants consumed by the rest of the library.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub name: &'static str,
    /// p2p message start bytes.
    pub netmagic: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],
    /// Display-order hex of the genesis block hash.
    pub genesis_hash: &'static str,
    /// Base58 prefix for P2PKH addresses.
    pub b58_prefix_pubkey_address: u8,
    /// Base58 prefix for P2SH addresses.
    pub b58_prefix_script_address: u8,
    /// Base58 prefix for WIF-encoded secrets.
    pub b58_prefix_secret: u8,
    /// BIP32 extended private key version (big-endian).
    pub bip32_privkey_version: u32,
    /// BIP32 extended public key version (big-endian).
    pub bip32_pubkey_version: u32,
    pub bech32_hrp: &'static str,
    /// Merged-mining chain id (encoded in block version bits 16..).
    pub auxpow_chain_id: u32,
    /// Reject AuxPoW parents carrying our own chain id.
    pub strict_chain_id: bool,
    pub checkpoints: &'static [Checkpoint],
}

impl ChainParams {
    pub fn genesis_block_hash(&self) -> Hash256 {
        Hash256::from_display_hex(self.genesis_hash).expect("genesis hash constant")
    }
}

pub static MAINNET: ChainParams = ChainParams {
    name: "main",
    netmagic: [0xc0, 0xc0, 0xc0, 0xc0],
    default_port: 22556,
    dns_seeds: &["seed.multidoge.org", "seed2.multidoge.org"],
    genesis_hash: "1a91e3dace36e2be3bf030a65679fe821aa1d6ef92e7c9902eb318182c355691",
    b58_prefix_pubkey_address: 0x1e,
    b58_prefix_script_address: 0x16,
    b58_prefix_secret: 0x9e,
    bip32_privkey_version: 0x02fac398,
    bip32_pubkey_version: 0x02facafd,
    bech32_hrp: "doge",
    auxpow_chain_id: 0x0062,
    strict_chain_id: true,
    checkpoints: &[
        Checkpoint {
            height: 0,
            hash: "1a91e3dace36e2be3bf030a65679fe821aa1d6ef92e7c9902eb318182c355691",
            timestamp: 1_386_325_540,
        },
        Checkpoint {
            height: 371_337,
            hash: "60323982f9c5ff1b5a954eac9dc1269352835f47c2c5222691d80f0d50dcf053",
            timestamp: 1_410_464_445,
        },
    ],
};

pub static TESTNET: ChainParams = ChainParams {
    name: "test",
    netmagic: [0xfc, 0xc1, 0xb7, 0xdc],
    default_port: 44556,
    dns_seeds: &["testseed.jrn.me.uk"],
    genesis_hash: "bb0a78264637406b6360aad926284d544d7049f45189db5664f3c4d07350559e",
    b58_prefix_pubkey_address: 0x71,
    b58_prefix_script_address: 0xc4,
    b58_prefix_secret: 0xf1,
    bip32_privkey_version: 0x04358394,
    bip32_pubkey_version: 0x043587cf,
    bech32_hrp: "tdge",
    auxpow_chain_id: 0x0062,
    strict_chain_id: false,
    checkpoints: &[Checkpoint {
        height: 0,
        hash: "bb0a78264637406b6360aad926284d544d7049f45189db5664f3c4d07350559e",
        timestamp: 1_391_503_289,
    }],
};

pub static REGTEST: ChainParams = ChainParams {
    name: "regtest",
    netmagic: [0xfa, 0xbf, 0xb5, 0xda],
    default_port: 18444,
    dns_seeds: &[],
    genesis_hash: "3d2160a3b5dc4a9d62e7e66a295f70313ac808440ef7400d6c0772171ce973a5",
    b58_prefix_pubkey_address: 0x6f,
    b58_prefix_script_address: 0xc4,
    b58_prefix_secret: 0xef,
    bip32_privkey_version: 0x04358394,
    bip32_pubkey_version: 0x043587cf,
    bech32_hrp: "dcrt",
    auxpow_chain_id: 0x0062,
    strict_chain_id: false,
    checkpoints: &[],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_hash_parses() {
        for params in [&MAINNET, &TESTNET, &REGTEST] {
            let hash = params.genesis_block_hash();
            assert!(!hash.is_zero());
            assert_eq!(hash.to_display_hex(), params.genesis_hash);
        }
    }

    #[test]
    fn test_checkpoints_are_ordered_by_height() {
        for params in [&MAINNET, &TESTNET] {
            let heights: Vec<u32> = params.checkpoints.iter().map(|c| c.height).collect();
            let mut sorted = heights.clone();
            sorted.sort_unstable();
            assert_eq!(heights, sorted);
        }
    }
}
