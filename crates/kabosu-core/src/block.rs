//! Block headers and merged-mining (AuxPoW) proof verification

use crate::chainparams::ChainParams;
use crate::crypto::sha256d;
use crate::hash::Hash256;
use crate::serialize::{put_hash, put_u32, put_var_int, ReadError, Reader};
use crate::tx::{Transaction, TxError};
use thiserror::Error;

/// Version bit signalling an AuxPoW tail after the 80-byte header.
pub const VERSION_AUXPOW_BIT: u32 = 0x100;

/// Marker preceding the aux merkle root in the parent coinbase scriptSig.
pub const MERGED_MINING_MAGIC: [u8; 4] = [0xfa, 0xbe, 0x6d, 0x6d];

/// The embedded magic must start at or before this scriptSig offset.
const MAX_COINBASE_SCAN_OFFSET: usize = 45;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error("invalid AuxPoW: {0}")]
    AuxPowInvalid(&'static str),
}

/// The chain id carried in a block version's upper bits.
pub fn version_chain_id(version: u32) -> u32 {
    version >> 16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const SERIALIZED_LEN: usize = 80;

    pub fn has_auxpow(&self) -> bool {
        self.version & VERSION_AUXPOW_BIT != 0
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        put_u32(out, self.version);
        put_hash(out, self.prev_block.as_bytes());
        put_hash(out, self.merkle_root.as_bytes());
        put_u32(out, self.timestamp);
        put_u32(out, self.bits);
        put_u32(out, self.nonce);
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SERIALIZED_LEN);
        self.serialize_into(&mut out);
        out
    }

    pub fn deserialize_from(r: &mut Reader) -> Result<BlockHeader, BlockError> {
        Ok(BlockHeader {
            version: r.read_u32()?,
            prev_block: Hash256(r.read_hash()?),
            merkle_root: Hash256(r.read_hash()?),
            timestamp: r.read_u32()?,
            bits: r.read_u32()?,
            nonce: r.read_u32()?,
        })
    }

    /// Double-SHA256 of the 80-byte serialization.
    pub fn hash(&self) -> Hash256 {
        Hash256(sha256d(&self.serialize()))
    }
}

/// Merged-mining proof attached to an AuxPoW block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxPow {
    pub parent_coinbase: Transaction,
    pub parent_hash: Hash256,
    pub parent_merkle_branch: Vec<Hash256>,
    pub parent_merkle_index: u32,
    pub aux_merkle_branch: Vec<Hash256>,
    pub aux_merkle_index: u32,
    pub parent_header: BlockHeader,
}

impl AuxPow {
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.parent_coinbase.serialize(true));
        put_hash(out, self.parent_hash.as_bytes());
        put_var_int(out, self.parent_merkle_branch.len() as u64);
        for node in &self.parent_merkle_branch {
            put_hash(out, node.as_bytes());
        }
        put_u32(out, self.parent_merkle_index);
        put_var_int(out, self.aux_merkle_branch.len() as u64);
        for node in &self.aux_merkle_branch {
            put_hash(out, node.as_bytes());
        }
        put_u32(out, self.aux_merkle_index);
        self.parent_header.serialize_into(out);
    }

    pub fn deserialize_from(r: &mut Reader) -> Result<AuxPow, BlockError> {
        let parent_coinbase = Transaction::deserialize_from(r, true)?;
        let parent_hash = Hash256(r.read_hash()?);

        let branch_len = r.read_var_int()?;
        let mut parent_merkle_branch = Vec::with_capacity(branch_len.min(64) as usize);
        for _ in 0..branch_len {
            parent_merkle_branch.push(Hash256(r.read_hash()?));
        }
        let parent_merkle_index = r.read_u32()?;

        let branch_len = r.read_var_int()?;
        let mut aux_merkle_branch = Vec::with_capacity(branch_len.min(64) as usize);
        for _ in 0..branch_len {
            aux_merkle_branch.push(Hash256(r.read_hash()?));
        }
        let aux_merkle_index = r.read_u32()?;

        let parent_header = BlockHeader::deserialize_from(r)?;
        Ok(AuxPow {
            parent_coinbase,
            parent_hash,
            parent_merkle_branch,
            parent_merkle_index,
            aux_merkle_branch,
            aux_merkle_index,
            parent_header,
        })
    }

    /// Verify the merged-mining proof for the aux block `aux_hash`.
    ///
    /// No partial acceptance: any violated condition rejects the proof.
    pub fn check(&self, aux_hash: &Hash256, params: &ChainParams) -> Result<(), BlockError> {
        // the parent coinbase must be the first leaf of its block
        if self.parent_merkle_index != 0 {
            return Err(BlockError::AuxPowInvalid("proof is not a generate"));
        }

        let parent_chain_id = version_chain_id(self.parent_header.version);
        if params.strict_chain_id && parent_chain_id == params.auxpow_chain_id {
            return Err(BlockError::AuxPowInvalid("parent carries our chain id"));
        }
        if self.aux_merkle_branch.len() > 30 {
            return Err(BlockError::AuxPowInvalid("aux merkle branch too deep"));
        }

        let chain_root =
            check_merkle_branch(aux_hash, &self.aux_merkle_branch, self.aux_merkle_index);
        // the root is embedded in the coinbase in reversed byte order
        let mut root_reversed = *chain_root.as_bytes();
        root_reversed.reverse();

        let coinbase_input = self
            .parent_coinbase
            .inputs
            .first()
            .ok_or(BlockError::AuxPowInvalid("parent coinbase has no input"))?;
        let script_sig = &coinbase_input.script_sig;

        let magic_at = find_subslice(script_sig, &MERGED_MINING_MAGIC)
            .ok_or(BlockError::AuxPowInvalid("merged-mining magic not found"))?;
        if magic_at > MAX_COINBASE_SCAN_OFFSET {
            return Err(BlockError::AuxPowInvalid(
                "merged-mining magic too late in coinbase",
            ));
        }
        if find_subslice(&script_sig[magic_at + 1..], &MERGED_MINING_MAGIC).is_some() {
            return Err(BlockError::AuxPowInvalid("multiple merged-mining magics"));
        }

        let payload = &script_sig[magic_at + 4..];
        if payload.len() < 32 + 8 {
            return Err(BlockError::AuxPowInvalid(
                "coinbase missing merkle size and nonce",
            ));
        }
        if payload[..32] != root_reversed {
            return Err(BlockError::AuxPowInvalid("aux merkle root mismatch"));
        }

        let merkle_size = u32::from_le_bytes([payload[32], payload[33], payload[34], payload[35]]);
        let merkle_nonce = u32::from_le_bytes([payload[36], payload[37], payload[38], payload[39]]);
        if u64::from(merkle_size) != 1u64 << self.aux_merkle_branch.len() {
            return Err(BlockError::AuxPowInvalid(
                "merkle size does not match branch depth",
            ));
        }

        let expected = expected_merkle_slot(
            merkle_nonce,
            params.auxpow_chain_id,
            self.aux_merkle_branch.len() as u32,
        );
        if expected != self.aux_merkle_index {
            return Err(BlockError::AuxPowInvalid("wrong aux merkle slot"));
        }

        Ok(())
    }
}

/// Fold a leaf up a merkle branch; `index` selects the side at each level.
pub fn check_merkle_branch(leaf: &Hash256, branch: &[Hash256], index: u32) -> Hash256 {
    let mut hash = *leaf;
    let mut index = index;
    for node in branch {
        let mut data = Vec::with_capacity(64);
        if index & 1 != 0 {
            data.extend_from_slice(node.as_bytes());
            data.extend_from_slice(hash.as_bytes());
        } else {
            data.extend_from_slice(hash.as_bytes());
            data.extend_from_slice(node.as_bytes());
        }
        hash = Hash256(sha256d(&data));
        index >>= 1;
    }
    hash
}

/// The merkle slot assigned to `chain_id` by the standard multiply-add mix.
fn expected_merkle_slot(nonce: u32, chain_id: u32, tree_height: u32) -> u32 {
    let mut rand = nonce;
    rand = rand.wrapping_mul(1103515245).wrapping_add(12345);
    rand = rand.wrapping_add(chain_id);
    rand = rand.wrapping_mul(1103515245).wrapping_add(12345);
    rand % (1u32 << tree_height)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Read a header and, when its version carries the AuxPoW bit, the proof
/// tail, which is verified against the header's own hash.
pub fn read_validated_header(
    r: &mut Reader,
    params: &ChainParams,
) -> Result<BlockHeader, BlockError> {
    let header = BlockHeader::deserialize_from(r)?;
    if header.has_auxpow() {
        let auxpow = AuxPow::deserialize_from(r)?;
        auxpow.check(&header.hash(), params)?;
    }
    Ok(header)
}
