//! Transaction model, SIGHASH computation and input signing

use crate::chainparams::ChainParams;
use crate::crypto;
use crate::hash::Hash256;
use crate::keys::{decode_address, AddressPayload, KeyError, PrivateKey};
use crate::script::{self, ScriptError, ScriptType};
use crate::serialize::{
    put_hash, put_i32, put_i64, put_u32, put_u64, put_var_bytes, put_var_int, ReadError, Reader,
};
use thiserror::Error;

pub const SIGHASH_ALL: u8 = 0x01;
pub const SIGHASH_NONE: u8 = 0x02;
pub const SIGHASH_SINGLE: u8 = 0x03;
pub const SIGHASH_ANYONECANPAY: u8 = 0x80;
const SIGHASH_MASK: u8 = 0x1f;

pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// OP_RETURN payloads beyond this size are refused.
pub const MAX_DATA_CARRIER_BYTES: usize = 80;

/// The digest produced for SIGHASH_SINGLE with an out-of-range input index
/// (the historical one-hash quirk); signing refuses to sign it.
pub const SIGHASH_SINGLE_PLACEHOLDER: Hash256 = Hash256([
    1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0,
]);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("unknown transaction serialization flag {0:#04x}")]
    UnknownFlags(u8),

    #[error("input index {index} out of range ({len} inputs)")]
    InputIndexOutOfRange { index: usize, len: usize },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Address(#[from] KeyError),
}

/// Reference to a previous transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == u32::MAX
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// BIP-144 witness stack; parsed and round-tripped.
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn new(txid: Hash256, vout: u32) -> TxIn {
        TxIn {
            prevout: OutPoint { txid, vout },
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
            witness: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    /// Value in koinu; negative only inside SIGHASH_SINGLE blanking.
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub locktime: u32,
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            locktime: 0,
        }
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Coinbase: exactly one input spending the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn serialize(&self, allow_witness: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        put_i32(&mut out, self.version);

        let with_witness = allow_witness && self.has_witness();
        if with_witness {
            // BIP-144 marker + flags
            out.push(0x00);
            out.push(0x01);
        }

        put_var_int(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            put_hash(&mut out, input.prevout.txid.as_bytes());
            put_u32(&mut out, input.prevout.vout);
            put_var_bytes(&mut out, &input.script_sig);
            put_u32(&mut out, input.sequence);
        }

        put_var_int(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            put_i64(&mut out, output.value);
            put_var_bytes(&mut out, &output.script_pubkey);
        }

        if with_witness {
            for input in &self.inputs {
                put_var_int(&mut out, input.witness.len() as u64);
                for item in &input.witness {
                    put_var_bytes(&mut out, item);
                }
            }
        }

        put_u32(&mut out, self.locktime);
        out
    }

    /// Decode a transaction from the reader, consuming exactly its bytes.
    pub fn deserialize_from(r: &mut Reader, allow_witness: bool) -> Result<Transaction, TxError> {
        let version = r.read_i32()?;

        let mut vin_count = r.read_var_int()?;
        let mut flags = 0u8;
        if vin_count == 0 && allow_witness {
            // marker byte seen; the next byte carries the flags
            flags = r.read_u8()?;
            if flags != 0 {
                vin_count = r.read_var_int()?;
            }
        }

        let mut inputs = Vec::with_capacity(vin_count.min(1024) as usize);
        for _ in 0..vin_count {
            let txid = Hash256(r.read_hash()?);
            let vout = r.read_u32()?;
            let script_sig = r.read_var_bytes()?;
            let sequence = r.read_u32()?;
            inputs.push(TxIn {
                prevout: OutPoint { txid, vout },
                script_sig,
                sequence,
                witness: Vec::new(),
            });
        }

        let vout_count = r.read_var_int()?;
        let mut outputs = Vec::with_capacity(vout_count.min(1024) as usize);
        for _ in 0..vout_count {
            let value = r.read_i64()?;
            let script_pubkey = r.read_var_bytes()?;
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }

        if flags & 0x01 != 0 && allow_witness {
            flags ^= 0x01;
            for input in &mut inputs {
                let items = r.read_var_int()?;
                for _ in 0..items {
                    input.witness.push(r.read_var_bytes()?);
                }
            }
        }
        if flags != 0 {
            return Err(TxError::UnknownFlags(flags));
        }

        let locktime = r.read_u32()?;
        Ok(Transaction {
            version,
            inputs,
            outputs,
            locktime,
        })
    }

    pub fn deserialize(bytes: &[u8], allow_witness: bool) -> Result<Transaction, TxError> {
        let mut r = Reader::new(bytes);
        Transaction::deserialize_from(&mut r, allow_witness)
    }

    /// Double-SHA256 of the non-witness serialization.
    pub fn txid(&self) -> Hash256 {
        Hash256(crypto::sha256d(&self.serialize(false)))
    }

    pub fn add_p2pkh_output(&mut self, value: i64, hash160: &[u8; 20]) {
        self.outputs.push(TxOut {
            value,
            script_pubkey: script::build_p2pkh(hash160),
        });
    }

    pub fn add_p2sh_output(&mut self, value: i64, hash160: &[u8; 20]) {
        self.outputs.push(TxOut {
            value,
            script_pubkey: script::build_p2sh(hash160),
        });
    }

    /// Add an output paying a textual address (P2PKH, P2SH or P2WPKH).
    pub fn add_address_output(
        &mut self,
        chain: &ChainParams,
        value: i64,
        address: &str,
    ) -> Result<(), TxError> {
        match decode_address(address, chain)? {
            AddressPayload::PubkeyHash(hash) => self.add_p2pkh_output(value, &hash),
            AddressPayload::ScriptHash(hash) => self.add_p2sh_output(value, &hash),
            AddressPayload::WitnessV0(program) => {
                let mut script_pubkey = vec![0x00];
                script::append_pushdata(&mut script_pubkey, &program);
                self.outputs.push(TxOut {
                    value,
                    script_pubkey,
                });
            }
        }
        Ok(())
    }

    /// Add a hash-puzzle output: `OP_HASH256 <32-byte hash> OP_EQUAL`.
    pub fn add_puzzle_output(&mut self, value: i64, puzzle: &[u8; 32]) {
        let mut script_pubkey = vec![script::opcodes::OP_HASH256];
        script::append_pushdata(&mut script_pubkey, puzzle);
        script_pubkey.push(script::opcodes::OP_EQUAL);
        self.outputs.push(TxOut {
            value,
            script_pubkey,
        });
    }

    /// Add an OP_RETURN data output (payload limited to 80 bytes).
    pub fn add_data_output(&mut self, value: i64, data: &[u8]) -> Result<(), TxError> {
        if data.len() > MAX_DATA_CARRIER_BYTES {
            return Err(ScriptError::DataTooLong(MAX_DATA_CARRIER_BYTES).into());
        }
        let mut script_pubkey = vec![script::opcodes::OP_RETURN];
        script::append_pushdata(&mut script_pubkey, data);
        self.outputs.push(TxOut {
            value,
            script_pubkey,
        });
        Ok(())
    }

    fn prevouts_hash(&self) -> Hash256 {
        let mut buf = Vec::with_capacity(self.inputs.len() * 36);
        for input in &self.inputs {
            put_hash(&mut buf, input.prevout.txid.as_bytes());
            put_u32(&mut buf, input.prevout.vout);
        }
        Hash256(crypto::sha256d(&buf))
    }

    fn sequences_hash(&self) -> Hash256 {
        let mut buf = Vec::with_capacity(self.inputs.len() * 4);
        for input in &self.inputs {
            put_u32(&mut buf, input.sequence);
        }
        Hash256(crypto::sha256d(&buf))
    }

    fn outputs_hash(&self) -> Hash256 {
        let mut buf = Vec::new();
        for output in &self.outputs {
            put_i64(&mut buf, output.value);
            put_var_bytes(&mut buf, &output.script_pubkey);
        }
        Hash256(crypto::sha256d(&buf))
    }

    /// Legacy (pre-segwit) signature hash.
    ///
    /// For SIGHASH_SINGLE with an input index beyond the last output this
    /// returns [`SIGHASH_SINGLE_PLACEHOLDER`] — the historical behaviour —
    /// which the signer refuses to sign.
    pub fn legacy_sighash(
        &self,
        input_index: usize,
        script_code: &[u8],
        sighash_type: u8,
    ) -> Result<Hash256, TxError> {
        if input_index >= self.inputs.len() {
            return Err(TxError::InputIndexOutOfRange {
                index: input_index,
                len: self.inputs.len(),
            });
        }

        let cleaned = script::copy_without_codeseparator(script_code)?;
        let mut tx = self.clone();

        for (i, input) in tx.inputs.iter_mut().enumerate() {
            input.script_sig.clear();
            if i == input_index {
                input.script_sig = cleaned.clone();
            }
            input.witness.clear();
        }

        match sighash_type & SIGHASH_MASK {
            SIGHASH_NONE => {
                tx.outputs.clear();
                for (i, input) in tx.inputs.iter_mut().enumerate() {
                    if i != input_index {
                        input.sequence = 0;
                    }
                }
            }
            SIGHASH_SINGLE => {
                if input_index >= tx.outputs.len() {
                    return Ok(SIGHASH_SINGLE_PLACEHOLDER);
                }
                tx.outputs.truncate(input_index + 1);
                for output in tx.outputs.iter_mut().take(input_index) {
                    output.value = -1;
                    output.script_pubkey.clear();
                }
                for (i, input) in tx.inputs.iter_mut().enumerate() {
                    if i != input_index {
                        input.sequence = 0;
                    }
                }
            }
            _ => {}
        }

        if sighash_type & SIGHASH_ANYONECANPAY != 0 {
            let signed = tx.inputs[input_index].clone();
            tx.inputs = vec![signed];
        }

        let mut preimage = tx.serialize(false);
        put_i32(&mut preimage, i32::from(sighash_type));
        Ok(Hash256(crypto::sha256d(&preimage)))
    }

    /// BIP-143 (witness v0) signature hash.
    pub fn witness_v0_sighash(
        &self,
        input_index: usize,
        script_code: &[u8],
        amount: u64,
        sighash_type: u8,
    ) -> Result<Hash256, TxError> {
        if input_index >= self.inputs.len() {
            return Err(TxError::InputIndexOutOfRange {
                index: input_index,
                len: self.inputs.len(),
            });
        }

        let anyonecanpay = sighash_type & SIGHASH_ANYONECANPAY != 0;
        let mask = sighash_type & SIGHASH_MASK;

        let hash_prevouts = if anyonecanpay {
            Hash256::ZERO
        } else {
            self.prevouts_hash()
        };
        let hash_sequence = if anyonecanpay || mask == SIGHASH_SINGLE || mask == SIGHASH_NONE {
            Hash256::ZERO
        } else {
            self.sequences_hash()
        };
        let hash_outputs = if mask != SIGHASH_SINGLE && mask != SIGHASH_NONE {
            self.outputs_hash()
        } else if mask == SIGHASH_SINGLE && input_index < self.outputs.len() {
            let mut buf = Vec::new();
            put_i64(&mut buf, self.outputs[input_index].value);
            put_var_bytes(&mut buf, &self.outputs[input_index].script_pubkey);
            Hash256(crypto::sha256d(&buf))
        } else {
            Hash256::ZERO
        };

        let input = &self.inputs[input_index];
        let mut preimage = Vec::with_capacity(156 + script_code.len());
        put_i32(&mut preimage, self.version);
        put_hash(&mut preimage, hash_prevouts.as_bytes());
        put_hash(&mut preimage, hash_sequence.as_bytes());
        put_hash(&mut preimage, input.prevout.txid.as_bytes());
        put_u32(&mut preimage, input.prevout.vout);
        put_var_bytes(&mut preimage, script_code);
        put_u64(&mut preimage, amount);
        put_u32(&mut preimage, input.sequence);
        put_hash(&mut preimage, hash_outputs.as_bytes());
        put_u32(&mut preimage, self.locktime);
        put_i32(&mut preimage, i32::from(sighash_type));
        Ok(Hash256(crypto::sha256d(&preimage)))
    }
}

/// Non-fatal conditions from signing; the signature is produced either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutcome {
    /// Signature produced and applied.
    Ok,
    /// The key does not match the script's key hash; signed anyway.
    NoKeyMatch,
    /// Script not classifiable; signature returned but not applied.
    UnknownScriptType,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignError {
    #[error("missing transaction or empty script")]
    InvalidTxOrScript,

    #[error("input index out of range")]
    InputIndexOutOfRange,

    #[error("invalid private key")]
    InvalidKey,

    #[error("sighash computation failed")]
    SighashFailed,
}

/// A produced input signature.
#[derive(Debug, Clone)]
pub struct InputSignature {
    pub outcome: SignOutcome,
    /// 64-byte compact form.
    pub compact: [u8; 64],
    /// Normalized DER with the sighash byte appended.
    pub der_with_hashtype: Vec<u8>,
}

/// Sign `tx`'s input `input_index` spending a UTXO locked by
/// `script_pubkey` of `amount` koinu.
///
/// P2PKH populates the scriptSig; P2WPKH fills the witness stack; P2SH is
/// treated as P2SH-P2WPKH (redeem script placed in the scriptSig, signature
/// in the witness). Non-standard scripts yield a signature that is not
/// applied.
pub fn sign_input(
    tx: &mut Transaction,
    input_index: usize,
    script_pubkey: &[u8],
    amount: u64,
    privkey: &PrivateKey,
    sighash_type: u8,
) -> Result<InputSignature, SignError> {
    if script_pubkey.is_empty() {
        return Err(SignError::InvalidTxOrScript);
    }
    if input_index >= tx.inputs.len() {
        return Err(SignError::InputIndexOutOfRange);
    }
    let pubkey = privkey.public_key();
    let key_hash = pubkey.hash160();

    let mut pushes = Vec::new();
    let mut script_type = script::classify(script_pubkey, Some(&mut pushes));
    let mut script_sign = script_pubkey.to_vec();
    let mut witness_script_sig: Option<Vec<u8>> = None;
    let mut outcome = SignOutcome::Ok;

    if script_type == ScriptType::ScriptHash {
        // we cannot know the redeem script; assume P2SH-P2WPKH over our key
        script_type = ScriptType::WitnessV0PubkeyHash;
        pushes = vec![key_hash.to_vec()];

        let redeem = script::build_p2wpkh(&key_hash);
        let mut script_sig = Vec::with_capacity(redeem.len() + 1);
        script::append_pushdata(&mut script_sig, &redeem);
        witness_script_sig = Some(script_sig);
    }

    let sig_version = match script_type {
        ScriptType::PubkeyHash if pushes.len() == 1 => {
            if pushes[0] != key_hash {
                outcome = SignOutcome::NoKeyMatch;
            }
            SigVersion::Base
        }
        ScriptType::WitnessV0PubkeyHash if pushes.len() == 1 => {
            if pushes[0] != key_hash {
                outcome = SignOutcome::NoKeyMatch;
            }
            let mut program = [0u8; 20];
            program.copy_from_slice(&pushes[0]);
            // BIP-143 scriptCode is the canonical P2PKH over the program
            script_sign = script::build_p2pkh(&program);
            SigVersion::WitnessV0
        }
        _ => {
            outcome = SignOutcome::UnknownScriptType;
            SigVersion::Base
        }
    };

    let sighash = match sig_version {
        SigVersion::Base => tx.legacy_sighash(input_index, &script_sign, sighash_type),
        SigVersion::WitnessV0 => {
            tx.witness_v0_sighash(input_index, &script_sign, amount, sighash_type)
        }
    }
    .map_err(|_| SignError::SighashFailed)?;
    if sighash == SIGHASH_SINGLE_PLACEHOLDER {
        return Err(SignError::SighashFailed);
    }

    let compact = privkey
        .sign_hash(sighash.as_bytes())
        .map_err(|_| SignError::InvalidKey)?;
    let mut der_with_hashtype =
        crypto::compact_to_der(&compact).map_err(|_| SignError::InvalidKey)?;
    der_with_hashtype.push(sighash_type);

    let input = &mut tx.inputs[input_index];
    match script_type {
        ScriptType::PubkeyHash => {
            let mut script_sig = Vec::with_capacity(der_with_hashtype.len() + 35);
            script::append_pushdata(&mut script_sig, &der_with_hashtype);
            script::append_pushdata(&mut script_sig, pubkey.as_bytes());
            input.script_sig = script_sig;
        }
        ScriptType::WitnessV0PubkeyHash => {
            input.script_sig = witness_script_sig.unwrap_or_default();
            input.witness = vec![der_with_hashtype.clone(), pubkey.as_bytes().to_vec()];
        }
        _ => {
            // signature returned but never applied
        }
    }

    Ok(InputSignature {
        outcome,
        compact,
        der_with_hashtype,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SigVersion {
    Base,
    WitnessV0,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chainparams::MAINNET;
    use crate::keys::PrivateKey;

    fn sample_tx() -> Transaction {
        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::new(
            Hash256::from_display_hex(
                "b4749f017444b051c44dfd2720e88f314ff94f3dd6d56d40ef65854fcd7fff6b",
            )
            .unwrap(),
            0,
        ));
        tx.add_p2pkh_output(100_000_000, &[0x11; 20]);
        tx.add_p2pkh_output(4_900_000_000, &[0x22; 20]);
        tx
    }

    #[test]
    fn test_serialize_roundtrip() {
        let tx = sample_tx();
        let bytes = tx.serialize(true);
        let decoded = Transaction::deserialize(&bytes, true).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.serialize(true), bytes);
    }

    #[test]
    fn test_witness_roundtrip_and_txid_stability() {
        let mut tx = sample_tx();
        let txid_before = tx.txid();
        tx.inputs[0].witness = vec![vec![0xde, 0xad], vec![0xbe, 0xef]];

        let bytes = tx.serialize(true);
        // marker + flags
        assert_eq!(&bytes[4..6], &[0x00, 0x01]);
        let decoded = Transaction::deserialize(&bytes, true).unwrap();
        assert_eq!(decoded, tx);

        // the txid ignores witness data
        assert_eq!(decoded.txid(), txid_before);
    }

    #[test]
    fn test_deserialize_rejects_unknown_flags() {
        let mut tx = sample_tx();
        tx.inputs[0].witness = vec![vec![0xaa]];
        let mut bytes = tx.serialize(true);
        bytes[5] = 0x03; // unknown flag bit alongside the witness bit
        assert!(matches!(
            Transaction::deserialize(&bytes, true),
            Err(TxError::UnknownFlags(0x02))
        ));
    }

    #[test]
    fn test_deserialize_short_buffer() {
        let bytes = sample_tx().serialize(false);
        assert!(matches!(
            Transaction::deserialize(&bytes[..bytes.len() - 2], false),
            Err(TxError::Read(_))
        ));
    }

    #[test]
    fn test_coinbase_detection() {
        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::new(Hash256::ZERO, u32::MAX));
        assert!(tx.is_coinbase());
        tx.inputs[0].prevout.vout = 0;
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn test_sighash_single_out_of_range() {
        let mut tx = sample_tx();
        tx.inputs.push(TxIn::new(Hash256::ZERO, 1));
        tx.inputs.push(TxIn::new(Hash256::ZERO, 2));
        tx.outputs.truncate(1);

        let script = script::build_p2pkh(&[0x11; 20]);
        let hash = tx.legacy_sighash(2, &script, SIGHASH_SINGLE).unwrap();
        assert_eq!(hash, SIGHASH_SINGLE_PLACEHOLDER);
        assert_eq!(hash.as_bytes()[0], 1);
        assert!(hash.as_bytes()[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_sighash_input_index_out_of_range() {
        let tx = sample_tx();
        let script = script::build_p2pkh(&[0x11; 20]);
        assert!(matches!(
            tx.legacy_sighash(5, &script, SIGHASH_ALL),
            Err(TxError::InputIndexOutOfRange { index: 5, len: 1 })
        ));
    }

    #[test]
    fn test_sighash_variants_differ() {
        let mut tx = sample_tx();
        tx.inputs.push(TxIn::new(Hash256::ZERO, 7));
        let script = script::build_p2pkh(&[0x11; 20]);

        let all = tx.legacy_sighash(0, &script, SIGHASH_ALL).unwrap();
        let none = tx.legacy_sighash(0, &script, SIGHASH_NONE).unwrap();
        let single = tx.legacy_sighash(0, &script, SIGHASH_SINGLE).unwrap();
        let acp = tx
            .legacy_sighash(0, &script, SIGHASH_ALL | SIGHASH_ANYONECANPAY)
            .unwrap();
        let digests = [all, none, single, acp];
        for (i, a) in digests.iter().enumerate() {
            for b in digests.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_codeseparator_stripped_from_sighash() {
        let tx = sample_tx();
        let clean = script::build_p2pkh(&[0x11; 20]);
        let mut with_sep = vec![script::opcodes::OP_CODESEPARATOR];
        with_sep.extend_from_slice(&clean);

        assert_eq!(
            tx.legacy_sighash(0, &clean, SIGHASH_ALL).unwrap(),
            tx.legacy_sighash(0, &with_sep, SIGHASH_ALL).unwrap()
        );
    }

    #[test]
    fn test_sign_p2pkh_and_verify() {
        let key = PrivateKey::generate();
        let utxo_script = script::build_p2pkh(&key.public_key().hash160());

        let mut tx = sample_tx();
        let sig = sign_input(&mut tx, 0, &utxo_script, 500_000_000, &key, SIGHASH_ALL).unwrap();
        assert_eq!(sig.outcome, SignOutcome::Ok);

        // scriptSig shape: <der+hashtype> <33-byte pubkey>
        let script_sig = &tx.inputs[0].script_sig;
        let der_len = script_sig[0] as usize;
        assert!((70..=74).contains(&(der_len - 1)), "DER length {}", der_len);
        let pubkey_push_at = 1 + der_len;
        assert_eq!(script_sig[pubkey_push_at], 33);
        assert_eq!(
            &script_sig[pubkey_push_at + 1..],
            key.public_key().as_bytes()
        );
        assert_eq!(script_sig[der_len], SIGHASH_ALL);

        // re-verify against the recomputed digest
        let sighash = tx.legacy_sighash(0, &utxo_script, SIGHASH_ALL).unwrap();
        let der = &sig.der_with_hashtype[..sig.der_with_hashtype.len() - 1];
        assert!(key.public_key().verify_signature_der(sighash.as_bytes(), der));
    }

    #[test]
    fn test_sign_wrong_key_reports_no_match() {
        let key = PrivateKey::generate();
        let other = PrivateKey::generate();
        let utxo_script = script::build_p2pkh(&other.public_key().hash160());

        let mut tx = sample_tx();
        let sig = sign_input(&mut tx, 0, &utxo_script, 1, &key, SIGHASH_ALL).unwrap();
        assert_eq!(sig.outcome, SignOutcome::NoKeyMatch);
        // signed anyway
        assert!(!tx.inputs[0].script_sig.is_empty());
    }

    #[test]
    fn test_sign_p2wpkh_fills_witness() {
        let key = PrivateKey::generate();
        let utxo_script = script::build_p2wpkh(&key.public_key().hash160());

        let mut tx = sample_tx();
        let sig = sign_input(&mut tx, 0, &utxo_script, 12345, &key, SIGHASH_ALL).unwrap();
        assert_eq!(sig.outcome, SignOutcome::Ok);
        assert!(tx.inputs[0].script_sig.is_empty());
        assert_eq!(tx.inputs[0].witness.len(), 2);
        assert_eq!(tx.inputs[0].witness[1], key.public_key().as_bytes().to_vec());
    }

    #[test]
    fn test_sign_p2sh_assumes_wrapped_segwit() {
        let key = PrivateKey::generate();
        let redeem = script::build_p2wpkh(&key.public_key().hash160());
        let utxo_script = script::build_p2sh(&script::script_hash160(&redeem));

        let mut tx = sample_tx();
        let sig = sign_input(&mut tx, 0, &utxo_script, 999, &key, SIGHASH_ALL).unwrap();
        assert_eq!(sig.outcome, SignOutcome::Ok);
        // scriptSig carries the pushed redeem script
        assert_eq!(tx.inputs[0].script_sig[0], 22);
        assert_eq!(&tx.inputs[0].script_sig[1..], redeem.as_slice());
        assert_eq!(tx.inputs[0].witness.len(), 2);
    }

    #[test]
    fn test_sign_nonstandard_not_applied() {
        let key = PrivateKey::generate();
        let mut tx = sample_tx();
        let sig = sign_input(&mut tx, 0, &[script::opcodes::OP_RETURN], 0, &key, SIGHASH_ALL)
            .unwrap();
        assert_eq!(sig.outcome, SignOutcome::UnknownScriptType);
        assert!(tx.inputs[0].script_sig.is_empty());
        assert!(tx.inputs[0].witness.is_empty());
        assert!(!sig.der_with_hashtype.is_empty());
    }

    #[test]
    fn test_add_address_output() {
        let key = PrivateKey::generate();
        let addr = key.public_key().p2pkh_address(&MAINNET);
        let mut tx = Transaction::new();
        tx.add_address_output(&MAINNET, 42, &addr).unwrap();
        assert_eq!(
            script::classify(&tx.outputs[0].script_pubkey, None),
            ScriptType::PubkeyHash
        );

        let wit = key.public_key().p2wpkh_address(&MAINNET);
        tx.add_address_output(&MAINNET, 42, &wit).unwrap();
        assert_eq!(
            script::classify(&tx.outputs[1].script_pubkey, None),
            ScriptType::WitnessV0PubkeyHash
        );

        assert!(tx.add_address_output(&MAINNET, 42, "garbage").is_err());
    }

    #[test]
    fn test_add_data_output() {
        let mut tx = Transaction::new();
        tx.add_data_output(0, b"much data").unwrap();
        assert_eq!(tx.outputs[0].script_pubkey[0], script::opcodes::OP_RETURN);
        assert!(tx.add_data_output(0, &[0u8; 81]).is_err());
    }

    #[test]
    fn test_add_puzzle_output() {
        let mut tx = Transaction::new();
        tx.add_puzzle_output(10, &[0x44; 32]);
        let script_pubkey = &tx.outputs[0].script_pubkey;
        assert_eq!(script_pubkey[0], script::opcodes::OP_HASH256);
        assert_eq!(script_pubkey[1], 32);
        assert_eq!(*script_pubkey.last().unwrap(), script::opcodes::OP_EQUAL);
        assert_eq!(script_pubkey.len(), 35);
    }
}
