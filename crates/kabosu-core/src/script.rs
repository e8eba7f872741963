//! Script parsing, classification and standard-template builders

use crate::crypto;
use thiserror::Error;

/// The opcodes this library needs to recognize or emit.
pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1: u8 = 0x51;
    pub const OP_16: u8 = 0x60;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_HASH256: u8 = 0xaa;
    pub const OP_CODESEPARATOR: u8 = 0xab;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
}

use opcodes::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script truncated")]
    ParseShort,

    #[error("push opcode claims more data than the script holds")]
    InvalidOpcode,

    #[error("multisig needs 1 <= required <= keys <= 16")]
    InvalidMultisig,

    #[error("data payload limited to {0} bytes")]
    DataTooLong(usize),
}

/// One parsed script element: a bare opcode or a data push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOp {
    Op(u8),
    Push(Vec<u8>),
}

/// The standard scriptPubKey templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    PubkeyHash,
    ScriptHash,
    Pubkey,
    Multisig,
    WitnessV0PubkeyHash,
    WitnessV0ScriptHash,
    NonStandard,
}

/// Parse a script into its opcode/push sequence.
pub fn get_ops(script: &[u8]) -> Result<Vec<ScriptOp>, ScriptError> {
    let mut ops = Vec::new();
    let mut pos = 0usize;
    while pos < script.len() {
        let opcode = script[pos];
        pos += 1;

        let data_len = if opcode > OP_0 && opcode < OP_PUSHDATA1 {
            opcode as usize
        } else if opcode == OP_PUSHDATA1 {
            let len = *script.get(pos).ok_or(ScriptError::ParseShort)? as usize;
            pos += 1;
            len
        } else if opcode == OP_PUSHDATA2 {
            let bytes = script.get(pos..pos + 2).ok_or(ScriptError::ParseShort)?;
            pos += 2;
            u16::from_le_bytes([bytes[0], bytes[1]]) as usize
        } else if opcode == OP_PUSHDATA4 {
            let bytes = script.get(pos..pos + 4).ok_or(ScriptError::ParseShort)?;
            pos += 4;
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        } else {
            ops.push(ScriptOp::Op(opcode));
            continue;
        };

        let data = script
            .get(pos..pos + data_len)
            .ok_or(ScriptError::InvalidOpcode)?;
        pos += data_len;
        ops.push(ScriptOp::Push(data.to_vec()));
    }
    Ok(ops)
}

fn is_op(op: &ScriptOp, opcode: u8) -> bool {
    matches!(op, ScriptOp::Op(o) if *o == opcode)
}

fn pubkey_len_for_header(header: u8) -> usize {
    match header {
        2 | 3 => 33,
        4 | 6 | 7 => 65,
        _ => 0,
    }
}

fn push_is_pubkey(op: &ScriptOp) -> bool {
    match op {
        ScriptOp::Push(data) => {
            (data.len() == 33 || data.len() == 65) && pubkey_len_for_header(data[0]) == data.len()
        }
        _ => false,
    }
}

fn push_is_hash160(op: &ScriptOp) -> bool {
    matches!(op, ScriptOp::Push(data) if data.len() == 20)
}

fn small_int(op: &ScriptOp) -> Option<u8> {
    match op {
        ScriptOp::Op(OP_0) => Some(0),
        ScriptOp::Op(o) if (OP_1..=OP_16).contains(o) => Some(o - OP_1 + 1),
        _ => None,
    }
}

fn push_data(op: &ScriptOp) -> &[u8] {
    match op {
        ScriptOp::Push(data) => data,
        ScriptOp::Op(_) => &[],
    }
}

fn is_pubkeyhash(ops: &[ScriptOp]) -> bool {
    ops.len() == 5
        && is_op(&ops[0], OP_DUP)
        && is_op(&ops[1], OP_HASH160)
        && push_is_hash160(&ops[2])
        && is_op(&ops[3], OP_EQUALVERIFY)
        && is_op(&ops[4], OP_CHECKSIG)
}

fn is_scripthash(ops: &[ScriptOp]) -> bool {
    ops.len() == 3
        && is_op(&ops[0], OP_HASH160)
        && push_is_hash160(&ops[1])
        && is_op(&ops[2], OP_EQUAL)
}

fn is_pubkey(ops: &[ScriptOp]) -> bool {
    ops.len() == 2 && push_is_pubkey(&ops[0]) && is_op(&ops[1], OP_CHECKSIG)
}

fn is_multisig(ops: &[ScriptOp]) -> bool {
    if ops.len() < 3 || ops.len() > 16 + 3 {
        return false;
    }
    let Some(required) = small_int(&ops[0]) else {
        return false;
    };
    let Some(total) = small_int(&ops[ops.len() - 2]) else {
        return false;
    };
    if !is_op(&ops[ops.len() - 1], OP_CHECKMULTISIG) {
        return false;
    }
    if required < 1 || total < required || total > 16 {
        return false;
    }
    let keys = &ops[1..ops.len() - 2];
    keys.len() == total as usize && keys.iter().all(push_is_pubkey)
}

/// A witness program: one version opcode followed by a 2–40 byte push.
fn witness_program(script: &[u8]) -> Option<(u8, &[u8])> {
    if script.len() < 4 || script.len() > 42 {
        return None;
    }
    let version = match script[0] {
        OP_0 => 0,
        op @ OP_1..=OP_16 => op - OP_1 + 1,
        _ => return None,
    };
    if script[1] as usize + 2 != script.len() {
        return None;
    }
    Some((version, &script[2..]))
}

/// Classify a scriptPubKey, optionally collecting the embedded hash,
/// public keys or witness program into `data_out`.
pub fn classify(script: &[u8], mut data_out: Option<&mut Vec<Vec<u8>>>) -> ScriptType {
    if let Some((0, program)) = witness_program(script) {
        let kind = match program.len() {
            20 => Some(ScriptType::WitnessV0PubkeyHash),
            32 => Some(ScriptType::WitnessV0ScriptHash),
            _ => None,
        };
        if let Some(kind) = kind {
            if let Some(out) = data_out.as_deref_mut() {
                out.push(program.to_vec());
            }
            return kind;
        }
    }

    let Ok(ops) = get_ops(script) else {
        return ScriptType::NonStandard;
    };

    if is_pubkeyhash(&ops) {
        if let Some(out) = data_out.as_deref_mut() {
            out.push(push_data(&ops[2]).to_vec());
        }
        return ScriptType::PubkeyHash;
    }
    if is_scripthash(&ops) {
        if let Some(out) = data_out.as_deref_mut() {
            out.push(push_data(&ops[1]).to_vec());
        }
        return ScriptType::ScriptHash;
    }
    if is_pubkey(&ops) {
        if let Some(out) = data_out.as_deref_mut() {
            out.push(push_data(&ops[0]).to_vec());
        }
        return ScriptType::Pubkey;
    }
    if is_multisig(&ops) {
        if let Some(out) = data_out.as_deref_mut() {
            for op in &ops[1..ops.len() - 2] {
                out.push(push_data(op).to_vec());
            }
        }
        return ScriptType::Multisig;
    }

    ScriptType::NonStandard
}

/// Append a data push in its shortest encoding.
pub fn append_pushdata(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
pub fn build_p2pkh(hash160: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    append_pushdata(&mut script, hash160);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// `OP_HASH160 <20> OP_EQUAL`
pub fn build_p2sh(hash160: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    append_pushdata(&mut script, hash160);
    script.push(OP_EQUAL);
    script
}

/// `OP_0 <20>`, the native segwit v0 key-hash program.
pub fn build_p2wpkh(hash160: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(22);
    script.push(OP_0);
    append_pushdata(&mut script, hash160);
    script
}

fn encode_op_n(n: u8) -> u8 {
    if n == 0 {
        OP_0
    } else {
        OP_1 + n - 1
    }
}

/// `OP_N <pub>... OP_M OP_CHECKMULTISIG`
pub fn build_multisig(required: u8, pubkeys: &[&[u8]]) -> Result<Vec<u8>, ScriptError> {
    if required < 1 || pubkeys.len() < required as usize || pubkeys.len() > 16 {
        return Err(ScriptError::InvalidMultisig);
    }
    let mut script = Vec::new();
    script.push(encode_op_n(required));
    for pubkey in pubkeys {
        append_pushdata(&mut script, pubkey);
    }
    script.push(encode_op_n(pubkeys.len() as u8));
    script.push(OP_CHECKMULTISIG);
    Ok(script)
}

/// HASH160 of the serialized script, for P2SH addresses.
pub fn script_hash160(script: &[u8]) -> [u8; 20] {
    crypto::hash160(script)
}

/// Re-emit a script with every OP_CODESEPARATOR removed, preserving push
/// bodies byte for byte.
pub fn copy_without_codeseparator(script: &[u8]) -> Result<Vec<u8>, ScriptError> {
    let mut out = Vec::with_capacity(script.len());
    let mut pos = 0usize;
    while pos < script.len() {
        let opcode = script[pos];
        pos += 1;

        if opcode == OP_CODESEPARATOR {
            continue;
        }

        let data_len = if opcode > OP_0 && opcode < OP_PUSHDATA1 {
            out.push(opcode);
            opcode as usize
        } else if opcode == OP_PUSHDATA1 {
            let len = *script.get(pos).ok_or(ScriptError::ParseShort)?;
            out.push(opcode);
            out.push(len);
            pos += 1;
            len as usize
        } else if opcode == OP_PUSHDATA2 {
            let bytes = script.get(pos..pos + 2).ok_or(ScriptError::ParseShort)?;
            out.push(opcode);
            out.extend_from_slice(bytes);
            pos += 2;
            u16::from_le_bytes([bytes[0], bytes[1]]) as usize
        } else if opcode == OP_PUSHDATA4 {
            let bytes = script.get(pos..pos + 4).ok_or(ScriptError::ParseShort)?;
            out.push(opcode);
            out.extend_from_slice(bytes);
            pos += 4;
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        } else {
            out.push(opcode);
            continue;
        };

        let data = script
            .get(pos..pos + data_len)
            .ok_or(ScriptError::InvalidOpcode)?;
        out.extend_from_slice(data);
        pos += data_len;
    }
    Ok(out)
}
