//! p2p wire messages
//!
//! Every message travels in a 24-byte envelope: netmagic, NUL-padded
//! command, payload length and the first four bytes of sha256d(payload).

use kabosu_core::crypto::sha256d;
use kabosu_core::hash::Hash256;
use kabosu_core::serialize::{
    put_u16, put_u32, put_u64, put_var_bytes, put_var_int, ReadError, Reader,
};
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 70015;
pub const NODE_NETWORK: u64 = 1;
pub const USER_AGENT: &str = "/kabosu:0.1.0/";

/// Envelope size on the wire.
pub const HEADER_LEN: usize = 24;

/// Upper bound accepted for a single payload.
pub const MAX_P2P_MSG_SIZE: u32 = 0x0200_0000;

/// Cap on headers per HEADERS message.
pub const MAX_HEADERS_RESULTS: usize = 2000;

pub const INV_TYPE_TX: u32 = 1;
pub const INV_TYPE_BLOCK: u32 = 2;

pub mod commands {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const GETHEADERS: &str = "getheaders";
    pub const GETBLOCKS: &str = "getblocks";
    pub const HEADERS: &str = "headers";
    pub const INV: &str = "inv";
    pub const GETDATA: &str = "getdata";
    pub const BLOCK: &str = "block";
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("message start bytes do not match the chain")]
    BadMagic,

    #[error("payload checksum mismatch for command {0}")]
    BadChecksum(String),

    #[error("malformed command field")]
    BadCommand,

    #[error("payload length {0} exceeds the p2p limit")]
    Oversized(u32),
}

/// Parsed 24-byte message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn parse(bytes: &[u8; HEADER_LEN], expected_magic: &[u8; 4]) -> Result<MessageHeader, MessageError> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if &magic != expected_magic {
            return Err(MessageError::BadMagic);
        }

        let raw_command = &bytes[4..16];
        let end = raw_command
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(raw_command.len());
        // NULs only as right padding, printable ASCII before them
        if raw_command[end..].iter().any(|b| *b != 0)
            || !raw_command[..end].iter().all(u8::is_ascii_graphic)
        {
            return Err(MessageError::BadCommand);
        }
        let command = String::from_utf8_lossy(&raw_command[..end]).into_owned();

        let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        if length > MAX_P2P_MSG_SIZE {
            return Err(MessageError::Oversized(length));
        }
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);
        Ok(MessageHeader {
            magic,
            command,
            length,
            checksum,
        })
    }

    pub fn checksum_matches(&self, payload: &[u8]) -> bool {
        sha256d(payload)[..4] == self.checksum
    }
}

/// Wrap a payload in the envelope for the given chain magic.
pub fn build_message(magic: &[u8; 4], command: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert!(command.len() <= 12);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(magic);
    let mut cmd = [0u8; 12];
    cmd[..command.len()].copy_from_slice(command.as_bytes());
    out.extend_from_slice(&cmd);
    put_u32(&mut out, payload.len() as u32);
    out.extend_from_slice(&sha256d(payload)[..4]);
    out.extend_from_slice(payload);
    out
}

/// The fields of a VERSION message this client consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
}

impl VersionMessage {
    pub fn new(start_height: i32, nonce: u64, timestamp: i64) -> VersionMessage {
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp,
            nonce,
            user_agent: USER_AGENT.to_string(),
            start_height,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(86 + self.user_agent.len());
        put_u32(&mut out, self.version);
        put_u64(&mut out, self.services);
        put_u64(&mut out, self.timestamp as u64);
        put_net_addr(&mut out, NODE_NETWORK);
        put_net_addr(&mut out, self.services);
        put_u64(&mut out, self.nonce);
        put_var_bytes(&mut out, self.user_agent.as_bytes());
        put_u32(&mut out, self.start_height as u32);
        out.push(0x01); // relay
        out
    }

    pub fn deserialize(payload: &[u8]) -> Result<VersionMessage, MessageError> {
        let mut r = Reader::new(payload);
        let version = r.read_u32()?;
        let services = r.read_u64()?;
        let timestamp = r.read_i64()?;
        r.skip(26)?; // addr_recv
        r.skip(26)?; // addr_from
        let nonce = r.read_u64()?;
        let user_agent = String::from_utf8_lossy(&r.read_var_bytes()?).into_owned();
        let start_height = r.read_i32()?;
        // the relay flag is optional for older peers
        Ok(VersionMessage {
            version,
            services,
            timestamp,
            nonce,
            user_agent,
            start_height,
        })
    }
}

fn put_net_addr(out: &mut Vec<u8>, services: u64) {
    put_u64(out, services);
    out.extend_from_slice(&[0u8; 16]); // unroutable placeholder address
    put_u16(out, 0u16.to_be());
}

/// GETHEADERS / GETBLOCKS share the same locator payload.
pub fn build_locator_payload(locators: &[Hash256], hash_stop: &Hash256) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 1 + locators.len() * 32 + 32);
    put_u32(&mut out, PROTOCOL_VERSION);
    put_var_int(&mut out, locators.len() as u64);
    for hash in locators {
        out.extend_from_slice(hash.as_bytes());
    }
    out.extend_from_slice(hash_stop.as_bytes());
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvItem {
    pub kind: u32,
    pub hash: Hash256,
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<InvItem>, MessageError> {
    let mut r = Reader::new(payload);
    let count = r.read_var_int()?;
    let mut items = Vec::with_capacity(count.min(50_000) as usize);
    for _ in 0..count {
        items.push(InvItem {
            kind: r.read_u32()?,
            hash: Hash256(r.read_hash()?),
        });
    }
    Ok(items)
}

pub fn build_inv(items: &[InvItem]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + items.len() * 36);
    put_var_int(&mut out, items.len() as u64);
    for item in items {
        put_u32(&mut out, item.kind);
        out.extend_from_slice(item.hash.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kabosu_core::chainparams::MAINNET;

    #[test]
    fn test_envelope_roundtrip() {
        let payload = b"wow";
        let wire = build_message(&MAINNET.netmagic, commands::PING, payload);
        assert_eq!(wire.len(), HEADER_LEN + 3);

        let mut hdr_bytes = [0u8; HEADER_LEN];
        hdr_bytes.copy_from_slice(&wire[..HEADER_LEN]);
        let header = MessageHeader::parse(&hdr_bytes, &MAINNET.netmagic).unwrap();
        assert_eq!(header.command, "ping");
        assert_eq!(header.length, 3);
        assert!(header.checksum_matches(payload));
        assert!(!header.checksum_matches(b"woof"));
    }

    #[test]
    fn test_envelope_rejects_wrong_magic() {
        let wire = build_message(&MAINNET.netmagic, commands::PING, b"");
        let mut hdr_bytes = [0u8; HEADER_LEN];
        hdr_bytes.copy_from_slice(&wire[..HEADER_LEN]);
        assert_eq!(
            MessageHeader::parse(&hdr_bytes, &[0xde, 0xad, 0xbe, 0xef]),
            Err(MessageError::BadMagic)
        );
    }

    #[test]
    fn test_envelope_rejects_embedded_nul_command() {
        let mut hdr_bytes = [0u8; HEADER_LEN];
        hdr_bytes[..4].copy_from_slice(&MAINNET.netmagic);
        hdr_bytes[4] = b'p';
        hdr_bytes[5] = 0;
        hdr_bytes[6] = b'g';
        assert_eq!(
            MessageHeader::parse(&hdr_bytes, &MAINNET.netmagic),
            Err(MessageError::BadCommand)
        );
    }

    #[test]
    fn test_version_roundtrip() {
        let msg = VersionMessage::new(5_100_000, 0x1122334455667788, 1_700_000_000);
        let decoded = VersionMessage::deserialize(&msg.serialize()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.user_agent, USER_AGENT);
    }

    #[test]
    fn test_inv_roundtrip() {
        let items = vec![
            InvItem {
                kind: INV_TYPE_BLOCK,
                hash: Hash256([0xaa; 32]),
            },
            InvItem {
                kind: INV_TYPE_TX,
                hash: Hash256([0xbb; 32]),
            },
        ];
        let decoded = parse_inv(&build_inv(&items)).unwrap();
        assert_eq!(decoded, items);
    }

    #[test]
    fn test_locator_payload_layout() {
        let locators = vec![Hash256([1; 32]), Hash256([2; 32])];
        let payload = build_locator_payload(&locators, &Hash256::ZERO);
        assert_eq!(payload.len(), 4 + 1 + 64 + 32);
        let mut r = Reader::new(&payload);
        assert_eq!(r.read_u32().unwrap(), PROTOCOL_VERSION);
        assert_eq!(r.read_var_int().unwrap(), 2);
    }
}
