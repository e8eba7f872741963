//! Append-only wallet file
//!
//! Same preamble as the headers database (magic, version, genesis hash),
//! followed by typed records. Every append is flushed and synced; a
//! truncated trailing record is dropped on load.

use kabosu_core::hash::Hash256;
use kabosu_core::serialize::{put_hash, put_u32, put_var_bytes, Reader};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

const FILE_MAGIC: [u8; 4] = [0xa8, 0xf0, 0x11, 0xc5];
const FILE_VERSION: u32 = 1;
const FILE_PREAMBLE_LEN: usize = 4 + 4 + 32;

const REC_TYPE_MASTERKEY: u8 = 0;
const REC_TYPE_PUBKEYCACHE: u8 = 1;
const REC_TYPE_TX: u8 = 2;

#[derive(Error, Debug)]
pub enum WalletDbError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("wallet file invalid: {0}")]
    FileFormatInvalid(&'static str),
}

/// One typed record of the wallet file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletRecord {
    /// Base58check extended private key.
    MasterKey { encoded: String },
    /// Watched key: its HASH160 plus the extended key string.
    PubkeyCache { hash160: [u8; 20], encoded: String },
    /// A relevant transaction with the height it confirmed at.
    Tx {
        height: u32,
        txid: Hash256,
        raw: Vec<u8>,
    },
}

impl WalletRecord {
    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        match self {
            WalletRecord::MasterKey { encoded } => {
                out.push(REC_TYPE_MASTERKEY);
                put_var_bytes(&mut out, encoded.as_bytes());
            }
            WalletRecord::PubkeyCache { hash160, encoded } => {
                out.push(REC_TYPE_PUBKEYCACHE);
                out.extend_from_slice(hash160);
                put_var_bytes(&mut out, encoded.as_bytes());
            }
            WalletRecord::Tx { height, txid, raw } => {
                out.push(REC_TYPE_TX);
                put_u32(&mut out, *height);
                put_hash(&mut out, txid.as_bytes());
                out.extend_from_slice(raw);
            }
        }
        out
    }
}

/// File handle plus the replay cursor used while loading.
pub struct WalletDb {
    file: File,
}

impl WalletDb {
    /// Open or create the wallet file; existing records are returned for
    /// the caller to replay into memory.
    pub fn open(path: &Path, genesis: Hash256) -> Result<(WalletDb, Vec<WalletRecord>), WalletDbError> {
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if !exists {
            file.write_all(&FILE_MAGIC)?;
            file.write_all(&FILE_VERSION.to_le_bytes())?;
            file.write_all(genesis.as_bytes())?;
            file.flush()?;
            file.sync_data()?;
            return Ok((WalletDb { file }, Vec::new()));
        }

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        if contents.len() < FILE_PREAMBLE_LEN {
            return Err(WalletDbError::FileFormatInvalid("preamble truncated"));
        }
        if contents[0..4] != FILE_MAGIC {
            return Err(WalletDbError::FileFormatInvalid("bad magic"));
        }
        let version = u32::from_le_bytes([contents[4], contents[5], contents[6], contents[7]]);
        if version > FILE_VERSION {
            return Err(WalletDbError::FileFormatInvalid("unsupported version"));
        }
        if contents[8..40] != genesis.0 {
            return Err(WalletDbError::FileFormatInvalid("different network"));
        }

        let mut records = Vec::new();
        let mut r = Reader::new(&contents[FILE_PREAMBLE_LEN..]);
        let mut good_len = FILE_PREAMBLE_LEN;
        while !r.is_empty() {
            match read_record(&mut r) {
                Ok(record) => {
                    records.push(record);
                    good_len = FILE_PREAMBLE_LEN + r.consumed();
                }
                Err(_) => {
                    log::warn!(
                        "wallet file carries {} undecodable trailing bytes, truncating",
                        contents.len() - good_len
                    );
                    file.set_len(good_len as u64)?;
                    break;
                }
            }
        }

        file.seek(SeekFrom::End(0))?;
        Ok((WalletDb { file }, records))
    }

    /// Append one record; flushed and synced before returning.
    pub fn append(&mut self, record: &WalletRecord) -> Result<(), WalletDbError> {
        self.file.write_all(&record.serialize())?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

fn read_record(r: &mut Reader) -> Result<WalletRecord, WalletDbError> {
    let bad = || WalletDbError::FileFormatInvalid("bad record");
    match r.read_u8().map_err(|_| bad())? {
        REC_TYPE_MASTERKEY => {
            let encoded = String::from_utf8(r.read_var_bytes().map_err(|_| bad())?)
                .map_err(|_| bad())?;
            Ok(WalletRecord::MasterKey { encoded })
        }
        REC_TYPE_PUBKEYCACHE => {
            let mut hash160 = [0u8; 20];
            hash160.copy_from_slice(r.read_bytes(20).map_err(|_| bad())?);
            let encoded = String::from_utf8(r.read_var_bytes().map_err(|_| bad())?)
                .map_err(|_| bad())?;
            Ok(WalletRecord::PubkeyCache { hash160, encoded })
        }
        REC_TYPE_TX => {
            let height = r.read_u32().map_err(|_| bad())?;
            let txid = Hash256(r.read_hash().map_err(|_| bad())?);
            let before = r.consumed();
            let tx = kabosu_core::tx::Transaction::deserialize_from(r, true)
                .map_err(|_| bad())?;
            // keep the raw bytes exactly as stored
            let raw = tx.serialize(true);
            debug_assert_eq!(raw.len(), r.consumed() - before);
            Ok(WalletRecord::Tx { height, txid, raw })
        }
        _ => Err(bad()),
    }
}
