//! Block-header database
//!
//! An in-memory index keyed by block hash (parents referenced by key, never
//! by pointer — the database is the sole owner of every node), optionally
//! backed by an append-only file. On-disk layout: the magic `A8 F0 11 C5`,
//! a little-endian format version, the chain's genesis hash, then a stream
//! of `(hash, height, 80-byte header)` records.

use kabosu_core::block::{BlockError, BlockHeader};
use kabosu_core::chainparams::ChainParams;
use kabosu_core::hash::Hash256;
use kabosu_core::serialize::{put_hash, put_u32, Reader};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

const FILE_MAGIC: [u8; 4] = [0xa8, 0xf0, 0x11, 0xc5];
const FILE_VERSION: u32 = 1;
const FILE_PREAMBLE_LEN: u64 = 4 + 4 + 32;
const RECORD_LEN: u64 = 32 + 4 + BlockHeader::SERIALIZED_LEN as u64;

/// Headers kept in memory above the pruning floor.
const MAX_HEADERS_IN_MEM: u32 = 144;

#[derive(Error, Debug)]
pub enum HeadersDbError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("headers file invalid: {0}")]
    FileFormatInvalid(&'static str),

    #[error("header does not link to a known block (prev {0})")]
    HeaderLinkageFailure(Hash256),

    #[error(transparent)]
    Block(#[from] BlockError),
}

/// One node of the header tree.
#[derive(Debug, Clone)]
pub struct BlockIndex {
    pub hash: Hash256,
    pub height: u32,
    /// Parent key; `None` at the chain bottom.
    pub prev: Option<Hash256>,
    pub header: BlockHeader,
}

/// The header index plus its optional file backing.
pub struct HeadersDb {
    params: &'static ChainParams,
    index: BTreeMap<Hash256, BlockIndex>,
    tip: Hash256,
    bottom: Hash256,
    file: Option<File>,
}

impl HeadersDb {
    /// In-memory database seeded with the chain's genesis entry.
    pub fn new(params: &'static ChainParams) -> HeadersDb {
        let genesis = params.genesis_block_hash();
        let mut index = BTreeMap::new();
        index.insert(
            genesis,
            BlockIndex {
                hash: genesis,
                height: 0,
                prev: None,
                header: BlockHeader::default(),
            },
        );
        HeadersDb {
            params,
            index,
            tip: genesis,
            bottom: genesis,
            file: None,
        }
    }

    /// Open (or create) the file-backed database and replay its records.
    pub fn open(params: &'static ChainParams, path: &Path) -> Result<HeadersDb, HeadersDbError> {
        let mut db = HeadersDb::new(params);
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if !exists {
            file.write_all(&FILE_MAGIC)?;
            file.write_all(&FILE_VERSION.to_le_bytes())?;
            file.write_all(db.params.genesis_block_hash().as_bytes())?;
            file.flush()?;
            file.sync_data()?;
            db.file = Some(file);
            return Ok(db);
        }

        let mut preamble = [0u8; FILE_PREAMBLE_LEN as usize];
        file.read_exact(&mut preamble)
            .map_err(|_| HeadersDbError::FileFormatInvalid("preamble truncated"))?;
        if preamble[0..4] != FILE_MAGIC {
            return Err(HeadersDbError::FileFormatInvalid("bad magic"));
        }
        let version = u32::from_le_bytes([preamble[4], preamble[5], preamble[6], preamble[7]]);
        if version > FILE_VERSION {
            return Err(HeadersDbError::FileFormatInvalid("unsupported version"));
        }
        if preamble[8..40] != db.params.genesis_block_hash().0 {
            return Err(HeadersDbError::FileFormatInvalid("different network"));
        }

        let file_len = file.metadata()?.len();
        let body_len = file_len - FILE_PREAMBLE_LEN;
        let whole_records = body_len / RECORD_LEN;
        if body_len % RECORD_LEN != 0 {
            // drop a trailing partial record left by a crashed writer
            log::warn!(
                "headers file carries {} trailing bytes, truncating",
                body_len % RECORD_LEN
            );
            file.set_len(FILE_PREAMBLE_LEN + whole_records * RECORD_LEN)?;
            file.seek(SeekFrom::Start(FILE_PREAMBLE_LEN))?;
        }

        let truncated = || HeadersDbError::FileFormatInvalid("record truncated");
        let mut connected = 0u64;
        let mut record = [0u8; RECORD_LEN as usize];
        for i in 0..whole_records {
            file.read_exact(&mut record)?;
            let mut r = Reader::new(&record);
            let hash = Hash256(r.read_hash().map_err(|_| truncated())?);
            let height = r.read_u32().map_err(|_| truncated())?;
            let header = BlockHeader::deserialize_from(&mut r)?;

            if i == 0 && !db.index.contains_key(&header.prev_block) {
                // a file bootstrapped from a checkpoint starts mid-chain;
                // accept its first record verbatim as the new root
                let index = BlockIndex {
                    hash: header.hash(),
                    height,
                    prev: None,
                    header,
                };
                db.tip = index.hash;
                db.bottom = index.hash;
                db.index.insert(index.hash, index);
                connected += 1;
            } else {
                match db.connect_inner(header, false) {
                    Ok(_) => connected += 1,
                    Err(err) => {
                        log::warn!("stored header {} failed to connect: {}", hash, err)
                    }
                }
            }
        }
        log::info!(
            "loaded {} headers, tip height {}",
            connected,
            db.chain_tip().height
        );

        file.seek(SeekFrom::End(0))?;
        db.file = Some(file);
        Ok(db)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndex> {
        self.index.get(hash)
    }

    pub fn chain_tip(&self) -> &BlockIndex {
        self.index.get(&self.tip).expect("tip is always indexed")
    }

    pub fn chain_bottom(&self) -> &BlockIndex {
        self.index.get(&self.bottom).expect("bottom is always indexed")
    }

    pub fn has_checkpoint_start(&self) -> bool {
        self.chain_bottom().height != 0
    }

    /// Restart the chain from a trusted checkpoint.
    pub fn set_checkpoint_start(&mut self, hash: Hash256, height: u32) {
        let index = BlockIndex {
            hash,
            height,
            prev: None,
            header: BlockHeader::default(),
        };
        self.index.insert(hash, index);
        self.tip = hash;
        self.bottom = hash;
    }

    /// Connect a header to the tip or to a known fork point.
    pub fn connect(&mut self, header: BlockHeader) -> Result<BlockIndex, HeadersDbError> {
        self.connect_inner(header, true)
    }

    fn connect_inner(
        &mut self,
        header: BlockHeader,
        persist: bool,
    ) -> Result<BlockIndex, HeadersDbError> {
        let hash = header.hash();
        let prev = header.prev_block;

        let parent = self
            .index
            .get(&prev)
            .ok_or(HeadersDbError::HeaderLinkageFailure(prev))?;
        let fork = parent.hash != self.tip;
        let index = BlockIndex {
            hash,
            height: parent.height + 1,
            prev: Some(parent.hash),
            header,
        };

        if index.height > self.chain_tip().height {
            if fork {
                log::info!("switching the active tip to a fork at {}", index.height);
            }
            self.tip = hash;
        } else if fork {
            log::debug!("stored header {} on a side branch", hash);
        }
        self.index.insert(hash, index.clone());

        if persist {
            if let Some(file) = self.file.as_mut() {
                let mut record = Vec::with_capacity(RECORD_LEN as usize);
                put_hash(&mut record, index.hash.as_bytes());
                put_u32(&mut record, index.height);
                index.header.serialize_into(&mut record);
                file.write_all(&record)?;
                file.flush()?;
                file.sync_data()?;
            }
        }

        self.prune();
        Ok(index)
    }

    /// Keep only the most recent headers in memory; older entries survive
    /// on disk. The chain bottom advances as ancestors are dropped.
    fn prune(&mut self) {
        let mut cursor = self.tip;
        for _ in 0..MAX_HEADERS_IN_MEM {
            match self.index.get(&cursor).and_then(|node| node.prev) {
                Some(prev) => cursor = prev,
                None => return,
            }
        }
        // cursor is the new bottom; everything below it goes
        let mut doomed = self.index.get(&cursor).and_then(|node| node.prev);
        if doomed.is_some() {
            if let Some(node) = self.index.get_mut(&cursor) {
                node.prev = None;
            }
            self.bottom = cursor;
        }
        while let Some(hash) = doomed {
            doomed = self.index.remove(&hash).and_then(|node| node.prev);
        }
    }

    /// Drop the active tip, falling back to its parent.
    pub fn disconnect_tip(&mut self) -> bool {
        let Some(prev) = self.chain_tip().prev else {
            return false;
        };
        self.index.remove(&self.tip);
        self.tip = prev;
        true
    }

    /// The last ten block hashes from the tip, for locator construction.
    pub fn fill_block_locator(&self) -> Vec<Hash256> {
        let mut locators = Vec::with_capacity(10);
        let mut node = self.chain_tip();
        if node.height == 0 {
            return locators;
        }
        for _ in 0..10 {
            locators.push(node.hash);
            match node.prev.and_then(|prev| self.index.get(&prev)) {
                Some(parent) => node = parent,
                None => break,
            }
        }
        locators
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kabosu_core::chainparams::MAINNET;

    /// A deterministic chain of headers on top of genesis. The headers are
    /// not proof-of-work valid, which the database does not check.
    fn build_chain(len: usize) -> Vec<BlockHeader> {
        let mut prev = MAINNET.genesis_block_hash();
        let mut headers = Vec::with_capacity(len);
        for i in 0..len {
            let header = BlockHeader {
                version: 0x620004,
                prev_block: prev,
                merkle_root: Hash256([i as u8; 32]),
                timestamp: 1_500_000_000 + i as u32 * 60,
                bits: 0x1e0ffff0,
                nonce: i as u32,
            };
            prev = header.hash();
            headers.push(header);
        }
        headers
    }

    #[test]
    fn test_connect_and_heights() {
        let mut db = HeadersDb::new(&MAINNET);
        for (i, header) in build_chain(32).iter().enumerate() {
            let index = db.connect(*header).unwrap();
            assert_eq!(index.height, i as u32 + 1);
        }
        assert_eq!(db.chain_tip().height, 32);

        // parent walk reaches each ancestor height
        let mut node = db.chain_tip().clone();
        for expected in (1..=32u32).rev() {
            assert_eq!(node.height, expected);
            match node.prev {
                Some(prev) => node = db.get(&prev).unwrap().clone(),
                None => break,
            }
        }
    }

    #[test]
    fn test_linkage_failure() {
        let mut db = HeadersDb::new(&MAINNET);
        let orphan = BlockHeader {
            prev_block: Hash256([0x77; 32]),
            ..BlockHeader::default()
        };
        assert!(matches!(
            db.connect(orphan),
            Err(HeadersDbError::HeaderLinkageFailure(_))
        ));
    }

    #[test]
    fn test_fork_switches_on_longer_branch() {
        let mut db = HeadersDb::new(&MAINNET);
        let chain = build_chain(3);
        for header in &chain {
            db.connect(*header).unwrap();
        }
        let tip_before = db.chain_tip().hash;

        // a competing header at height 3 does not displace the tip
        let rival = BlockHeader {
            nonce: 0xdead,
            ..chain[2]
        };
        db.connect(rival).unwrap();
        assert_eq!(db.chain_tip().hash, tip_before);

        // extending the rival branch wins
        let extend = BlockHeader {
            version: 0x620004,
            prev_block: rival.hash(),
            merkle_root: Hash256([0xcc; 32]),
            timestamp: 1_500_009_999,
            bits: 0x1e0ffff0,
            nonce: 1,
        };
        db.connect(extend).unwrap();
        assert_eq!(db.chain_tip().height, 4);
        assert_eq!(db.chain_tip().hash, extend.hash());
    }

    #[test]
    fn test_disconnect_tip() {
        let mut db = HeadersDb::new(&MAINNET);
        for header in build_chain(2) {
            db.connect(header).unwrap();
        }
        assert_eq!(db.chain_tip().height, 2);
        assert!(db.disconnect_tip());
        assert_eq!(db.chain_tip().height, 1);
        assert!(db.disconnect_tip());
        assert!(!db.disconnect_tip());
        assert_eq!(db.chain_tip().height, 0);
    }

    #[test]
    fn test_block_locator() {
        let mut db = HeadersDb::new(&MAINNET);
        assert!(db.fill_block_locator().is_empty());

        for header in build_chain(25) {
            db.connect(header).unwrap();
        }
        let locators = db.fill_block_locator();
        assert_eq!(locators.len(), 10);
        assert_eq!(locators[0], db.chain_tip().hash);
        for pair in locators.windows(2) {
            let a = db.get(&pair[0]).unwrap();
            let b = db.get(&pair[1]).unwrap();
            assert_eq!(a.height, b.height + 1);
        }
    }

    #[test]
    fn test_pruning_advances_bottom() {
        let mut db = HeadersDb::new(&MAINNET);
        for header in build_chain(MAX_HEADERS_IN_MEM as usize + 40) {
            db.connect(header).unwrap();
        }
        let tip_height = db.chain_tip().height;
        assert_eq!(tip_height, MAX_HEADERS_IN_MEM + 40);
        assert_eq!(db.chain_bottom().height, tip_height - MAX_HEADERS_IN_MEM);
        // pruned ancestors are gone from memory
        assert!(db.index.len() <= MAX_HEADERS_IN_MEM as usize + 2);
    }

    #[test]
    fn test_file_reload_after_2000_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headers.db");

        let chain = build_chain(2000);
        let tip_hash;
        {
            let mut db = HeadersDb::open(&MAINNET, &path).unwrap();
            for header in &chain {
                db.connect(*header).unwrap();
            }
            tip_hash = db.chain_tip().hash;
            assert_eq!(db.chain_tip().height, 2000);
        }

        // the tip hash is the hash field of the last appended record
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(
            contents.len() as u64,
            FILE_PREAMBLE_LEN + 2000 * RECORD_LEN
        );
        let last_record = &contents[contents.len() - RECORD_LEN as usize..];
        assert_eq!(last_record[..32], tip_hash.0);

        let db = HeadersDb::open(&MAINNET, &path).unwrap();
        assert_eq!(db.chain_tip().height, 2000);
        assert_eq!(db.chain_tip().hash, tip_hash);
    }

    #[test]
    fn test_file_truncates_partial_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headers.db");
        {
            let mut db = HeadersDb::open(&MAINNET, &path).unwrap();
            for header in build_chain(5) {
                db.connect(header).unwrap();
            }
        }
        // simulate a crash mid-record
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xab; 17]).unwrap();
        drop(file);

        let db = HeadersDb::open(&MAINNET, &path).unwrap();
        assert_eq!(db.chain_tip().height, 5);
    }

    #[test]
    fn test_file_rejects_wrong_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headers.db");
        HeadersDb::open(&MAINNET, &path).unwrap();
        assert!(matches!(
            HeadersDb::open(&kabosu_core::chainparams::TESTNET, &path),
            Err(HeadersDbError::FileFormatInvalid("different network"))
        ));
    }

    #[test]
    fn test_checkpoint_start() {
        let mut db = HeadersDb::new(&MAINNET);
        assert!(!db.has_checkpoint_start());
        let checkpoint = &MAINNET.checkpoints[1];
        db.set_checkpoint_start(checkpoint.block_hash(), checkpoint.height);
        assert!(db.has_checkpoint_start());
        assert_eq!(db.chain_tip().height, checkpoint.height);
    }
}
