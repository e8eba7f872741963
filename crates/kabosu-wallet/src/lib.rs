//! Kabosu Wallet
//!
//! Watch-only and spendable HD wallet state: a master key, the derived
//! child nodes indexed by their HASH160, relevant transactions with their
//! spent-outpoint set, and balance accounting with coinbase maturity. All
//! state survives restarts through an append-only record file.
//!
//! The wallet implements [`kabosu_spv::SpvHandler`], so it can be plugged
//! directly into the SPV client as the scan callback.

pub mod db;

use db::{WalletDb, WalletDbError, WalletRecord};
use kabosu_core::bip32::{Bip32Error, HdNode, HARDENED_CHILD};
use kabosu_core::chainparams::ChainParams;
use kabosu_core::crypto::base58check_decode;
use kabosu_core::hash::Hash256;
use kabosu_core::script::{self, ScriptType};
use kabosu_core::tx::{OutPoint, Transaction, TxOut};
use kabosu_spv::headersdb::BlockIndex;
use kabosu_spv::SpvHandler;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Coinbase outputs are spendable this many blocks after confirmation.
pub const COINBASE_MATURITY: u32 = 100;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error(transparent)]
    Db(#[from] WalletDbError),

    #[error(transparent)]
    Bip32(#[from] Bip32Error),

    #[error("wallet has no master key")]
    NoMasterKey,

    #[error("wallet file out of child indices")]
    ChildIndexExhausted,
}

/// An unspent output the wallet can see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unspent {
    pub outpoint: OutPoint,
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub from_coinbase: bool,
}

/// A transaction the wallet tracks, with its confirmation height.
#[derive(Debug, Clone)]
pub struct WalletTx {
    pub height: u32,
    pub txid: Hash256,
    pub tx: Transaction,
}

pub struct Wallet {
    chain: &'static ChainParams,
    db: WalletDb,
    master: Option<HdNode>,
    /// Watched nodes keyed by the HASH160 of their public key.
    nodes: BTreeMap<[u8; 20], HdNode>,
    txs: BTreeMap<Hash256, WalletTx>,
    spends: HashSet<OutPoint>,
    next_child_index: u32,
    best_block_height: u32,
}

impl Wallet {
    /// Open the wallet file, creating it when absent, and rebuild the
    /// in-memory state from its records.
    pub fn load_or_create(path: &Path, chain: &'static ChainParams) -> Result<Wallet, WalletError> {
        let (db, records) = WalletDb::open(path, chain.genesis_block_hash())?;
        let mut wallet = Wallet {
            chain,
            db,
            master: None,
            nodes: BTreeMap::new(),
            txs: BTreeMap::new(),
            spends: HashSet::new(),
            next_child_index: 0,
            best_block_height: 0,
        };

        for record in records {
            match record {
                WalletRecord::MasterKey { encoded } => {
                    match HdNode::deserialize(&encoded, chain) {
                        Ok(node) => wallet.master = Some(node),
                        Err(err) => log::warn!("stored master key unreadable: {}", err),
                    }
                }
                WalletRecord::PubkeyCache { hash160, encoded } => {
                    match HdNode::deserialize(&encoded, chain) {
                        Ok(node) => {
                            if node.child_num() + 1 > wallet.next_child_index {
                                wallet.next_child_index = node.child_num() + 1;
                            }
                            wallet.nodes.insert(hash160, node);
                        }
                        Err(err) => log::warn!("stored child key unreadable: {}", err),
                    }
                }
                WalletRecord::Tx { height, txid, raw } => {
                    match Transaction::deserialize(&raw, true) {
                        Ok(tx) => wallet.register_tx(WalletTx { height, txid, tx }),
                        Err(err) => log::warn!("stored transaction unreadable: {}", err),
                    }
                }
            }
        }

        log::info!(
            "wallet loaded: {} keys, {} transactions, next child index {}",
            wallet.nodes.len(),
            wallet.txs.len(),
            wallet.next_child_index
        );
        Ok(wallet)
    }

    /// Install (a copy of) the master key and persist it.
    pub fn set_master_key(&mut self, master: &HdNode) -> Result<(), WalletError> {
        if !master.has_private_key() {
            return Err(Bip32Error::NoPrivateKey.into());
        }
        self.master = Some(master.clone());
        let encoded = master.serialize_private(self.chain)?;
        self.persist(&WalletRecord::MasterKey { encoded });
        Ok(())
    }

    pub fn has_master_key(&self) -> bool {
        self.master.is_some()
    }

    /// Derive the next child (m/k), register it as watched and persist it.
    ///
    /// Indices that fail derivation are skipped, as the derivation scheme
    /// requires.
    pub fn next_address(&mut self) -> Result<String, WalletError> {
        let master = self.master.as_ref().ok_or(WalletError::NoMasterKey)?;

        let mut index = self.next_child_index;
        let node = loop {
            if index >= HARDENED_CHILD {
                return Err(WalletError::ChildIndexExhausted);
            }
            match master.derive_child(index) {
                Ok(node) => break node,
                Err(Bip32Error::WeakChild) => {
                    log::warn!("child index {} unusable, skipping", index);
                    index += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };
        self.next_child_index = index + 1;

        let hash160 = node.hash160();
        let address = node.p2pkh_address(self.chain);
        let encoded = node.serialize_private(self.chain)?;
        self.nodes.insert(hash160, node);
        self.persist(&WalletRecord::PubkeyCache { hash160, encoded });
        Ok(address)
    }

    /// Look up the HD node paying to a textual P2PKH address.
    pub fn find_node_by_address(&self, address: &str) -> Option<&HdNode> {
        let payload = base58check_decode(address).ok()?;
        if payload.len() != 21 || payload[0] != self.chain.b58_prefix_pubkey_address {
            return None;
        }
        let mut hash160 = [0u8; 20];
        hash160.copy_from_slice(&payload[1..]);
        self.nodes.get(&hash160)
    }

    pub fn has_key(&self, hash160: &[u8; 20]) -> bool {
        self.nodes.contains_key(hash160)
    }

    pub fn list_addresses(&self) -> Vec<String> {
        self.nodes
            .values()
            .map(|node| node.p2pkh_address(self.chain))
            .collect()
    }

    pub fn best_block_height(&self) -> u32 {
        self.best_block_height
    }

    pub fn set_best_block_height(&mut self, height: u32) {
        self.best_block_height = height;
    }

    fn output_is_mine(&self, output: &TxOut) -> bool {
        let mut pushes = Vec::new();
        if script::classify(&output.script_pubkey, Some(&mut pushes)) != ScriptType::PubkeyHash {
            return false;
        }
        pushes
            .first()
            .and_then(|push| <&[u8; 20]>::try_from(push.as_slice()).ok())
            .map(|hash| self.has_key(hash))
            .unwrap_or(false)
    }

    fn tx_is_mine(&self, tx: &Transaction) -> bool {
        tx.outputs.iter().any(|output| self.output_is_mine(output))
    }

    fn tx_is_from_me(&self, tx: &Transaction) -> bool {
        tx.inputs
            .iter()
            .any(|input| self.txs.contains_key(&input.prevout.txid))
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spends.contains(outpoint)
    }

    fn register_tx(&mut self, wtx: WalletTx) {
        if !wtx.tx.is_coinbase() {
            for input in &wtx.tx.inputs {
                self.spends.insert(input.prevout);
            }
        }
        self.txs.insert(wtx.txid, wtx);
    }

    /// Scan callback: record the transaction when it pays us or spends our
    /// outputs. Returns whether it was relevant.
    pub fn check_transaction(&mut self, tx: &Transaction, height: u32) -> bool {
        if !self.tx_is_mine(tx) && !self.tx_is_from_me(tx) {
            return false;
        }

        let txid = tx.txid();
        log::info!("relevant transaction {} at height {}", txid, height);
        let wtx = WalletTx {
            height,
            txid,
            tx: tx.clone(),
        };
        self.persist(&WalletRecord::Tx {
            height,
            txid,
            raw: wtx.tx.serialize(true),
        });
        self.register_tx(wtx);
        if height > self.best_block_height {
            self.best_block_height = height;
        }
        true
    }

    fn coinbase_immature(&self, wtx: &WalletTx) -> bool {
        wtx.tx.is_coinbase()
            && (self.best_block_height < COINBASE_MATURITY
                || wtx.height > self.best_block_height - COINBASE_MATURITY)
    }

    fn tx_credit(&self, wtx: &WalletTx) -> i64 {
        if self.coinbase_immature(wtx) {
            return 0;
        }
        let mut credit = 0i64;
        for (vout, output) in wtx.tx.outputs.iter().enumerate() {
            let outpoint = OutPoint {
                txid: wtx.txid,
                vout: vout as u32,
            };
            if !self.is_spent(&outpoint) && self.output_is_mine(output) {
                credit += output.value;
            }
        }
        credit
    }

    /// Sum of unspent watched outputs, excluding immature coinbase value.
    pub fn balance(&self) -> i64 {
        self.txs.values().map(|wtx| self.tx_credit(wtx)).sum()
    }

    pub fn list_unspent(&self) -> Vec<Unspent> {
        let mut unspent = Vec::new();
        for wtx in self.txs.values() {
            if self.coinbase_immature(wtx) {
                continue;
            }
            for (vout, output) in wtx.tx.outputs.iter().enumerate() {
                let outpoint = OutPoint {
                    txid: wtx.txid,
                    vout: vout as u32,
                };
                if !self.is_spent(&outpoint) && self.output_is_mine(output) {
                    unspent.push(Unspent {
                        outpoint,
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height: wtx.height,
                        from_coinbase: wtx.tx.is_coinbase(),
                    });
                }
            }
        }
        unspent
    }

    pub fn transactions(&self) -> impl Iterator<Item = &WalletTx> {
        self.txs.values()
    }

    /// Append a record; persistence failures are logged and in-memory
    /// state is kept, per the durability policy.
    fn persist(&mut self, record: &WalletRecord) {
        if let Err(err) = self.db.append(record) {
            log::error!("wallet append failed: {}", err);
        }
    }
}

impl SpvHandler for Wallet {
    fn header_connected(&mut self, index: &BlockIndex) {
        if index.height > self.best_block_height {
            self.best_block_height = index.height;
        }
    }

    fn sync_transaction(&mut self, tx: &Transaction, _index_in_block: usize, block: &BlockIndex) {
        self.check_transaction(tx, block.height);
    }

    fn sync_completed(&mut self) {
        log::info!("wallet sync completed, balance {}", self.balance());
    }
}
