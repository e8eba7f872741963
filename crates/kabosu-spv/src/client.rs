//! SPV synchronization state machine
//!
//! One cooperative orchestrator task owns every peer's write half, the
//! headers database and all handler callbacks; per-peer reader tasks only
//! frame bytes off their sockets and forward them over a channel. A one
//! second ticker is the only place timeouts are observed.

use crate::headersdb::{BlockIndex, HeadersDb, HeadersDbError};
use crate::message::{self, commands, InvItem, VersionMessage, MAX_HEADERS_RESULTS};
use crate::peer::{Peer, PeerEvent, PeerId, SyncRole, MISBEHAVE_INCREMENT, MISBEHAVE_THRESHOLD};
use kabosu_core::block::read_validated_header;
use kabosu_core::chainparams::ChainParams;
use kabosu_core::hash::Hash256;
use kabosu_core::serialize::Reader;
use kabosu_core::tx::Transaction;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;

/// Seconds a GETHEADERS may go unanswered before the peer is stalled.
const HEADERS_MAX_RESPONSE_TIME: u64 = 60;
/// Seconds between state checks.
const MIN_TIME_DELTA_FOR_STATE_CHECK: u64 = 5;
/// Blocks of slack deducted before the scan window.
const BLOCK_GAP_TO_DEDUCT_TO_START_SCAN_FROM: u64 = 5;
/// Nominal seconds per locator gap block.
const BLOCKS_DELTA_IN_S: u64 = 900;
/// Peers that must agree with our tip height before sync is complete.
const COMPLETED_WHEN_NUM_NODES_AT_SAME_HEIGHT: usize = 2;

#[derive(Error, Debug)]
pub enum SpvError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Db(#[from] HeadersDbError),
}

/// Consumer callbacks, all invoked from the orchestrator task.
pub trait SpvHandler {
    /// A header joined the active chain.
    fn header_connected(&mut self, _index: &BlockIndex) {}

    /// A HEADERS message finished processing; return `false` to suppress
    /// the follow-up batch request.
    fn header_message_processed(&mut self, _tip: &BlockIndex) -> bool {
        true
    }

    /// A transaction of a downloaded block, in block order.
    fn sync_transaction(&mut self, _tx: &Transaction, _index_in_block: usize, _block: &BlockIndex) {
    }

    /// Fired at most once per client lifetime.
    fn sync_completed(&mut self) {}

    /// Raw command dispatch, before the client's own handling.
    fn post_command(&mut self, _peer: PeerId, _command: &str, _payload: &[u8]) {}

    fn handshake_done(&mut self, _peer: PeerId) {}

    fn peer_connected(&mut self, _peer: PeerId) {}

    fn peer_disconnected(&mut self, _peer: PeerId) {}

    /// Per-peer tick; return `false` to skip the default timeout logic for
    /// this peer on this round.
    fn peer_timer(&mut self, _peer: PeerId, _now: u64) -> bool {
        true
    }
}

/// Handler that leaves every callback at its default.
pub struct NullHandler;

impl SpvHandler for NullHandler {}

pub struct SpvClient<H: SpvHandler> {
    params: &'static ChainParams,
    headers_db: HeadersDb,
    handler: H,

    peers: HashMap<PeerId, Peer>,
    next_peer_id: PeerId,
    candidates: VecDeque<SocketAddr>,
    connecting: usize,
    desired_connections: usize,

    /// Wall-clock moment before which history does not interest us.
    oldest_item_of_interest: u64,
    use_checkpoints: bool,
    header_sync_phase: bool,
    last_headers_request_time: u64,
    last_statecheck_time: u64,
    called_sync_completed: bool,
    quit_when_synced: bool,
    quit: bool,
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl<H: SpvHandler> SpvClient<H> {
    pub fn new(params: &'static ChainParams, headers_db: HeadersDb, handler: H) -> SpvClient<H> {
        SpvClient {
            params,
            headers_db,
            handler,
            peers: HashMap::new(),
            next_peer_id: 0,
            candidates: VecDeque::new(),
            connecting: 0,
            desired_connections: 8,
            oldest_item_of_interest: unix_time().saturating_sub(5 * 60),
            use_checkpoints: !params.checkpoints.is_empty(),
            header_sync_phase: true,
            last_headers_request_time: 0,
            last_statecheck_time: 0,
            called_sync_completed: false,
            quit_when_synced: false,
            quit: false,
        }
    }

    pub fn headers_db(&self) -> &HeadersDb {
        &self.headers_db
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_parts(self) -> (HeadersDb, H) {
        (self.headers_db, self.handler)
    }

    /// Only scan blocks newer than this unix time.
    pub fn set_oldest_item_of_interest(&mut self, timestamp: u64) {
        self.oldest_item_of_interest = timestamp;
    }

    pub fn set_quit_when_synced(&mut self, quit: bool) {
        self.quit_when_synced = quit;
    }

    pub fn set_desired_connections(&mut self, count: usize) {
        self.desired_connections = count;
    }

    /// Seed the candidate pool from a comma-separated `host[:port]` list,
    /// or from the chain's DNS seeds when `None`.
    pub async fn discover_peers(&mut self, ips: Option<&str>) {
        let port = self.params.default_port;
        match ips {
            Some(list) => {
                for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                    let target = if entry.contains(':') {
                        entry.to_string()
                    } else {
                        format!("{}:{}", entry, port)
                    };
                    let result = lookup_host(&target).await;
                    match result {
                        Ok(addrs) => self.candidates.extend(addrs),
                        Err(err) => log::warn!("cannot resolve {}: {}", target, err),
                    }
                }
            }
            None => {
                for seed in self.params.dns_seeds {
                    match lookup_host((*seed, port)).await {
                        Ok(addrs) => self.candidates.extend(addrs),
                        Err(err) => log::warn!("seed {} failed: {}", seed, err),
                    }
                }
            }
        }
        log::info!("discovered {} peer candidates", self.candidates.len());
    }

    /// Run the event loop until torn down after sync (when configured) or
    /// the process drops the client.
    pub async fn run(&mut self) -> Result<(), SpvError> {
        let (events_tx, mut events_rx) = mpsc::channel(64);
        self.connect_next_peers(&events_tx);

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.quit {
            tokio::select! {
                Some(event) = events_rx.recv() => {
                    self.handle_event(event, &events_tx).await?;
                }
                _ = ticker.tick() => {
                    self.on_timer(&events_tx).await?;
                }
            }
        }

        for peer in self.peers.values() {
            peer.shutdown();
        }
        self.peers.clear();
        Ok(())
    }

    fn connected_handshaken_count(&self) -> usize {
        self.peers.values().filter(|p| p.version_handshake).count()
    }

    fn connect_next_peers(&mut self, events: &mpsc::Sender<PeerEvent>) {
        while self.peers.len() + self.connecting < self.desired_connections {
            let Some(addr) = self.candidates.pop_front() else {
                break;
            };
            self.connecting += 1;
            let events = events.clone();
            tokio::spawn(async move {
                let event = match TcpStream::connect(addr).await {
                    Ok(stream) => PeerEvent::Connected { addr, stream },
                    Err(_) => PeerEvent::ConnectFailed { addr },
                };
                let _ = events.send(event).await;
            });
        }
    }

    async fn handle_event(
        &mut self,
        event: PeerEvent,
        events: &mpsc::Sender<PeerEvent>,
    ) -> Result<(), SpvError> {
        match event {
            PeerEvent::Connected { addr, stream } => {
                self.connecting = self.connecting.saturating_sub(1);
                self.add_peer(addr, stream, events).await;
            }
            PeerEvent::ConnectFailed { addr } => {
                self.connecting = self.connecting.saturating_sub(1);
                log::debug!("connect to {} failed", addr);
            }
            PeerEvent::Message {
                peer,
                command,
                payload,
            } => {
                if self.peers.contains_key(&peer) {
                    self.handler.post_command(peer, &command, &payload);
                    self.dispatch(peer, &command, &payload).await?;
                }
            }
            PeerEvent::Disconnected { peer } => {
                if self.remove_peer(peer) {
                    self.request_headers().await?;
                }
            }
        }
        Ok(())
    }

    async fn add_peer(
        &mut self,
        addr: SocketAddr,
        stream: TcpStream,
        events: &mpsc::Sender<PeerEvent>,
    ) {
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        let mut peer = Peer::start(id, addr, stream, self.params.netmagic, events.clone());

        let version = VersionMessage::new(
            self.headers_db.chain_tip().height as i32,
            rand::thread_rng().gen(),
            unix_time() as i64,
        );
        if peer.send(commands::VERSION, &version.serialize()).await.is_err() {
            peer.shutdown();
            return;
        }
        log::info!("peer {} connected ({})", id, addr);
        self.peers.insert(id, peer);
        self.handler.peer_connected(id);
    }

    /// Returns true when the dropped peer was carrying a sync role.
    fn remove_peer(&mut self, id: PeerId) -> bool {
        let Some(peer) = self.peers.remove(&id) else {
            return false;
        };
        peer.shutdown();
        let had_role = peer.role != SyncRole::None;
        if peer.role == SyncRole::Headers {
            self.last_headers_request_time = 0;
        }
        log::info!("peer {} disconnected ({})", id, peer.addr);
        self.handler.peer_disconnected(id);
        had_role
    }

    fn misbehave(&mut self, id: PeerId) -> bool {
        let Some(peer) = self.peers.get_mut(&id) else {
            return false;
        };
        peer.misbehave_score += MISBEHAVE_INCREMENT;
        log::warn!("peer {} misbehaving, score {}", id, peer.misbehave_score);
        if peer.misbehave_score >= MISBEHAVE_THRESHOLD {
            self.remove_peer(id);
            return true;
        }
        false
    }

    async fn dispatch(
        &mut self,
        peer: PeerId,
        command: &str,
        payload: &[u8],
    ) -> Result<(), SpvError> {
        match command {
            commands::VERSION => self.on_version(peer, payload).await,
            commands::VERACK => self.on_verack(peer).await,
            commands::PING => self.on_ping(peer, payload).await,
            commands::INV => self.on_inv(peer, payload).await,
            commands::HEADERS => self.on_headers(peer, payload).await,
            commands::BLOCK => self.on_block(peer, payload).await,
            _ => {
                log::debug!("peer {}: ignoring {}", peer, command);
                Ok(())
            }
        }
    }

    async fn on_version(&mut self, id: PeerId, payload: &[u8]) -> Result<(), SpvError> {
        let Ok(version) = VersionMessage::deserialize(payload) else {
            self.misbehave(id);
            return Ok(());
        };
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.best_known_height = version.start_height.max(0) as u32;
            log::debug!(
                "peer {} is {} at height {}",
                id,
                version.user_agent,
                version.start_height
            );
            let _ = peer.send(commands::VERACK, &[]).await;
        }
        Ok(())
    }

    async fn on_verack(&mut self, id: PeerId) -> Result<(), SpvError> {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.version_handshake = true;
        }
        self.handler.handshake_done(id);
        self.request_headers().await
    }

    async fn on_ping(&mut self, id: PeerId, payload: &[u8]) -> Result<(), SpvError> {
        if let Some(peer) = self.peers.get_mut(&id) {
            let _ = peer.send(commands::PONG, payload).await;
        }
        Ok(())
    }

    /// Blanket sync driver, mirroring the per-state transitions:
    /// one peer at a time runs header sync; once headers reach the window
    /// of interest, a peer is flipped to block download.
    async fn request_headers(&mut self) -> Result<(), SpvError> {
        // only one peer may hold a sync role at a time
        if self
            .peers
            .values()
            .any(|p| p.role != SyncRole::None && p.version_handshake)
        {
            return Ok(());
        }

        let tip_height = self.headers_db.chain_tip().height;
        let tip_timestamp = u64::from(self.headers_db.chain_tip().header.timestamp);
        let window = self
            .oldest_item_of_interest
            .saturating_sub(BLOCK_GAP_TO_DEDUCT_TO_START_SCAN_FROM * BLOCKS_DELTA_IN_S);

        let mut nodes_at_same_height = 0usize;

        if tip_timestamp < window {
            let candidates: Vec<PeerId> = self
                .peers
                .values()
                .filter(|p| p.version_handshake)
                .map(|p| p.id)
                .collect();
            for id in candidates {
                let best = self.peers[&id].best_known_height;
                if best > tip_height {
                    self.send_locator_request(id, SyncRole::Headers).await;
                    return Ok(());
                } else if best == tip_height {
                    nodes_at_same_height += 1;
                }
            }
        }

        if self.connected_handshaken_count() > 0 {
            let candidates: Vec<PeerId> = self
                .peers
                .values()
                .filter(|p| p.version_handshake)
                .map(|p| p.id)
                .collect();
            for id in candidates {
                let best = self.peers[&id].best_known_height;
                if best > tip_height {
                    self.send_locator_request(id, SyncRole::Blocks).await;
                    return Ok(());
                } else if best == tip_height {
                    nodes_at_same_height += 1;
                }
            }
        }

        if nodes_at_same_height >= COMPLETED_WHEN_NUM_NODES_AT_SAME_HEIGHT {
            self.complete_sync();
        }
        Ok(())
    }

    /// Send GETHEADERS or GETBLOCKS with the current locator and mark the
    /// peer with the matching role.
    async fn send_locator_request(&mut self, id: PeerId, role: SyncRole) {
        let locators = self.build_block_locator();
        let payload = message::build_locator_payload(&locators, &Hash256::ZERO);
        let now = unix_time();
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        let command = match role {
            SyncRole::Blocks => commands::GETBLOCKS,
            _ => commands::GETHEADERS,
        };
        if peer.send(command, &payload).await.is_err() {
            self.remove_peer(id);
            return;
        }
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.role = role;
        match role {
            SyncRole::Blocks => peer.time_last_request = now,
            _ => self.last_headers_request_time = now,
        }
        log::debug!("sent {} to peer {}", command, id);
    }

    /// Build the locator: checkpoints bound the first request when the tip
    /// is still at genesis, otherwise the last blocks from the tip.
    fn build_block_locator(&mut self) -> Vec<Hash256> {
        if self.headers_db.chain_tip().height != 0 {
            return self.headers_db.fill_block_locator();
        }

        let window = self
            .oldest_item_of_interest
            .saturating_sub(BLOCK_GAP_TO_DEDUCT_TO_START_SCAN_FROM * BLOCKS_DELTA_IN_S);
        let mut locators = Vec::new();
        if self.use_checkpoints && window > 0 {
            for checkpoint in self.params.checkpoints.iter().rev() {
                if u64::from(checkpoint.timestamp) < window {
                    locators.push(checkpoint.block_hash());
                    if !self.headers_db.has_checkpoint_start() && checkpoint.height > 0 {
                        self.headers_db
                            .set_checkpoint_start(checkpoint.block_hash(), checkpoint.height);
                    }
                }
            }
            if !locators.is_empty() {
                return locators;
            }
        }
        vec![self.params.genesis_block_hash()]
    }

    async fn on_headers(&mut self, id: PeerId, payload: &[u8]) -> Result<(), SpvError> {
        let mut r = Reader::new(payload);
        let Ok(count) = r.read_var_int() else {
            self.misbehave(id);
            return Ok(());
        };
        log::debug!("peer {} sent {} headers", id, count);
        self.last_headers_request_time = 0;

        let mut connected_headers = 0u64;
        let mut switched_to_blocks = false;
        for _ in 0..count {
            let header = match read_validated_header(&mut r, self.params) {
                Ok(header) => header,
                Err(err) => {
                    log::warn!("peer {}: header parse failed: {}", id, err);
                    self.clear_role(id);
                    self.misbehave(id);
                    self.request_headers().await?;
                    return Ok(());
                }
            };
            if r.read_var_int().is_err() {
                self.clear_role(id);
                self.misbehave(id);
                self.request_headers().await?;
                return Ok(());
            }

            match self.headers_db.connect(header) {
                Ok(index) => {
                    self.handler.header_connected(&index);
                    connected_headers += 1;

                    let window = self
                        .oldest_item_of_interest
                        .saturating_sub(BLOCK_GAP_TO_DEDUCT_TO_START_SCAN_FROM * BLOCKS_DELTA_IN_S);
                    if u64::from(index.header.timestamp) > window {
                        // headers reached the scan window: download blocks
                        self.header_sync_phase = false;
                        self.clear_role(id);
                        log::info!(
                            "header sync reached the window of interest at height {}",
                            index.height
                        );
                        self.send_locator_request(id, SyncRole::Blocks).await;
                        switched_to_blocks = true;
                        break;
                    }
                }
                Err(err) => {
                    log::warn!("peer {}: header not in sequence: {}", id, err);
                    self.clear_role(id);
                    self.misbehave(id);
                    self.request_headers().await?;
                    return Ok(());
                }
            }
        }

        let tip = self.headers_db.chain_tip().clone();
        log::debug!(
            "connected {} headers, tip at height {}",
            connected_headers,
            tip.height
        );
        if !self.handler.header_message_processed(&tip) {
            return Ok(());
        }

        if count as usize == MAX_HEADERS_RESULTS && !switched_to_blocks {
            // a full batch means more are very likely waiting
            self.clear_role(id);
            self.send_locator_request(id, SyncRole::Headers).await;
        }
        Ok(())
    }

    async fn on_inv(&mut self, id: PeerId, payload: &[u8]) -> Result<(), SpvError> {
        let in_block_sync = self
            .peers
            .get(&id)
            .map(|p| p.role == SyncRole::Blocks)
            .unwrap_or(false);
        if !in_block_sync {
            return Ok(());
        }

        let Ok(items) = message::parse_inv(payload) else {
            self.misbehave(id);
            return Ok(());
        };
        let blocks: Vec<&InvItem> = items
            .iter()
            .filter(|item| item.kind == message::INV_TYPE_BLOCK)
            .collect();
        log::debug!(
            "peer {} announced {} items ({} blocks)",
            id,
            items.len(),
            blocks.len()
        );
        if blocks.is_empty() {
            return Ok(());
        }

        let last_block = blocks.last().map(|item| item.hash);
        let now = unix_time();
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.last_requested_inv = last_block;
            peer.time_last_request = now;
            // echo the announcement back as the data request
            let _ = peer.send(commands::GETDATA, payload).await;
        }
        Ok(())
    }

    async fn on_block(&mut self, id: PeerId, payload: &[u8]) -> Result<(), SpvError> {
        let mut r = Reader::new(payload);
        let header = match read_validated_header(&mut r, self.params) {
            Ok(header) => header,
            Err(err) => {
                log::warn!("peer {}: block header parse failed: {}", id, err);
                self.misbehave(id);
                return Ok(());
            }
        };
        let block_hash = header.hash();

        match self.headers_db.connect(header) {
            Ok(index) => {
                let Ok(tx_count) = r.read_var_int() else {
                    self.misbehave(id);
                    return Ok(());
                };

                let now = unix_time();
                if let Some(peer) = self.peers.get_mut(&id) {
                    // near the tip, stop treating slow announcements as stalls
                    peer.time_last_request =
                        if u64::from(index.header.timestamp) > now.saturating_sub(30 * 60) {
                            0
                        } else {
                            now
                        };
                }

                self.handler.header_connected(&index);
                log::debug!(
                    "block {} at height {} carries {} transactions",
                    index.hash,
                    index.height,
                    tx_count
                );
                for i in 0..tx_count {
                    match Transaction::deserialize_from(&mut r, true) {
                        Ok(tx) => self.handler.sync_transaction(&tx, i as usize, &index),
                        Err(err) => {
                            log::warn!("peer {}: transaction {} undecodable: {}", id, i, err);
                            self.misbehave(id);
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                log::warn!("could not connect block {}: {}", block_hash, err);
            }
        }

        let last_requested = self.peers.get(&id).and_then(|p| p.last_requested_inv);
        if last_requested == Some(block_hash) {
            // the final announced block arrived
            self.complete_sync();
        }
        Ok(())
    }

    fn clear_role(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            if peer.role == SyncRole::Headers {
                self.last_headers_request_time = 0;
            }
            peer.role = SyncRole::None;
        }
    }

    fn complete_sync(&mut self) {
        if !self.called_sync_completed {
            log::info!("sync completed at height {}", self.headers_db.chain_tip().height);
            self.handler.sync_completed();
            self.called_sync_completed = true;
        }
        if self.quit_when_synced {
            self.quit = true;
        }
    }

    async fn on_timer(&mut self, events: &mpsc::Sender<PeerEvent>) -> Result<(), SpvError> {
        let now = unix_time();
        self.connect_next_peers(events);
        if self.last_statecheck_time + MIN_TIME_DELTA_FOR_STATE_CHECK < now {
            self.periodic_statecheck(now).await?;
        }
        Ok(())
    }

    /// Stall detection and sync driving, every five seconds.
    async fn periodic_statecheck(&mut self, now: u64) -> Result<(), SpvError> {
        log::debug!(
            "statecheck: {} connected peers",
            self.connected_handshaken_count()
        );

        let peer_ids: Vec<PeerId> = self.peers.keys().copied().collect();
        let consented: Vec<PeerId> = peer_ids
            .into_iter()
            .filter(|id| self.handler.peer_timer(*id, now))
            .collect();

        // headers request outstanding for too long? At most one peer holds
        // the role, checked once per round so the replacement request is
        // not measured against the stale timestamp.
        if self.last_headers_request_time > 0
            && now.saturating_sub(self.last_headers_request_time) > HEADERS_MAX_RESPONSE_TIME
        {
            let stalled = self
                .peers
                .values()
                .find(|p| p.role == SyncRole::Headers && consented.contains(&p.id))
                .map(|p| p.id);
            if let Some(id) = stalled {
                log::warn!("no header response in time from peer {}", id);
                self.remove_peer(id);
                self.last_headers_request_time = 0;
                self.request_headers().await?;
            }
        }

        // block download outstanding for too long?
        for id in consented {
            let stalled_block = self
                .peers
                .get(&id)
                .map(|p| {
                    p.time_last_request > 0
                        && now.saturating_sub(p.time_last_request) > HEADERS_MAX_RESPONSE_TIME
                })
                .unwrap_or(false);
            if stalled_block {
                log::warn!("no block response in time from peer {}", id);
                self.remove_peer(id);
                self.request_headers().await?;
            }
        }

        if self.header_sync_phase {
            self.request_headers().await?;
        }
        self.last_statecheck_time = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{build_message, MessageHeader, HEADER_LEN};
    use kabosu_core::block::BlockHeader;
    use kabosu_core::chainparams::MAINNET;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Default, Clone)]
    struct Recorder {
        headers: Arc<Mutex<u32>>,
        txs: Arc<Mutex<usize>>,
        completed: Arc<Mutex<bool>>,
    }

    impl SpvHandler for Recorder {
        fn header_connected(&mut self, _index: &BlockIndex) {
            *self.headers.lock().unwrap() += 1;
        }
        fn sync_transaction(
            &mut self,
            _tx: &Transaction,
            _index_in_block: usize,
            _block: &BlockIndex,
        ) {
            *self.txs.lock().unwrap() += 1;
        }
        fn sync_completed(&mut self) {
            *self.completed.lock().unwrap() = true;
        }
    }

    fn test_chain(len: usize, timestamp_base: u32) -> Vec<BlockHeader> {
        let mut prev = MAINNET.genesis_block_hash();
        let mut headers = Vec::with_capacity(len);
        for i in 0..len {
            let header = BlockHeader {
                version: 0x620004,
                prev_block: prev,
                merkle_root: Hash256([i as u8; 32]),
                timestamp: timestamp_base + i as u32 * 60,
                bits: 0x1e0ffff0,
                nonce: i as u32,
            };
            prev = header.hash();
            headers.push(header);
        }
        headers
    }

    /// Accept one inbound connection and hand back the server-side socket.
    async fn connected_client_and_socket(
        client: &mut SpvClient<Recorder>,
        events: &mpsc::Sender<PeerEvent>,
    ) -> (PeerId, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let outbound = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let id = client.next_peer_id;
        client.add_peer(addr, outbound, events).await;
        (id, server_side)
    }

    async fn read_server_message(socket: &mut TcpStream) -> (String, Vec<u8>) {
        let mut header_bytes = [0u8; HEADER_LEN];
        socket.read_exact(&mut header_bytes).await.unwrap();
        let header = MessageHeader::parse(&header_bytes, &MAINNET.netmagic).unwrap();
        let mut payload = vec![0u8; header.length as usize];
        socket.read_exact(&mut payload).await.unwrap();
        (header.command, payload)
    }

    fn handshaken(client: &mut SpvClient<Recorder>, id: PeerId, best_height: u32) {
        let peer = client.peers.get_mut(&id).unwrap();
        peer.version_handshake = true;
        peer.best_known_height = best_height;
    }

    #[tokio::test]
    async fn test_version_is_sent_on_connect() {
        let (events, _rx) = mpsc::channel(16);
        let db = HeadersDb::new(&MAINNET);
        let mut client = SpvClient::new(&MAINNET, db, Recorder::default());

        let (_id, mut server) = connected_client_and_socket(&mut client, &events).await;
        let (command, payload) = read_server_message(&mut server).await;
        assert_eq!(command, "version");
        let version = VersionMessage::deserialize(&payload).unwrap();
        assert_eq!(version.user_agent, message::USER_AGENT);
        assert_eq!(version.start_height, 0);
    }

    #[tokio::test]
    async fn test_headers_sync_connects_headers() {
        let (events, _rx) = mpsc::channel(16);
        let db = HeadersDb::new(&MAINNET);
        let mut client = SpvClient::new(&MAINNET, db, Recorder::default());
        client.use_checkpoints = false;
        // keep everything inside the header-sync phase
        client.set_oldest_item_of_interest(u64::MAX / 2);

        let (id, mut server) = connected_client_and_socket(&mut client, &events).await;
        let (_, _) = read_server_message(&mut server).await; // version
        handshaken(&mut client, id, 100);

        client.request_headers().await.unwrap();
        let (command, payload) = read_server_message(&mut server).await;
        assert_eq!(command, "getheaders");
        // locator holds the genesis hash only
        assert_eq!(payload[4], 1);
        assert_eq!(&payload[5..37], MAINNET.genesis_block_hash().as_bytes());
        assert_eq!(client.peers[&id].role, SyncRole::Headers);
        assert!(client.last_headers_request_time > 0);

        // deliver three headers
        let mut headers_payload = vec![3u8];
        for header in test_chain(3, 1_500_000_000) {
            headers_payload.extend_from_slice(&header.serialize());
            headers_payload.push(0); // tx count
        }
        client.on_headers(id, &headers_payload).await.unwrap();

        assert_eq!(client.headers_db().chain_tip().height, 3);
        assert_eq!(*client.handler().headers.lock().unwrap(), 3);
        assert_eq!(client.last_headers_request_time, 0);
    }

    #[tokio::test]
    async fn test_headers_crossing_window_switch_to_blocks() {
        let (events, _rx) = mpsc::channel(16);
        let db = HeadersDb::new(&MAINNET);
        let mut client = SpvClient::new(&MAINNET, db, Recorder::default());
        client.use_checkpoints = false;
        let now = unix_time();
        client.set_oldest_item_of_interest(now);

        let (id, mut server) = connected_client_and_socket(&mut client, &events).await;
        read_server_message(&mut server).await; // version
        handshaken(&mut client, id, 100);

        // recent timestamps put the first header inside the scan window
        let mut headers_payload = vec![2u8];
        for header in test_chain(2, now as u32) {
            headers_payload.extend_from_slice(&header.serialize());
            headers_payload.push(0);
        }
        client.on_headers(id, &headers_payload).await.unwrap();

        assert!(!client.header_sync_phase);
        assert_eq!(client.peers[&id].role, SyncRole::Blocks);
        let (command, _) = read_server_message(&mut server).await;
        assert_eq!(command, "getblocks");
    }

    #[tokio::test]
    async fn test_block_download_feeds_wallet_callback() {
        let (events, _rx) = mpsc::channel(16);
        let db = HeadersDb::new(&MAINNET);
        let mut client = SpvClient::new(&MAINNET, db, Recorder::default());
        let now = unix_time();
        client.set_oldest_item_of_interest(now);

        let (id, mut server) = connected_client_and_socket(&mut client, &events).await;
        read_server_message(&mut server).await; // version
        handshaken(&mut client, id, 2);
        client.peers.get_mut(&id).unwrap().role = SyncRole::Blocks;

        let header = test_chain(1, now as u32)[0];

        // announce the block; client must echo a getdata
        let inv = message::build_inv(&[InvItem {
            kind: message::INV_TYPE_BLOCK,
            hash: header.hash(),
        }]);
        client.on_inv(id, &inv).await.unwrap();
        let (command, getdata_payload) = read_server_message(&mut server).await;
        assert_eq!(command, "getdata");
        assert_eq!(getdata_payload, inv);
        assert_eq!(client.peers[&id].last_requested_inv, Some(header.hash()));

        // deliver the block with two transactions
        let mut coinbase = Transaction::new();
        coinbase
            .inputs
            .push(kabosu_core::tx::TxIn::new(Hash256::ZERO, u32::MAX));
        coinbase.add_p2pkh_output(88, &[0xaa; 20]);
        let mut spend = Transaction::new();
        spend
            .inputs
            .push(kabosu_core::tx::TxIn::new(coinbase.txid(), 0));
        spend.add_p2pkh_output(88, &[0xbb; 20]);

        let mut block_payload = header.serialize();
        block_payload.push(2);
        block_payload.extend_from_slice(&coinbase.serialize(true));
        block_payload.extend_from_slice(&spend.serialize(true));
        client.on_block(id, &block_payload).await.unwrap();

        assert_eq!(client.headers_db().chain_tip().height, 1);
        assert_eq!(*client.handler().txs.lock().unwrap(), 2);
        // the last announced block arrived: sync is complete
        assert!(*client.handler().completed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_stall_recovery_moves_to_next_peer() {
        let (events, _rx) = mpsc::channel(16);
        let db = HeadersDb::new(&MAINNET);
        let mut client = SpvClient::new(&MAINNET, db, Recorder::default());
        client.use_checkpoints = false;
        client.set_oldest_item_of_interest(u64::MAX / 2);

        let (id_a, mut server_a) = connected_client_and_socket(&mut client, &events).await;
        read_server_message(&mut server_a).await;
        let (id_b, mut server_b) = connected_client_and_socket(&mut client, &events).await;
        read_server_message(&mut server_b).await;
        handshaken(&mut client, id_a, 100);
        handshaken(&mut client, id_b, 100);

        // peer A picks up header sync
        client.request_headers().await.unwrap();
        let syncing = if client.peers[&id_a].role == SyncRole::Headers {
            id_a
        } else {
            id_b
        };
        let requested_at = client.last_headers_request_time;
        assert!(requested_at > 0);

        // no response for 61 seconds: the stalled peer is dropped and the
        // other one gets a fresh getheaders
        client
            .periodic_statecheck(requested_at + HEADERS_MAX_RESPONSE_TIME + 1)
            .await
            .unwrap();
        assert!(!client.peers.contains_key(&syncing));
        let other = if syncing == id_a { id_b } else { id_a };
        assert_eq!(client.peers[&other].role, SyncRole::Headers);

        let mut other_server = if syncing == id_a { server_b } else { server_a };
        let (command, _) = read_server_message(&mut other_server).await;
        assert_eq!(command, "getheaders");
    }

    #[tokio::test]
    async fn test_sync_completed_when_two_peers_agree() {
        let (events, _rx) = mpsc::channel(16);
        let db = HeadersDb::new(&MAINNET);
        let mut client = SpvClient::new(&MAINNET, db, Recorder::default());
        client.use_checkpoints = false;
        // tip (genesis, timestamp 0) is older than the window, so the
        // header-sync branch runs and counts agreeing peers
        client.set_oldest_item_of_interest(u64::MAX / 2);

        let (id_a, mut server_a) = connected_client_and_socket(&mut client, &events).await;
        read_server_message(&mut server_a).await;
        let (id_b, mut server_b) = connected_client_and_socket(&mut client, &events).await;
        read_server_message(&mut server_b).await;
        handshaken(&mut client, id_a, 0);
        handshaken(&mut client, id_b, 0);

        client.request_headers().await.unwrap();
        assert!(*client.handler().completed.lock().unwrap());

        // sync_completed fires at most once
        *client.handler().completed.lock().unwrap() = false;
        client.request_headers().await.unwrap();
        assert!(!*client.handler().completed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_misbehaving_peer_disconnected_at_threshold() {
        let (events, _rx) = mpsc::channel(16);
        let db = HeadersDb::new(&MAINNET);
        let mut client = SpvClient::new(&MAINNET, db, Recorder::default());

        let (id, mut server) = connected_client_and_socket(&mut client, &events).await;
        read_server_message(&mut server).await;

        for _ in 0..(MISBEHAVE_THRESHOLD / MISBEHAVE_INCREMENT - 1) {
            assert!(!client.misbehave(id));
        }
        assert!(client.misbehave(id));
        assert!(!client.peers.contains_key(&id));
    }

    #[tokio::test]
    async fn test_checkpoint_locator_bounds_first_request() {
        let (_events, _rx) = mpsc::channel::<PeerEvent>(1);
        let db = HeadersDb::new(&MAINNET);
        let mut client = SpvClient::new(&MAINNET, db, Recorder::default());
        // interested in history after the AuxPoW checkpoint
        client.set_oldest_item_of_interest(1_420_000_000);

        let locators = client.build_block_locator();
        let auxpow_checkpoint = &MAINNET.checkpoints[1];
        assert_eq!(locators[0], auxpow_checkpoint.block_hash());
        assert!(client.headers_db().has_checkpoint_start());
        assert_eq!(
            client.headers_db().chain_tip().height,
            auxpow_checkpoint.height
        );
    }

    #[test]
    fn test_envelope_helper_is_consistent_with_reader() {
        // framing helper used by the fake servers above
        let wire = build_message(&MAINNET.netmagic, commands::PING, b"abcd");
        assert_eq!(wire.len(), HEADER_LEN + 4);
    }
}
