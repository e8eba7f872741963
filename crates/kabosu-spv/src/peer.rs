//! Peer sessions and the socket reader task

use crate::message::{self, MessageHeader, HEADER_LEN};
use kabosu_core::hash::Hash256;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type PeerId = u32;

/// Added to the score per offense.
pub const MISBEHAVE_INCREMENT: u32 = 10;
/// Peers reaching this score are disconnected.
pub const MISBEHAVE_THRESHOLD: u32 = 100;

/// What the orchestrator loop hears from the outside world.
#[derive(Debug)]
pub enum PeerEvent {
    Connected { addr: SocketAddr, stream: TcpStream },
    ConnectFailed { addr: SocketAddr },
    Message {
        peer: PeerId,
        command: String,
        payload: Vec<u8>,
    },
    Disconnected { peer: PeerId },
}

/// Which sync duty a peer currently carries; at most one at a time, and at
/// most one peer across the group holds `Headers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    None,
    Headers,
    Blocks,
}

/// Connection-side state of one remote peer.
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub version_handshake: bool,
    pub best_known_height: u32,
    pub role: SyncRole,
    /// Unix time of the outstanding block request; 0 when idle.
    pub time_last_request: u64,
    /// Last block hash announced via INV that we asked for.
    pub last_requested_inv: Option<Hash256>,
    pub misbehave_score: u32,
    magic: [u8; 4],
    writer: OwnedWriteHalf,
    reader_task: JoinHandle<()>,
}

impl Peer {
    /// Take ownership of a fresh connection and start its reader task.
    pub fn start(
        id: PeerId,
        addr: SocketAddr,
        stream: TcpStream,
        magic: [u8; 4],
        events: mpsc::Sender<PeerEvent>,
    ) -> Peer {
        let (read_half, writer) = stream.into_split();
        let reader_task = tokio::spawn(read_loop(id, magic, read_half, events));
        Peer {
            id,
            addr,
            version_handshake: false,
            best_known_height: 0,
            role: SyncRole::None,
            time_last_request: 0,
            last_requested_inv: None,
            misbehave_score: 0,
            magic,
            writer,
            reader_task,
        }
    }

    pub async fn send(&mut self, command: &str, payload: &[u8]) -> std::io::Result<()> {
        let wire = message::build_message(&self.magic, command, payload);
        self.writer.write_all(&wire).await
    }

    /// Stop the reader task; dropping the peer closes the write half.
    pub fn shutdown(&self) {
        self.reader_task.abort();
    }
}

/// Frame messages off the socket until EOF or a protocol violation.
async fn read_loop(
    peer: PeerId,
    magic: [u8; 4],
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<PeerEvent>,
) {
    let mut header_bytes = [0u8; HEADER_LEN];
    loop {
        if reader.read_exact(&mut header_bytes).await.is_err() {
            break;
        }
        let header = match MessageHeader::parse(&header_bytes, &magic) {
            Ok(header) => header,
            Err(err) => {
                log::debug!("peer {}: bad message envelope: {}", peer, err);
                break;
            }
        };
        let mut payload = vec![0u8; header.length as usize];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }
        if !header.checksum_matches(&payload) {
            log::debug!("peer {}: checksum mismatch on {}", peer, header.command);
            break;
        }
        if events
            .send(PeerEvent::Message {
                peer,
                command: header.command,
                payload,
            })
            .await
            .is_err()
        {
            return; // orchestrator gone
        }
    }
    let _ = events.send(PeerEvent::Disconnected { peer }).await;
}
