//! Kabosu SPV
//!
//! Simple-payment-verification client for Dogecoin: a peer group speaking
//! the p2p wire protocol, a chain-reorg-aware headers database with an
//! append-only file backing, and the header/block synchronization state
//! machine with stall detection.
//!
//! # Concurrency
//!
//! [`client::SpvClient::run`] is one cooperative orchestrator loop. Every
//! callback and every headers-database mutation happens inside it; per-peer
//! reader tasks only frame bytes. Embedders calling from other threads must
//! serialize at the boundary.
//!
//! # Example
//!
//! ```ignore
//! use kabosu_core::chainparams::MAINNET;
//! use kabosu_spv::client::{NullHandler, SpvClient};
//! use kabosu_spv::headersdb::HeadersDb;
//!
//! let db = HeadersDb::open(&MAINNET, "headers.db".as_ref())?;
//! let mut client = SpvClient::new(&MAINNET, db, NullHandler);
//! client.discover_peers(None).await;
//! client.run().await?;
//! ```

pub mod client;
pub mod headersdb;
pub mod message;
pub mod peer;

pub use client::{SpvClient, SpvError, SpvHandler};
pub use headersdb::{BlockIndex, HeadersDb, HeadersDbError};
