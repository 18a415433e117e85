//! A BitTorrent download engine.
//!
//! This crate has the pieces of a BitTorrent V1 client: a bencode decoder,
//! the metainfo model, the peer wire protocol, a piece and block scheduler,
//! a background disk worker that verifies pieces, a global rate controller
//! and an HTTP tracker client.
//!
//! Everything that touches protocol state runs on one task, the [`Client`]
//! event loop. Disk I/O runs on one thread per torrent and reports back
//! through a channel.
//!
//! # Example
//!
//! Run the [`Client`] and talk to it through its [`ClientHandle`].
//!
//! ```no_run
//! use seedling::{client::Client, config::Config};
//!
//! # async fn download() -> Result<(), seedling::error::Error> {
//! let (client, handle) = Client::with_http(Config::default())?;
//! tokio::spawn(client.run());
//!
//! let bytes = std::fs::read("debian.torrent")?;
//! let info_hash = handle.add_torrent(bytes, "/tmp/downloads", None).await?;
//! println!("{:?}", handle.stats(info_hash).await?);
//!
//! handle.quit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Client`]: client::Client
//! [`ClientHandle`]: client::ClientHandle

pub mod bencode;
pub mod bitfield;
pub mod client;
pub mod config;
pub mod connection_manager;
pub mod counter;
pub mod disk;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod rate_controller;
pub mod torrent;
pub mod tracker;
pub mod utils;
