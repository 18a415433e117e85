use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

#[derive(Parser, Debug, Default)]
#[clap(name = "Seedling")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// The `.torrent` files to download.
    pub torrents: Vec<PathBuf>,

    /// The directory in which torrents will be downloaded.
    #[clap(short, long)]
    pub download_dir: Option<PathBuf>,

    /// Listen for peers on this port only, `0` lets the OS pick one.
    #[clap(short, long)]
    pub port: Option<u16>,

    /// Maximum number of peer connections across every torrent.
    #[clap(short, long)]
    pub max_connections: Option<usize>,

    /// Upload limit in bytes per second.
    #[clap(long)]
    pub upload_limit: Option<u64>,

    /// Download limit in bytes per second.
    #[clap(long)]
    pub download_limit: Option<u64>,

    /// Connect to this peer, can be repeated.
    #[clap(long = "peer")]
    pub peers: Vec<SocketAddr>,

    /// Seed of the piece and peer selection.
    #[clap(long)]
    pub seed: Option<u64>,

    /// Read the configuration from this file instead of the default one.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// If the program should quit after all torrents are fully downloaded.
    #[clap(short, long)]
    pub quit_after_complete: bool,

    /// Write the logs to this file instead of stderr.
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Log at debug level.
    #[clap(short, long)]
    pub verbose: bool,
}
