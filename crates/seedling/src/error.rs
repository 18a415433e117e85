use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{bencode::DecodeError, client::ClientMsg};

impl From<mpsc::error::SendError<ClientMsg>> for Error {
    fn from(_: mpsc::error::SendError<ClientMsg>) -> Self {
        Self::ClientClosed
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("bencode: {0}")]
    BencodeError(#[from] DecodeError),

    #[error("invalid metainfo: {0}")]
    MetaInfoInvalid(String),

    #[error("io: {0}")]
    IO(#[from] io::Error),

    // peer wire
    #[error("malformed handshake")]
    HandshakeInvalid,

    #[error("handshake names another torrent")]
    InfoHashMismatch,

    #[error("connected to our own peer id")]
    SelfConnection,

    #[error("message of {0} bytes exceeds the limit")]
    MessageTooLarge(usize),

    #[error("malformed peer message")]
    MessageResponse,

    #[error("peer was silent for too long")]
    Timeout,

    #[error("requested blocks did not arrive in time")]
    RequestTimeout,

    #[error("socket closed by the peer")]
    PeerClosedSocket,

    #[error("closed by the session")]
    Aborted,

    #[error("wire encoding: {0}")]
    WireEncoding(#[from] speedy::Error),

    // tracker
    #[error("bad tracker response: {0}")]
    TrackerResponse(String),

    #[error("announce failed: {0}")]
    TrackerRequest(#[from] reqwest::Error),

    #[error("compact peer list length is not a multiple of 6")]
    TrackerCompactPeerList,

    // sessions and client
    #[error("resume state is corrupt or belongs to another torrent")]
    ResumeStateInvalid,

    #[error("no torrent with this info hash")]
    TorrentDoesNotExist,

    #[error("torrent already added")]
    NoDuplicateTorrent,

    #[error("the client event loop is gone")]
    ClientClosed,

    #[error("the client dropped the reply")]
    ReplyDropped(#[from] oneshot::error::RecvError),

    // configuration
    #[error("no home directory to keep the configuration in")]
    NoHomeDir,

    #[error("cannot create folder {0}")]
    FolderCreate(String),

    #[error("{0} is not a file path")]
    NotAFile(String),

    #[error("cannot write the configuration: {0}")]
    ConfigSerializeError(#[from] toml::ser::Error),
}
