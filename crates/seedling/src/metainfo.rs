//! Structured view over the bencoded `.torrent` file.
//!
//! The metainfo is parsed once when the torrent is added and never changes
//! afterwards. Its info-hash is the SHA-1 of the raw `info` bytes as they
//! appear in the file.
use std::path::PathBuf;

use crate::{
    bencode::{self, Dictionary, Value},
    error::Error,
    torrent::InfoHash,
};

/// Length of a SHA-1 digest.
pub const HASH_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct MetaInfo {
    /// Tracker announce URL, the torrent can still be used without one.
    pub announce: Option<String>,
    /// Read for display only, trackers in it are never contacted.
    pub announce_list: Vec<Vec<String>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
    pub info: Info,
    pub info_hash: InfoHash,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    /// Name of the file, or of the root folder on multi-file torrents.
    pub name: String,
    pub piece_length: u32,
    /// SHA-1 digest of every piece, in order.
    pub pieces: Vec<[u8; HASH_LEN]>,
    pub private: bool,
    pub layout: FileLayout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileLayout {
    Single { length: u64, md5sum: Option<String> },
    Multi { files: Vec<File> },
}

/// A file of a multi-file torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    /// Path segments relative to the torrent's root folder.
    pub path: Vec<String>,
    pub length: u64,
    pub md5sum: Option<String>,
}

impl File {
    /// The path segments joined with `/`.
    pub fn path_string(&self) -> String {
        self.path.join("/")
    }
}

impl MetaInfo {
    /// Parse the raw bytes of a `.torrent` file.
    pub fn from_bytes(content: &[u8]) -> Result<Self, Error> {
        let decoded = bencode::decode(content)?;
        let info_bytes = decoded
            .info_section()
            .ok_or_else(|| invalid("missing the info dictionary"))?;
        let info_hash = InfoHash(sha1_smol::Sha1::from(info_bytes).digest().bytes());

        let root = &decoded.root;
        let info = root
            .get(b"info")
            .and_then(Value::as_dict)
            .ok_or_else(|| invalid("info is not a dictionary"))?;

        let announce_list = root
            .get(b"announce-list")
            .and_then(Value::as_list)
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(Value::as_list)
                    .map(|tier| tier.iter().filter_map(Value::as_str).collect())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            announce: root.get(b"announce").and_then(Value::as_str),
            announce_list,
            comment: root.get(b"comment").and_then(Value::as_str),
            created_by: root.get(b"created by").and_then(Value::as_str),
            creation_date: root.get(b"creation date").and_then(Value::as_int),
            info: Info::from_dict(info)?,
            info_hash,
        })
    }
}

impl Info {
    fn from_dict(dict: &Dictionary) -> Result<Self, Error> {
        let name = dict
            .get(b"name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing name"))?;
        if !is_plain_segment(&name) {
            return Err(invalid("name is not a plain file name"));
        }

        let piece_length = dict
            .get(b"piece length")
            .and_then(Value::as_int)
            .filter(|l| *l > 0)
            .and_then(|l| u32::try_from(l).ok())
            .ok_or_else(|| invalid("piece length must be a positive 32-bit integer"))?;

        let blob = dict
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| invalid("missing pieces"))?;
        if blob.len() % HASH_LEN != 0 {
            return Err(invalid("pieces is not a multiple of 20 bytes"));
        }
        let pieces: Vec<[u8; HASH_LEN]> = blob
            .chunks_exact(HASH_LEN)
            .map(|c| {
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(c);
                hash
            })
            .collect();

        let layout = if let Some(files) = dict.get(b"files") {
            let files = files
                .as_list()
                .ok_or_else(|| invalid("files is not a list"))?
                .iter()
                .map(parse_file)
                .collect::<Result<Vec<_>, _>>()?;
            FileLayout::Multi { files }
        } else if let Some(length) = dict.get(b"length") {
            let length = length
                .as_int()
                .and_then(|l| u64::try_from(l).ok())
                .ok_or_else(|| invalid("length is not a positive integer"))?;
            FileLayout::Single {
                length,
                md5sum: dict.get(b"md5sum").and_then(Value::as_str),
            }
        } else {
            return Err(invalid("info has neither files nor length"));
        };

        let info = Self {
            name,
            piece_length,
            pieces,
            private: dict.get(b"private").and_then(Value::as_int) == Some(1),
            layout,
        };

        let expected = info.total_size().div_ceil(piece_length as u64);
        if expected == 0 || expected != info.pieces.len() as u64 {
            return Err(invalid("the number of piece hashes does not match the size"));
        }

        Ok(info)
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn total_size(&self) -> u64 {
        match &self.layout {
            FileLayout::Single { length, .. } => *length,
            FileLayout::Multi { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    /// Size of the piece at `index`, only the last one may be shorter.
    pub fn piece_length_at(&self, index: usize) -> u32 {
        let count = self.piece_count();
        if count == 0 || index + 1 < count {
            return self.piece_length;
        }
        let rest = self.total_size() % self.piece_length as u64;
        if rest == 0 {
            self.piece_length
        } else {
            rest as u32
        }
    }

    /// Every file with its length, relative to the download directory.
    ///
    /// Single-file torrents store the file as `name`, multi-file torrents
    /// store their files under the `name` folder.
    pub fn files(&self) -> Vec<(PathBuf, u64)> {
        match &self.layout {
            FileLayout::Single { length, .. } => {
                vec![(PathBuf::from(&self.name), *length)]
            }
            FileLayout::Multi { files } => files
                .iter()
                .map(|f| {
                    let mut path = PathBuf::from(&self.name);
                    path.extend(&f.path);
                    (path, f.length)
                })
                .collect(),
        }
    }
}

fn parse_file(value: &Value) -> Result<File, Error> {
    let dict = value.as_dict().ok_or_else(|| invalid("file entry is not a dictionary"))?;

    let length = dict
        .get(b"length")
        .and_then(Value::as_int)
        .and_then(|l| u64::try_from(l).ok())
        .ok_or_else(|| invalid("file entry without a valid length"))?;

    let path: Vec<String> = dict
        .get(b"path")
        .and_then(Value::as_list)
        .ok_or_else(|| invalid("file entry without a path"))?
        .iter()
        .map(|s| s.as_str().ok_or_else(|| invalid("path segment is not a string")))
        .collect::<Result<_, _>>()?;

    if path.is_empty() || !path.iter().all(|s| is_plain_segment(s)) {
        return Err(invalid("file path escapes the torrent folder"));
    }

    Ok(File { path, length, md5sum: dict.get(b"md5sum").and_then(Value::as_str) })
}

/// A path component that stays inside the folder it is joined to.
fn is_plain_segment(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\'])
}

fn invalid(reason: &str) -> Error {
    Error::MetaInfoInvalid(reason.to_owned())
}
