//! Announce request and response of the HTTP tracker protocol.
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::{
    bencode::{self, Value},
    error::Error,
    peer::PeerId,
    torrent::InfoHash,
};

/// Optional `event` parameter of an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Event {
    /// Regular re-announce.
    #[default]
    None,
    Started,
    Completed,
    Stopped,
}

impl Event {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Started => Some("started"),
            Self::Completed => Some("completed"),
            Self::Stopped => Some("stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
    pub tracker_id: Option<String>,
}

impl Request {
    /// Full announce URL, the hash and the peer id are percent encoded
    /// byte by byte.
    pub fn to_url(&self, announce: &str) -> String {
        let sep = if announce.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{announce}{sep}info_hash={}&peer_id={}&port={}",
            urlencoding::encode_binary(&self.info_hash.0),
            urlencoding::encode_binary(&self.peer_id.0),
            self.port,
        );
        url.push_str(&format!(
            "&uploaded={}&downloaded={}&left={}&compact=1",
            self.uploaded, self.downloaded, self.left,
        ));

        if let Some(event) = self.event.as_str() {
            url.push_str("&event=");
            url.push_str(event);
        }

        if let Some(id) = &self.tracker_id {
            url.push_str("&trackerid=");
            url.push_str(&urlencoding::encode(id));
        }

        url
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncedPeer {
    pub addr: SocketAddr,
    pub id: Option<PeerId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    /// The tracker refused the announce, nothing else is set.
    pub failure_reason: Option<String>,
    pub warning: Option<String>,
    pub tracker_id: Option<String>,
    pub interval: Duration,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub peers: Vec<AnnouncedPeer>,
}

impl Response {
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        let decoded = bencode::decode(buf)?;
        let dict = &decoded.root;

        let string = |key: &[u8]| dict.get(key).and_then(Value::as_str);
        let int = |key: &[u8]| dict.get(key).and_then(Value::as_int);

        if let Some(reason) = string(b"failure reason") {
            return Ok(Self { failure_reason: Some(reason), ..Default::default() });
        }

        let interval = int(b"interval")
            .filter(|i| *i >= 0)
            .ok_or_else(|| Error::TrackerResponse("missing interval".to_owned()))?;

        let peers = match dict.get(b"peers") {
            Some(Value::Bytes(compact)) => parse_compact_peer_list(compact)?,
            Some(Value::List(list)) => list.iter().filter_map(parse_peer_dict).collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            failure_reason: None,
            warning: string(b"warning message"),
            tracker_id: string(b"tracker id"),
            interval: Duration::from_secs(interval as u64),
            complete: int(b"complete").map(|v| v as u32),
            incomplete: int(b"incomplete").map(|v| v as u32),
            peers,
        })
    }
}

/// Peers packed as 4 bytes of IPv4 address and 2 bytes of port.
pub fn parse_compact_peer_list(buf: &[u8]) -> Result<Vec<AnnouncedPeer>, Error> {
    let chunks = buf.chunks_exact(6);
    if !chunks.remainder().is_empty() {
        return Err(Error::TrackerCompactPeerList);
    }

    Ok(chunks
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            AnnouncedPeer { addr: SocketAddr::new(IpAddr::V4(ip), port), id: None }
        })
        .collect())
}

fn parse_peer_dict(value: &Value) -> Option<AnnouncedPeer> {
    let dict = value.as_dict()?;
    let ip: IpAddr = dict.get(b"ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(dict.get(b"port")?.as_int()?).ok()?;
    let id = dict
        .get(b"peer id")
        .and_then(Value::as_bytes)
        .and_then(|b| PeerId::try_from(b).ok());
    Some(AnnouncedPeer { addr: SocketAddr::new(ip, port), id })
}
