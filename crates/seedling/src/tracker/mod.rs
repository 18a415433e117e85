//! A tracker is a server that manages peers and stats of multiple torrents.
//!
//! Each session with an announce URL spawns one [`Tracker`] task. The task
//! announces `started` right away, re-announces on the interval given by
//! the tracker and reports the peers it learns about to the control loop.
pub mod announce;

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    select,
    sync::mpsc,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{error::Error, peer::PeerId, torrent::InfoHash};

use self::announce::{Event, Request, Response};

/// Interval used until the tracker tells otherwise.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);

/// Trackers that ask for less are ignored.
pub const MIN_INTERVAL: Duration = Duration::from_secs(30);

/// Trackers that ask for more are announced to at least once a day.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Channel on which every [`Tracker`] reports back to the control loop.
pub type TrackerTx = mpsc::UnboundedSender<(InfoHash, TrackerEvent)>;

/// Transport of an announce: GET `url` and return the body.
pub trait Announcer: Clone + Send + Sync + 'static {
    fn get(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;
}

/// [`Announcer`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpAnnouncer {
    client: reqwest::Client,
}

impl HttpAnnouncer {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

impl Announcer for HttpAnnouncer {
    async fn get(&self, url: &str) -> Result<Vec<u8>, Error> {
        let res = self.client.get(url).send().await?.error_for_status()?;
        Ok(res.bytes().await?.to_vec())
    }
}

/// Totals reported in every announce, updated by the session.
#[derive(Debug, Default)]
pub struct TransferStats {
    pub uploaded: AtomicU64,
    pub downloaded: AtomicU64,
    pub left: AtomicU64,
}

impl TransferStats {
    pub fn update(&self, uploaded: u64, downloaded: u64, left: u64) {
        self.uploaded.store(uploaded, Ordering::Relaxed);
        self.downloaded.store(downloaded, Ordering::Relaxed);
        self.left.store(left, Ordering::Relaxed);
    }
}

/// Messages from the session to its tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerMsg {
    /// The download finished.
    Completed,
    /// Announce `stopped` and quit.
    Stop,
}

/// What the tracker task reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Peers(Vec<(SocketAddr, Option<PeerId>)>),
    Warning(String),
    /// The tracker answered with a `failure reason`.
    Failure(String),
    /// The tracker could not be reached or sent garbage.
    Error(String),
    /// The `stopped` announce finished, the task is gone.
    Stopped,
}

pub struct Tracker<A: Announcer> {
    announcer: A,
    url: String,
    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,
    stats: Arc<TransferStats>,
    tracker_id: Option<String>,
    interval: Duration,
    rx: mpsc::UnboundedReceiver<TrackerMsg>,
    tx: TrackerTx,
}

impl<A: Announcer> Tracker<A> {
    pub fn new(
        announcer: A,
        url: String,
        info_hash: InfoHash,
        peer_id: PeerId,
        port: u16,
        stats: Arc<TransferStats>,
        tx: TrackerTx,
    ) -> (Self, mpsc::UnboundedSender<TrackerMsg>) {
        let (msg_tx, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            announcer,
            url,
            info_hash,
            peer_id,
            port,
            stats,
            tracker_id: None,
            interval: DEFAULT_INTERVAL,
            rx,
            tx,
        };
        (tracker, msg_tx)
    }

    #[tracing::instrument(name = "tracker", skip_all, fields(url = %self.url))]
    pub async fn run(mut self) {
        debug!("running tracker");

        self.announce(Event::Started).await;
        let mut next = self.next_announce();

        loop {
            select! {
                _ = sleep_until(next) => {
                    self.announce(Event::None).await;
                    next = self.next_announce();
                }
                msg = self.rx.recv() => match msg {
                    Some(TrackerMsg::Completed) => {
                        self.announce(Event::Completed).await;
                        next = self.next_announce();
                    }
                    Some(TrackerMsg::Stop) | None => {
                        if timeout(HTTP_TIMEOUT, self.announce(Event::Stopped)).await.is_err() {
                            warn!("stop announce timed out");
                        }
                        let _ = self.tx.send((self.info_hash, TrackerEvent::Stopped));
                        return;
                    }
                }
            }
        }
    }

    fn next_announce(&self) -> Instant {
        Instant::now() + self.interval
    }

    fn request(&self, event: Event) -> Request {
        Request {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: self.stats.uploaded.load(Ordering::Relaxed),
            downloaded: self.stats.downloaded.load(Ordering::Relaxed),
            left: self.stats.left.load(Ordering::Relaxed),
            event,
            tracker_id: self.tracker_id.clone(),
        }
    }

    async fn announce(&mut self, event: Event) {
        let url = self.request(event).to_url(&self.url);
        debug!("announcing {event:?}");

        let res = match self.announcer.get(&url).await.and_then(|b| Response::parse(&b)) {
            Ok(res) => res,
            Err(e) => {
                warn!("announce failed: {e}");
                self.report(TrackerEvent::Error(e.to_string()));
                return;
            }
        };

        if let Some(reason) = res.failure_reason {
            warn!("tracker refused the announce: {reason}");
            self.report(TrackerEvent::Failure(reason));
            return;
        }

        if let Some(warning) = res.warning {
            self.report(TrackerEvent::Warning(warning));
        }

        if res.tracker_id.is_some() {
            self.tracker_id = res.tracker_id;
        }
        self.interval = res.interval.clamp(MIN_INTERVAL, MAX_INTERVAL);

        info!("tracker returned {} peers, next announce in {:?}", res.peers.len(), self.interval);
        if event != Event::Stopped && !res.peers.is_empty() {
            let peers = res.peers.into_iter().map(|p| (p.addr, p.id)).collect();
            self.report(TrackerEvent::Peers(peers));
        }
    }

    fn report(&self, event: TrackerEvent) {
        let _ = self.tx.send((self.info_hash, event));
    }
}
