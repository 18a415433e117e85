//! A Client is the process level owner of every [`Session`].
//!
//! It binds the listening socket, routes inbound connections by the info
//! hash of their handshake, drives the [`RateController`] and forwards disk
//! and tracker events to the session they belong to. All of it runs on the
//! task of [`Client::run`], sessions are never touched from anywhere else.
use std::{
    collections::BTreeMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use hashbrown::HashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    connection_manager::ConnectionManager,
    disk::DiskEvent,
    error::Error,
    metainfo::MetaInfo,
    peer::{ConnId, PeerConnection, PeerEvent, PeerId, Transport},
    rate_controller::RateController,
    torrent::{InfoHash, Session, SessionCtx, SessionState, TorrentStats},
    tracker::{Announcer, HttpAnnouncer, TrackerEvent},
};

/// How long [`ClientMsg::Quit`] waits for the trackers to confirm the stop.
pub const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

const HOUSEKEEPING_TICK: Duration = Duration::from_secs(1);

/// Messages of the [`Client`] event loop.
pub enum ClientMsg {
    /// Parse a metainfo file and start downloading it into `download_dir`.
    AddTorrent {
        bytes: Vec<u8>,
        download_dir: PathBuf,
        /// Saved by [`ClientMsg::DumpState`] in a previous run.
        resume: Option<Vec<u8>>,
        recipient: oneshot::Sender<Result<InfoHash, Error>>,
    },
    /// Pause or resume a torrent.
    Pause { info_hash: InfoHash, paused: bool, recipient: oneshot::Sender<Result<(), Error>> },
    /// Stop a torrent, it stays listed as Idle.
    Stop { info_hash: InfoHash, recipient: oneshot::Sender<Result<(), Error>> },
    Stats { info_hash: InfoHash, recipient: oneshot::Sender<Result<TorrentStats, Error>> },
    AllStats { recipient: oneshot::Sender<Vec<TorrentStats>> },
    /// Resume state of a torrent.
    DumpState { info_hash: InfoHash, recipient: oneshot::Sender<Result<Vec<u8>, Error>> },
    /// Peers that did not come from a tracker.
    AddPeers {
        info_hash: InfoHash,
        peers: Vec<SocketAddr>,
        recipient: oneshot::Sender<Result<(), Error>>,
    },
    /// Upload and download limits in bytes per second.
    SetLimits { upload: u64, download: u64 },
    SetMaxConnections(usize),
    /// Port of the listener, `None` if none could be bound.
    ListenPort { recipient: oneshot::Sender<Option<u16>> },
    /// Stop every torrent and end the event loop.
    Quit { recipient: oneshot::Sender<()> },
    /// An outbound TCP connect finished.
    PeerConnected { info_hash: InfoHash, id: ConnId, result: io::Result<TcpStream> },
    /// The listener accepted a socket.
    Accepted { stream: TcpStream, addr: SocketAddr },
}

/// Cloneable handle to a running [`Client`].
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<ClientMsg>,
}

impl ClientHandle {
    pub async fn add_torrent(
        &self,
        bytes: Vec<u8>,
        download_dir: impl Into<PathBuf>,
        resume: Option<Vec<u8>>,
    ) -> Result<InfoHash, Error> {
        let (recipient, rx) = oneshot::channel();
        self.tx.send(ClientMsg::AddTorrent {
            bytes,
            download_dir: download_dir.into(),
            resume,
            recipient,
        })?;
        rx.await?
    }

    pub async fn pause(&self, info_hash: InfoHash, paused: bool) -> Result<(), Error> {
        let (recipient, rx) = oneshot::channel();
        self.tx.send(ClientMsg::Pause { info_hash, paused, recipient })?;
        rx.await?
    }

    pub async fn stop(&self, info_hash: InfoHash) -> Result<(), Error> {
        let (recipient, rx) = oneshot::channel();
        self.tx.send(ClientMsg::Stop { info_hash, recipient })?;
        rx.await?
    }

    pub async fn stats(&self, info_hash: InfoHash) -> Result<TorrentStats, Error> {
        let (recipient, rx) = oneshot::channel();
        self.tx.send(ClientMsg::Stats { info_hash, recipient })?;
        rx.await?
    }

    pub async fn all_stats(&self) -> Result<Vec<TorrentStats>, Error> {
        let (recipient, rx) = oneshot::channel();
        self.tx.send(ClientMsg::AllStats { recipient })?;
        Ok(rx.await?)
    }

    pub async fn dump_state(&self, info_hash: InfoHash) -> Result<Vec<u8>, Error> {
        let (recipient, rx) = oneshot::channel();
        self.tx.send(ClientMsg::DumpState { info_hash, recipient })?;
        rx.await?
    }

    pub async fn add_peers(
        &self,
        info_hash: InfoHash,
        peers: Vec<SocketAddr>,
    ) -> Result<(), Error> {
        let (recipient, rx) = oneshot::channel();
        self.tx.send(ClientMsg::AddPeers { info_hash, peers, recipient })?;
        rx.await?
    }

    pub fn set_limits(&self, upload: u64, download: u64) -> Result<(), Error> {
        self.tx.send(ClientMsg::SetLimits { upload, download })?;
        Ok(())
    }

    pub fn set_max_connections(&self, max: usize) -> Result<(), Error> {
        self.tx.send(ClientMsg::SetMaxConnections(max))?;
        Ok(())
    }

    pub async fn listen_port(&self) -> Result<Option<u16>, Error> {
        let (recipient, rx) = oneshot::channel();
        self.tx.send(ClientMsg::ListenPort { recipient })?;
        Ok(rx.await?)
    }

    /// Stop every torrent and wait for the event loop to finish.
    pub async fn quit(&self) -> Result<(), Error> {
        let (recipient, rx) = oneshot::channel();
        self.tx.send(ClientMsg::Quit { recipient })?;
        Ok(rx.await?)
    }
}

struct Quitting {
    deadline: Instant,
    recipient: oneshot::Sender<()>,
}

pub struct Client<A: Announcer = HttpAnnouncer> {
    config: Config,
    ctx: SessionCtx<A>,
    sessions: HashMap<InfoHash, Session<A>>,
    rc: RateController,
    cm: ConnectionManager,
    listen_port: Option<u16>,
    /// Accepted sockets whose handshake did not name a torrent yet.
    pending: BTreeMap<ConnId, PeerConnection>,
    quitting: Option<Quitting>,

    rx: mpsc::UnboundedReceiver<ClientMsg>,
    disk_rx: mpsc::UnboundedReceiver<(InfoHash, DiskEvent)>,
    tracker_rx: mpsc::UnboundedReceiver<(InfoHash, TrackerEvent)>,
}

impl Client<HttpAnnouncer> {
    /// A client that announces over HTTP(S).
    pub fn with_http(config: Config) -> Result<(Self, ClientHandle), Error> {
        Ok(Self::new(config, HttpAnnouncer::new()?))
    }
}

impl<A: Announcer> Client<A> {
    pub fn new(config: Config, announcer: A) -> (Self, ClientHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        let (tracker_tx, tracker_rx) = mpsc::unbounded_channel();

        let cm = ConnectionManager::new(config.max_connections, PeerId::generate());
        let ctx = SessionCtx {
            local_peer_id: cm.peer_id(),
            client_tx: tx.clone(),
            disk_tx,
            tracker_tx,
            announcer,
            rng_seed: config.rng_seed,
        };

        let client = Self {
            rc: RateController::new(config.upload_limit, config.download_limit),
            config,
            ctx,
            sessions: HashMap::new(),
            cm,
            listen_port: None,
            pending: BTreeMap::new(),
            quitting: None,
            rx,
            disk_rx,
            tracker_rx,
        };

        (client, ClientHandle { tx })
    }

    /// Bind the first free port of the configured range.
    async fn bind(&mut self) -> Option<TcpListener> {
        for port in self.config.listen_ports() {
            match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(listener) => {
                    let Ok(addr) = listener.local_addr() else {
                        continue;
                    };
                    info!("listening on: {addr}");
                    self.listen_port = Some(addr.port());
                    return Some(listener);
                }
                Err(e) => debug!("could not bind port {port}: {e}"),
            }
        }
        error!(
            "could not listen on any port between {} and {}",
            self.config.listen_port_min, self.config.listen_port_max
        );
        None
    }

    fn spawn_accept_loop(&self, listener: TcpListener) -> JoinHandle<()> {
        let tx = self.ctx.client_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if tx.send(ClientMsg::Accepted { stream, addr }).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        })
    }

    /// Run the event loop until [`ClientMsg::Quit`] finished.
    #[tracing::instrument(name = "client", skip_all)]
    pub async fn run(mut self) -> Result<(), Error> {
        debug!("running client");

        let accept = match self.bind().await {
            Some(listener) => Some(self.spawn_accept_loop(listener)),
            None => None,
        };

        let mut rate_tick = interval(RateController::TICK);
        rate_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = interval(HOUSEKEEPING_TICK);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                Some(msg) = self.rx.recv() => self.handle_msg(msg),
                Some((info_hash, event)) = self.disk_rx.recv() => {
                    self.handle_disk_event(info_hash, event);
                }
                Some((info_hash, event)) = self.tracker_rx.recv() => {
                    if let Some(session) = self.sessions.get_mut(&info_hash) {
                        session.handle_tracker_event(event, &mut self.cm);
                    }
                }
                _ = rate_tick.tick() => self.transfer(),
                _ = housekeeping.tick() => self.housekeeping(),
            }

            if self.quit_finished() {
                break;
            }
        }

        if let Some(accept) = accept {
            accept.abort();
        }
        info!("client stopped");
        Ok(())
    }

    fn handle_msg(&mut self, msg: ClientMsg) {
        match msg {
            ClientMsg::AddTorrent { bytes, download_dir, resume, recipient } => {
                let _ = recipient.send(self.add_torrent(&bytes, download_dir, resume));
            }
            ClientMsg::Pause { info_hash, paused, recipient } => {
                let r = self.session_mut(info_hash).map(|(session, cm)| {
                    session.set_paused(paused, cm);
                    session.process_events(cm);
                });
                let _ = recipient.send(r);
            }
            ClientMsg::Stop { info_hash, recipient } => {
                let r = self.session_mut(info_hash).map(|(session, cm)| session.stop(cm));
                let _ = recipient.send(r);
            }
            ClientMsg::Stats { info_hash, recipient } => {
                let r = self
                    .sessions
                    .get(&info_hash)
                    .map(|s| s.stats())
                    .ok_or(Error::TorrentDoesNotExist);
                let _ = recipient.send(r);
            }
            ClientMsg::AllStats { recipient } => {
                let _ = recipient.send(self.sessions.values().map(|s| s.stats()).collect());
            }
            ClientMsg::DumpState { info_hash, recipient } => {
                let r = self
                    .sessions
                    .get(&info_hash)
                    .map(|s| s.dumped_state())
                    .ok_or(Error::TorrentDoesNotExist);
                let _ = recipient.send(r);
            }
            ClientMsg::AddPeers { info_hash, peers, recipient } => {
                let r = self.session_mut(info_hash).map(|(session, cm)| {
                    session.add_to_peer_list(peers.into_iter().map(|p| (p, None)).collect(), cm);
                    session.process_events(cm);
                });
                let _ = recipient.send(r);
            }
            ClientMsg::SetLimits { upload, download } => {
                debug!("limits set to {upload} up and {download} down");
                self.rc.set_upload_limit(upload);
                self.rc.set_download_limit(download);
            }
            ClientMsg::SetMaxConnections(max) => self.cm.set_max_connections(max),
            ClientMsg::ListenPort { recipient } => {
                let _ = recipient.send(self.listen_port);
            }
            ClientMsg::Quit { recipient } => self.quit(recipient),
            ClientMsg::PeerConnected { info_hash, id, result } => {
                let Some(session) = self.sessions.get_mut(&info_hash) else {
                    self.cm.remove_connection(id);
                    return;
                };
                let result = result.map(|stream| Box::new(stream) as Box<dyn Transport>);
                session.on_connected(id, result, &mut self.cm);
            }
            ClientMsg::Accepted { stream, addr } => self.accept(stream, addr),
        }
    }

    fn session_mut(
        &mut self,
        info_hash: InfoHash,
    ) -> Result<(&mut Session<A>, &mut ConnectionManager), Error> {
        let session = self.sessions.get_mut(&info_hash).ok_or(Error::TorrentDoesNotExist)?;
        Ok((session, &mut self.cm))
    }

    /// A torrent that cannot be parsed leaves no trace.
    fn add_torrent(
        &mut self,
        bytes: &[u8],
        download_dir: PathBuf,
        resume: Option<Vec<u8>>,
    ) -> Result<InfoHash, Error> {
        let meta = MetaInfo::from_bytes(bytes)?;
        let info_hash = meta.info_hash;

        if self.sessions.contains_key(&info_hash) {
            warn!("{} is already present on the client", meta.info.name);
            return Err(Error::NoDuplicateTorrent);
        }

        info!("adding {} ({info_hash})", meta.info.name);
        let mut session = Session::new(meta, download_dir, self.ctx.clone());

        if let Some(state) = resume {
            if let Err(e) = session.set_dumped_state(&state) {
                warn!("{e}, checking every piece on disk");
            }
        }
        session.start()?;

        self.sessions.insert(info_hash, session);
        Ok(info_hash)
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.quitting.is_some() || !self.cm.can_add_connection() {
            debug!("refusing {addr}");
            return;
        }

        let id = self.cm.next_id();
        debug!("accepted {addr}");
        let conn = PeerConnection::new_inbound(id, addr, self.cm.peer_id(), Box::new(stream));
        self.cm.add_connection(id);
        self.pending.insert(id, conn);
    }

    fn handle_disk_event(&mut self, info_hash: InfoHash, event: DiskEvent) {
        let Some(session) = self.sessions.get_mut(&info_hash) else {
            return;
        };
        match event {
            DiskEvent::VerificationDone { completed } => {
                session.full_verification_done(completed, self.listen_port, &mut self.cm);
                session.process_events(&mut self.cm);
            }
            event => session.handle_disk_event(event, &mut self.cm),
        }
    }

    /// Move bytes on every socket, then handle what was received.
    fn transfer(&mut self) {
        let conns = self
            .pending
            .values_mut()
            .chain(self.sessions.values_mut().flat_map(|s| s.connections_mut()));
        self.rc.transfer(conns);

        self.route_pending();
        for session in self.sessions.values_mut() {
            session.process_events(&mut self.cm);
        }
    }

    /// Hand inbound connections to the session their handshake names.
    fn route_pending(&mut self) {
        let ids: Vec<ConnId> = self.pending.keys().copied().collect();
        for id in ids {
            let Some(conn) = self.pending.get_mut(&id) else {
                continue;
            };

            let info_hash = conn.take_events().into_iter().find_map(|e| match e {
                PeerEvent::InfoHashReceived(info_hash) => Some(info_hash),
                _ => None,
            });

            if conn.is_closed() {
                if let Some(reason) = conn.close_reason() {
                    debug!("inbound {} closed: {reason}", conn.addr());
                }
                self.pending.remove(&id);
                self.cm.remove_connection(id);
                continue;
            }

            let Some(info_hash) = info_hash else {
                continue;
            };
            let Some(conn) = self.pending.remove(&id) else {
                continue;
            };

            let routed = match self.sessions.get_mut(&info_hash) {
                Some(session) => session.setup_incoming_connection(conn, &mut self.cm),
                None => Err(conn),
            };
            if let Err(conn) = routed {
                debug!("no torrent takes {} for {info_hash}", conn.addr());
                self.cm.remove_connection(id);
            }
        }
    }

    fn housekeeping(&mut self) {
        let now = Instant::now();

        for conn in self.pending.values_mut() {
            conn.poll_timers(now);
        }
        self.route_pending();

        for session in self.sessions.values_mut() {
            session.tick(now, &mut self.cm);
        }
    }

    fn quit(&mut self, recipient: oneshot::Sender<()>) {
        info!("quitting, stopping {} torrents", self.sessions.len());
        for session in self.sessions.values_mut() {
            session.stop(&mut self.cm);
        }
        for id in std::mem::take(&mut self.pending).into_keys() {
            self.cm.remove_connection(id);
        }
        self.quitting = Some(Quitting { deadline: Instant::now() + QUIT_TIMEOUT, recipient });
    }

    /// Every tracker confirmed the stop, or we waited long enough.
    fn quit_finished(&mut self) -> bool {
        let Some(quitting) = &self.quitting else {
            return false;
        };

        let idle = self.sessions.values().all(|s| s.state() == SessionState::Idle);
        if !idle && Instant::now() < quitting.deadline {
            return false;
        }
        if !idle {
            warn!("gave up waiting for the trackers");
        }

        if let Some(quitting) = self.quitting.take() {
            let _ = quitting.recipient.send(());
        }
        true
    }
}
