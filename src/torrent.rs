//! The torrent supervisor: owns the listener and the set of live peer
//! sessions, dials peers learned from the tracker and keeps the announce
//! schedule.
//!
//! Sessions are reached only through their command channels and report
//! back on a shared event channel, so there is no ownership cycle between
//! the supervisor and its sessions.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    time,
};
use url::Url;

use crate::{
    conf::Config,
    counter::ThruputCounters,
    error::{Error, Result},
    metainfo::Metainfo,
    peer::{self, Command, PeerSession, SessionEvent},
    store::{PieceStore, StoreEvent},
    tracker::{Announce, Event, Tracker},
    PeerId, SessionId, Sha1Hash,
};

/// How long the supervisor waits for sessions to wind down on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared information and handles of the torrent, one `Arc` per session.
pub(crate) struct TorrentContext {
    /// The torrent's identity, verified against every handshake.
    pub info_hash: Sha1Hash,
    /// Our own peer id, sent in handshakes and announces.
    pub client_id: PeerId,
    /// The nominal piece length; bounds legal frame sizes.
    pub piece_len: u32,
    pub store: Arc<PieceStore>,
    pub counters: Arc<ThruputCounters>,
    pub conf: Config,
}

/// What the supervisor knows about an endpoint it may dial.
#[derive(Clone, Copy, Debug, Default)]
struct DialState {
    /// Consecutive dial failures; drives the exponential back-off.
    failures: u32,
    /// Don't dial before this instant.
    backoff_until: Option<Instant>,
    /// Set once the endpoint turned out to be ourselves.
    is_self: bool,
}

struct SessionHandle {
    cmd: peer::Sender,
}

pub(crate) struct Torrent {
    ctx: Arc<TorrentContext>,
    listener: TcpListener,
    /// The port we announce; the listener's actual local port.
    listen_port: u16,
    tracker: Tracker,
    /// Live sessions by their id.
    sessions: HashMap<SessionId, SessionHandle>,
    /// The endpoints of live sessions, to avoid duplicate dials.
    connected: HashMap<SocketAddr, SessionId>,
    /// Every endpoint the tracker has told us about, with dial state.
    known_peers: HashMap<SocketAddr, DialState>,
    next_session_id: SessionId,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown: watch::Receiver<bool>,
    /// Whether the one `completed` announce was already sent.
    announced_completed: bool,
}

impl Torrent {
    /// Binds the listener and sets up the tracker client. The listener is
    /// bound before the first announce so an OS-assigned port can be
    /// announced.
    pub async fn bind(
        conf: Config,
        metainfo: &Metainfo,
        store: Arc<PieceStore>,
        counters: Arc<ThruputCounters>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, conf.listen_port))
                .await?;
        let listen_port = listener.local_addr()?.port();
        log::info!("Listening for peers on port {}", listen_port);

        let announce_url = Url::parse(&metainfo.announce).map_err(|e| {
            Error::MalformedMetainfo(format!("invalid announce url: {}", e))
        })?;
        let tracker =
            Tracker::new(announce_url, metainfo.info_hash, conf.client_id)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(TorrentContext {
            info_hash: metainfo.info_hash,
            client_id: conf.client_id,
            piece_len: metainfo.piece_len,
            store,
            counters,
            conf,
        });

        Ok(Self {
            ctx,
            listener,
            listen_port,
            tracker,
            sessions: HashMap::new(),
            connected: HashMap::new(),
            known_peers: HashMap::new(),
            next_session_id: 1,
            events_tx,
            events_rx,
            shutdown,
            announced_completed: false,
        })
    }

    /// The port the listener actually bound; what gets announced.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Runs the supervisor until shutdown or a fatal error, then winds
    /// everything down: sessions, the goodbye announce, the store flush.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_inner().await;
        self.teardown().await;
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        let mut store_events = self.ctx.store.subscribe();

        // join the swarm; without a tracker we have nobody to talk to, but
        // inbound peers may still find us, so a failure is not fatal
        let mut interval = self.announce(Some(Event::Started)).await;
        let mut next_announce = time::Instant::now() + interval;

        let mut reconcile = time::interval(self.ctx.conf.reconcile_interval);
        reconcile
            .set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => self.accept_peer(socket, addr),
                    Err(e) => log::warn!("Failed to accept peer: {}", e),
                },
                Some(event) = self.events_rx.recv() => {
                    self.handle_session_event(event)?;
                }
                event = store_events.recv() => {
                    if let Ok(StoreEvent::PieceCompleted(_)) = event {
                        if self.ctx.store.is_complete()
                            && !self.announced_completed
                        {
                            log::info!("Download complete, announcing");
                            self.announced_completed = true;
                            interval = self
                                .announce(Some(Event::Completed))
                                .await;
                            next_announce = time::Instant::now() + interval;
                        }
                    }
                }
                _ = time::sleep_until(next_announce) => {
                    interval = self.announce(None).await;
                    next_announce = time::Instant::now() + interval;
                }
                _ = reconcile.tick() => self.reconcile_dials(),
                _ = self.shutdown.changed() => {
                    log::info!("Shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    /// Announces to the tracker, records the peers it returns and yields
    /// the cadence until the next announce. Tracker trouble is logged and
    /// retried at the next interval.
    async fn announce(&mut self, event: Option<Event>) -> Duration {
        let params = Announce {
            port: self.listen_port,
            uploaded: self.ctx.counters.up(),
            downloaded: self.ctx.counters.down(),
            left: self.ctx.store.left(),
            event,
        };
        match self.tracker.announce(params).await {
            Ok(response) => {
                log::debug!(
                    "Tracker returned {} peer(s)",
                    response.peers.len()
                );
                for addr in response.peers {
                    self.known_peers.entry(addr).or_default();
                }
                response
                    .interval
                    .unwrap_or(self.ctx.conf.announce_interval)
            }
            Err(e) => {
                log::warn!("Announce failed: {}", e);
                self.ctx.conf.announce_interval
            }
        }
    }

    /// Promotes an accepted socket to an inbound session.
    fn accept_peer(&mut self, socket: TcpStream, addr: SocketAddr) {
        if self.sessions.len() >= self.ctx.conf.max_connected_peers {
            log::warn!("At peer capacity, rejecting {}", addr);
            return;
        }
        log::info!("Accepted connection from {}", addr);
        let session = self.register_session(addr);
        tokio::spawn(session.run_inbound(socket));
    }

    /// Dials every known endpoint we aren't connected to, within the
    /// connection cap and each endpoint's back-off window.
    fn reconcile_dials(&mut self) {
        let now = Instant::now();
        let mut dialing = Vec::new();
        for (addr, state) in self.known_peers.iter() {
            if self.sessions.len() + dialing.len()
                >= self.ctx.conf.max_connected_peers
            {
                break;
            }
            let backing_off = state
                .backoff_until
                .is_some_and(|until| now < until);
            if state.is_self
                || backing_off
                || self.connected.contains_key(addr)
            {
                continue;
            }
            dialing.push(*addr);
        }
        for addr in dialing {
            log::debug!("Dialing peer {}", addr);
            let session = self.register_session(addr);
            tokio::spawn(session.run_outbound());
        }
    }

    fn register_session(&mut self, addr: SocketAddr) -> PeerSession {
        let id = self.next_session_id;
        self.next_session_id += 1;
        let (session, cmd) = PeerSession::new(
            Arc::clone(&self.ctx),
            id,
            addr,
            self.events_tx.clone(),
        );
        self.sessions.insert(id, SessionHandle { cmd });
        self.connected.insert(addr, id);
        session
    }

    /// Applies a session lifecycle event. Only disk failures propagate;
    /// everything else is contained to the session that reported it.
    fn handle_session_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Connected { id, addr, peer_id } => {
                log::info!(
                    "Session {} with peer {} ({}) established",
                    id,
                    addr,
                    String::from_utf8_lossy(&peer_id)
                );
                if let Some(state) = self.known_peers.get_mut(&addr) {
                    state.failures = 0;
                    state.backoff_until = None;
                }
            }
            SessionEvent::Stopped {
                id,
                addr,
                outcome,
                uploaded,
                downloaded,
            } => {
                self.sessions.remove(&id);
                if self.connected.get(&addr) == Some(&id) {
                    self.connected.remove(&addr);
                }
                // whatever the session had in flight is up for grabs again
                self.ctx.store.release_session(id);
                log::info!(
                    "Session {} with peer {} over; up {} B, down {} B",
                    id,
                    addr,
                    uploaded,
                    downloaded
                );
                match outcome {
                    Err(Error::Disk(e)) => return Err(Error::Disk(e)),
                    Err(Error::SelfConnection) => {
                        if let Some(state) = self.known_peers.get_mut(&addr)
                        {
                            state.is_self = true;
                        }
                    }
                    Err(e) => {
                        log::debug!("Session {} error: {}", id, e);
                        self.note_dial_failure(addr);
                    }
                    Ok(()) => {
                        // clean close; the endpoint is eligible for redial
                        if let Some(state) = self.known_peers.get_mut(&addr)
                        {
                            state.failures = 0;
                            state.backoff_until = None;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Doubles the endpoint's back-off, up to the cap. Only endpoints the
    /// tracker told us about are tracked; inbound sessions arrive from
    /// ephemeral ports that must not become dial candidates.
    fn note_dial_failure(&mut self, addr: SocketAddr) {
        let conf = &self.ctx.conf;
        let state = match self.known_peers.get_mut(&addr) {
            Some(state) => state,
            None => return,
        };
        let backoff = conf
            .dial_backoff_base
            .saturating_mul(1u32 << state.failures.min(16))
            .min(conf.dial_backoff_cap);
        state.failures = state.failures.saturating_add(1);
        state.backoff_until = Some(Instant::now() + backoff);
        log::debug!(
            "Peer {} backed off for {:?} ({} failures)",
            addr,
            backoff,
            state.failures
        );
    }

    /// The shutdown sequence: stop sessions, say goodbye to the tracker,
    /// flush the store. Each step is best-effort.
    async fn teardown(&mut self) {
        log::info!("Stopping {} session(s)", self.sessions.len());
        for session in self.sessions.values() {
            let _ = session.cmd.send(Command::Shutdown);
        }
        let deadline = time::Instant::now() + SHUTDOWN_GRACE;
        while !self.sessions.is_empty() {
            match time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(SessionEvent::Stopped { id, addr, .. })) => {
                    self.sessions.remove(&id);
                    if self.connected.get(&addr) == Some(&id) {
                        self.connected.remove(&addr);
                    }
                    self.ctx.store.release_session(id);
                }
                Ok(Some(SessionEvent::Connected { .. })) => {}
                Ok(None) => break,
                Err(_) => {
                    log::warn!(
                        "{} session(s) did not stop in time",
                        self.sessions.len()
                    );
                    break;
                }
            }
        }

        // goodbye announce; failures were already logged by the helper
        let _ = self.announce(Some(Event::Stopped)).await;

        if let Err(e) = self.ctx.store.flush() {
            log::error!("Failed to flush store: {}", e);
        }
    }
}
