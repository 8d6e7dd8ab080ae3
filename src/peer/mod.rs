//! A peer session drives a single connection through the handshake and the
//! message protocol, downloading blocks into the piece store and serving
//! verified blocks back out.
//!
//! Each session runs as its own task and is connected to the rest of the
//! engine by channels only: commands arrive from the supervisor, piece
//! completions arrive on the store's broadcast channel, and the session
//! posts lifecycle events back. Any error is contained to the session.

mod codec;

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{self, MissedTickBehavior},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    error::{Error, Result},
    store::{Deposit, StoreEvent},
    torrent::TorrentContext,
    Bitfield, BlockInfo, PeerId, PieceIndex, SessionId, BLOCK_LEN,
};
use codec::{Handshake, HandshakeCodec, Message, PeerCodec};

/// How long to wait for the remote's half of the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// The cadence of the session's housekeeping timer.
const TICK: Duration = Duration::from_secs(5);

type Socket = Framed<TcpStream, PeerCodec>;
type Sink = SplitSink<Socket, Message>;

/// The channel on which the supervisor can send a command to the session
/// task.
pub(crate) type Sender = mpsc::UnboundedSender<Command>;
type Receiver = mpsc::UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
}

/// Lifecycle notifications a session posts to the supervisor's event
/// channel. Sessions never hold a reference back to the supervisor.
pub(crate) enum SessionEvent {
    /// The handshake completed and the remote identified itself.
    Connected {
        id: SessionId,
        addr: SocketAddr,
        peer_id: PeerId,
    },
    /// The session terminated; the supervisor releases its resources.
    Stopped {
        id: SessionId,
        addr: SocketAddr,
        outcome: Result<()>,
        uploaded: u64,
        downloaded: u64,
    },
}

/// Per-direction protocol flags. Both directions start out choked and
/// uninterested.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// We choke the peer: we don't serve their requests.
    am_choking: bool,
    /// We are interested: the peer has a piece we lack.
    am_interested: bool,
    /// The peer chokes us: our requests would be ignored.
    peer_choking: bool,
    /// The peer is interested in one of our pieces.
    peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

pub(crate) struct PeerSession {
    /// Shared information and handles of the torrent.
    ctx: Arc<TorrentContext>,
    /// The id the supervisor registered this session under; tags our block
    /// reservations in the piece store.
    id: SessionId,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The port on which the peer session receives commands.
    cmd_port: Receiver,
    /// Where lifecycle events are posted.
    events: mpsc::UnboundedSender<SessionEvent>,
    status: Status,
    /// The peer's advertised piece availability, updated by `Bitfield` and
    /// `Have` messages.
    peer_pieces: Bitfield,
    /// Our pending requests that we sent to peer, with the time they were
    /// issued. Blocks that arrive without an entry here are dropped as
    /// unsolicited. Emptied when we get choked, as the peer won't serve
    /// them.
    outgoing_requests: Vec<(BlockInfo, Instant)>,
    /// Requests from the peer waiting to be served. `Cancel` removes a
    /// matching entry that hasn't been sent yet.
    queued_uploads: VecDeque<BlockInfo>,
    /// A bitfield message is only legal as the very first message.
    expect_bitfield: bool,
    last_send: Instant,
    last_recv: Instant,
    /// Payload bytes served to this peer.
    uploaded: u64,
    /// Payload bytes received from this peer.
    downloaded: u64,
}

impl PeerSession {
    pub fn new(
        ctx: Arc<TorrentContext>,
        id: SessionId,
        addr: SocketAddr,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let piece_count = ctx.store.piece_count();
        (
            Self {
                ctx,
                id,
                addr,
                cmd_port,
                events,
                status: Status::default(),
                peer_pieces: Bitfield::repeat(false, piece_count),
                outgoing_requests: Vec::new(),
                queued_uploads: VecDeque::new(),
                expect_bitfield: true,
                last_send: Instant::now(),
                last_recv: Instant::now(),
                uploaded: 0,
                downloaded: 0,
            },
            cmd_chan,
        )
    }

    /// Dials the peer, performs the initiator's side of the handshake and
    /// runs the session until it stops. Always posts a `Stopped` event.
    pub async fn run_outbound(mut self) {
        log::info!("Starting outbound session with peer {}", self.addr);
        let outcome = match self.establish_outbound().await {
            Ok(socket) => self.run(socket).await,
            Err(e) => Err(e),
        };
        self.finish(outcome);
    }

    /// Performs the responder's side of the handshake on an accepted
    /// socket and runs the session until it stops.
    pub async fn run_inbound(mut self, socket: TcpStream) {
        log::info!("Starting inbound session with peer {}", self.addr);
        let outcome = match self.establish_inbound(socket).await {
            Ok(socket) => self.run(socket).await,
            Err(e) => Err(e),
        };
        self.finish(outcome);
    }

    async fn establish_outbound(&mut self) -> Result<Socket> {
        log::info!("Connecting to peer {}", self.addr);
        let socket = TcpStream::connect(self.addr).await?;
        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we send the first handshake
        socket
            .send(Handshake::new(self.ctx.info_hash, self.ctx.client_id))
            .await?;
        let theirs = self.recv_handshake(&mut socket).await?;
        self.check_handshake(theirs)?;
        Ok(self.into_message_framing(socket))
    }

    async fn establish_inbound(
        &mut self,
        socket: TcpStream,
    ) -> Result<Socket> {
        let mut socket = Framed::new(socket, HandshakeCodec);

        // the initiator speaks first; we only reply once their handshake
        // checks out
        let theirs = self.recv_handshake(&mut socket).await?;
        self.check_handshake(theirs)?;
        socket
            .send(Handshake::new(self.ctx.info_hash, self.ctx.client_id))
            .await?;
        Ok(self.into_message_framing(socket))
    }

    async fn recv_handshake(
        &mut self,
        socket: &mut Framed<TcpStream, HandshakeCodec>,
    ) -> Result<Handshake> {
        match time::timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
            Ok(Some(theirs)) => theirs,
            Ok(None) => Err(Error::PeerDisconnected),
            Err(_) => Err(Error::BadHandshake),
        }
    }

    fn check_handshake(&mut self, theirs: Handshake) -> Result<()> {
        if theirs.info_hash != self.ctx.info_hash {
            log::info!("Peer {} handshake has foreign info hash", self.addr);
            return Err(Error::BadHandshake);
        }
        if theirs.peer_id == self.ctx.client_id {
            log::debug!("Dialed ourselves at {}", self.addr);
            return Err(Error::SelfConnection);
        }
        log::debug!("Peer {} handshake: {:?}", self.addr, theirs);
        let _ = self.events.send(SessionEvent::Connected {
            id: self.id,
            addr: self.addr,
            peer_id: theirs.peer_id,
        });
        Ok(())
    }

    /// Switches the socket from the handshake to the message codec, keeping
    /// any bytes the peer sent right after its handshake.
    fn into_message_framing(
        &self,
        socket: Framed<TcpStream, HandshakeCodec>,
    ) -> Socket {
        let old_parts = socket.into_parts();
        let mut new_parts =
            FramedParts::new(old_parts.io, PeerCodec::new(self.ctx.piece_len));
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        Framed::from_parts(new_parts)
    }

    /// The main session loop: exchanges messages and runs the timers until
    /// the connection closes, a protocol error occurs or the supervisor
    /// tells us to stop.
    async fn run(&mut self, socket: Socket) -> Result<()> {
        let (mut sink, mut stream) = socket.split();

        // subscribe before snapshotting availability so a piece completing
        // in between still reaches this peer as a Have
        let mut store_events = self.ctx.store.subscribe();

        // advertise what we already have, then unchoke; the engine's
        // choking policy is "unchoke all"
        let bitfield = self.ctx.store.bitfield();
        if bitfield.any() {
            self.send(&mut sink, Message::Bitfield(bitfield)).await?;
        }
        self.send(&mut sink, Message::Unchoke).await?;
        self.status.am_choking = false;

        let mut tick = time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(msg) => {
                        let msg = msg?;
                        self.last_recv = Instant::now();
                        self.handle_msg(&mut sink, msg).await?;
                    }
                    // EOF, including one mid-frame: the peer is gone
                    None => return Err(Error::PeerDisconnected),
                },
                event = store_events.recv() => {
                    if let Ok(event) = event {
                        self.handle_store_event(&mut sink, event).await?;
                    }
                }
                cmd = self.cmd_port.recv() => match cmd {
                    Some(Command::Shutdown) | None => {
                        log::info!("Shutting down peer {} session", self.addr);
                        return Ok(());
                    }
                },
                _ = tick.tick() => self.on_tick(&mut sink).await?,
            }

            // serve queued requests outside the select so inbound traffic
            // and timers stay responsive between blocks
            self.serve_uploads(&mut sink).await?;
        }
    }

    async fn handle_msg(
        &mut self,
        sink: &mut Sink,
        msg: Message,
    ) -> Result<()> {
        log::debug!("Received message {:?} from peer {}", msg.id(), self.addr);
        let expects_bitfield =
            std::mem::replace(&mut self.expect_bitfield, false);
        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(bitfield) => {
                if !expects_bitfield {
                    log::warn!(
                        "Peer {} sent bitfield after first message",
                        self.addr
                    );
                    return Err(Error::ProtocolViolation(
                        "bitfield not first message",
                    ));
                }
                self.handle_bitfield(sink, bitfield).await?;
            }
            Message::Choke => {
                if !self.status.peer_choking {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.peer_choking = true;
                    // the peer won't serve what's in flight; free the
                    // reservations so the blocks can be picked again
                    self.outgoing_requests.clear();
                    self.ctx.store.release_session(self.id);
                }
            }
            Message::Unchoke => {
                if self.status.peer_choking {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.peer_choking = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.peer_interested {
                    log::info!("Peer {} is no longer interested", self.addr);
                    self.status.peer_interested = false;
                }
            }
            Message::Have(piece_index) => {
                if piece_index >= self.ctx.store.piece_count() {
                    return Err(Error::ProtocolViolation(
                        "have index out of range",
                    ));
                }
                self.peer_pieces.set(piece_index, true);
                self.update_interest(sink).await?;
                self.make_requests(sink).await?;
            }
            Message::Request(block) => self.handle_request(block)?,
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block(sink, piece_index, offset, data).await?;
            }
            Message::Cancel(block) => {
                // drop a queued upload; anything already sent is a no-op
                self.queued_uploads.retain(|queued| *queued != block);
            }
        }
        Ok(())
    }

    async fn handle_bitfield(
        &mut self,
        sink: &mut Sink,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        let piece_count = self.ctx.store.piece_count();
        // the wire carries whole bytes: the length must match our piece
        // count exactly and the pad bits must be zero
        let expected_bytes = (piece_count + 7) / 8;
        if bitfield.len() != expected_bytes * 8
            || bitfield[piece_count..].any()
        {
            return Err(Error::ProtocolViolation("bitfield length mismatch"));
        }
        bitfield.resize(piece_count, false);
        log::info!(
            "Peer {} has {}/{} pieces",
            self.addr,
            bitfield.count_ones(),
            piece_count
        );
        self.peer_pieces = bitfield;
        self.update_interest(sink).await?;
        self.make_requests(sink).await?;
        Ok(())
    }

    /// Validates and queues an upload request.
    fn handle_request(&mut self, block: BlockInfo) -> Result<()> {
        log::debug!("Peer {} requested block {:?}", self.addr, block);
        if self.status.am_choking {
            log::debug!("Peer {} requested while choked", self.addr);
            return Ok(());
        }
        if block.len == 0 || block.len > 2 * BLOCK_LEN {
            return Err(Error::ProtocolViolation("request length invalid"));
        }
        if !self.queued_uploads.contains(&block) {
            self.queued_uploads.push_back(block);
        }
        Ok(())
    }

    /// Matches an arriving block against our pending requests and deposits
    /// it in the piece store.
    async fn handle_block(
        &mut self,
        sink: &mut Sink,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let block = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };
        let pos = self
            .outgoing_requests
            .iter()
            .position(|(requested, _)| *requested == block);
        match pos {
            Some(pos) => {
                self.outgoing_requests.remove(pos);
            }
            None => {
                // unsolicited block; not fatal, just dropped
                log::warn!(
                    "Peer {} sent block we didn't request: {:?}",
                    self.addr,
                    block
                );
                return Ok(());
            }
        }

        self.downloaded += data.len() as u64;
        self.ctx.counters.record_down(data.len() as u64);
        match self
            .ctx
            .store
            .deposit_block(piece_index, offset, &data, self.id)?
        {
            Deposit::PieceCorrupt => {
                // the store dropped the piece; it will be picked again, by
                // us or by another session
                log::warn!(
                    "Piece {} completed via peer {} was corrupt",
                    piece_index,
                    self.addr
                );
            }
            Deposit::Accepted | Deposit::PieceCompleted => {}
        }

        // a slot in the pipeline just freed up
        self.make_requests(sink).await?;
        Ok(())
    }

    async fn handle_store_event(
        &mut self,
        sink: &mut Sink,
        event: StoreEvent,
    ) -> Result<()> {
        match event {
            StoreEvent::PieceCompleted(piece_index) => {
                self.send(sink, Message::Have(piece_index)).await?;
                // completing a piece may end our interest in this peer
                self.update_interest(sink).await?;
            }
            StoreEvent::PieceCorrupt(_) => {
                self.update_interest(sink).await?;
                self.make_requests(sink).await?;
            }
        }
        Ok(())
    }

    /// Signals `Interested`/`NotInterested` when whether the peer has a
    /// piece we lack changes.
    async fn update_interest(&mut self, sink: &mut Sink) -> Result<()> {
        let ours = self.ctx.store.bitfield();
        let want = self.peer_pieces.iter_ones().any(|index| !ours[index]);
        if want && !self.status.am_interested {
            log::info!("Interested in peer {}", self.addr);
            self.status.am_interested = true;
            self.send(sink, Message::Interested).await?;
        } else if !want && self.status.am_interested {
            log::info!("No longer interested in peer {}", self.addr);
            self.status.am_interested = false;
            self.send(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    /// Fills the download pipeline up to the configured depth with blocks
    /// the scheduler picks against this peer's availability.
    async fn make_requests(&mut self, sink: &mut Sink) -> Result<()> {
        if self.status.peer_choking || !self.status.am_interested {
            return Ok(());
        }
        while self.outgoing_requests.len() < self.ctx.conf.max_pipeline {
            let block = self.ctx.store.next_request(
                &self.peer_pieces,
                self.id,
                self.ctx.conf.max_pipeline,
            );
            match block {
                Some(block) => {
                    log::debug!(
                        "Requesting block {:?} from peer {}",
                        block,
                        self.addr
                    );
                    self.outgoing_requests.push((block, Instant::now()));
                    self.send(sink, Message::Request(block)).await?;
                }
                None => {
                    // nothing left to ask this peer for; idle until a piece
                    // corruption, timeout or new Have changes that
                    if self.outgoing_requests.is_empty()
                        && self.status.am_interested
                    {
                        self.status.am_interested = false;
                        self.send(sink, Message::NotInterested).await?;
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Reads queued upload requests from the store and sends them.
    async fn serve_uploads(&mut self, sink: &mut Sink) -> Result<()> {
        while let Some(block) = self.queued_uploads.pop_front() {
            match self.ctx.store.read_block(block) {
                Ok(data) => {
                    self.uploaded += data.len() as u64;
                    self.ctx.counters.record_up(data.len() as u64);
                    self.send(
                        sink,
                        Message::Piece {
                            piece_index: block.piece_index,
                            offset: block.offset,
                            data,
                        },
                    )
                    .await?;
                }
                // a region escaping the piece is hostile; a request for a
                // piece we merely don't have yet is not
                Err(Error::OutOfRange) => {
                    return Err(Error::ProtocolViolation(
                        "request escapes piece",
                    ));
                }
                Err(Error::PieceNotAvailable(piece_index)) => {
                    log::warn!(
                        "Peer {} requested piece {} we don't have",
                        self.addr,
                        piece_index
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Periodic housekeeping: keep-alives, inbound idle teardown, request
    /// timeout reissue and interest refresh.
    async fn on_tick(&mut self, sink: &mut Sink) -> Result<()> {
        if self.last_recv.elapsed() > 2 * self.ctx.conf.keep_alive_interval {
            log::warn!("Peer {} went silent, closing", self.addr);
            return Err(Error::PeerDisconnected);
        }

        // forget requests the peer never answered; the store expires the
        // matching reservations on its own clock, after which the blocks
        // are picked again
        let request_timeout = self.ctx.conf.request_timeout;
        let before = self.outgoing_requests.len();
        self.outgoing_requests
            .retain(|(_, at)| at.elapsed() <= request_timeout);
        if self.outgoing_requests.len() < before {
            log::warn!(
                "{} requests to peer {} timed out",
                before - self.outgoing_requests.len(),
                self.addr
            );
        }

        self.update_interest(sink).await?;
        self.make_requests(sink).await?;

        if self.last_send.elapsed() >= self.ctx.conf.keep_alive_interval {
            self.send(sink, Message::KeepAlive).await?;
        }
        Ok(())
    }

    async fn send(&mut self, sink: &mut Sink, msg: Message) -> Result<()> {
        log::debug!("Sending message {:?} to peer {}", msg.id(), self.addr);
        sink.send(msg).await?;
        self.last_send = Instant::now();
        Ok(())
    }

    fn finish(self, outcome: Result<()>) {
        match &outcome {
            Ok(()) => log::info!("Session with peer {} closed", self.addr),
            Err(e) => {
                log::info!("Session with peer {} closed: {}", self.addr, e)
            }
        }
        let _ = self.events.send(SessionEvent::Stopped {
            id: self.id,
            addr: self.addr,
            outcome,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
        });
    }
}
