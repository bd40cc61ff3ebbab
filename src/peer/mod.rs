//! A peer session drives a single connection through the handshake, the
//! availability exchange and the steady message flow, one tokio task per
//! peer.
//!
//! Sessions don't talk to each other: block deliveries go straight to the
//! disk task, selection state is shared with the torrent through one
//! per-torrent mutex that is never held across an await, and everything
//! else flows over channels.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{interval, timeout},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    blockinfo::{Block, BlockInfo},
    counter::{ThruputCounters, ThruputSnapshot},
    disk,
    download::BlockReceipt,
    error::peer::{PeerError, Result},
    peer::{
        codec::{Handshake, HandshakeCodec, Message, PeerCodec},
        extension::{
            ExtendedHandshake, MetadataMessage, PexMessage, EXT_HANDSHAKE_ID,
            METADATA_PIECE_LEN, UT_METADATA_ID, UT_PEX_ID,
        },
        state::{ConnectionState, SessionState},
    },
    torrent::{self, PeerSource, TorrentContext},
    Bitfield, PeerId, PieceIndex, BLOCK_LEN,
};

pub mod codec;
pub mod extension;
pub mod state;

/// The channel on which a session listens for commands from its torrent
/// (and block read results from the disk task).
pub type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// How long a session waits for block deliveries on its outstanding
/// requests before it assumes them lost and re-schedules.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

/// Keep-alives are sent after this much send-side silence.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// A peer that stays completely silent for this long is disconnected.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// How many unsolicited or otherwise invalid blocks a peer may deliver
/// before the session gives up on it.
const MAX_MISBEHAVIOR: u32 = 16;

/// The commands a session can receive from its torrent and the disk task.
pub enum Command {
    /// The result of a block read, to be served to the peer.
    Block(Block),
    /// We verified a new piece; announce it to the peer.
    PieceCompletion { index: PieceIndex },
    /// The choker's decision for this round.
    SetChoked(bool),
    /// Another peer delivered this block first (endgame); withdraw our
    /// request for it.
    CancelRequest(BlockInfo),
    /// Gracefully tear the session down.
    Shutdown,
}

/// The most essential information of a peer session, sent to the torrent
/// with each tick.
pub struct SessionTick {
    /// A snapshot of the session state.
    pub state: SessionState,
    /// Various transfer statistics.
    pub counters: ThruputSnapshot,
    /// The number of pieces the peer has available.
    pub piece_count: usize,
}

pub struct PeerSession {
    /// Shared information of the torrent.
    ctx: Arc<TorrentContext>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The port on which the session receives commands.
    cmd_rx: Receiver,
    /// Our own command sender, handed to the disk task so block read
    /// results come back to this session.
    own_tx: Sender,
    /// The current protocol state.
    state: SessionState,
    /// The peer's id, recorded from its handshake.
    peer_id: Option<PeerId>,
    /// Which pieces the peer has, sized once the bitfield (or the first
    /// have message) arrives.
    peer_pieces: Bitfield,
    /// The peer's extended handshake, once received.
    peer_extensions: Option<ExtendedHandshake>,
    /// Whether both sides advertised BEP 10 in the handshake.
    extension_protocol: bool,
    /// The requests we sent the peer that have not been answered yet.
    outgoing_requests: HashSet<BlockInfo>,
    /// The peer's requests we have not served yet (the disk read is in
    /// flight).
    incoming_requests: HashSet<BlockInfo>,
    /// The request pipeline target, adapted from observed throughput
    /// within the configured bounds.
    target_request_queue_len: usize,
    /// Transfer statistics.
    counters: ThruputCounters,
    /// Strikes for protocol misbehavior that isn't bad enough for an
    /// immediate disconnect.
    misbehavior: u32,
    /// When the last message was sent, for keep-alive scheduling.
    last_outgoing_msg_time: Instant,
    /// When the peer last sent anything, for the inactivity timeout.
    last_incoming_msg_time: Instant,
    /// When the last block was received, for the request timeout.
    last_incoming_block_time: Instant,
}

impl PeerSession {
    /// Creates a new session and the sender through which the torrent and
    /// the disk task talk to it.
    pub fn new(ctx: Arc<TorrentContext>, addr: SocketAddr) -> (Self, Sender) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let piece_count = ctx.storage.piece_count;
        let min_queue_len = ctx.conf.min_request_queue_len;
        let now = Instant::now();
        (
            Self {
                ctx,
                addr,
                cmd_rx,
                own_tx: cmd_tx.clone(),
                state: SessionState::default(),
                peer_id: None,
                peer_pieces: Bitfield::repeat(false, piece_count),
                peer_extensions: None,
                extension_protocol: false,
                outgoing_requests: HashSet::new(),
                incoming_requests: HashSet::new(),
                target_request_queue_len: min_queue_len,
                counters: ThruputCounters::default(),
                misbehavior: 0,
                last_outgoing_msg_time: now,
                last_incoming_msg_time: now,
                last_incoming_block_time: now,
            },
            cmd_tx,
        )
    }

    /// Dials the peer and runs the session until completion or error.
    pub async fn start_outbound(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.state.connection = ConnectionState::Connecting;
        let socket = timeout(
            self.ctx.conf.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await
        .map_err(|_| PeerError::ConnectTimeout)??;
        log::info!("Connected to peer {}", self.addr);

        let result = self.establish(socket, true).await;
        self.shutdown().await;
        result
    }

    /// Runs the session over an already accepted connection.
    pub async fn start_inbound(&mut self, socket: TcpStream) -> Result<()> {
        log::info!("Inbound connection from peer {}", self.addr);
        let result = self.establish(socket, false).await;
        self.shutdown().await;
        result
    }

    /// Exchanges the handshakes and runs the message loop.
    async fn establish(
        &mut self,
        socket: TcpStream,
        outbound: bool,
    ) -> Result<()> {
        self.state.connection = ConnectionState::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);

        let ours = Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        if outbound {
            // an outbound connection starts with our handshake
            socket.send(ours).await?;
        }

        let theirs = timeout(self.ctx.conf.connect_timeout, socket.next())
            .await
            .map_err(|_| PeerError::ConnectTimeout)?
            .ok_or(PeerError::ConnectTimeout)??;

        // the connection is for one torrent only; anything else is
        // a misdirected or hostile dial
        if theirs.info_hash != self.ctx.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(PeerError::InfoHashMismatch);
        }

        if !outbound {
            socket.send(ours).await?;
        }

        self.peer_id = Some(theirs.peer_id);
        self.extension_protocol = theirs.supports_extension_protocol();

        // now that we have the handshake, switch to the peer message codec,
        // reusing the buffers of the previous codec
        let old_parts = socket.into_parts();
        let mut parts = FramedParts::new(old_parts.io, PeerCodec);
        parts.read_buf = old_parts.read_buf;
        parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(parts);

        self.ctx.cmd_tx.send(torrent::Command::PeerConnected {
            addr: self.addr,
            id: theirs.peer_id,
        })?;

        self.state.connection = ConnectionState::AvailabilityExchange;
        self.run(socket).await
    }

    /// The session's main loop: multiplexes the socket, the command
    /// channel and a one second tick.
    async fn run(
        &mut self,
        mut socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        // right after the handshake both sides send their optional opening
        // messages: the extended handshake and the bitfield
        if self.extension_protocol {
            let metadata_size =
                self.ctx.metadata.as_ref().map(|m| m.len() as u32);
            let handshake = ExtendedHandshake::ours(metadata_size);
            self.send(
                &mut socket,
                Message::Extended {
                    id: EXT_HANDSHAKE_ID,
                    payload: handshake.encode(),
                },
            )
            .await?;
        }

        let own_pieces = {
            let tracker = self.ctx.piece_state.lock().unwrap();
            tracker.picker.own_pieces().clone()
        };
        if own_pieces.any() {
            self.send(&mut socket, Message::Bitfield(own_pieces)).await?;
        }

        let mut tick = interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                msg = socket.next() => {
                    let msg = match msg {
                        Some(msg) => msg.map_err(|e| {
                            log::info!("Peer {} codec error: {}", self.addr, e);
                            PeerError::InvalidMessage
                        })?,
                        None => {
                            log::info!("Peer {} closed the connection", self.addr);
                            return Ok(());
                        }
                    };
                    self.last_incoming_msg_time = Instant::now();
                    self.handle_msg(&mut socket, msg).await?;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Block(block)) => {
                            self.serve_block(&mut socket, block).await?;
                        }
                        Some(Command::PieceCompletion { index }) => {
                            self.handle_piece_completion(&mut socket, index).await?;
                        }
                        Some(Command::SetChoked(choked)) => {
                            self.apply_choke_decision(&mut socket, choked).await?;
                        }
                        Some(Command::CancelRequest(block)) => {
                            if self.outgoing_requests.remove(&block) {
                                self.send(&mut socket, Message::Cancel(block)).await?;
                            }
                        }
                        Some(Command::Shutdown) | None => {
                            log::info!("Shutting down session with {}", self.addr);
                            return Ok(());
                        }
                    }
                }
                _ = tick.tick() => {
                    self.tick(&mut socket).await?;
                }
            }
        }
    }

    async fn send(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        msg: Message,
    ) -> Result<()> {
        self.last_outgoing_msg_time = Instant::now();
        socket.send(msg).await?;
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        msg: Message,
    ) -> Result<()> {
        // the bitfield is only valid as the first message after the
        // handshake
        if let Message::Bitfield(bitfield) = msg {
            if self.state.connection != ConnectionState::AvailabilityExchange {
                log::warn!("Peer {} sent a mid-session bitfield", self.addr);
                return Err(PeerError::InvalidBitfield);
            }
            self.handle_bitfield(socket, bitfield).await?;
            self.state.connection = ConnectionState::Connected;
            return Ok(());
        }
        if self.state.connection == ConnectionState::AvailabilityExchange {
            self.state.connection = ConnectionState::Connected;
        }

        match msg {
            Message::Bitfield(_) => unreachable!("handled above"),
            Message::KeepAlive => {
                log::trace!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.state.is_choked {
                    self.state.is_choked = true;
                    // the peer will not answer outstanding requests
                    // anymore; release the blocks for other peers
                    self.free_outgoing_requests();
                }
            }
            Message::Unchoke => {
                if self.state.is_choked {
                    self.state.is_choked = false;
                    self.make_requests(socket).await?;
                }
            }
            Message::Interested => {
                self.state.is_peer_interested = true;
            }
            Message::NotInterested => {
                self.state.is_peer_interested = false;
            }
            Message::Have { piece_index } => {
                if piece_index >= self.peer_pieces.len() {
                    return Err(PeerError::InvalidMessage);
                }
                if !self.peer_pieces[piece_index] {
                    self.peer_pieces.set(piece_index, true);
                    let mut tracker = self.ctx.piece_state.lock().unwrap();
                    tracker.picker.register_peer_have(piece_index);
                }
                self.update_interest(socket).await?;
            }
            Message::Request(block) => {
                self.handle_request(block)?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block(socket, piece_index, offset, data.into_owned())
                    .await?;
            }
            Message::Cancel(block) => {
                // the read may already be in flight; dropping the entry
                // makes sure the result is not sent
                self.incoming_requests.remove(&block);
            }
            Message::Extended { id, payload } => {
                self.handle_extended(socket, id, payload).await?;
            }
        }

        Ok(())
    }

    async fn handle_bitfield(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        let piece_count = self.ctx.storage.piece_count;
        // the wire bitfield is padded to a byte boundary with zero bits
        if bitfield.len() < piece_count
            || bitfield.len() - piece_count >= 8
            || bitfield[piece_count..].any()
        {
            log::warn!("Peer {} sent an invalid bitfield", self.addr);
            return Err(PeerError::InvalidBitfield);
        }
        bitfield.truncate(piece_count);

        log::info!(
            "Peer {} has {} pieces",
            self.addr,
            bitfield.count_ones()
        );

        {
            let mut tracker = self.ctx.piece_state.lock().unwrap();
            tracker.picker.register_peer_pieces(&bitfield);
        }
        self.peer_pieces = bitfield;

        self.update_interest(socket).await
    }

    /// Sends (not) interested when the peer's availability and our own
    /// pieces say so.
    async fn update_interest(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let interested = {
            let tracker = self.ctx.piece_state.lock().unwrap();
            let own = tracker.picker.own_pieces();
            self.peer_pieces
                .iter_ones()
                .any(|index| !own[index])
        };

        if interested && !self.state.is_interested {
            self.state.is_interested = true;
            self.send(socket, Message::Interested).await?;
            if !self.state.is_choked {
                self.make_requests(socket).await?;
            }
        } else if !interested && self.state.is_interested {
            self.state.is_interested = false;
            self.send(socket, Message::NotInterested).await?;
        }
        Ok(())
    }

    /// Fills the request pipeline from the torrent's shared piece state.
    async fn make_requests(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        if self.state.is_choked || !self.state.is_interested {
            return Ok(());
        }
        // disk backpressure: while the write queue is above its high
        // watermark, no new requests are issued
        if self
            .ctx
            .request_throttle
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            return Ok(());
        }

        let mut requests = Vec::new();
        {
            let mut tracker = self.ctx.piece_state.lock().unwrap();
            let missing = tracker.picker.missing_piece_count();
            self.state.in_endgame =
                missing <= self.ctx.conf.endgame_threshold;

            let want = self
                .target_request_queue_len
                .saturating_sub(self.outgoing_requests.len());
            tracker.pick_blocks_for_peer(
                self.addr,
                &self.peer_pieces,
                want,
                self.state.in_endgame,
                &mut requests,
            );
        }

        for block in requests {
            // don't resend a request we already have in flight
            if self.outgoing_requests.insert(block) {
                log::trace!("Requesting {} from {}", block, self.addr);
                self.counters.protocol.up.add(17);
                self.send(socket, Message::Request(block)).await?;
            }
        }
        Ok(())
    }

    /// Handles a block delivery: bookkeeping, duplicate-cancellation in
    /// endgame, handing the bytes to the disk task.
    async fn handle_block(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let info = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };

        if !self.outgoing_requests.remove(&info) {
            // a block we didn't ask for (or asked for and then canceled):
            // the bytes are discarded, never written
            log::info!("Peer {} sent unsolicited block {}", self.addr, info);
            self.counters.waste.add(info.len as u64);
            self.misbehavior += 1;
            if self.misbehavior > MAX_MISBEHAVIOR {
                return Err(PeerError::UnsolicitedBlock(info));
            }
            return Ok(());
        }

        self.last_incoming_block_time = Instant::now();

        // consult the shared download state; a duplicate endgame delivery
        // is waste, a fresh one may cancel other peers' in-flight copies
        let (receipt, piece_done) = {
            let mut tracker = self.ctx.piece_state.lock().unwrap();
            tracker.received_block(&info, self.addr)
        };

        match receipt {
            BlockReceipt::Accepted { duplicates_of } => {
                self.counters.payload.down.add(info.len as u64);

                // in endgame the same block may be in flight to other
                // peers; their copies are no longer needed
                for peer in duplicates_of {
                    self.ctx.cmd_tx.send(torrent::Command::CancelRequest {
                        addr: peer,
                        block: info,
                    })?;
                }

                self.ctx.disk_tx.send(disk::Command::WriteBlock {
                    id: self.ctx.id,
                    block_info: info,
                    data,
                })?;

                if piece_done {
                    log::debug!(
                        "Piece {} completed via {}",
                        piece_index,
                        self.addr
                    );
                }
            }
            BlockReceipt::Duplicate | BlockReceipt::Invalid => {
                log::debug!(
                    "Peer {} delivered duplicate or invalid block {}",
                    self.addr,
                    info
                );
                self.counters.waste.add(info.len as u64);
            }
        }

        // the pipeline has a free slot now
        self.make_requests(socket).await
    }

    /// Validates a peer's block request and starts the disk read. The
    /// result arrives back on the command channel.
    fn handle_request(&mut self, block: BlockInfo) -> Result<()> {
        if self.state.is_peer_choked {
            // requests sent while choked are ignored, per the protocol
            log::debug!(
                "Peer {} requested {} while choked",
                self.addr,
                block
            );
            return Ok(());
        }

        // bounds: a valid piece we own, a block within it, sane length
        let piece_len = match self.ctx.storage.piece_len(block.piece_index) {
            Ok(len) => len,
            Err(_) => return Err(PeerError::InvalidMessage),
        };
        let owned = {
            let tracker = self.ctx.piece_state.lock().unwrap();
            tracker.picker.own_pieces()[block.piece_index]
        };
        if !owned
            || block.len == 0
            || block.len > BLOCK_LEN
            || block.offset % BLOCK_LEN != 0
            || block.offset.checked_add(block.len).map(|end| end > piece_len)
                != Some(false)
        {
            log::warn!("Peer {} sent invalid request {}", self.addr, block);
            self.misbehavior += 1;
            if self.misbehavior > MAX_MISBEHAVIOR {
                return Err(PeerError::InvalidMessage);
            }
            return Ok(());
        }

        if self.incoming_requests.insert(block) {
            self.ctx.disk_tx.send(disk::Command::ReadBlock {
                id: self.ctx.id,
                block_info: block,
                result_tx: self.own_tx.clone(),
            })?;
        }
        Ok(())
    }

    /// Sends a block the disk task read for one of the peer's requests,
    /// unless the request was canceled in the meantime.
    async fn serve_block(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        block: Block,
    ) -> Result<()> {
        let info = block.info();
        if !self.incoming_requests.remove(&info) {
            // canceled while the read was in flight
            return Ok(());
        }
        self.counters.payload.up.add(info.len as u64);
        let data = block.data;
        self.send(
            socket,
            Message::Block {
                piece_index: info.piece_index,
                offset: info.offset,
                data,
            },
        )
        .await
    }

    async fn handle_piece_completion(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        index: PieceIndex,
    ) -> Result<()> {
        // our availability changed: announce and possibly lose interest
        self.send(socket, Message::Have { piece_index: index }).await?;
        self.update_interest(socket).await
    }

    async fn apply_choke_decision(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        choked: bool,
    ) -> Result<()> {
        if self.state.is_peer_choked == choked {
            return Ok(());
        }
        self.state.is_peer_choked = choked;
        if choked {
            // in-flight serves are dropped with the queue
            self.incoming_requests.clear();
            self.send(socket, Message::Choke).await
        } else {
            self.send(socket, Message::Unchoke).await
        }
    }

    async fn handle_extended(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        if !self.extension_protocol {
            return Err(PeerError::NoExtensionSupport);
        }
        match id {
            EXT_HANDSHAKE_ID => {
                let theirs = ExtendedHandshake::decode(&payload)?;
                log::debug!(
                    "Peer {} extensions: {:?}",
                    self.addr,
                    theirs.extensions.keys().len()
                );
                self.peer_extensions = Some(theirs);
            }
            // ids here are the ones *we* assigned in our extended
            // handshake, as the peer addresses our extension instances
            UT_METADATA_ID => {
                let msg = MetadataMessage::decode(&payload)?;
                self.handle_metadata_request(socket, msg).await?;
            }
            UT_PEX_ID => {
                let msg = PexMessage::decode(&payload)?;
                if !msg.added.is_empty() {
                    self.ctx.cmd_tx.send(torrent::Command::AvailablePeers {
                        addrs: msg.added,
                        source: PeerSource::Pex,
                    })?;
                }
            }
            _ => {
                log::debug!(
                    "Peer {} sent unknown extended id {}",
                    self.addr,
                    id
                );
            }
        }
        Ok(())
    }

    /// Serves the peer's ut_metadata requests from the raw info bytes, if
    /// the torrent has them (it always does once the download started).
    async fn handle_metadata_request(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        msg: MetadataMessage,
    ) -> Result<()> {
        let piece = match msg {
            MetadataMessage::Request { piece } => piece,
            // a data/reject at this layer is unexpected (the metadata
            // download path has its own sessions) but harmless
            _ => return Ok(()),
        };

        let peer_metadata_id = self
            .peer_extensions
            .as_ref()
            .and_then(|e| e.ut_metadata_id());
        let Some(peer_metadata_id) = peer_metadata_id else {
            return Ok(());
        };

        let reply = match &self.ctx.metadata {
            Some(metadata) => {
                let start = piece as usize * METADATA_PIECE_LEN;
                if start < metadata.len() {
                    let end =
                        (start + METADATA_PIECE_LEN).min(metadata.len());
                    MetadataMessage::Data {
                        piece,
                        total_size: metadata.len() as u32,
                        payload: metadata[start..end].to_vec(),
                    }
                } else {
                    MetadataMessage::Reject { piece }
                }
            }
            None => MetadataMessage::Reject { piece },
        };

        self.send(
            socket,
            Message::Extended {
                id: peer_metadata_id,
                payload: reply.encode(),
            },
        )
        .await
    }

    /// The per-second housekeeping: counters, keep-alives, timeouts,
    /// pipeline adaptation, the state report to the torrent.
    async fn tick(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        self.counters.tick();

        let now = Instant::now();

        if now.duration_since(self.last_incoming_msg_time)
            > INACTIVITY_TIMEOUT
        {
            return Err(PeerError::InactivityTimeout);
        }

        // a silent send channel needs a keep-alive
        if now.duration_since(self.last_outgoing_msg_time)
            > KEEP_ALIVE_INTERVAL
        {
            self.send(socket, Message::KeepAlive).await?;
        }

        // requests that have been in flight too long are considered lost:
        // free them for other peers and shrink the pipeline
        if !self.outgoing_requests.is_empty()
            && !self.state.is_choked
            && now.duration_since(self.last_incoming_block_time)
                > REQUEST_TIMEOUT
        {
            log::info!(
                "Peer {} timed out {} requests",
                self.addr,
                self.outgoing_requests.len()
            );
            self.free_outgoing_requests();
            self.target_request_queue_len =
                self.ctx.conf.min_request_queue_len;
        }

        // adapt the pipeline to the observed download rate: keep roughly
        // one second's worth of blocks in flight
        let rate = self.counters.payload.down.avg();
        let target = (rate / BLOCK_LEN as u64) as usize;
        self.target_request_queue_len = target.clamp(
            self.ctx.conf.min_request_queue_len,
            self.ctx.conf.max_request_queue_len,
        );

        self.ctx.cmd_tx.send(torrent::Command::PeerState {
            addr: self.addr,
            info: SessionTick {
                state: self.state,
                counters: self.counters.snapshot(),
                piece_count: self.peer_pieces.count_ones(),
            },
        })?;

        // top the pipeline back up
        self.make_requests(socket).await
    }

    /// Returns all blocks in flight to this peer to the shared free pool.
    fn free_outgoing_requests(&mut self) {
        if self.outgoing_requests.is_empty() {
            return;
        }
        let mut tracker = self.ctx.piece_state.lock().unwrap();
        tracker.cancel_peer(self.addr);
        self.outgoing_requests.clear();
    }

    /// Cleans up the session's shared state on the way out. Runs for every
    /// exit path, successful or not.
    async fn shutdown(&mut self) {
        self.state.connection = ConnectionState::Disconnecting;

        self.free_outgoing_requests();
        {
            let mut tracker = self.ctx.piece_state.lock().unwrap();
            tracker.picker.unregister_peer_pieces(&self.peer_pieces);
        }

        let _ = self.ctx.cmd_tx.send(torrent::Command::PeerDisconnected {
            addr: self.addr,
        });
        self.state.connection = ConnectionState::Disconnected;
    }
}
