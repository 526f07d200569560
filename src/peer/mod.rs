pub(crate) mod codec;

use std::{net::SocketAddr, sync::Arc};

use futures::{
    pin_mut, select,
    stream::{SplitSink, SplitStream},
    FutureExt, SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, Mutex},
    time::{delay_for, timeout},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    conf::Conf,
    error::{Error, Result},
    piece_picker::PiecePicker,
    Bitfield, BlockInfo, PeerId, Sha1Hash,
};
use codec::*;

/// The channel on which peer sessions pull block requests from the request
/// producer. There is one receiver, shared by every session.
pub(crate) type RequestQueue = Arc<Mutex<mpsc::Receiver<BlockInfo>>>;

/// A block that arrived on the wire, tagged with the address of the peer that
/// served it.
pub(crate) type DownloadedBlock = (BlockInfo, Vec<u8>, SocketAddr);

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This is the normal state of a peer session, in which any message,
    /// apart from the handshake, may be exchanged.
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The status of a peer session.
///
/// We start off choked and uninterested, per the protocol; interest is
/// declared immediately after a successful handshake.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't serve our requests. We keep sending
    /// them anyway; the blocks simply never arrive and are re-requested
    /// elsewhere once they go stale.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
        }
    }
}

/// A connection with a single remote peer, driven for the whole lifetime of
/// the download.
///
/// The session connects, handshakes, and then runs two concurrent pumps: one
/// pulling block descriptors off the shared request queue and sending
/// REQUEST messages, the other dispatching everything the peer sends back,
/// forwarding downloaded blocks to the coordinator. Every network error is
/// local to the session: the connection is dropped and, after a fixed
/// backoff, re-established, until the download completes.
pub(crate) struct PeerSession {
    /// The remote address of the peer.
    addr: SocketAddr,
    info_hash: Sha1Hash,
    /// Our own id, sent in the handshake.
    client_id: PeerId,
    conf: Conf,
    /// The piece availability counters shared by all sessions.
    piece_picker: Arc<PiecePicker>,
    /// Where block requests are pulled from.
    request_queue: RequestQueue,
    /// Where downloaded blocks are pushed for the coordinator to consume.
    downloaded_chan: mpsc::Sender<DownloadedBlock>,
    /// Signals that every block of the torrent has been downloaded and the
    /// session should wind down.
    complete_port: watch::Receiver<bool>,
    /// Session related information.
    status: Status,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    #[allow(clippy::too_many_arguments)]
    pub fn outbound(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
        conf: Conf,
        piece_picker: Arc<PiecePicker>,
        request_queue: RequestQueue,
        downloaded_chan: mpsc::Sender<DownloadedBlock>,
        complete_port: watch::Receiver<bool>,
    ) -> Self {
        Self {
            addr,
            info_hash,
            client_id,
            conf,
            piece_picker,
            request_queue,
            downloaded_chan,
            complete_port,
            status: Status::default(),
        }
    }

    /// Drives the session until the download completes.
    ///
    /// Connection, handshake, and mid-session failures all loop back here
    /// for another attempt after the reconnect backoff; a peer that turns
    /// out to serve a different torrent is the one failure not worth
    /// retrying.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting peer {} session", self.addr);
        loop {
            let addr = self.addr;
            let mut complete_port = self.complete_port.clone();

            let outcome = {
                let session = self.connect_and_run().fuse();
                let complete = wait_complete(&mut complete_port).fuse();
                pin_mut!(session, complete);
                select! {
                    res = session => Some(res),
                    _ = complete => None,
                }
            };

            match outcome {
                // the download finished while we were talking to the peer
                None => return Ok(()),
                Some(Err(Error::InvalidPeerInfoHash)) => {
                    log::warn!(
                        "Peer {} serves a different torrent, giving up on it",
                        addr
                    );
                    return Err(Error::InvalidPeerInfoHash);
                }
                Some(Err(e)) => {
                    log::debug!("Peer {} session error: {}", addr, e);
                }
                Some(Ok(())) => {}
            }

            self.status = Status::default();
            log::debug!(
                "Reconnecting to peer {} in {:?}",
                addr,
                self.conf.reconnect_backoff
            );

            let mut complete_port = self.complete_port.clone();
            let backoff = delay_for(self.conf.reconnect_backoff).fuse();
            let complete = wait_complete(&mut complete_port).fuse();
            pin_mut!(backoff, complete);
            select! {
                _ = backoff => {}
                _ = complete => return Ok(()),
            }
        }
    }

    /// Performs a single connection attempt: TCP connect, handshake
    /// exchange, codec switch, and then the message pumps. Only returns on
    /// failure; completion cancels this future from the outside.
    async fn connect_and_run(&mut self) -> Result<()> {
        log::debug!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = timeout(
            self.conf.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await??;
        log::debug!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.status.state = State::Handshaking;
        let handshake = Handshake::new(self.info_hash, self.client_id);
        timeout(self.conf.io_timeout, socket.send(handshake)).await??;

        let peer_handshake =
            match timeout(self.conf.io_timeout, socket.next()).await? {
                Some(handshake) => handshake?,
                None => return Err(Error::PeerDisconnected),
            };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        // codec should only return a handshake if the protocol string in it
        // is valid
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        // verify that the advertised torrent info hash is the same as ours;
        // the remote peer id is accepted as-is
        if peer_handshake.info_hash != self.info_hash {
            return Err(Error::InvalidPeerInfoHash);
        }
        log::info!("Handshake with peer {} successful", self.addr);

        // now that we have the handshake, we need to switch to the peer
        // message codec, keeping any bytes the peer has already sent after
        // its handshake (its bitfield is usually in flight by now)
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.run(socket).await
    }

    /// Runs the session after the handshake: declares our interest, then
    /// races the request pump against the reply pump. Either pump failing
    /// cancels its sibling, which closes the connection.
    async fn run(
        &mut self,
        mut socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        // we only download, so we are interested in every peer right away
        timeout(self.conf.io_timeout, socket.send(Message::Interested))
            .await??;
        self.status.is_interested = true;
        self.status.state = State::Connected;
        log::debug!(
            "Peer {} session state: {:?}, interested: {}",
            self.addr,
            self.status.state,
            self.status.is_interested
        );

        // split the connection so the pumps can run concurrently
        let (sink, stream) = socket.split();

        let addr = self.addr;
        let conf = self.conf.clone();
        let request_queue = Arc::clone(&self.request_queue);
        let request_pump = request_pump(sink, request_queue, addr, conf).fuse();
        let reply_pump = self.reply_pump(stream).fuse();
        pin_mut!(request_pump, reply_pump);

        select! {
            res = request_pump => res,
            res = reply_pump => res,
        }
    }

    /// Reads and dispatches messages until the peer stops talking.
    async fn reply_pump(
        &mut self,
        mut stream: SplitStream<Framed<TcpStream, PeerCodec>>,
    ) -> Result<()> {
        loop {
            let msg = match timeout(self.conf.io_timeout, stream.next())
                .await?
            {
                Some(msg) => msg?,
                None => return Err(Error::PeerDisconnected),
            };
            if let Some(id) = msg.id() {
                log::trace!(
                    "Received message {:?} from peer {}",
                    id,
                    self.addr
                );
            }
            self.handle_msg(msg).await?;
        }
    }

    async fn handle_msg(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.status.is_choked {
                    log::debug!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::debug!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                }
            }
            Message::Interested | Message::NotInterested => {
                // we don't serve blocks, so the peer's interest in us is
                // irrelevant
            }
            Message::Have { piece_index } => {
                self.piece_picker.register_have(piece_index);
            }
            Message::Bitfield(bitfield) => {
                self.handle_bitfield_msg(bitfield)?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                log::trace!(
                    "Received block {:?} from peer {}",
                    block,
                    self.addr
                );
                self.downloaded_chan
                    .send((block, data, self.addr))
                    .await
                    .map_err(|_| Error::ChannelClosed)?;
            }
            Message::Request(block) => {
                log::debug!(
                    "Peer {} requested block {:?}, but we don't upload",
                    self.addr,
                    block
                );
            }
            Message::Cancel(_) | Message::Port(_) => {}
        }
        Ok(())
    }

    /// Registers the peer's piece availability.
    ///
    /// A bitfield normally arrives as the first message after the handshake,
    /// but it is accepted at any point. Its raw data may be longer than the
    /// number of pieces it represents, if the piece count is not a multiple
    /// of 8, so the padding is sliced off before counting; a bitfield too
    /// short to cover the torrent is a protocol violation.
    fn handle_bitfield_msg(&mut self, mut bitfield: Bitfield) -> Result<()> {
        let piece_count = self.piece_picker.piece_count();
        if bitfield.len() < piece_count {
            log::warn!(
                "Peer {} sent bitfield shorter than {} pieces",
                self.addr,
                piece_count
            );
            return Err(Error::InvalidBitfield);
        }
        bitfield.resize(piece_count, false);
        self.piece_picker.register_bitfield(&bitfield);
        log::debug!(
            "Peer {} has {}/{} pieces",
            self.addr,
            bitfield.count_ones(),
            piece_count
        );
        Ok(())
    }
}

/// Feeds the peer from the shared request queue.
///
/// Requests are sent regardless of whether the peer has choked us; a choked
/// peer simply never answers and the blocks are handed out again once their
/// requests go stale.
async fn request_pump(
    mut sink: SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    request_queue: RequestQueue,
    addr: SocketAddr,
    conf: Conf,
) -> Result<()> {
    loop {
        // only one session at a time may wait on the shared queue; the lock
        // is released while the request is on the wire
        let block = {
            let mut queue = request_queue.lock().await;
            queue.recv().await
        };
        let block = block.ok_or(Error::ChannelClosed)?;

        log::trace!("Requesting block {:?} from peer {}", block, addr);
        timeout(conf.io_timeout, sink.send(Message::Request(block)))
            .await??;

        // brief yield so a single fast session doesn't drain the whole queue
        delay_for(conf.cooperative_sleep).await;
    }
}

/// Resolves once the download complete flag is raised. The coordinator going
/// away entirely closes the channel, which counts too.
pub(crate) async fn wait_complete(complete_port: &mut watch::Receiver<bool>) {
    while let Some(complete) = complete_port.recv().await {
        if complete {
            return;
        }
    }
}
