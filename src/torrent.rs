//! The download coordinator: owns the block table, hands out work to peer
//! sessions through a bounded request queue, consumes the blocks they
//! deliver, verifies finished pieces, and finally assembles the output file.

use std::{io, net::SocketAddr, sync::Arc, time::Instant};

use futures::{pin_mut, select, FutureExt};
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task,
    time::delay_for,
};

use crate::{
    block::{self, Block, BlockStatus},
    conf::Conf,
    error::{Error, Result},
    peer::{wait_complete, DownloadedBlock, PeerSession, RequestQueue},
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    BlockInfo, PeerId, PieceIndex, Sha1Hash, BLOCK_LEN,
};

/// A single download, driven from construction to the written file.
///
/// The torrent spawns one session per peer (up to the configured cap) and
/// two coordinator tasks: the request producer, which keeps the shared
/// request queue topped up with the rarest not yet downloaded blocks, and
/// the consumer, which drains delivered blocks into the block table and
/// raises the completion flag once the last piece verifies.
pub struct Torrent {
    conf: Conf,
    storage: StorageInfo,
    piece_hashes: Vec<Sha1Hash>,
    info_hash: Sha1Hash,
    client_id: PeerId,
    peers: Vec<SocketAddr>,
}

impl Torrent {
    pub fn new(
        conf: Conf,
        storage: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
        info_hash: Sha1Hash,
        client_id: PeerId,
        peers: Vec<SocketAddr>,
    ) -> Self {
        debug_assert_eq!(piece_hashes.len(), storage.piece_count);
        Self {
            conf,
            storage,
            piece_hashes,
            info_hash,
            client_id,
            peers,
        }
    }

    /// Runs the download to completion and writes the output file.
    ///
    /// Only two failures can surface here: every peer session giving up (the
    /// queues close), and the must-not-happen case of the completion flag
    /// rising with blocks still missing. Individual peer failures are
    /// absorbed by the sessions' reconnect loops.
    pub async fn start(&self) -> Result<()> {
        log::info!(
            "Starting download of {} bytes from up to {} peers",
            self.storage.download_len,
            self.peers.len()
        );

        let block_size = std::cmp::min(BLOCK_LEN, self.storage.piece_len);
        let state = Arc::new(Mutex::new(DownloadState::new(
            self.storage.clone(),
            self.piece_hashes.clone(),
            block_size,
        )));
        let piece_picker = Arc::new(PiecePicker::new(self.storage.piece_count));

        let (request_chan, request_port) =
            mpsc::channel(self.conf.queue_capacity);
        let request_port: RequestQueue = Arc::new(Mutex::new(request_port));
        let (downloaded_chan, downloaded_port) =
            mpsc::channel(self.conf.queue_capacity);
        let (complete_chan, complete_port) = watch::channel(false);

        // spawn a session for a random sample of the available peers
        let mut addrs = self.peers.clone();
        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(self.conf.max_sessions);

        let mut sessions = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let mut session = PeerSession::outbound(
                addr,
                self.info_hash,
                self.client_id,
                self.conf.clone(),
                Arc::clone(&piece_picker),
                Arc::clone(&request_port),
                downloaded_chan.clone(),
                complete_port.clone(),
            );
            sessions.push(tokio::spawn(async move {
                if let Err(e) = session.start().await {
                    log::debug!("Peer {} session gave up: {}", addr, e);
                }
            }));
        }
        // the clones moved into the sessions are the only senders that
        // should keep the consume queue open
        drop(downloaded_chan);

        let producer = run_producer(
            Arc::clone(&state),
            Arc::clone(&piece_picker),
            request_chan,
            complete_port.clone(),
            self.conf.clone(),
        )
        .fuse();
        let consumer = run_consumer(
            Arc::clone(&state),
            downloaded_port,
            complete_chan,
            self.conf.clone(),
        )
        .fuse();
        pin_mut!(producer, consumer);
        select! {
            res = consumer => res?,
            res = producer => res?,
        }

        // sessions observe the completion flag; let them close their sockets
        // before we touch the disk
        for session in sessions {
            let _ = session.await;
        }

        self.assemble(&state).await
    }

    /// Concatenates the downloaded blocks in `(piece, offset)` order and
    /// writes them to the output path in one go.
    async fn assemble(&self, state: &Mutex<DownloadState>) -> Result<()> {
        let payload = {
            let state = state.lock().await;
            state.assemble()?
        };

        let path = self.storage.output_path.clone();
        log::info!("Writing {} bytes to {:?}", payload.len(), path);
        task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &payload)
        })
        .await
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))??;

        log::info!("Download finished: {:?}", self.storage.output_path);
        Ok(())
    }
}

/// Keeps the request queue topped up with blocks that still need to be
/// downloaded, rarest pieces first, until the download completes.
async fn run_producer(
    state: Arc<Mutex<DownloadState>>,
    piece_picker: Arc<PiecePicker>,
    mut request_chan: mpsc::Sender<BlockInfo>,
    mut complete_port: watch::Receiver<bool>,
    conf: Conf,
) -> Result<()> {
    loop {
        if *complete_port.borrow() {
            return Ok(());
        }

        let batch = {
            let mut state = state.lock().await;
            state.take_request_batch(
                conf.request_batch,
                conf.request_timeout,
                &piece_picker,
            )
        };

        for block in batch {
            // a full queue applies backpressure right here; completion
            // cancels the wait
            let send = request_chan.send(block).fuse();
            let complete = wait_complete(&mut complete_port).fuse();
            pin_mut!(send, complete);
            select! {
                res = send => res.map_err(|_| Error::ChannelClosed)?,
                _ = complete => return Ok(()),
            }
        }

        delay_for(conf.cooperative_sleep).await;
    }
}

/// Drains delivered blocks into the block table in small batches, reports
/// progress, and raises the completion flag once every piece has verified.
async fn run_consumer(
    state: Arc<Mutex<DownloadState>>,
    mut downloaded_port: mpsc::Receiver<DownloadedBlock>,
    complete_chan: watch::Sender<bool>,
    conf: Conf,
) -> Result<()> {
    let mut batch = Vec::with_capacity(conf.consume_batch);
    loop {
        // one blocking receive, then drain whatever else is already waiting
        match downloaded_port.recv().await {
            Some(block) => batch.push(block),
            None => return Err(Error::ChannelClosed),
        }
        while batch.len() < conf.consume_batch {
            match downloaded_port.try_recv() {
                Ok(block) => batch.push(block),
                Err(_) => break,
            }
        }

        let (downloaded, total, complete) = {
            let mut state = state.lock().await;
            for (info, data, addr) in batch.drain(..) {
                match state.deliver(info, data) {
                    Delivery::Accepted => {
                        log::debug!(
                            "Downloaded block {:?} from peer {}",
                            info,
                            addr
                        );
                    }
                    Delivery::PieceVerified(index) => {
                        log::info!("Piece {} downloaded and verified", index);
                    }
                    Delivery::PieceRejected(index) => {
                        log::warn!(
                            "Piece {} failed its hash check, downloading it \
                             again",
                            index
                        );
                    }
                    Delivery::Duplicate => {
                        log::trace!(
                            "Discarding duplicate block {:?} from peer {}",
                            info,
                            addr
                        );
                    }
                    Delivery::Unknown => {
                        log::warn!(
                            "Discarding unsolicited block {:?} from peer {}",
                            info,
                            addr
                        );
                    }
                }
            }
            let (downloaded, total) = state.progress();
            (downloaded, total, state.is_complete())
        };

        log::info!(
            "Downloaded {}/{} bytes ({:.1}%)",
            downloaded,
            total,
            downloaded as f64 / total as f64 * 100.0
        );

        if complete {
            log::info!("All pieces downloaded and verified");
            complete_chan
                .broadcast(true)
                .map_err(|_| Error::ChannelClosed)?;
            return Ok(());
        }
    }
}

/// What happened to a block handed to [`DownloadState::deliver`].
#[derive(Debug, PartialEq)]
enum Delivery {
    /// The block was accepted; its piece is not yet complete.
    Accepted,
    /// The block completed its piece and the piece's hash checked out.
    PieceVerified(PieceIndex),
    /// The block completed its piece but the hash was wrong; the piece was
    /// reset to be downloaded again.
    PieceRejected(PieceIndex),
    /// The block had already been downloaded; the payload is discarded.
    Duplicate,
    /// The block matches no block of this torrent.
    Unknown,
}

/// The mutable heart of the coordinator: the flat block table and the
/// per-piece bookkeeping derived from it.
///
/// Blocks are stored in `(piece index, offset)` order, which makes locating
/// a block arithmetic and the final assembly a plain concatenation.
struct DownloadState {
    blocks: Vec<Block>,
    /// The length blocks are cut by; 16 KiB clamped down to the piece
    /// length for tiny torrents.
    block_size: u32,
    /// The number of blocks in every piece except possibly the last.
    blocks_per_piece: usize,
    /// Per piece, how many of its blocks are still missing.
    missing_in_piece: Vec<usize>,
    piece_hashes: Vec<Sha1Hash>,
    storage: StorageInfo,
    downloaded_bytes: u64,
    verified_pieces: usize,
}

impl DownloadState {
    fn new(
        storage: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
        block_size: u32,
    ) -> Self {
        let blocks = block::partition(&storage, block_size);
        let blocks_per_piece =
            ((storage.piece_len + block_size - 1) / block_size) as usize;

        let mut missing_in_piece = vec![0; storage.piece_count];
        for block in &blocks {
            missing_in_piece[block.info.piece_index] += 1;
        }

        Self {
            blocks,
            block_size,
            blocks_per_piece,
            missing_in_piece,
            piece_hashes,
            storage,
            downloaded_bytes: 0,
            verified_pieces: 0,
        }
    }

    /// Locates a delivered block in the table. Anything that doesn't line up
    /// exactly with a block we cut ourselves is rejected.
    fn block_index(&self, info: &BlockInfo) -> Option<usize> {
        if info.piece_index >= self.storage.piece_count {
            return None;
        }
        if info.offset % self.block_size != 0 {
            return None;
        }
        let index = info.piece_index * self.blocks_per_piece
            + (info.offset / self.block_size) as usize;
        let block = self.blocks.get(index)?;
        if &block.info != info {
            return None;
        }
        Some(index)
    }

    /// Records a delivered block.
    ///
    /// Re-deliveries of an already downloaded block are discarded, so it
    /// doesn't matter how many sessions requested it. When the last block of
    /// a piece lands the piece is hashed; a mismatch throws the whole piece
    /// back into the not-requested pool.
    fn deliver(&mut self, info: BlockInfo, data: Vec<u8>) -> Delivery {
        let index = match self.block_index(&info) {
            Some(index) => index,
            None => return Delivery::Unknown,
        };

        let block = &mut self.blocks[index];
        if block.status == BlockStatus::Downloaded {
            return Delivery::Duplicate;
        }
        block.status = BlockStatus::Downloaded;
        block.data = data;
        block.requested_at = None;
        self.downloaded_bytes += info.len as u64;

        let piece_index = info.piece_index;
        self.missing_in_piece[piece_index] -= 1;
        if self.missing_in_piece[piece_index] > 0 {
            return Delivery::Accepted;
        }

        if self.verify_piece(piece_index) {
            self.verified_pieces += 1;
            Delivery::PieceVerified(piece_index)
        } else {
            self.reset_piece(piece_index);
            Delivery::PieceRejected(piece_index)
        }
    }

    /// Picks up to `count` blocks to hand to the request queue: everything
    /// not yet requested, plus requested blocks whose delivery is overdue,
    /// ordered rarest piece first. Picked blocks are marked requested.
    fn take_request_batch(
        &mut self,
        count: usize,
        request_timeout: std::time::Duration,
        piece_picker: &PiecePicker,
    ) -> Vec<BlockInfo> {
        let now = Instant::now();
        let mut candidates: Vec<BlockInfo> = self
            .blocks
            .iter()
            .filter(|block| match block.status {
                BlockStatus::NotRequested => true,
                // a requested block whose peer silently vanished is handed
                // out again
                BlockStatus::Requested => block
                    .requested_at
                    .map(|at| now.duration_since(at) >= request_timeout)
                    .unwrap_or(true),
                BlockStatus::Downloaded => false,
            })
            .map(|block| block.info)
            .collect();

        piece_picker.order_rarest_first(&mut candidates);
        candidates.truncate(count);

        for info in &candidates {
            if let Some(index) = self.block_index(info) {
                let block = &mut self.blocks[index];
                block.status = BlockStatus::Requested;
                block.requested_at = Some(now);
            }
        }

        candidates
    }

    fn progress(&self) -> (u64, u64) {
        (self.downloaded_bytes, self.storage.download_len)
    }

    fn is_complete(&self) -> bool {
        self.verified_pieces == self.storage.piece_count
    }

    /// The range of the piece's blocks in the table.
    fn piece_blocks(&self, piece_index: PieceIndex) -> std::ops::Range<usize> {
        let start = piece_index * self.blocks_per_piece;
        let piece_len = if piece_index == self.storage.piece_count - 1 {
            self.storage.last_piece_len
        } else {
            self.storage.piece_len
        };
        let count =
            ((piece_len + self.block_size - 1) / self.block_size) as usize;
        start..start + count
    }

    fn verify_piece(&self, piece_index: PieceIndex) -> bool {
        let mut hasher = Sha1::new();
        for block in &self.blocks[self.piece_blocks(piece_index)] {
            hasher.update(&block.data);
        }
        let digest = hasher.finalize();
        digest.as_slice() == &self.piece_hashes[piece_index][..]
    }

    /// Returns a rejected piece's blocks to the not-requested pool.
    fn reset_piece(&mut self, piece_index: PieceIndex) {
        let range = self.piece_blocks(piece_index);
        self.missing_in_piece[piece_index] = range.len();
        for block in &mut self.blocks[range] {
            block.status = BlockStatus::NotRequested;
            block.data = Vec::new();
            block.requested_at = None;
            self.downloaded_bytes -= block.info.len as u64;
        }
    }

    /// Concatenates all block payloads into the final file contents.
    ///
    /// By the time this is called every block must have been downloaded;
    /// anything else is a coordinator bug and nothing is written.
    fn assemble(&self) -> Result<Vec<u8>> {
        let missing = self
            .blocks
            .iter()
            .filter(|block| block.status != BlockStatus::Downloaded)
            .count();
        if missing > 0 {
            return Err(Error::IncompleteDownload { missing });
        }

        // the table is already in (piece, offset) order
        let mut payload = Vec::with_capacity(self.storage.download_len as usize);
        for block in &self.blocks {
            payload.extend_from_slice(&block.data);
        }
        Ok(payload)
    }
}
