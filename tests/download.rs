//! End-to-end download tests against scripted in-process seeds.
//!
//! The seeds speak just enough of the peer protocol to serve a leech: they
//! accept the handshake, advertise every piece, unchoke on interest, and
//! answer each request with a deterministic payload in which every byte is
//! its absolute offset in the download modulo 256.

use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use leechbit::{
    conf::Conf, storage_info::StorageInfo, torrent::Torrent, PeerId, Sha1Hash,
};

const INFO_HASH: Sha1Hash = [0x42; 20];
const CLIENT_ID: PeerId = *b"-lb0001-012345678901";

// two 16 KiB blocks per full piece, plus a short last piece
const PIECE_LEN: u32 = 32768;
const LAST_PIECE_LEN: u32 = 5000;
const PIECE_COUNT: usize = 3;
const DOWNLOAD_LEN: u64 =
    (PIECE_COUNT as u64 - 1) * PIECE_LEN as u64 + LAST_PIECE_LEN as u64;

fn payload_byte(offset: u64) -> u8 {
    (offset % 256) as u8
}

fn piece_hashes() -> Vec<Sha1Hash> {
    (0..PIECE_COUNT)
        .map(|index| {
            let start = index as u64 * PIECE_LEN as u64;
            let end = std::cmp::min(start + PIECE_LEN as u64, DOWNLOAD_LEN);
            let piece: Vec<u8> = (start..end).map(payload_byte).collect();
            let mut hash = [0; 20];
            hash.copy_from_slice(&Sha1::digest(&piece));
            hash
        })
        .collect()
}

fn test_storage(output_path: std::path::PathBuf) -> StorageInfo {
    StorageInfo {
        piece_count: PIECE_COUNT,
        piece_len: PIECE_LEN,
        last_piece_len: LAST_PIECE_LEN,
        download_len: DOWNLOAD_LEN,
        output_path,
    }
}

fn test_conf(download_dir: &std::path::Path) -> Conf {
    let mut conf = Conf::new(download_dir);
    conf.cooperative_sleep = Duration::from_millis(1);
    conf
}

/// Accepts connections forever, serving each like a well-behaved seed.
/// When `corrupt_first_block` is set, the very first block served comes
/// back with flipped bytes, which must make the client reject the piece
/// and download it again.
async fn run_seed(mut listener: TcpListener, corrupt_first_block: bool) {
    loop {
        let (socket, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        tokio::spawn(serve_peer(socket, corrupt_first_block));
    }
}

async fn serve_peer(mut socket: TcpStream, mut corrupt_next_block: bool) {
    // handshake exchange; we expect the leech to go first
    let mut handshake = [0u8; 68];
    if socket.read_exact(&mut handshake).await.is_err() {
        return;
    }
    assert_eq!(handshake[0], 19);
    assert_eq!(&handshake[1..20], b"BitTorrent protocol");
    assert_eq!(&handshake[28..48], &INFO_HASH);

    let mut reply = Vec::with_capacity(68);
    reply.push(19);
    reply.extend_from_slice(b"BitTorrent protocol");
    reply.extend_from_slice(&[0u8; 8]);
    reply.extend_from_slice(&INFO_HASH);
    reply.extend_from_slice(b"-sd0001-999999999999");
    if socket.write_all(&reply).await.is_err() {
        return;
    }

    // a full bitfield; the padding bits in the last byte are deliberately
    // set, which the leech must tolerate
    let bitfield_len = (PIECE_COUNT + 7) / 8;
    let mut bitfield = Vec::new();
    bitfield.extend_from_slice(&(1 + bitfield_len as u32).to_be_bytes());
    bitfield.push(5);
    bitfield.extend_from_slice(&vec![0xff; bitfield_len]);
    if socket.write_all(&bitfield).await.is_err() {
        return;
    }

    loop {
        let mut prefix = [0u8; 4];
        if socket.read_exact(&mut prefix).await.is_err() {
            return;
        }
        let len = u32::from_be_bytes(prefix) as usize;
        if len == 0 {
            // keep-alive
            continue;
        }
        let mut payload = vec![0u8; len];
        if socket.read_exact(&mut payload).await.is_err() {
            return;
        }

        match payload[0] {
            // interested: unchoke the leech
            2 => {
                if socket.write_all(&[0, 0, 0, 1, 1]).await.is_err() {
                    return;
                }
            }
            // request: serve the deterministic payload
            6 => {
                let index = u32::from_be_bytes([
                    payload[1], payload[2], payload[3], payload[4],
                ]);
                let begin = u32::from_be_bytes([
                    payload[5], payload[6], payload[7], payload[8],
                ]);
                let length = u32::from_be_bytes([
                    payload[9], payload[10], payload[11], payload[12],
                ]);

                let start = index as u64 * PIECE_LEN as u64 + begin as u64;
                let mut data: Vec<u8> = (start..start + length as u64)
                    .map(payload_byte)
                    .collect();
                if corrupt_next_block {
                    corrupt_next_block = false;
                    for byte in &mut data {
                        *byte = !*byte;
                    }
                }

                let mut frame = Vec::with_capacity(13 + data.len());
                frame.extend_from_slice(&(9 + length).to_be_bytes());
                frame.push(7);
                frame.extend_from_slice(&payload[1..9]);
                frame.extend_from_slice(&data);
                if socket.write_all(&frame).await.is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}

fn loopback() -> std::net::SocketAddr {
    ([127, 0, 0, 1], 0).into()
}

async fn spawn_seeds(
    count: usize,
    corrupt_first_block: bool,
) -> Vec<std::net::SocketAddr> {
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        addrs.push(listener.local_addr().unwrap());
        tokio::spawn(run_seed(listener, corrupt_first_block));
    }
    addrs
}

fn assert_payload_on_disk(path: &std::path::Path) {
    let written = std::fs::read(path).unwrap();
    assert_eq!(written.len() as u64, DOWNLOAD_LEN);
    for (offset, byte) in written.iter().enumerate() {
        assert_eq!(
            *byte,
            payload_byte(offset as u64),
            "wrong byte at offset {}",
            offset
        );
    }
}

#[tokio::test]
async fn test_download_from_two_seeds() {
    let _ = env_logger::builder().is_test(true).try_init();

    let peers = spawn_seeds(2, false).await;

    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("payload.bin");
    let torrent = Torrent::new(
        test_conf(dir.path()),
        test_storage(output_path.clone()),
        piece_hashes(),
        INFO_HASH,
        CLIENT_ID,
        peers,
    );

    torrent.start().await.unwrap();

    assert_payload_on_disk(&output_path);
}

#[tokio::test]
async fn test_download_survives_a_dead_peer() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut peers = spawn_seeds(1, false).await;
    // a peer that refuses connections: its session must not stall the
    // download
    let dead = TcpListener::bind(loopback()).await.unwrap();
    peers.push(dead.local_addr().unwrap());
    drop(dead);

    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("payload.bin");
    let torrent = Torrent::new(
        test_conf(dir.path()),
        test_storage(output_path.clone()),
        piece_hashes(),
        INFO_HASH,
        CLIENT_ID,
        peers,
    );

    torrent.start().await.unwrap();

    assert_payload_on_disk(&output_path);
}

#[tokio::test]
async fn test_corrupt_piece_is_downloaded_again() {
    let _ = env_logger::builder().is_test(true).try_init();

    // a single seed whose first served block is garbage: the affected piece
    // must fail verification, be thrown back into the pool, and complete on
    // the second attempt
    let peers = spawn_seeds(1, true).await;

    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("payload.bin");
    let torrent = Torrent::new(
        test_conf(dir.path()),
        test_storage(output_path.clone()),
        piece_hashes(),
        INFO_HASH,
        CLIENT_ID,
        peers,
    );

    torrent.start().await.unwrap();

    assert_payload_on_disk(&output_path);
}
