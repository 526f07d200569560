//! The front door of the library: takes a parsed metainfo, announces to the
//! tracker, and drives the download to completion.

use rand::Rng;

use crate::{
    conf::{Conf, LEECHBIT_CLIENT_PREFIX},
    error::{Error, Result},
    metainfo::Metainfo,
    storage_info::StorageInfo,
    torrent::Torrent,
    tracker, PeerId,
};

/// Generates our peer id: the 8 byte client prefix followed by 12 random
/// ASCII digits, per the common client id convention.
pub fn generate_peer_id() -> PeerId {
    let mut peer_id = [0; 20];
    peer_id[..8].copy_from_slice(LEECHBIT_CLIENT_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in peer_id[8..].iter_mut() {
        *byte = rng.gen_range(b'0'..=b'9');
    }
    peer_id
}

/// Downloads the torrent described by the metainfo and writes its payload
/// into the configured download directory.
pub async fn download(conf: Conf, metainfo: Metainfo) -> Result<()> {
    if !metainfo.is_single_file() {
        return Err(Error::MultiFileTorrent);
    }

    let info_hash = metainfo.create_info_hash()?;
    let storage = StorageInfo::new(&metainfo, conf.download_dir.clone())?;
    let piece_hashes = metainfo.piece_hashes();

    log::info!("Torrent: {}", metainfo.info.name);
    log::info!("  announce url: {}", metainfo.announce);
    log::info!("  info hash: {}", hex::encode(&info_hash));
    log::info!("  piece length: {}", human_size(storage.piece_len as u64));
    log::info!("  pieces: {}", storage.piece_count);
    log::info!("  total size: {}", human_size(storage.download_len));

    let peer_id = generate_peer_id();
    let peers = tracker::announce(
        &metainfo.announce,
        &info_hash,
        &peer_id,
        conf.listen_port,
        storage.download_len,
    )
    .await?;
    if peers.is_empty() {
        return Err(Error::Tracker("no peers in the swarm".to_string()));
    }

    let torrent =
        Torrent::new(conf, storage, piece_hashes, info_hash, peer_id, peers);
    torrent.start().await
}

/// Renders a byte count with a binary unit, for log lines.
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
