//! The HTTP tracker announce: one GET with the torrent and transfer
//! parameters, answered by a bencoded dictionary carrying the swarm's peers
//! in either the compact byte-string or the dictionary list model.

use std::net::{Ipv4Addr, SocketAddr};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;
use url::Url;

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// Announces our presence to the tracker and returns the peers it knows
/// about.
///
/// The binary `info_hash` and `peer_id` parameters are percent-encoded by
/// hand since they are raw bytes, not UTF-8. We always announce a started
/// event with nothing uploaded or downloaded: the engine runs a fresh leech
/// every time and keeps no state between runs.
pub async fn announce(
    announce_url: &str,
    info_hash: &Sha1Hash,
    peer_id: &PeerId,
    port: u16,
    left: u64,
) -> Result<Vec<SocketAddr>> {
    let mut url = Url::parse(announce_url)?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}\
         &compact=1&event=started",
        percent_encode(info_hash, NON_ALPHANUMERIC),
        percent_encode(peer_id, NON_ALPHANUMERIC),
        port,
        left,
    );
    let query = match url.query() {
        Some(existing) => format!("{}&{}", existing, query),
        None => query,
    };
    url.set_query(Some(&query));

    log::info!("Announcing to tracker {}", announce_url);
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        return Err(Error::Tracker(format!(
            "announce failed with HTTP {}",
            response.status()
        )));
    }
    let body = response.bytes().await?;

    parse_response(&body)
}

fn parse_response(body: &[u8]) -> Result<Vec<SocketAddr>> {
    let response: TrackerResponse = serde_bencode::from_bytes(body)?;

    if let Some(reason) = response.failure_reason {
        return Err(Error::Tracker(reason));
    }
    if let Some(interval) = response.interval {
        log::debug!("Tracker suggests an announce interval of {}s", interval);
    }

    let peers = match response.peers {
        // compact model: 6 bytes per peer, 4 for the IPv4 address and 2 for
        // the port, both big endian
        Some(PeerList::Compact(buf)) => {
            if buf.len() % 6 != 0 {
                return Err(Error::Tracker(
                    "malformed compact peer list".to_string(),
                ));
            }
            buf.chunks_exact(6)
                .map(|chunk| {
                    let ip = Ipv4Addr::new(
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    );
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    SocketAddr::from((ip, port))
                })
                .collect()
        }
        // dictionary model: a list of {ip, port} dicts; entries whose
        // address doesn't parse as IPv4 are skipped
        Some(PeerList::Dict(entries)) => entries
            .iter()
            .filter_map(|peer| {
                peer.ip
                    .parse::<Ipv4Addr>()
                    .ok()
                    .map(|ip| SocketAddr::from((ip, peer.port)))
            })
            .collect(),
        None => Vec::new(),
    };

    log::info!("Tracker returned {} peers", peers.len());
    Ok(peers)
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    peers: Option<PeerList>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PeerList {
    Compact(ByteBuf),
    Dict(Vec<DictPeer>),
}

#[derive(Debug, Deserialize)]
struct DictPeer {
    ip: String,
    port: u16,
}
