//! The crate-wide error type and its conversions.
//!
//! Peer session errors are absorbed by the reconnect loop and never bubble up
//! past the session task; only metainfo/tracker failures and the
//! assembly-time invariant violation surface to the caller.

use std::{fmt, io};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to parse or re-encode a bencoded structure.
    Bencode(serde_bencode::Error),
    /// A channel between the coordinator and its tasks was closed while the
    /// download was still in progress.
    ChannelClosed,
    /// HTTP failure while talking to the tracker.
    Http(reqwest::Error),
    /// Some blocks were still missing when the download was declared
    /// complete. This is a bug in the coordinator, not a peer failure; no
    /// file is written.
    IncompleteDownload {
        missing: usize,
    },
    /// The tracker announce URL in the metainfo could not be parsed.
    InvalidAnnounceUrl(url::ParseError),
    /// The peer sent a bitfield too short for the torrent's piece count.
    InvalidBitfield,
    /// The peer's handshake was not a well-formed BitTorrent handshake.
    InvalidHandshake,
    /// The peer sent a known message whose payload length doesn't match its
    /// id.
    InvalidMessagePayload(u8),
    /// The torrent metainfo is structurally invalid.
    InvalidMetainfo(&'static str),
    /// The info hash in the peer's handshake is for a different torrent.
    InvalidPeerInfoHash,
    Io(io::Error),
    /// Only single-file torrents are supported.
    MultiFileTorrent,
    /// The peer closed the connection.
    PeerDisconnected,
    /// A network operation did not finish within its allotted time.
    Timeout,
    /// The tracker answered with a failure reason or an unusable response.
    Tracker(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
            Error::ChannelClosed => write!(f, "coordinator channel closed"),
            Error::Http(e) => write!(f, "tracker request failed: {}", e),
            Error::IncompleteDownload { missing } => write!(
                f,
                "download marked complete with {} blocks missing",
                missing
            ),
            Error::InvalidAnnounceUrl(e) => {
                write!(f, "invalid announce url: {}", e)
            }
            Error::InvalidBitfield => {
                write!(f, "peer sent a bitfield shorter than the piece count")
            }
            Error::InvalidHandshake => write!(f, "invalid handshake"),
            Error::InvalidMessagePayload(id) => {
                write!(f, "invalid payload length for message id {}", id)
            }
            Error::InvalidMetainfo(what) => {
                write!(f, "invalid metainfo: {}", what)
            }
            Error::InvalidPeerInfoHash => {
                write!(f, "peer handshake has a different info hash")
            }
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::MultiFileTorrent => {
                write!(f, "multi-file torrents are not supported")
            }
            Error::PeerDisconnected => write!(f, "peer disconnected"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::Tracker(reason) => write!(f, "tracker error: {}", reason),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bencode(e) => Some(e),
            Error::Http(e) => Some(e),
            Error::InvalidAnnounceUrl(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Bencode(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidAnnounceUrl(e)
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Error::Timeout
    }
}
