//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

/// The 8 byte client prefix of our peer id, followed on the wire by 12 random
/// ASCII digits.
pub const LEECHBIT_CLIENT_PREFIX: &[u8; 8] = b"-lb0001-";

/// The global configuration for a download and all its parts.
///
/// The defaults are tuned for a well-behaved public swarm; all knobs that the
/// engine consults live here rather than as scattered constants.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The directory into which the torrent's file is downloaded.
    pub download_dir: PathBuf,

    /// The maximum number of peer sessions spawned concurrently. If the
    /// tracker returns fewer peers, all of them are used.
    pub max_sessions: usize,

    /// How many not yet requested blocks the request producer queues up per
    /// tick.
    pub request_batch: usize,

    /// How many downloaded blocks the consumer drains from its queue in one
    /// go: one blocking receive followed by up to this many minus one
    /// opportunistic ones.
    pub consume_batch: usize,

    /// Capacity of the block request and block consume queues. Producers
    /// sleep and retry when a queue is full.
    pub queue_capacity: usize,

    /// How long a TCP connect to a peer may take before the attempt is
    /// abandoned.
    pub connect_timeout: Duration,

    /// Per-operation network read and write timeout.
    pub io_timeout: Duration,

    /// How long a session sleeps after a failed connect, handshake, or mid
    /// session error before it tries the same peer again.
    pub reconnect_backoff: Duration,

    /// A block that has been requested but not delivered for this long is
    /// handed out again, so that a silently dropped peer can't strand it.
    pub request_timeout: Duration,

    /// Cooperative pause between request sends and producer ticks, so that
    /// queue-churning loops don't starve the executor.
    pub cooperative_sleep: Duration,

    /// The port we claim to listen on when announcing to the tracker. No
    /// incoming connections are accepted; the value is convention.
    pub listen_port: u16,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_sessions: 35,
            request_batch: 16,
            consume_batch: 20,
            queue_capacity: 4096,
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(20),
            request_timeout: Duration::from_secs(60),
            cooperative_sleep: Duration::from_millis(10),
            listen_port: 6881,
        }
    }
}
