//! This module defines types used to configure the engine and its parts.
//!
//! All knobs live in a single immutable [`Config`] value that is threaded
//! through construction; nothing here is mutable global state.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The prefix of every peer id generated by this client.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-lt0001-";

/// The global configuration for the peer engine and all its parts.
#[derive(Clone, Debug)]
pub struct Config {
    /// The ID of the client to announce to the tracker and other peers.
    /// Freshly randomized per run unless overridden.
    pub client_id: PeerId,

    /// The port the TCP listener binds to. 0 lets the OS pick one; the
    /// chosen port is what gets announced.
    pub listen_port: u16,

    /// The directory in which the torrent's file is placed upon download and
    /// from which it is seeded.
    pub data_dir: PathBuf,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peers: usize,

    /// The number of block requests kept outstanding per peer.
    pub max_pipeline: usize,

    /// A keep-alive is sent when nothing else went out for this long; a
    /// session is torn down after twice this much inbound silence.
    pub keep_alive_interval: Duration,

    /// Announce cadence used when the tracker doesn't provide an interval.
    pub announce_interval: Duration,

    /// An outstanding block request older than this is considered lost and
    /// is reissued.
    pub request_timeout: Duration,

    /// First retry delay after a failed dial; doubles per failure.
    pub dial_backoff_base: Duration,

    /// Upper bound on the dial back-off.
    pub dial_backoff_cap: Duration,

    /// How often the supervisor reconciles the session set with the
    /// tracker's latest peer list.
    pub reconcile_interval: Duration,
}

impl Config {
    /// Returns the engine configuration with reasonable defaults, except for
    /// the data directory, as it is not sensible to guess that for the user.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_id: generate_client_id(),
            listen_port: 0,
            data_dir: data_dir.into(),
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peers: 50,
            max_pipeline: 5,
            keep_alive_interval: Duration::from_secs(120),
            announce_interval: Duration::from_secs(120),
            request_timeout: Duration::from_secs(60),
            dial_backoff_base: Duration::from_secs(5),
            dial_backoff_cap: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

/// Configuration of the tracker service.
#[derive(Clone, Copy, Debug)]
pub struct TrackerConfig {
    /// The advisory re-announce cadence returned to peers.
    pub announce_interval: Duration,

    /// A peer that hasn't announced for this long is evicted.
    pub peer_timeout: Duration,

    /// How often the background sweep looks for stale peers.
    pub sweep_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(120),
            peer_timeout: Duration::from_secs(180),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Generates a fresh peer id: the client prefix followed by random
/// alphanumeric bytes.
pub fn generate_client_id() -> PeerId {
    use rand::{distributions::Alphanumeric, Rng};

    let mut id = [0u8; 20];
    id[..CLIENT_ID_PREFIX.len()].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[CLIENT_ID_PREFIX.len()..].iter_mut() {
        *b = rng.sample(Alphanumeric);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_shape() {
        let id = generate_client_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_client_ids_are_unique_per_run() {
        assert_ne!(generate_client_id(), generate_client_id());
    }
}
