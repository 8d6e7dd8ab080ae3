//! The tracker service: the swarm rendezvous point.
//!
//! Two HTTP resources are exposed: `GET /announce`, which registers the
//! caller in its torrent's peer set and returns the other members, and
//! `GET /stats`, a plain-text view for humans. Peers that stop announcing
//! are evicted by a background sweep; an explicit `stopped` event evicts
//! immediately.

use std::{
    collections::HashMap,
    future::Future,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::Instant,
};

use axum::{
    extract::{ConnectInfo, RawQuery, State},
    http::StatusCode,
    routing::get,
    Router,
};
use tokio::{task::JoinHandle, time};

use crate::{
    bencode::Value,
    conf::TrackerConfig,
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// One member of a torrent's peer set, keyed by `(ip, port)` in the swarm
/// table.
#[derive(Clone, Copy, Debug)]
struct PeerEntry {
    peer_id: PeerId,
    /// The number of bytes the peer still reports missing; zero means
    /// seeder.
    left: u64,
    last_seen: Instant,
}

/// Per-torrent seeder/leecher counts, as shown on `/stats`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwarmStats {
    pub info_hash: Sha1Hash,
    pub seeders: usize,
    pub leechers: usize,
}

/// A peer as returned in an announce response.
#[derive(Clone, Copy, Debug)]
struct PeerRecord {
    peer_id: PeerId,
    ip: IpAddr,
    port: u16,
}

/// The mapping from info-hash to peer set, behind a single mutex.
///
/// Nothing outside this type sees its internals; responses are rendered
/// from snapshots taken under the lock.
pub struct SwarmTable {
    conf: TrackerConfig,
    swarms: Mutex<HashMap<Sha1Hash, HashMap<(IpAddr, u16), PeerEntry>>>,
}

impl SwarmTable {
    pub fn new(conf: TrackerConfig) -> Self {
        Self {
            conf,
            swarms: Mutex::new(HashMap::new()),
        }
    }

    /// Applies an announce to the table and returns the requester's view
    /// of the swarm (everyone but itself).
    fn announce(
        &self,
        request: &AnnounceRequest,
        ip: IpAddr,
    ) -> Vec<PeerRecord> {
        let key = (ip, request.port);
        let mut swarms = self.swarms.lock().expect("swarm lock poisoned");
        let swarm = swarms.entry(request.info_hash).or_default();

        match request.event {
            Some(AnnounceEvent::Stopped) => {
                swarm.remove(&key);
            }
            event => {
                let left = match event {
                    Some(AnnounceEvent::Completed) => 0,
                    _ => request.left,
                };
                swarm.insert(
                    key,
                    PeerEntry {
                        peer_id: request.peer_id,
                        left,
                        last_seen: Instant::now(),
                    },
                );
            }
        }

        swarm
            .iter()
            .filter(|(peer_key, _)| **peer_key != key)
            .map(|((ip, port), entry)| PeerRecord {
                peer_id: entry.peer_id,
                ip: *ip,
                port: *port,
            })
            .collect()
    }

    /// Evicts peers that haven't announced within the timeout and drops
    /// emptied swarms. Returns the number of evicted peers.
    pub fn sweep(&self) -> usize {
        let mut swarms = self.swarms.lock().expect("swarm lock poisoned");
        let timeout = self.conf.peer_timeout;
        let mut evicted = 0;
        swarms.retain(|_, swarm| {
            let before = swarm.len();
            swarm.retain(|_, entry| entry.last_seen.elapsed() <= timeout);
            evicted += before - swarm.len();
            !swarm.is_empty()
        });
        evicted
    }

    /// A snapshot of per-torrent seeder and leecher counts.
    pub fn stats(&self) -> Vec<SwarmStats> {
        let swarms = self.swarms.lock().expect("swarm lock poisoned");
        let mut stats: Vec<_> = swarms
            .iter()
            .map(|(info_hash, swarm)| {
                let seeders =
                    swarm.values().filter(|entry| entry.left == 0).count();
                SwarmStats {
                    info_hash: *info_hash,
                    seeders,
                    leechers: swarm.len() - seeders,
                }
            })
            .collect();
        stats.sort_by_key(|s| s.info_hash);
        stats
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
}

/// A parsed, validated announce query.
#[derive(Clone, Copy, Debug)]
struct AnnounceRequest {
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    left: u64,
    event: Option<AnnounceEvent>,
    compact: bool,
}

/// Parses the raw query string, percent-decoding every value as raw bytes:
/// the two digests are binary and would be mangled by a string-typed
/// decoder.
fn parse_query(query: &str) -> std::result::Result<AnnounceRequest, String> {
    let mut info_hash = None;
    let mut peer_id = None;
    let mut port = None;
    let mut left = 0;
    let mut event = None;
    let mut compact = false;

    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let bytes: Vec<u8> =
            percent_encoding::percent_decode_str(value).collect();
        match key {
            "info_hash" => {
                info_hash = Some(
                    Sha1Hash::try_from(&bytes[..])
                        .map_err(|_| "info_hash must be 20 bytes")?,
                );
            }
            "peer_id" => {
                peer_id = Some(
                    PeerId::try_from(&bytes[..])
                        .map_err(|_| "peer_id must be 20 bytes")?,
                );
            }
            "port" => {
                port = Some(
                    ascii_int::<u16>(&bytes)
                        .filter(|port| *port != 0)
                        .ok_or("invalid port")?,
                );
            }
            "left" => left = ascii_int(&bytes).unwrap_or(0),
            // any unknown event value counts as a plain refresh
            "event" => {
                event = match std::str::from_utf8(&bytes).unwrap_or("") {
                    "started" => Some(AnnounceEvent::Started),
                    "completed" => Some(AnnounceEvent::Completed),
                    "stopped" => Some(AnnounceEvent::Stopped),
                    _ => None,
                };
            }
            "compact" => compact = bytes == b"1",
            // uploaded/downloaded are accepted but not tracked
            _ => {}
        }
    }

    Ok(AnnounceRequest {
        info_hash: info_hash.ok_or("info_hash missing")?,
        peer_id: peer_id.ok_or("peer_id missing")?,
        port: port.ok_or("port missing")?,
        left,
        event,
        compact,
    })
}

fn ascii_int<T: std::str::FromStr>(bytes: &[u8]) -> Option<T> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Renders the bencoded announce response: `interval` plus the peer list
/// in dict form, or packed 6-byte entries with `compact=1` (IPv6 peers
/// can't be packed and are skipped there).
fn render_announce(
    peers: &[PeerRecord],
    interval: u64,
    compact: bool,
) -> Vec<u8> {
    let peers_value = if compact {
        let mut packed = Vec::with_capacity(peers.len() * 6);
        for peer in peers {
            if let IpAddr::V4(ip) = peer.ip {
                packed.extend_from_slice(&ip.octets());
                packed.extend_from_slice(&peer.port.to_be_bytes());
            }
        }
        Value::Bytes(packed)
    } else {
        Value::List(
            peers
                .iter()
                .map(|peer| {
                    let mut entry = std::collections::BTreeMap::new();
                    entry.insert(
                        b"ip".to_vec(),
                        Value::str(&peer.ip.to_string()),
                    );
                    entry.insert(
                        b"peer id".to_vec(),
                        Value::Bytes(peer.peer_id.to_vec()),
                    );
                    entry
                        .insert(b"port".to_vec(), Value::Int(peer.port as i64));
                    Value::Dict(entry)
                })
                .collect(),
        )
    };

    let mut response = std::collections::BTreeMap::new();
    response.insert(b"interval".to_vec(), Value::Int(interval as i64));
    response.insert(b"peers".to_vec(), peers_value);
    Value::Dict(response).encode()
}

fn render_failure(reason: &str) -> Vec<u8> {
    let mut response = std::collections::BTreeMap::new();
    response.insert(b"failure reason".to_vec(), Value::str(reason));
    Value::Dict(response).encode()
}

async fn announce(
    State(table): State<Arc<SwarmTable>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
) -> (StatusCode, Vec<u8>) {
    match parse_query(query.as_deref().unwrap_or_default()) {
        Ok(request) => {
            log::debug!(
                "Announce from {} for {}",
                remote,
                hex::encode(request.info_hash)
            );
            let peers = table.announce(&request, remote.ip());
            let interval = table.conf.announce_interval.as_secs();
            (
                StatusCode::OK,
                render_announce(&peers, interval, request.compact),
            )
        }
        Err(reason) => {
            log::warn!("Bad announce from {}: {}", remote, reason);
            (StatusCode::BAD_REQUEST, render_failure(reason.as_str()))
        }
    }
}

async fn stats(State(table): State<Arc<SwarmTable>>) -> String {
    let stats = table.stats();
    let mut out = format!("{} torrent(s)\n", stats.len());
    for swarm in stats {
        out.push_str(&format!(
            "{}: {} seeder(s), {} leecher(s)\n",
            hex::encode(swarm.info_hash),
            swarm.seeders,
            swarm.leechers
        ));
    }
    out
}

/// A tracker service running in the background, plus the handle needed to
/// reach and stop it.
pub struct RunningTracker {
    pub local_addr: SocketAddr,
    table: Arc<SwarmTable>,
    server: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl RunningTracker {
    pub fn table(&self) -> &Arc<SwarmTable> {
        &self.table
    }
}

impl Drop for RunningTracker {
    fn drop(&mut self) {
        self.server.abort();
        self.sweeper.abort();
    }
}

fn router(table: Arc<SwarmTable>) -> Router {
    Router::new()
        .route("/announce", get(announce))
        .route("/stats", get(stats))
        .with_state(table)
}

/// Binds the tracker service and spawns its server and sweep tasks.
/// Must be called within a tokio runtime.
pub fn serve(addr: SocketAddr, conf: TrackerConfig) -> Result<RunningTracker> {
    let table = Arc::new(SwarmTable::new(conf));

    let server = axum::Server::try_bind(&addr)
        .map_err(|e| Error::TrackerUnavailable(e.to_string()))?
        .serve(
            router(Arc::clone(&table))
                .into_make_service_with_connect_info::<SocketAddr>(),
        );
    let local_addr = server.local_addr();
    log::info!("Tracker listening on {}", local_addr);

    let server = tokio::spawn(run_logged(server));
    let sweeper = tokio::spawn(sweep_loop(Arc::clone(&table)));

    Ok(RunningTracker {
        local_addr,
        table,
        server,
        sweeper,
    })
}

async fn run_logged<F, E>(server: F)
where
    F: Future<Output = std::result::Result<(), E>>,
    E: std::fmt::Display,
{
    if let Err(e) = server.await {
        log::error!("Tracker server error: {}", e);
    }
}

async fn sweep_loop(table: Arc<SwarmTable>) {
    let mut tick = time::interval(table.conf.sweep_interval);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let evicted = table.sweep();
        if evicted > 0 {
            log::info!("Swept {} stale peer(s)", evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn request(
        info_hash: Sha1Hash,
        peer_id: u8,
        port: u16,
        left: u64,
        event: Option<AnnounceEvent>,
    ) -> AnnounceRequest {
        AnnounceRequest {
            info_hash,
            peer_id: [peer_id; 20],
            port,
            left,
            event,
            compact: false,
        }
    }

    fn localhost(last: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, last))
    }

    #[test]
    fn test_parse_query_roundtrip() {
        let query = "info_hash=%FF%00%FF%00%FF%00%FF%00%FF%00\
                     %FF%00%FF%00%FF%00%FF%00%FF%00\
                     &peer_id=-lt0001-aaaaaaaaaaaa&port=6881\
                     &uploaded=0&downloaded=0&left=42&event=started&compact=1";
        let request = parse_query(query).unwrap();
        let mut expected_hash = [0u8; 20];
        for byte in expected_hash.iter_mut().step_by(2) {
            *byte = 0xff;
        }
        assert_eq!(request.info_hash, expected_hash);
        assert_eq!(&request.peer_id, b"-lt0001-aaaaaaaaaaaa");
        assert_eq!(request.port, 6881);
        assert_eq!(request.left, 42);
        assert_eq!(request.event, Some(AnnounceEvent::Started));
        assert!(request.compact);
    }

    #[test]
    fn test_parse_query_rejects_bad_requests() {
        assert!(parse_query("").is_err());
        // short info hash
        assert!(parse_query(
            "info_hash=abc&peer_id=-lt0001-aaaaaaaaaaaa&port=6881"
        )
        .is_err());
        // missing port
        assert!(parse_query(
            "info_hash=aaaaaaaaaaaaaaaaaaaa&peer_id=-lt0001-aaaaaaaaaaaa"
        )
        .is_err());
        // port zero
        assert!(parse_query(
            "info_hash=aaaaaaaaaaaaaaaaaaaa&peer_id=-lt0001-aaaaaaaaaaaa\
             &port=0"
        )
        .is_err());
    }

    #[test]
    fn test_parse_query_unknown_event_is_absent() {
        let query = "info_hash=aaaaaaaaaaaaaaaaaaaa\
                     &peer_id=-lt0001-aaaaaaaaaaaa&port=6881&event=paused";
        assert_eq!(parse_query(query).unwrap().event, None);
    }

    #[test]
    fn test_announce_excludes_requester() {
        let table = SwarmTable::new(TrackerConfig::default());
        let hash = [7; 20];

        let peers = table.announce(
            &request(hash, 1, 6881, 100, Some(AnnounceEvent::Started)),
            localhost(1),
        );
        assert!(peers.is_empty());

        let peers = table.announce(
            &request(hash, 2, 6882, 100, Some(AnnounceEvent::Started)),
            localhost(2),
        );
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, [1; 20]);
        assert_eq!((peers[0].ip, peers[0].port), (localhost(1), 6881));
    }

    #[test]
    fn test_stopped_event_evicts_immediately() {
        let table = SwarmTable::new(TrackerConfig::default());
        let hash = [7; 20];

        table.announce(
            &request(hash, 1, 6881, 100, Some(AnnounceEvent::Started)),
            localhost(1),
        );
        table.announce(
            &request(hash, 1, 6881, 100, Some(AnnounceEvent::Stopped)),
            localhost(1),
        );
        let peers = table.announce(
            &request(hash, 2, 6882, 100, None),
            localhost(2),
        );
        assert!(peers.is_empty());
    }

    #[test]
    fn test_sweep_evicts_stale_peers() {
        let conf = TrackerConfig {
            peer_timeout: Duration::ZERO,
            ..TrackerConfig::default()
        };
        let table = SwarmTable::new(conf);
        let hash = [7; 20];
        table.announce(
            &request(hash, 1, 6881, 100, Some(AnnounceEvent::Started)),
            localhost(1),
        );

        assert_eq!(table.sweep(), 1);
        assert!(table.stats().is_empty(), "emptied swarms are dropped");
    }

    #[test]
    fn test_completed_event_makes_seeder() {
        let table = SwarmTable::new(TrackerConfig::default());
        let hash = [7; 20];
        table.announce(
            &request(hash, 1, 6881, 100, Some(AnnounceEvent::Started)),
            localhost(1),
        );
        table.announce(
            &request(hash, 2, 6882, 50, Some(AnnounceEvent::Started)),
            localhost(2),
        );
        table.announce(
            &request(hash, 1, 6881, 100, Some(AnnounceEvent::Completed)),
            localhost(1),
        );

        let stats = table.stats();
        assert_eq!(
            stats,
            vec![SwarmStats {
                info_hash: hash,
                seeders: 1,
                leechers: 1,
            }]
        );
    }

    #[test]
    fn test_render_compact_announce() {
        let peers = vec![
            PeerRecord {
                peer_id: [1; 20],
                ip: localhost(1),
                port: 6881,
            },
            PeerRecord {
                peer_id: [2; 20],
                ip: "::1".parse().unwrap(),
                port: 6882,
            },
        ];
        // the IPv6 peer can't be packed and is skipped
        assert_eq!(
            render_announce(&peers, 120, true),
            b"d8:intervali120e5:peers6:\x7f\x00\x00\x01\x1a\xe1e".to_vec()
        );
    }

    #[test]
    fn test_render_dict_announce() {
        let peers = vec![PeerRecord {
            peer_id: *b"-lt0001-bbbbbbbbbbbb",
            ip: localhost(1),
            port: 6881,
        }];
        assert_eq!(
            render_announce(&peers, 60, false),
            b"d8:intervali60e5:peersl\
              d2:ip9:127.0.0.17:peer id20:-lt0001-bbbbbbbbbbbb4:porti6881ee\
              ee"
            .to_vec()
        );
    }

    #[test]
    fn test_render_failure() {
        assert_eq!(
            render_failure("port missing"),
            b"d14:failure reason12:port missinge".to_vec()
        );
    }
}
