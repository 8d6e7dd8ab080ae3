//! The announce side of the tracker protocol: a small HTTP client that
//! reports our state and receives the swarm's peer list.
//!
//! The [`service`] submodule is the other end of this conversation, the
//! tracker itself.

pub mod service;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::Buf;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Url};
use serde::{de, Deserialize};

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// The HTTP timeout of a single announce.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Optional announce events marking swarm membership transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The first announce of a run.
    Started,
    /// The download just finished.
    Completed,
    /// A best-effort goodbye on shutdown.
    Stopped,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }
}

/// Parameters of a single announce.
#[derive(Clone, Copy, Debug)]
pub struct Announce {
    /// The port our listener accepts peer connections on.
    pub port: u16,
    /// Total payload bytes uploaded so far.
    pub uploaded: u64,
    /// Total payload bytes downloaded so far.
    pub downloaded: u64,
    /// Bytes still missing; zero marks us a seeder.
    pub left: u64,
    pub event: Option<Event>,
}

/// The tracker's bencoded answer to an announce.
#[derive(Debug, Deserialize, PartialEq)]
pub struct Response {
    /// Set instead of everything else when the tracker rejects the
    /// announce.
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    /// The advisory re-announce cadence.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_seconds")]
    pub interval: Option<Duration>,

    #[serde(rename = "complete")]
    pub seeder_count: Option<usize>,
    #[serde(rename = "incomplete")]
    pub leecher_count: Option<usize>,

    /// The swarm's other peers, in whichever of the two response forms the
    /// tracker chose.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_peers")]
    pub peers: Vec<SocketAddr>,
}

/// HTTP tracker client bound to one torrent.
#[derive(Clone, Debug)]
pub struct Tracker {
    client: Client,
    url: Url,
    info_hash: Sha1Hash,
    peer_id: PeerId,
}

impl Tracker {
    pub fn new(url: Url, info_hash: Sha1Hash, peer_id: PeerId) -> Result<Self> {
        let client = Client::builder().timeout(ANNOUNCE_TIMEOUT).build()?;
        Ok(Self {
            client,
            url,
            info_hash,
            peer_id,
        })
    }

    /// Sends an announce and parses the bencoded response. A `failure
    /// reason` in the response surfaces as an error.
    pub async fn announce(&self, params: Announce) -> Result<Response> {
        let url = self.announce_url(&params);
        log::debug!("Announcing: {}", url);
        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let response: Response = serde_bencode::from_bytes(&bytes)
            .map_err(|e| Error::TrackerUnavailable(e.to_string()))?;
        if let Some(reason) = response.failure_reason {
            return Err(Error::TrackerFailure(reason));
        }
        Ok(response)
    }

    /// Builds the announce URL by hand: the two digests are raw bytes that
    /// must be percent-encoded exactly once, which query-pair builders
    /// can't be trusted with.
    fn announce_url(&self, params: &Announce) -> String {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}\
             &left={}&compact=1",
            self.url,
            percent_encoding::percent_encode(
                &self.info_hash,
                URL_ENCODE_RESERVED
            ),
            percent_encoding::percent_encode(&self.peer_id, URL_ENCODE_RESERVED),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = params.event {
            url.push_str("&event=");
            url.push_str(event.as_str());
        }
        url
    }
}

/// Percent-encode all non-alphanumeric bytes except `-._~`.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Deserialize a bencoded integer of seconds into a `Duration`.
fn deserialize_seconds<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let opt: Option<u64> = Option::deserialize(deserializer)?;
    Ok(opt.map(Duration::from_secs))
}

/// Deserialize either a compact peer string or a list of `{ip, port}`
/// dicts.
fn deserialize_peers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
            fmt.write_str("compact peer string or list of {ip, port} dicts")
        }

        // compact format: 6 byte entries, IPv4 and port both big endian
        fn visit_bytes<E>(
            self,
            mut b: &[u8],
        ) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY: usize = 6;
            if b.len() % ENTRY != 0 {
                return Err(de::Error::custom(
                    "compact peers length must be a multiple of 6",
                ));
            }
            let mut peers = Vec::with_capacity(b.len() / ENTRY);
            while !b.is_empty() {
                let ip = Ipv4Addr::from(b.get_u32());
                let port = b.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
            Ok(peers)
        }

        fn visit_seq<A>(
            self,
            mut seq: A,
        ) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct Raw {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(Raw { ip, port }) = seq.next_element()? {
                if let Ok(addr) = ip.parse() {
                    peers.push(SocketAddr::new(addr, port));
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_announce_url_escapes_digests() {
        let tracker = Tracker::new(
            Url::parse("http://127.0.0.1:8000/announce").unwrap(),
            [0xff; 20],
            *b"-lt0001-aaaaaaaaaaaa",
        )
        .unwrap();
        let url = tracker.announce_url(&Announce {
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event: Some(Event::Started),
        });
        assert_eq!(
            url,
            "http://127.0.0.1:8000/announce?info_hash=\
             %FF%FF%FF%FF%FF%FF%FF%FF%FF%FF%FF%FF%FF%FF%FF%FF%FF%FF%FF%FF\
             &peer_id=-lt0001-aaaaaaaaaaaa&port=6881&uploaded=1\
             &downloaded=2&left=3&compact=1&event=started"
        );
    }

    #[test]
    fn test_parse_compact_response() {
        let body =
            b"d8:intervali120e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x7f\x00\x00\x02\x1a\xe2e";
        let response: Response = serde_bencode::from_bytes(body).unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(120)));
        assert_eq!(
            response.peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "127.0.0.2:6882".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_dict_response() {
        let body = b"d8:intervali60e5:peersl\
                     d2:ip9:127.0.0.17:peer id20:-lt0001-bbbbbbbbbbbb4:porti6881ee\
                     ee";
        let response: Response = serde_bencode::from_bytes(&body[..]).unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(60)));
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_failure_response() {
        let body = b"d14:failure reason12:unknown infoe";
        let response: Response = serde_bencode::from_bytes(&body[..]).unwrap();
        assert_eq!(response.failure_reason.as_deref(), Some("unknown info"));
    }
}
