//! The HTTP tracker announce client.
//!
//! Builds the announce request (info hash and peer id percent-encoded as
//! raw bytes, compact peer format requested) and parses both the compact
//! and the dictionary form of the peer list in the bencoded response. The
//! torrent task announces `started` on its first call and `stopped` at
//! shutdown; a failing announce is an error for the caller to log, not a
//! session stopper.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;
use url::Url;

use crate::{
    error::{Error, Result},
    InfoHash, PeerId,
};

/// The optional announce event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// The first announce of a download.
    Started,
    /// The download finished.
    Completed,
    /// The client is shutting the torrent down.
    Stopped,
}

impl Event {
    fn as_str(&self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        }
    }
}

/// Parameters of one announce request.
#[derive(Clone, Debug)]
pub(crate) struct Announce {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
    /// How many peers we ask the tracker for.
    pub num_want: Option<usize>,
}

/// The tracker's reply: candidate peers and the refresh interval.
#[derive(Debug, Default)]
pub(crate) struct AnnounceResponse {
    pub interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
}

pub(crate) struct Tracker {
    client: reqwest::Client,
    url: Url,
    /// Consecutive announce failures; the torrent stops announcing to a
    /// tracker past its error threshold.
    pub error_count: usize,
}

impl Tracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            error_count: 0,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sends the announce and parses the response.
    pub async fn announce(
        &mut self,
        params: Announce,
        timeout: Duration,
    ) -> Result<AnnounceResponse> {
        let url = build_announce_url(&self.url, &params);
        log::debug!("Announcing to tracker: {}", url);

        let result = async {
            let response = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await?
                .error_for_status()?;
            let body = response.bytes().await?;
            parse_response(&body)
        }
        .await;

        match &result {
            Ok(response) => {
                self.error_count = 0;
                log::info!(
                    "Tracker {} returned {} peer(s)",
                    self.url,
                    response.peers.len()
                );
            }
            Err(e) => {
                self.error_count += 1;
                log::warn!(
                    "Tracker {} announce failed ({} failure(s)): {}",
                    self.url,
                    self.error_count,
                    e
                );
            }
        }
        result
    }
}

/// Builds the announce URL with all query parameters attached. The info
/// hash and peer id are percent-encoded byte for byte.
fn build_announce_url(base: &Url, params: &Announce) -> Url {
    let mut url = base.clone();
    let info_hash =
        percent_encode(&params.info_hash, NON_ALPHANUMERIC).to_string();
    let peer_id =
        percent_encode(&params.peer_id, NON_ALPHANUMERIC).to_string();

    // the hash and id are already escaped so they are appended to the raw
    // query rather than through the encoding serializer
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}\
        &compact=1",
        info_hash,
        peer_id,
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    );
    if let Some(event) = params.event {
        query.push_str("&event=");
        query.push_str(event.as_str());
    }
    if let Some(num_want) = params.num_want {
        query.push_str("&numwant=");
        query.push_str(&num_want.to_string());
    }
    if let Some(existing) = base.query() {
        query = format!("{}&{}", existing, query);
    }
    url.set_query(Some(&query));
    url
}

/// The bencoded response document.
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    peers: Option<RawPeers>,
}

/// Trackers reply with either the compact byte string or a list of peer
/// dictionaries.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPeers {
    Compact(ByteBuf),
    Dict(Vec<RawPeerEntry>),
}

#[derive(Debug, Deserialize)]
struct RawPeerEntry {
    ip: String,
    port: u16,
}

/// Parses the bencoded announce response body.
fn parse_response(body: &[u8]) -> Result<AnnounceResponse> {
    let raw: RawResponse = serde_bencode::from_bytes(body)?;
    if let Some(reason) = raw.failure_reason {
        return Err(Error::Network(format!("tracker failure: {}", reason)));
    }

    let mut peers = Vec::new();
    match raw.peers {
        Some(RawPeers::Compact(compact)) => {
            // 6 bytes per peer: 4 byte IPv4 address + 2 byte port
            for chunk in compact.chunks_exact(6) {
                let ip = IpAddr::from([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                peers.push(SocketAddr::new(ip, port));
            }
        }
        Some(RawPeers::Dict(entries)) => {
            for entry in entries {
                match entry.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, entry.port)),
                    Err(_) => {
                        log::debug!(
                            "Skipping unparsable tracker peer ip {:?}",
                            entry.ip
                        );
                    }
                }
            }
        }
        None => {}
    }

    Ok(AnnounceResponse {
        interval: raw.interval.map(Duration::from_secs),
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(event: Option<Event>) -> Announce {
        Announce {
            info_hash: [0xab; 20],
            peer_id: *b"-cb0100-000000000000",
            port: 6881,
            uploaded: 100,
            downloaded: 200,
            left: 300,
            event,
            num_want: Some(50),
        }
    }

    #[test]
    fn test_build_announce_url() {
        let base = Url::parse("http://tracker.example/announce").unwrap();
        let url = build_announce_url(&base, &params(Some(Event::Started)));
        let query = url.query().unwrap();

        // every byte of the info hash is escaped
        assert!(query.contains(&"%AB".repeat(20)));
        assert!(query.contains("port=6881"));
        assert!(query.contains("uploaded=100"));
        assert!(query.contains("downloaded=200"));
        assert!(query.contains("left=300"));
        assert!(query.contains("compact=1"));
        assert!(query.contains("event=started"));
        assert!(query.contains("numwant=50"));
    }

    #[test]
    fn test_build_announce_url_without_event() {
        let base = Url::parse("http://tracker.example/announce?key=abc")
            .unwrap();
        let url = build_announce_url(&base, &params(None));
        let query = url.query().unwrap();
        assert!(!query.contains("event="));
        // pre-existing query parameters survive
        assert!(query.contains("key=abc"));
    }

    #[test]
    fn test_parse_compact_response() {
        // interval 1800, two compact peers
        let mut body = b"d8:intervali1800e5:peers12:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);
        body.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0xe2]);
        body.push(b'e');

        let response = parse_response(&body).unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
        assert_eq!(
            response.peers,
            vec![
                SocketAddr::from(([10, 0, 0, 1], 6881)),
                SocketAddr::from(([10, 0, 0, 2], 6882)),
            ]
        );
    }

    #[test]
    fn test_parse_dict_response() {
        let body = b"d8:intervali900e5:peersld2:ip8:10.0.0.34:porti6883e\
            eee"
        .to_vec();
        let response = parse_response(&body).unwrap();
        assert_eq!(
            response.peers,
            vec![SocketAddr::from(([10, 0, 0, 3], 6883))]
        );
    }

    #[test]
    fn test_parse_failure_reason() {
        let body = b"d14:failure reason12:unregisterede".to_vec();
        assert!(matches!(
            parse_response(&body),
            Err(Error::Network(_))
        ));
    }
}
