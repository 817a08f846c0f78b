//! BitTorrent HTTP tracker communication: announcing our participation and
//! harvesting the compact peer list from the response.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use url::Url;

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// How long a tracker HTTP round trip may take.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// The announce interval used when the tracker doesn't provide one.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Percent-encode all non-alphanumeric bytes except `-._~`.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Optional announce events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The first announce of a download.
    Started,
    /// The download stopped before completing.
    Stopped,
    /// The download just completed.
    Completed,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        }
    }
}

/// Parameters for an HTTP announce to a tracker.
#[derive(Clone, Copy, Debug, Default)]
pub struct Announce {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    /// Steady state polls carry no event.
    pub event: Option<Event>,
}

/// The bencoded tracker response, in compact peer list form.
#[derive(Debug, Deserialize)]
struct Response {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    /// Seconds until the next poll.
    interval: Option<u64>,
    /// Concatenated 6 byte records of IPv4 address and port, both big
    /// endian.
    #[serde(default)]
    peers: Option<serde_bytes::ByteBuf>,
}

/// HTTP tracker client for a single torrent.
pub struct Tracker {
    client: Client,
    announce_url: String,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
}

impl Tracker {
    /// Constructs a tracker client announcing to `announce_url`.
    pub fn new(
        announce_url: String,
        info_hash: Sha1Hash,
        peer_id: PeerId,
        port: u16,
    ) -> Result<Self> {
        // catch unusable URLs at setup rather than on every poll
        Url::parse(&announce_url)
            .map_err(|e| Error::Metainfo(format!("invalid announce URL: {}", e)))?;
        Ok(Self {
            client: Client::new(),
            announce_url,
            info_hash,
            peer_id,
            port,
        })
    }

    /// Sends an announce and returns the peer list and the interval after
    /// which the tracker wants to be polled again.
    ///
    /// All failures count as the tracker being unreachable except an
    /// explicit `failure reason`, which is a refusal. The supervisor treats
    /// both as an empty peer list and retries after the default interval.
    pub async fn announce(
        &self,
        params: Announce,
    ) -> Result<(Vec<SocketAddr>, Duration)> {
        // the info hash and peer id are raw bytes and have to be encoded
        // byte-wise, which reqwest's typed query API can't express
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}\
             &left={}&compact=1",
            self.announce_url,
            if self.announce_url.contains('?') { '&' } else { '?' },
            percent_encode(&self.info_hash, URL_ENCODE_RESERVED),
            percent_encode(&self.peer_id, URL_ENCODE_RESERVED),
            self.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = params.event {
            url.push_str("&event=");
            url.push_str(event.as_str());
        }

        log::debug!("Announcing to tracker {}", self.announce_url);
        let response = self
            .client
            .get(&url)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::TrackerUnreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::TrackerUnreachable(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::TrackerUnreachable(e.to_string()))?;

        let response: Response = serde_bencode::from_bytes(&body)
            .map_err(|e| Error::TrackerUnreachable(e.to_string()))?;
        if let Some(reason) = response.failure_reason {
            return Err(Error::TrackerRefused(reason));
        }

        let peers = parse_compact_peers(
            response.peers.as_ref().map(|buf| buf.as_slice()).unwrap_or(&[]),
        )?;
        let interval = response
            .interval
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_INTERVAL);
        log::debug!(
            "Tracker returned {} peers, next announce in {:?}",
            peers.len(),
            interval
        );

        Ok((peers, interval))
    }
}

/// Splits a compact peer list into socket addresses. An empty blob is a
/// valid empty peer list.
fn parse_compact_peers(blob: &[u8]) -> Result<Vec<SocketAddr>> {
    if blob.len() % 6 != 0 {
        return Err(Error::TrackerUnreachable(
            "compact peer list length is not a multiple of 6".to_string(),
        ));
    }
    Ok(blob
        .chunks_exact(6)
        .map(|record| {
            let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
            let port = u16::from_be_bytes([record[4], record[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}
