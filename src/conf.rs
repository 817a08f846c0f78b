//! This module defines types used to configure the engine and its parts.

use std::path::PathBuf;

use rand::Rng;

use crate::PeerId;

/// The Azureus-style client id prefix announced to trackers and peers.
///
/// Guidelines: http://bittorrent.org/beps/bep_0020.html.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-RP0001-";

/// The configuration of a single torrent download.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The directory in which the torrent's files are placed upon download.
    pub download_dir: PathBuf,

    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,

    /// The port reported to trackers. The engine is a leecher and accepts no
    /// inbound connections, so this is nominal.
    pub listen_port: u16,

    /// The UDP port the DHT client binds to (it falls back to an ephemeral
    /// port when taken). `None` disables DHT peer discovery and leaves the
    /// tracker as the only peer source.
    pub dht_port: Option<u16>,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            client_id: gen_client_id(),
            listen_port: 6881,
            dht_port: Some(6881),
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 40,
        }
    }
}

/// Generates a fresh client id: the fixed prefix followed by 12 random ASCII
/// digits.
pub fn gen_client_id() -> PeerId {
    let mut id = [0; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for digit in id[8..].iter_mut() {
        *digit = rng.gen_range(b'0'..=b'9');
    }
    id
}
