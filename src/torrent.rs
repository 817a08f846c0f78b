//! The download supervisor: owns one torrent's end-to-end lifecycle and
//! composes the metainfo, the piece manager, the tracker, the DHT client,
//! and the peer sessions into a working download.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures::{pin_mut, select, FutureExt};
use tokio::{sync::Notify, time::sleep};

use crate::{
    conf::Conf,
    dht::DhtClient,
    error::{Error, Result},
    metainfo::Metainfo,
    peer::{Command, PeerSession},
    piece_manager::PieceManager,
    storage_info::StorageInfo,
    tracker::{Announce, Event, Tracker},
    PeerId, Sha1Hash,
};

/// The wait before re-polling a tracker that failed to answer.
const ANNOUNCE_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// The lifecycle state of a download, as shown to the front-end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Set up, not yet announced.
    Starting,
    /// Actively fetching pieces.
    Downloading,
    /// Everything verified and on disk. The engine doesn't serve uploads;
    /// this is an idle state with the file handles closed.
    Seeding,
    /// A disk or setup failure ended the download.
    Failed,
}

/// State shared between the supervisor, the session tasks, and any number of
/// status handles. Everything here is readable without blocking the
/// download.
struct Shared {
    status: Mutex<DownloadStatus>,
    start_time: Mutex<Option<Instant>>,
    end_time: Mutex<Option<Instant>>,
    /// The live sessions' command channels, keyed by peer address. The entry
    /// is removed by the session task as it ends, whatever the reason.
    peers: Mutex<HashMap<SocketAddr, crate::peer::Sender>>,
    /// A torrent-fatal error reported by a session (disk failures, in
    /// practice).
    fatal: Mutex<Option<Error>>,
    /// Wakes the supervisor out of its inter-announce wait.
    wakeup: Notify,
}

impl Shared {
    fn set_status(&self, status: DownloadStatus) {
        *self.status.lock().expect("torrent status lock poisoned") = status;
    }
}

/// A cloneable, non-blocking view of a download's progress, for driving a
/// status display.
#[derive(Clone)]
pub struct TorrentHandle {
    manager: Arc<PieceManager>,
    shared: Arc<Shared>,
}

impl TorrentHandle {
    pub fn status(&self) -> DownloadStatus {
        *self
            .shared
            .status
            .lock()
            .expect("torrent status lock poisoned")
    }

    /// The fraction of pieces verified, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.manager.progress()
    }

    /// Unique payload bytes accepted from peers so far.
    pub fn downloaded_bytes(&self) -> u64 {
        self.manager.downloaded_bytes()
    }

    pub fn peer_count(&self) -> usize {
        self.shared
            .peers
            .lock()
            .expect("torrent roster lock poisoned")
            .len()
    }

    pub fn start_time(&self) -> Option<Instant> {
        *self
            .shared
            .start_time
            .lock()
            .expect("torrent clock lock poisoned")
    }

    pub fn end_time(&self) -> Option<Instant> {
        *self
            .shared
            .end_time
            .lock()
            .expect("torrent clock lock poisoned")
    }

    /// Time spent downloading: up to now while in progress, or the total
    /// once complete.
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.start_time()?;
        Some(match self.end_time() {
            Some(end) => end.duration_since(start),
            None => start.elapsed(),
        })
    }
}

/// A single torrent download.
pub struct Torrent {
    name: String,
    info_hash: Sha1Hash,
    client_id: PeerId,
    max_peer_count: usize,
    dht_port: Option<u16>,
    manager: Arc<PieceManager>,
    tracker: Tracker,
    dht: Option<DhtClient>,
    shared: Arc<Shared>,
}

impl Torrent {
    /// Sets up the download area for the torrent (creating and
    /// pre-allocating its files) and the tracker client. Nothing is
    /// announced or connected yet.
    pub fn new(metainfo: Metainfo, conf: Conf) -> Result<Self> {
        let info = StorageInfo::new(&metainfo, conf.download_dir.clone());
        let manager =
            Arc::new(PieceManager::new(info, metainfo.piece_hashes.clone())?);
        let tracker = Tracker::new(
            metainfo.announce.clone(),
            metainfo.info_hash,
            conf.client_id,
            conf.listen_port,
        )?;

        Ok(Self {
            name: metainfo.name.clone(),
            info_hash: metainfo.info_hash,
            client_id: conf.client_id,
            max_peer_count: conf.max_connected_peer_count,
            dht_port: conf.dht_port,
            manager,
            tracker,
            dht: None,
            shared: Arc::new(Shared {
                status: Mutex::new(DownloadStatus::Starting),
                start_time: Mutex::new(None),
                end_time: Mutex::new(None),
                peers: Mutex::new(HashMap::new()),
                fatal: Mutex::new(None),
                wakeup: Notify::new(),
            }),
        })
    }

    /// Returns a view of the download for status displays.
    pub fn handle(&self) -> TorrentHandle {
        TorrentHandle {
            manager: Arc::clone(&self.manager),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drives the download to completion: announce, connect, wait, repeat.
    ///
    /// Returns once every piece is verified and flushed (leaving the status
    /// at `Seeding`), or with an error when the torrent fails fatally
    /// (status `Failed`). Peer, tracker, and DHT failures never end the
    /// download; they are logged and retried with fresh peers.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent {}", self.name);
        self.shared.set_status(DownloadStatus::Downloading);
        *self
            .shared
            .start_time
            .lock()
            .expect("torrent clock lock poisoned") = Some(Instant::now());

        if let Some(port) = self.dht_port {
            match DhtClient::bind(port).await {
                Ok(dht) => self.dht = Some(dht),
                Err(e) => {
                    log::warn!("DHT unavailable, using tracker only: {}", e)
                }
            }
        }

        // the first announce carries the started event, later polls none
        let mut event = Some(Event::Started);
        while !self.manager.complete() {
            if let Some(e) = self.take_fatal() {
                log::error!("Torrent {} failed: {}", self.name, e);
                self.shared.set_status(DownloadStatus::Failed);
                return Err(e);
            }

            let (peers, interval) = self.discover_peers(&mut event).await;
            self.connect_to_peers(peers);

            // wait out the tracker interval, but let completion or a fatal
            // error interrupt the wait
            let announce_wait = sleep(interval).fuse();
            let completion = self.manager.completion().notified().fuse();
            let failure = self.shared.wakeup.notified().fuse();
            pin_mut!(announce_wait, completion, failure);
            select! {
                _ = announce_wait => {}
                _ = completion => {}
                _ = failure => {}
            }
        }

        log::info!("Torrent {} download complete", self.name);
        self.shared.set_status(DownloadStatus::Seeding);
        *self
            .shared
            .end_time
            .lock()
            .expect("torrent clock lock poisoned") = Some(Instant::now());

        // one last announce so the tracker's books are right; nothing
        // depends on it anymore
        let downloaded = self.manager.downloaded_bytes();
        if let Err(e) = self
            .tracker
            .announce(Announce {
                downloaded,
                uploaded: 0,
                left: 0,
                event: Some(Event::Completed),
            })
            .await
        {
            log::warn!("Completion announce failed: {}", e);
        }

        // wind the sessions down and close the files; upload servicing is
        // not implemented, so there is nothing left to do
        for cmd_chan in self
            .shared
            .peers
            .lock()
            .expect("torrent roster lock poisoned")
            .values()
        {
            let _ = cmd_chan.send(Command::Shutdown);
        }
        self.manager.close_files();

        Ok(())
    }

    fn take_fatal(&self) -> Option<Error> {
        self.shared
            .fatal
            .lock()
            .expect("torrent fatal lock poisoned")
            .take()
    }

    /// One discovery round: announce to the tracker and, when that yields
    /// nothing and DHT is available, fall back to a DHT lookup.
    async fn discover_peers(
        &self,
        event: &mut Option<Event>,
    ) -> (Vec<SocketAddr>, Duration) {
        let downloaded = self.manager.downloaded_bytes();
        let left = self.manager.download_len().saturating_sub(downloaded);

        let (mut peers, interval) = match self
            .tracker
            .announce(Announce {
                downloaded,
                uploaded: 0,
                left,
                event: *event,
            })
            .await
        {
            Ok((peers, interval)) => {
                *event = None;
                (peers, interval)
            }
            Err(e) => {
                // refusals and unreachable trackers alike: no peers this
                // round, poll again later
                log::warn!("Tracker announce failed: {}", e);
                (Vec::new(), ANNOUNCE_RETRY_INTERVAL)
            }
        };
        log::info!(
            "Torrent {}: {} peers from tracker",
            self.name,
            peers.len()
        );

        if peers.is_empty() {
            if let Some(dht) = &self.dht {
                match dht.find_peers(self.info_hash).await {
                    Ok(dht_peers) => {
                        log::info!(
                            "Torrent {}: {} peers from DHT",
                            self.name,
                            dht_peers.len()
                        );
                        peers.extend(dht_peers);
                    }
                    Err(e) => log::warn!("DHT lookup failed: {}", e),
                }
            }
        }

        (peers, interval)
    }

    /// Spawns a session toward every endpoint we don't already have one
    /// for, up to the peer cap. Each session removes itself from the roster
    /// when it ends.
    fn connect_to_peers(&self, peers: Vec<SocketAddr>) {
        let mut roster = self
            .shared
            .peers
            .lock()
            .expect("torrent roster lock poisoned");
        for addr in peers {
            if roster.contains_key(&addr) {
                continue;
            }
            if roster.len() >= self.max_peer_count {
                break;
            }

            let (mut session, cmd_chan) = PeerSession::outbound(
                Arc::clone(&self.manager),
                addr,
                self.info_hash,
                self.client_id,
            );
            roster.insert(addr, cmd_chan);

            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                match session.start().await {
                    Ok(()) => log::info!("Peer {} session done", addr),
                    Err(e) if e.is_fatal() => {
                        log::error!("Peer {} session fatal error: {}", addr, e);
                        *shared
                            .fatal
                            .lock()
                            .expect("torrent fatal lock poisoned") = Some(e);
                        shared.wakeup.notify_one();
                    }
                    // per-session failures are recovered with fresh peers on
                    // the next announce
                    Err(e) => log::info!("Peer {} session closed: {}", addr, e),
                }
                shared
                    .peers
                    .lock()
                    .expect("torrent roster lock poisoned")
                    .remove(&addr);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bencode::{self, Value},
        metainfo::FilePlan,
        peer::codec::{Handshake, HandshakeCodec, Message, PeerCodec},
        Bitfield, BLOCK_LEN,
    };
    use futures::{SinkExt, StreamExt};
    use sha1::{Digest, Sha1};
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_util::codec::{Framed, FramedParts};

    const PIECE_LEN: u32 = 2 * BLOCK_LEN;
    const INFO_HASH: Sha1Hash = [0x42; 20];

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 41 % 223) as u8).collect()
    }

    /// A scripted seed that serves `content` to the first leecher that
    /// connects.
    async fn run_seed(listener: TcpListener, content: Vec<u8>) {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = Framed::new(socket, HandshakeCodec);
        socket.next().await.unwrap().unwrap();
        socket
            .send(Handshake::new(INFO_HASH, *b"-SD0001-000000000000"))
            .await
            .unwrap();

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new::<Message>(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        let piece_count =
            (content.len() + PIECE_LEN as usize - 1) / PIECE_LEN as usize;
        socket
            .send(Message::Bitfield(Bitfield::repeat(true, piece_count)))
            .await
            .unwrap();
        socket.send(Message::Unchoke).await.unwrap();

        while let Some(msg) = socket.next().await {
            if let Ok(Message::Request(block)) = msg {
                let start = block.piece_index * PIECE_LEN as usize
                    + block.offset as usize;
                let data =
                    content[start..start + block.len as usize].to_vec();
                if socket
                    .send(Message::Block {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    /// Announce response carrying a single compact peer record.
    fn tracker_body(addr: SocketAddr, interval: i64) -> Vec<u8> {
        let mut record = match addr {
            SocketAddr::V4(addr) => addr.ip().octets().to_vec(),
            SocketAddr::V6(_) => panic!("test peers are IPv4"),
        };
        record.extend_from_slice(&addr.port().to_be_bytes());

        let mut body = std::collections::BTreeMap::new();
        body.insert(b"interval".to_vec(), Value::Int(interval));
        body.insert(b"peers".to_vec(), Value::Bytes(record));
        bencode::encode(&Value::Dict(body))
    }

    #[tokio::test]
    async fn test_end_to_end_download_via_tracker() {
        let dir = TempDir::new().unwrap();
        let content = payload(PIECE_LEN as usize + 100);
        let piece_hashes: Vec<Sha1Hash> = content
            .chunks(PIECE_LEN as usize)
            .map(|piece| Sha1::digest(piece).into())
            .collect();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seed_addr = listener.local_addr().unwrap();
        tokio::spawn(run_seed(listener, content.clone()));

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/announce")
            .match_query(mockito::Matcher::Any)
            .with_body(tracker_body(seed_addr, 60))
            .create_async()
            .await;

        let metainfo = Metainfo {
            announce: format!("{}/announce", server.url()),
            info_hash: INFO_HASH,
            piece_len: PIECE_LEN,
            piece_hashes,
            name: "payload".to_string(),
            total_len: content.len() as u64,
            plan: FilePlan::Single {
                len: content.len() as u64,
            },
        };
        let mut conf = Conf::new(dir.path());
        conf.dht_port = None;

        let mut torrent = Torrent::new(metainfo, conf).unwrap();
        let handle = torrent.handle();
        assert_eq!(handle.status(), DownloadStatus::Starting);

        torrent.start().await.unwrap();

        assert_eq!(handle.status(), DownloadStatus::Seeding);
        assert_eq!(handle.progress(), 1.0);
        assert_eq!(handle.downloaded_bytes(), content.len() as u64);
        assert!(handle.elapsed().is_some());
        assert!(handle.end_time().is_some());
        assert_eq!(
            std::fs::read(dir.path().join("payload")).unwrap(),
            content
        );
    }

    #[tokio::test]
    async fn test_unreachable_tracker_yields_no_peers() {
        let dir = TempDir::new().unwrap();
        let content = payload(BLOCK_LEN as usize);
        let metainfo = Metainfo {
            announce: "http://127.0.0.1:1/announce".to_string(),
            info_hash: INFO_HASH,
            piece_len: BLOCK_LEN,
            piece_hashes: vec![Sha1::digest(&content).into()],
            name: "payload".to_string(),
            total_len: content.len() as u64,
            plan: FilePlan::Single {
                len: content.len() as u64,
            },
        };
        let mut conf = Conf::new(dir.path());
        conf.dht_port = None;

        let torrent = Torrent::new(metainfo, conf).unwrap();
        let mut event = Some(Event::Started);
        let (peers, interval) = torrent.discover_peers(&mut event).await;
        assert_eq!(peers, vec![]);
        assert_eq!(interval, ANNOUNCE_RETRY_INTERVAL);
        // the started event wasn't consumed by the failed announce
        assert_eq!(event, Some(Event::Started));
    }
}
