//! A single peer session: one TCP connection over which we download blocks
//! from a remote peer.
//!
//! Sessions are spawned by the torrent supervisor and drive themselves to
//! completion; any failure (timeout, reset, protocol violation, handshake
//! mismatch) just terminates the session. The supervisor obtains fresh peers
//! on the next announce, and block requests this session leaves behind are
//! re-issued through other sessions once they age past the request timeout.

pub(crate) mod codec;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{pin_mut, select, stream::SplitSink, FutureExt, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::timeout,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    error::{Error, Result},
    piece_manager::{BlockStatus, PieceManager},
    PeerId, PieceIndex, Sha1Hash,
};
use codec::*;

/// How long connection establishment may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long we wait for the peer's half of the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a connected peer may stay silent.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// The number of block requests kept outstanding on a session to saturate
/// the link.
const MAX_PENDING_REQUESTS: usize = 20;

/// The channel on which the torrent can send a command to the peer session
/// task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
}

pub(crate) struct PeerSession {
    /// The piece manager picks the blocks to request and takes delivery of
    /// the downloaded ones. Shared with every other session of the torrent.
    manager: Arc<PieceManager>,
    /// The port on which the peer session receives commands.
    cmd_port: Option<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The infohash of the torrent this session downloads.
    info_hash: Sha1Hash,
    /// Our own id, sent in the handshake.
    client_id: PeerId,
    /// Session related information.
    status: Status,
    /// Information about the peer, set after a successful handshake.
    peer_info: Option<PeerInfo>,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(
        manager: Arc<PieceManager>,
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                manager,
                cmd_port: Some(cmd_port),
                addr,
                info_hash,
                client_id,
                status: Status::default(),
                peer_info: None,
            },
            cmd_chan,
        )
    }

    /// Starts the peer session and returns if the connection is closed or an
    /// error occurs.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::PeerTimeout)??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.status.state = State::Handshaking;
        let handshake = Handshake::new(self.info_hash, self.client_id);
        log::debug!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await?;

        let peer_handshake =
            match timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
                Err(_) => return Err(Error::PeerTimeout),
                Ok(None) => return Err(Error::PeerDisconnected),
                Ok(Some(peer_handshake)) => peer_handshake?,
            };
        log::debug!("Received handshake from peer {}", self.addr);

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::HandshakeMismatch);
        }

        // the remote id is recorded but not checked against anything
        log::debug!(
            "Peer {} id {:?}",
            self.addr,
            String::from_utf8_lossy(&peer_handshake.peer_id)
        );
        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
            pieces: None,
        });

        // now that we have the handshake, we need to switch to the peer
        // message codec and save the socket in self (note that we need to
        // keep the buffer from the original codec as it may contain bytes
        // of any potential message the peer may have sent after the
        // handshake)
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new::<Message>(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        // advertise our piece availability, then declare interest; the
        // pipeline starts once the peer unchokes us
        socket
            .send(Message::Bitfield(self.manager.bitfield()))
            .await?;
        socket.send(Message::Interested).await?;
        self.status.is_interested = true;

        self.status.state = State::Connected;
        log::info!("Peer {} session state: {:?}", self.addr, self.status.state);

        let result = self.run(socket).await;
        log::info!(
            "Peer {} session ended with {} block bytes downloaded",
            self.addr,
            self.status.downloaded_block_bytes_count
        );
        result
    }

    /// Runs the session after the connection to peer is established.
    ///
    /// This is the main session "loop" and performs the core of the session
    /// logic: exchange of messages, idle timeout, shutdown commands.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        // split the sink and stream so that we can pass the sink while
        // holding a reference to the stream in the loop
        let (mut sink, mut stream) = socket.split();
        let mut cmd_port = self
            .cmd_port
            .take()
            .ok_or_else(|| Error::PeerProtocolViolation(
                "session started twice".to_string(),
            ))?;

        loop {
            let msg = timeout(IDLE_TIMEOUT, stream.next()).fuse();
            let cmd = cmd_port.recv().fuse();
            pin_mut!(msg, cmd);

            select! {
                msg = msg => match msg {
                    // the peer didn't even send a keep-alive
                    Err(_) => return Err(Error::PeerTimeout),
                    Ok(None) => {
                        log::info!("Peer {} closed the connection", self.addr);
                        return Ok(());
                    }
                    Ok(Some(msg)) => {
                        let msg = msg?;
                        self.handle_msg(&mut sink, msg).await?;
                    }
                },
                cmd = cmd => match cmd {
                    Some(Command::Shutdown) | None => {
                        log::info!("Shutting down peer {} session", self.addr);
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        if let Some(id) = msg.id() {
            log::debug!("Received message {:?} from peer {}", id, self.addr);
        }
        match msg {
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    // since we're choked we don't expect our outstanding
                    // requests to be served; the manager's request timeout
                    // re-issues them
                    self.status.pending_request_count = 0;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    // now that we are allowed to request blocks, start the
                    // download pipeline
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                // recorded only; the engine doesn't serve blocks
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                self.register_peer_piece(piece_index);
            }
            Message::Bitfield(bitfield) => {
                self.handle_bitfield_msg(bitfield);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block_msg(piece_index, offset, data)?;

                // we may be able to make more requests now that a block has
                // arrived
                self.make_requests(sink).await?;
            }
            // not served: this client only leeches
            Message::Request(block) => {
                log::debug!(
                    "Peer {} requested block {:?}, ignoring",
                    self.addr,
                    block
                );
            }
            Message::Cancel(block) => {
                log::debug!(
                    "Peer {} canceled block {:?}, ignoring",
                    self.addr,
                    block
                );
            }
        }

        Ok(())
    }

    /// Records the peer's piece availability. Not used for picking yet, but
    /// kept up to date for when per peer availability lands.
    fn handle_bitfield_msg(&mut self, mut bitfield: crate::Bitfield) {
        log::debug!("Handling peer {} bitfield message", self.addr);
        // The bitfield raw data that is sent over the wire may be longer
        // than the logical pieces it represents, if the number of pieces in
        // torrent is not a multiple of 8. Therefore, we need to slice off
        // the last part of the bitfield.
        bitfield.resize(self.manager.piece_count(), false);
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = Some(bitfield);
        }
    }

    fn register_peer_piece(&mut self, piece_index: PieceIndex) {
        if let Some(pieces) = self
            .peer_info
            .as_mut()
            .and_then(|peer_info| peer_info.pieces.as_mut())
        {
            if piece_index < pieces.len() {
                pieces.set(piece_index, true);
            }
        }
    }

    /// Hands a received block to the piece manager and updates statistics.
    ///
    /// Disk failures bubble up and kill the session (and with it the
    /// torrent); anything else about the block is at worst ignorable.
    fn handle_block_msg(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        log::debug!(
            "Received block {}:{} ({} bytes) from peer {}",
            piece_index,
            offset,
            data.len(),
            self.addr
        );
        self.status.pending_request_count =
            self.status.pending_request_count.saturating_sub(1);

        match self.manager.block_received(piece_index, offset, &data)? {
            BlockStatus::Accepted => {
                self.status.downloaded_block_bytes_count += data.len() as u64;
            }
            BlockStatus::Duplicate => {
                log::debug!(
                    "Peer {} sent block {}:{} we already have",
                    self.addr,
                    piece_index,
                    offset
                );
            }
            BlockStatus::Rejected => {
                log::warn!(
                    "Peer {} sent invalid block {}:{}",
                    self.addr,
                    piece_index,
                    offset
                );
            }
        }
        Ok(())
    }

    /// Fills the session's download pipeline up to the allowed number of
    /// outstanding requests.
    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }

        while self.status.pending_request_count < MAX_PENDING_REQUESTS {
            let block = match self.manager.next_request() {
                Some(block) => block,
                // nothing is requestable right now; received blocks and
                // request timeouts will trigger the next refill attempt
                None => break,
            };
            log::debug!("Requesting block {:?} from peer {}", block, self.addr);
            sink.send(Message::Request(block)).await?;
            self.status.pending_request_count += 1;
        }

        Ok(())
    }
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
    /// The number of block requests we sent and haven't seen answered yet.
    pending_request_count: usize,
    /// The number of piece/block bytes downloaded over this session.
    downloaded_block_bytes_count: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_interested: false,
            pending_request_count: 0,
            downloaded_block_bytes_count: 0,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the 'handshake', may be exchanged.
    Connected,
}

/// The default (and initial) state of a peer session is `Disconnected`.
impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    #[allow(dead_code)]
    peer_id: PeerId,
    /// All pieces peer has, updated when it announces to us a new piece.
    pieces: Option<crate::Bitfield>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metainfo::{FilePlan, Metainfo},
        Bitfield, Sha1Hash, StorageInfo, BLOCK_LEN,
    };
    use sha1::{Digest, Sha1};
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    const PIECE_LEN: u32 = 2 * BLOCK_LEN;
    const INFO_HASH: Sha1Hash = [0x42; 20];
    const CLIENT_ID: PeerId = *b"-RP0001-000000000000";
    const SEED_ID: PeerId = *b"-SD0001-000000000000";

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 37 % 239) as u8).collect()
    }

    fn manager_for(dir: &TempDir, content: &[u8]) -> Arc<PieceManager> {
        let piece_hashes: Vec<Sha1Hash> = content
            .chunks(PIECE_LEN as usize)
            .map(|piece| Sha1::digest(piece).into())
            .collect();
        let metainfo = Metainfo {
            announce: "http://t.example/ann".to_string(),
            info_hash: INFO_HASH,
            piece_len: PIECE_LEN,
            piece_hashes: piece_hashes.clone(),
            name: "payload".to_string(),
            total_len: content.len() as u64,
            plan: FilePlan::Single {
                len: content.len() as u64,
            },
        };
        let info = StorageInfo::new(&metainfo, dir.path());
        Arc::new(PieceManager::new(info, piece_hashes).unwrap())
    }

    /// A scripted seed: accepts one leecher, handshakes, advertises all
    /// pieces, unchokes, and serves every requested block. When `corrupt` is
    /// set, the first served block of piece 0 has a byte flipped.
    async fn run_seed(listener: TcpListener, content: Vec<u8>, corrupt: bool) {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = Framed::new(socket, HandshakeCodec);

        let handshake = socket.next().await.unwrap().unwrap();
        assert_eq!(handshake.info_hash, INFO_HASH);
        socket
            .send(Handshake::new(INFO_HASH, SEED_ID))
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

        let mut corrupt_next = corrupt;
        while let Some(msg) = socket.next().await {
            match msg.unwrap() {
                Message::Request(block) => {
                    let start = block.piece_index * PIECE_LEN as usize
                        + block.offset as usize;
                    let mut data =
                        content[start..start + block.len as usize].to_vec();
                    if corrupt_next && block.piece_index == 0 {
                        data[0] ^= 0xff;
                        corrupt_next = false;
                    }
                    socket
                        .send(Message::Block {
                            piece_index: block.piece_index,
                            offset: block.offset,
                            data,
                        })
                        .await
                        .unwrap();
                }
                // the leecher's own bitfield and interest declarations
                _ => {}
            }
        }
    }

    async fn download_via_session(
        manager: Arc<PieceManager>,
        addr: SocketAddr,
    ) -> Result<()> {
        let (mut session, cmd_chan) =
            PeerSession::outbound(Arc::clone(&manager), addr, INFO_HASH, CLIENT_ID);
        // wind the session down once the last piece verifies
        tokio::spawn(async move {
            manager.completion().notified().await;
            let _ = cmd_chan.send(Command::Shutdown);
        });
        session.start().await
    }

    #[tokio::test]
    async fn test_downloads_two_piece_torrent_from_scripted_seed() {
        let dir = TempDir::new().unwrap();
        let content = payload(PIECE_LEN as usize + 100);
        let manager = manager_for(&dir, &content);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seed = tokio::spawn(run_seed(listener, content.clone(), false));

        download_via_session(Arc::clone(&manager), addr)
            .await
            .unwrap();

        assert!(manager.complete());
        assert!(manager.have(0));
        assert!(manager.have(1));
        assert_eq!(manager.downloaded_bytes(), content.len() as u64);
        assert_eq!(
            std::fs::read(dir.path().join("payload")).unwrap(),
            content
        );
        seed.await.unwrap();
    }

    #[tokio::test]
    async fn test_redownloads_piece_after_hash_mismatch() {
        let dir = TempDir::new().unwrap();
        let content = payload(PIECE_LEN as usize + 100);
        let manager = manager_for(&dir, &content);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seed = tokio::spawn(run_seed(listener, content.clone(), true));

        download_via_session(Arc::clone(&manager), addr)
            .await
            .unwrap();

        assert!(manager.complete());
        assert_eq!(
            std::fs::read(dir.path().join("payload")).unwrap(),
            content
        );
        // the discarded delivery of piece 0 occupied buffer slots before the
        // hash check failed, so its bytes stay counted
        assert_eq!(
            manager.downloaded_bytes(),
            content.len() as u64 + PIECE_LEN as u64
        );
        seed.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_infohash_mismatch_closes_session() {
        let dir = TempDir::new().unwrap();
        let content = payload(PIECE_LEN as usize);
        let manager = manager_for(&dir, &content);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = Framed::new(socket, HandshakeCodec);
            socket.next().await.unwrap().unwrap();
            socket
                .send(Handshake::new([0xdd; 20], SEED_ID))
                .await
                .unwrap();
        });

        let (mut session, _cmd_chan) =
            PeerSession::outbound(Arc::clone(&manager), addr, INFO_HASH, CLIENT_ID);
        assert!(matches!(
            session.start().await,
            Err(Error::HandshakeMismatch)
        ));
        assert!(!manager.complete());
    }

    #[tokio::test]
    async fn test_truncated_handshake_closes_session() {
        let dir = TempDir::new().unwrap();
        let content = payload(PIECE_LEN as usize);
        let manager = manager_for(&dir, &content);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut socket, _) = listener.accept().await.unwrap();
            // an incomplete handshake, then hang up
            socket.write_all(&[19; 30]).await.unwrap();
        });

        let (mut session, _cmd_chan) =
            PeerSession::outbound(Arc::clone(&manager), addr, INFO_HASH, CLIENT_ID);
        assert!(session.start().await.is_err());
    }
}
