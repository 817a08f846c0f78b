//! The piece manager owns all piece and block state of a download: it picks
//! the next block to request, verifies finished pieces against their expected
//! hashes, and stripes verified pieces across the download's files.
//!
//! It is the single mutable point shared by all peer sessions. All state is
//! guarded by a mutex that is only ever held for the duration of a
//! non-suspending operation, so sessions may call into it from any task.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, OpenOptions},
    io::{Seek, SeekFrom, Write},
    sync::Mutex,
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use tokio::sync::Notify;

use crate::{
    block_count, block_len,
    error::{Error, Result},
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PieceIndex, Sha1Hash, BLOCK_LEN,
};

/// How long a requested block may stay unanswered before the request is
/// considered abandoned and handed to another session. This is also the
/// engine's only mechanism for recovering requests lost to a dropped peer
/// connection.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The outcome of handing a received block to the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    /// The block was new and its bytes were stored.
    Accepted,
    /// The block (or its whole piece) had already been received. Nothing
    /// changed, and in particular the downloaded byte counter didn't.
    Duplicate,
    /// The block doesn't belong to any piece we're waiting for, or its
    /// offset or length are invalid.
    Rejected,
}

/// An in-progress piece: the block bookkeeping and the in-memory buffer the
/// blocks accumulate in until the piece can be hashed.
struct Piece {
    /// The expected hash of the whole piece.
    expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    len: u32,
    /// Which blocks have been received.
    blocks: Vec<bool>,
    /// When each block was last requested. `None` means the block is not
    /// outstanding.
    requested_at: Vec<Option<Instant>>,
    /// The piece's write buffer. Released when the piece is flushed or
    /// discarded.
    buf: Vec<u8>,
}

impl Piece {
    fn new(len: u32, expected_hash: Sha1Hash) -> Self {
        let block_count = block_count(len);
        Self {
            expected_hash,
            len,
            blocks: vec![false; block_count],
            requested_at: vec![None; block_count],
            buf: vec![0; len as usize],
        }
    }

    /// Stores a newly received block at its offset within the piece.
    fn add_block(&mut self, offset: u32, data: &[u8]) {
        let index = (offset / BLOCK_LEN) as usize;
        debug_assert!(!self.blocks[index]);
        self.blocks[index] = true;
        self.requested_at[index] = None;
        self.buf[offset as usize..offset as usize + data.len()]
            .copy_from_slice(data);
    }

    fn mark_requested(&mut self, index: usize, now: Instant) {
        self.requested_at[index] = Some(now);
    }

    /// A block may be requested if it hasn't been received and is not
    /// currently outstanding at another session.
    fn is_block_available(&self, index: usize, now: Instant) -> bool {
        !self.blocks[index]
            && match self.requested_at[index] {
                None => true,
                Some(at) => now.duration_since(at) > REQUEST_TIMEOUT,
            }
    }

    /// The lowest indexed block that was requested but never answered within
    /// the timeout.
    fn first_timed_out_block(&self, now: Instant) -> Option<usize> {
        self.requested_at
            .iter()
            .enumerate()
            .position(|(index, requested_at)| match requested_at {
                Some(at) => {
                    !self.blocks[index]
                        && now.duration_since(*at) > REQUEST_TIMEOUT
                }
                None => false,
            })
    }

    /// Returns true if the piece has all its blocks in its write buffer.
    fn is_complete(&self) -> bool {
        self.blocks.iter().all(|received| *received)
    }

    /// Calculates the piece's hash from its buffer and returns whether it
    /// matches the expected hash.
    fn matches_hash(&self) -> bool {
        let digest = Sha1::digest(&self.buf);
        digest.as_slice() == self.expected_hash
    }
}

/// One of the download's files, opened for the duration of the download with
/// its length pre-allocated.
struct TorrentFile {
    info: crate::FileInfo,
    handle: fs::File,
}

/// The mutable state behind the manager's mutex.
struct State {
    /// Which pieces have been downloaded, verified, and flushed.
    have: Bitfield,
    /// The pieces still to be verified. A pending piece is still missing
    /// until its hash checks out, so the pending keys are a subset of this.
    missing: BTreeSet<PieceIndex>,
    /// The in-progress pieces, keyed by index so that timeout recovery scans
    /// them in piece order.
    pending: BTreeMap<PieceIndex, Piece>,
    /// The number of unique block bytes accepted so far. Duplicates don't
    /// count; bytes of a piece that later fails its hash check stay counted,
    /// keeping the value monotone for progress displays.
    downloaded: u64,
    /// Handles of all files in torrent, opened in advance. Emptied once the
    /// download completes.
    files: Vec<TorrentFile>,
}

/// Owns the piece/block state, the piece write buffers, and the file handles
/// of a single torrent. See the module docs.
pub struct PieceManager {
    info: StorageInfo,
    piece_hashes: Vec<Sha1Hash>,
    state: Mutex<State>,
    /// Signalled once, when the last piece is verified.
    completion: Notify,
}

impl PieceManager {
    /// Sets up the download area: creates the directory structure and the
    /// files, pre-allocated to their declared lengths, and initializes all
    /// pieces as missing.
    pub fn new(info: StorageInfo, piece_hashes: Vec<Sha1Hash>) -> Result<Self> {
        debug_assert_eq!(piece_hashes.len(), info.piece_count);

        let mut files = Vec::with_capacity(info.files.len());
        for file_info in info.files.iter() {
            if let Some(dir) = file_info.path.parent() {
                fs::create_dir_all(dir).map_err(Error::Disk)?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&file_info.path)
                .map_err(Error::Disk)?;
            handle.set_len(file_info.len).map_err(Error::Disk)?;
            files.push(TorrentFile {
                info: file_info.clone(),
                handle,
            });
        }

        let state = State {
            have: Bitfield::repeat(false, info.piece_count),
            missing: (0..info.piece_count).collect(),
            pending: BTreeMap::new(),
            downloaded: 0,
            files,
        };

        Ok(Self {
            info,
            piece_hashes,
            state: Mutex::new(state),
            completion: Notify::new(),
        })
    }

    /// Picks the next block worth requesting, or `None` if every remaining
    /// block is either received or freshly outstanding elsewhere.
    ///
    /// Timed out blocks of already started pieces come first, in piece and
    /// block order, so an abandoned request is always re-issued before new
    /// work is started. Fresh blocks are then picked from the missing pieces
    /// in a random order that is reshuffled on every call: with several
    /// sessions drawing from the same manager this spreads them across
    /// different pieces instead of marching them all through the same one.
    pub fn next_request(&self) -> Option<BlockInfo> {
        let mut state = self.state.lock().expect("piece manager lock poisoned");
        let state = &mut *state;
        let now = Instant::now();

        for (&index, piece) in state.pending.iter_mut() {
            if let Some(block) = piece.first_timed_out_block(now) {
                log::debug!("Block {} of piece {} timed out", block, index);
                piece.mark_requested(block, now);
                return Some(BlockInfo {
                    piece_index: index,
                    offset: block as u32 * BLOCK_LEN,
                    len: block_len(piece.len, block),
                });
            }
        }

        let mut order: Vec<PieceIndex> = state.missing.iter().copied().collect();
        order.shuffle(&mut rand::thread_rng());

        for index in order {
            let piece_len = self.info.piece_len(index);
            let piece = state
                .pending
                .entry(index)
                .or_insert_with(|| Piece::new(piece_len, self.piece_hashes[index]));
            for block in 0..piece.blocks.len() {
                if piece.is_block_available(block, now) {
                    piece.mark_requested(block, now);
                    return Some(BlockInfo {
                        piece_index: index,
                        offset: block as u32 * BLOCK_LEN,
                        len: block_len(piece_len, block),
                    });
                }
            }
        }

        None
    }

    /// Accepts a block received from a peer.
    ///
    /// A valid new block is copied into its piece's buffer; the last missing
    /// block of a piece triggers hash verification and either a striped
    /// flush to disk or, on mismatch, the discarding of the whole piece so
    /// its blocks are re-requested. Disk failures are returned and are fatal
    /// for the torrent.
    pub fn block_received(
        &self,
        index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<BlockStatus> {
        let mut state = self.state.lock().expect("piece manager lock poisoned");
        let state = &mut *state;

        if index >= self.info.piece_count {
            log::warn!("Received block for invalid piece {}", index);
            return Ok(BlockStatus::Rejected);
        }
        let piece_len = self.info.piece_len(index);
        if offset % BLOCK_LEN != 0 || offset >= piece_len {
            log::warn!("Received misaligned block {}:{}", index, offset);
            return Ok(BlockStatus::Rejected);
        }
        if data.len() as u32 != std::cmp::min(BLOCK_LEN, piece_len - offset) {
            log::warn!(
                "Received block {}:{} of invalid length {}",
                index,
                offset,
                data.len()
            );
            return Ok(BlockStatus::Rejected);
        }

        // blocks of an already verified piece are accepted without effect
        if state.have[index] {
            return Ok(BlockStatus::Duplicate);
        }
        let piece = match state.pending.get_mut(&index) {
            Some(piece) => piece,
            // a piece discarded after a hash mismatch loses its pending
            // record, so a straggler block for it has nowhere to go
            None => return Ok(BlockStatus::Rejected),
        };
        let block = (offset / BLOCK_LEN) as usize;
        if piece.blocks[block] {
            return Ok(BlockStatus::Duplicate);
        }

        piece.add_block(offset, data);
        state.downloaded += data.len() as u64;

        if !piece.is_complete() {
            return Ok(BlockStatus::Accepted);
        }

        let piece = state
            .pending
            .remove(&index)
            .expect("complete piece not pending");
        if piece.matches_hash() {
            log::info!("Piece {} is valid", index);
            Self::write_piece(&self.info, &mut state.files, index, &piece)?;
            state.have.set(index, true);
            state.missing.remove(&index);
            if state.missing.is_empty() {
                log::info!("All pieces verified");
                self.completion.notify_one();
            }
        } else {
            // dropping the record erases both the bitmap and the buffer; the
            // blocks count as never requested and get picked up again
            log::warn!("Piece {} hash mismatch, discarding", index);
        }

        Ok(BlockStatus::Accepted)
    }

    /// Writes a verified piece to disk, striping it across the files its
    /// byte range overlaps.
    fn write_piece(
        info: &StorageInfo,
        files: &mut [TorrentFile],
        index: PieceIndex,
        piece: &Piece,
    ) -> Result<()> {
        let mut torrent_offset = info.piece_offset(index);
        let mut written = 0u64;

        while written < piece.len as u64 {
            let file_index = info
                .file_index_at(torrent_offset)
                .expect("piece byte range not covered by stripe table");
            let file = &mut files[file_index];
            let slice = file
                .info
                .get_slice(torrent_offset, piece.len as u64 - written);

            file.handle
                .seek(SeekFrom::Start(slice.offset))
                .map_err(Error::Disk)?;
            file.handle
                .write_all(
                    &piece.buf[written as usize..(written + slice.len) as usize],
                )
                .map_err(Error::Disk)?;

            written += slice.len;
            torrent_offset += slice.len;
        }
        log::trace!("Piece {} flushed ({} bytes)", index, written);

        Ok(())
    }

    /// Returns whether the piece has been downloaded and verified.
    pub fn have(&self, index: PieceIndex) -> bool {
        let state = self.state.lock().expect("piece manager lock poisoned");
        state.have.get(index).map(|bit| *bit).unwrap_or(false)
    }

    /// The fraction of pieces verified so far, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let state = self.state.lock().expect("piece manager lock poisoned");
        state.have.count_ones() as f64 / self.info.piece_count as f64
    }

    /// Returns true once every piece has been verified and flushed.
    pub fn complete(&self) -> bool {
        let state = self.state.lock().expect("piece manager lock poisoned");
        state.missing.is_empty()
    }

    /// The number of unique block bytes accepted so far.
    pub fn downloaded_bytes(&self) -> u64 {
        let state = self.state.lock().expect("piece manager lock poisoned");
        state.downloaded
    }

    /// A snapshot of our piece availability, for the bitfield message sent
    /// to peers after the handshake.
    pub fn bitfield(&self) -> Bitfield {
        let state = self.state.lock().expect("piece manager lock poisoned");
        state.have.clone()
    }

    pub fn piece_count(&self) -> usize {
        self.info.piece_count
    }

    pub(crate) fn download_len(&self) -> u64 {
        self.info.download_len
    }

    /// Signalled when the last piece is verified.
    pub(crate) fn completion(&self) -> &Notify {
        &self.completion
    }

    /// Closes the file handles. Meant for the idle state entered after the
    /// download completes.
    pub fn close_files(&self) {
        let mut state = self.state.lock().expect("piece manager lock poisoned");
        state.files.clear();
    }
}
