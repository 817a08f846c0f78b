//! Parsing of metainfo (.torrent) files.
//!
//! The metainfo is decoded with the [`bencode`](crate::bencode) codec and the
//! infohash is computed over the original byte span of the `info` value, so
//! it is identical to what every other client derives for the same file, no
//! matter how the dictionary keys were ordered on disk.

use sha1::{Digest, Sha1};
use std::path::Path;

use crate::{
    bencode::{self, Value},
    error::{Error, Result},
    Sha1Hash,
};

/// One file of a multi-file torrent, as declared by the metainfo: a relative
/// path (components to be joined below the torrent's directory) and a length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct File {
    pub path: Vec<String>,
    pub len: u64,
}

/// The file layout of the download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilePlan {
    /// A single file named after the torrent.
    Single { len: u64 },
    /// Multiple files under a directory named after the torrent.
    Multi { files: Vec<File> },
}

impl FilePlan {
    /// The sum of the lengths of all files.
    pub fn total_len(&self) -> u64 {
        match self {
            FilePlan::Single { len } => *len,
            FilePlan::Multi { files } => files.iter().map(|f| f.len).sum(),
        }
    }
}

/// A parsed metainfo file. Immutable once parsed.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The URL of the tracker to announce to.
    pub announce: String,
    /// SHA-1 of the bencoded `info` dictionary; identifies the swarm.
    pub info_hash: Sha1Hash,
    /// The nominal piece length. All pieces but possibly the last are this
    /// long.
    pub piece_len: u32,
    /// The expected SHA-1 digest of each piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The advised name of the downloaded file or directory.
    pub name: String,
    /// The declared file layout.
    pub plan: FilePlan,
    /// The total download size in bytes.
    pub total_len: u64,
}

impl Metainfo {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let buf = std::fs::read(path).map_err(Error::Disk)?;
        Self::from_bytes(&buf)
    }

    /// Parses the raw contents of a metainfo file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let root = bencode::decode(buf)?;

        let announce = Self::parse_announce(&root)?;

        let info = root
            .get(b"info")
            .filter(|info| info.as_dict().is_some())
            .ok_or_else(|| err("no info dictionary"))?;
        // hash the bytes the info value was decoded from, not a re-encoding
        let info_span = bencode::dict_value_span(buf, b"info")?
            .ok_or_else(|| err("no info dictionary"))?;
        let digest = Sha1::digest(&buf[info_span]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);

        let piece_len = info
            .get(b"piece length")
            .and_then(Value::as_int)
            .filter(|len| *len > 0 && *len <= u32::MAX as i64)
            .ok_or_else(|| err("bad piece length"))? as u32;

        let pieces = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| err("no pieces"))?;
        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(err("pieces length is not a multiple of 20"));
        }
        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect::<Vec<Sha1Hash>>();

        let name = info
            .get(b"name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| err("bad name"))?
            .to_string();

        let plan = Self::parse_plan(info)?;
        let total_len = plan.total_len();
        if total_len == 0 {
            return Err(err("torrent is empty"));
        }
        // the piece table must tile the download exactly, leaving a last
        // piece of length in (0, piece_len]
        let expected_count =
            (total_len + piece_len as u64 - 1) / piece_len as u64;
        if piece_hashes.len() as u64 != expected_count {
            return Err(err("piece count disagrees with total length"));
        }

        Ok(Self {
            announce,
            info_hash,
            piece_len,
            piece_hashes,
            name,
            plan,
            total_len,
        })
    }

    /// The `announce` key, falling back to the first `announce-list` entry
    /// for archives that only carry the list form.
    fn parse_announce(root: &Value) -> Result<String> {
        if let Some(announce) = root.get(b"announce").and_then(Value::as_str) {
            return Ok(announce.to_string());
        }
        root.get(b"announce-list")
            .and_then(Value::as_list)
            .and_then(|tiers| tiers.first())
            .and_then(Value::as_list)
            .and_then(|tier| tier.first())
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| err("no announce URL"))
    }

    fn parse_plan(info: &Value) -> Result<FilePlan> {
        let files = match info.get(b"files") {
            None => {
                let len = info
                    .get(b"length")
                    .and_then(Value::as_int)
                    .filter(|len| *len >= 0)
                    .ok_or_else(|| err("no length or files"))?;
                return Ok(FilePlan::Single { len: len as u64 });
            }
            Some(files) => files.as_list().ok_or_else(|| err("files is not a list"))?,
        };
        if files.is_empty() {
            return Err(err("files list is empty"));
        }
        let files = files
            .iter()
            .map(|entry| {
                let len = entry
                    .get(b"length")
                    .and_then(Value::as_int)
                    .filter(|len| *len >= 0)
                    .ok_or_else(|| err("bad file length"))?;
                let path = entry
                    .get(b"path")
                    .and_then(Value::as_list)
                    .filter(|parts| !parts.is_empty())
                    .ok_or_else(|| err("bad file path"))?
                    .iter()
                    .map(|part| {
                        part.as_str()
                            .filter(|p| !p.is_empty() && *p != ".." && !p.contains('/'))
                            .map(str::to_string)
                            .ok_or_else(|| err("bad file path component"))
                    })
                    .collect::<Result<Vec<String>>>()?;
                Ok(File {
                    path,
                    len: len as u64,
                })
            })
            .collect::<Result<Vec<File>>>()?;
        Ok(FilePlan::Multi { files })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// The length of the final piece, which is the total size modulo the
    /// piece length, or a whole piece if they divide evenly.
    pub fn last_piece_len(&self) -> u32 {
        let remainder = self.total_len % self.piece_len as u64;
        if remainder == 0 {
            self.piece_len
        } else {
            remainder as u32
        }
    }
}

fn err(msg: &str) -> Error {
    Error::Metainfo(msg.to_string())
}
