//! The metainfo (.torrent) file format.
//!
//! A metainfo file is a bencoded dictionary with an `announce` URL and an
//! `info` dictionary describing a single file: its `name`, `piece length`,
//! `length` and the concatenated SHA-1 digests of its pieces. The SHA-1 of
//! the bencoded `info` dictionary is the torrent's identity, the info-hash.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

use crate::{
    bencode::{self, Value},
    error::{Error, Result},
    PieceIndex, Sha1Hash,
};

/// The parsed, validated contents of a metainfo file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metainfo {
    /// The announce URL of the tracker coordinating this torrent's swarm.
    pub announce: String,
    /// The advisory basename of the downloaded file.
    pub name: String,
    /// The nominal length of a piece. The last piece may be shorter.
    pub piece_len: u32,
    /// The length of the file, in bytes.
    pub download_len: u64,
    /// The expected SHA-1 digest of each piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// SHA-1 over the bencoded `info` dictionary; the torrent's stable
    /// identity within tracker and wire protocols.
    pub info_hash: Sha1Hash,
}

impl Metainfo {
    /// Parses and validates a metainfo file.
    ///
    /// The info-hash is computed over the `info` dictionary's byte slice in
    /// the original input, so metainfo with harmless non-canonical quirks
    /// inside `info` keeps the identity other tools computed for it. The
    /// top-level structure itself must still decode, which rejects
    /// unordered or duplicate dictionary keys.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let root = Value::decode(buf)?;
        let root = root
            .as_dict()
            .ok_or_else(|| malformed("metainfo root is not a dictionary"))?;

        let announce = utf8(required(root, "announce")?)?;

        let info = required(root, "info")?
            .as_dict()
            .ok_or_else(|| malformed("info is not a dictionary"))?;
        let name = utf8(required(info, "name")?)?;
        let piece_len = required(info, "piece length")?
            .as_int()
            .filter(|n| (1..=u32::MAX as i64).contains(n))
            .ok_or_else(|| malformed("invalid piece length"))?
            as u32;
        let download_len = required(info, "length")?
            .as_int()
            .filter(|n| *n >= 1)
            .ok_or_else(|| malformed("invalid length"))? as u64;
        let pieces = required(info, "pieces")?
            .as_bytes()
            .ok_or_else(|| malformed("pieces is not a byte string"))?;
        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(malformed("pieces is not a sequence of 20 byte digests"));
        }
        let piece_hashes: Vec<Sha1Hash> = pieces
            .chunks_exact(20)
            .map(|chunk| chunk.try_into().expect("chunk is 20 bytes"))
            .collect();

        let expected_count =
            (download_len + piece_len as u64 - 1) / piece_len as u64;
        if piece_hashes.len() as u64 != expected_count {
            return Err(malformed("piece digest count does not match length"));
        }

        let info_span = bencode::top_level_entry_span(buf, b"info")?
            .expect("info presence already checked");
        let info_hash = sha1(&buf[info_span]);

        Ok(Self {
            announce,
            name,
            piece_len,
            download_len,
            piece_hashes,
            info_hash,
        })
    }

    /// Serializes into the canonical metainfo bencoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), Value::str(&self.announce));
        root.insert(b"info".to_vec(), Value::Dict(self.info_dict()));
        Value::Dict(root).encode()
    }

    fn info_dict(&self) -> BTreeMap<Vec<u8>, Value> {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Value::Int(self.download_len as i64));
        info.insert(b"name".to_vec(), Value::str(&self.name));
        info.insert(
            b"piece length".to_vec(),
            Value::Int(self.piece_len as i64),
        );
        info.insert(
            b"pieces".to_vec(),
            Value::Bytes(self.piece_hashes.concat()),
        );
        info
    }

    /// Builds the metainfo describing a byte payload, hashing its pieces.
    ///
    /// This is the interface consumed from the torrent-making utility; the
    /// engine itself only ever reads metainfo.
    pub fn for_payload(
        announce: impl Into<String>,
        name: impl Into<String>,
        piece_len: u32,
        payload: &[u8],
    ) -> Result<Self> {
        if piece_len == 0 || payload.is_empty() {
            return Err(malformed("payload and piece length must be nonzero"));
        }
        let piece_hashes =
            payload.chunks(piece_len as usize).map(sha1).collect();
        let mut metainfo = Self {
            announce: announce.into(),
            name: name.into(),
            piece_len,
            download_len: payload.len() as u64,
            piece_hashes,
            info_hash: [0; 20],
        };
        metainfo.info_hash =
            sha1(&Value::Dict(metainfo.info_dict()).encode());
        Ok(metainfo)
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        let count = self.piece_count();
        if index + 1 == count {
            let last =
                self.download_len - self.piece_len as u64 * (count as u64 - 1);
            Ok(last as u32)
        } else if index + 1 < count {
            Ok(self.piece_len)
        } else {
            Err(Error::OutOfRange)
        }
    }
}

fn required<'v>(
    dict: &'v BTreeMap<Vec<u8>, Value>,
    key: &str,
) -> Result<&'v Value> {
    dict.get(key.as_bytes())
        .ok_or_else(|| malformed(&format!("missing key {}", key)))
}

fn utf8(value: &Value) -> Result<String> {
    value
        .as_bytes()
        .and_then(|b| std::str::from_utf8(b).ok())
        .map(str::to_owned)
        .ok_or_else(|| malformed("expected a UTF-8 string"))
}

fn malformed(what: &str) -> Error {
    Error::MalformedMetainfo(what.into())
}

fn sha1(buf: impl AsRef<[u8]>) -> Sha1Hash {
    Sha1::digest(buf.as_ref()).into()
}
