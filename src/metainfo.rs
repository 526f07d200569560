use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    Sha1Hash,
};

/// The parsed representation of a `.torrent` file.
///
/// Only the fields the engine needs are kept. The `info` dictionary is
/// re-encoded verbatim to derive the info hash that identifies the swarm.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    /// The tracker announce URL.
    pub announce: String,
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Metainfo = serde_bencode::from_bytes(buf)?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    /// The SHA-1 of the bencoded `info` dictionary.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Whether the torrent's payload is a single file. Multi-file torrents
    /// are rejected before the engine starts.
    pub fn is_single_file(&self) -> bool {
        self.info.length.is_some() && self.info.files.is_none()
    }

    /// The total payload size, in bytes.
    pub fn total_size(&self) -> u64 {
        self.info.length.unwrap_or_default()
    }

    /// The number of pieces, as advertised by the digest list.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Splits the concatenated digest string into one 20 byte SHA-1 per
    /// piece.
    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.info.length.is_none() && self.info.files.is_none() {
            return Err(Error::InvalidMetainfo("no length and no files"));
        }
        if self.info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("piece length is zero"));
        }
        if self.info.piece_length > u32::MAX as u64 {
            return Err(Error::InvalidMetainfo("piece length too large"));
        }
        if self.info.pieces.is_empty() || self.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "piece digest string is not a multiple of 20 bytes",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    pub pieces: ByteBuf,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // A hand-built single-file torrent with two pieces. The digest string is
    // 40 'a's, which is not a real hash but is structurally valid.
    fn single_file_torrent() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce26:http://tracker.example/ann4:infod");
        buf.extend_from_slice(b"6:lengthi300e");
        buf.extend_from_slice(b"4:name8:test.bin");
        buf.extend_from_slice(b"12:piece lengthi256e");
        buf.extend_from_slice(b"6:pieces40:");
        buf.extend_from_slice(&[b'a'; 40]);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_parse_single_file() {
        let metainfo = Metainfo::from_bytes(&single_file_torrent()).unwrap();

        assert_eq!(metainfo.announce, "http://tracker.example/ann");
        assert_eq!(metainfo.info.name, "test.bin");
        assert_eq!(metainfo.info.piece_length, 256);
        assert_eq!(metainfo.total_size(), 300);
        assert_eq!(metainfo.piece_count(), 2);
        assert!(metainfo.is_single_file());

        let hashes = metainfo.piece_hashes();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], [b'a'; 20]);
    }

    #[test]
    fn test_info_hash_is_digest_of_reencoded_info() {
        let metainfo = Metainfo::from_bytes(&single_file_torrent()).unwrap();

        let reencoded = serde_bencode::to_bytes(&metainfo.info).unwrap();
        let mut expected = [0; 20];
        expected.copy_from_slice(&Sha1::digest(&reencoded));

        assert_eq!(metainfo.create_info_hash().unwrap(), expected);
    }

    #[test]
    fn test_multi_file_is_parsed_but_flagged() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce26:http://tracker.example/ann4:infod");
        buf.extend_from_slice(b"5:filesld6:lengthi100e4:pathl3:fooeee");
        buf.extend_from_slice(b"4:name8:test.dir");
        buf.extend_from_slice(b"12:piece lengthi256e");
        buf.extend_from_slice(b"6:pieces20:");
        buf.extend_from_slice(&[b'a'; 20]);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert!(!metainfo.is_single_file());
    }

    #[test]
    fn test_truncated_digest_string_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce26:http://tracker.example/ann4:infod");
        buf.extend_from_slice(b"6:lengthi300e");
        buf.extend_from_slice(b"4:name8:test.bin");
        buf.extend_from_slice(b"12:piece lengthi256e");
        buf.extend_from_slice(b"6:pieces19:");
        buf.extend_from_slice(&[b'a'; 19]);
        buf.extend_from_slice(b"ee");

        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }
}
