use std::path::PathBuf;

use crate::{
    error::{Error, Result},
    metainfo::Metainfo,
    PieceIndex,
};

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, and the output file path.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The length of the single downloaded file.
    pub download_len: u64,
    /// Where the downloaded file is written, which is the download directory
    /// joined by the torrent's name.
    pub output_path: PathBuf,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    ///
    /// The piece count is derived from the download length and cross-checked
    /// against the number of digests in the metainfo, so that a truncated
    /// digest list can't silently pass verification.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Result<Self> {
        if !metainfo.is_single_file() {
            return Err(Error::MultiFileTorrent);
        }

        let download_len = metainfo.total_size();
        if download_len == 0 {
            return Err(Error::InvalidMetainfo("download length is zero"));
        }

        let piece_len = metainfo.info.piece_length as u32;
        let piece_count =
            ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        if piece_count != metainfo.piece_count() {
            return Err(Error::InvalidMetainfo(
                "piece digest count doesn't match the download length",
            ));
        }

        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        Ok(Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            output_path: download_dir.join(&metainfo.info.name),
        })
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidMetainfo("piece index out of bounds"))
        }
    }
}

/// Builds a `StorageInfo` straight from its geometry, for tests that don't
/// want to fabricate a whole metainfo.
#[cfg(test)]
pub(crate) fn test_storage(piece_len: u32, download_len: u64) -> StorageInfo {
    let piece_count =
        ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
    let last_piece_len =
        (download_len - piece_len as u64 * (piece_count - 1) as u64) as u32;
    StorageInfo {
        piece_count,
        piece_len,
        last_piece_len,
        download_len,
        output_path: PathBuf::from("/tmp/does/not/exist"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_piece_len() {
        // 3 full length pieces and 1 smaller piece
        let info = test_storage(4, 3 * 4 + 2);

        assert_eq!(info.piece_count, 4);
        assert_eq!(info.piece_len(0).unwrap(), 4);
        assert_eq!(info.piece_len(2).unwrap(), 4);
        assert_eq!(info.piece_len(3).unwrap(), 2);
        assert!(info.piece_len(4).is_err());
    }

    #[test]
    fn test_exact_multiple_has_full_last_piece() {
        let info = test_storage(16384, 4 * 16384);

        assert_eq!(info.piece_count, 4);
        assert_eq!(info.last_piece_len, 16384);
    }

    #[test]
    fn test_single_byte_download() {
        let info = test_storage(16384, 1);

        assert_eq!(info.piece_count, 1);
        assert_eq!(info.last_piece_len, 1);
        assert_eq!(info.piece_len(0).unwrap(), 1);
    }

    #[test]
    fn test_one_byte_past_piece_boundary() {
        let info = test_storage(8, 9);

        assert_eq!(info.piece_count, 2);
        assert_eq!(info.piece_len(0).unwrap(), 8);
        assert_eq!(info.piece_len(1).unwrap(), 1);
    }
}
