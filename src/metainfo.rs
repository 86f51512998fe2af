//! Torrent metainfo parsing.
//!
//! Supports v1 torrents, v2 torrents (BEP-52, to the extent of per-piece
//! SHA-256 hashes), and hybrid torrents carrying both hash sets, as well as
//! the BEP-47 per-file extensions (attributes, symlink target, file SHA-1).
//! A descriptor is immutable once parsed; magnet-sourced descriptors are
//! represented by [`Metainfo::metadata_incomplete`] returning true until the
//! info dictionary arrives from peers.

use std::{collections::BTreeMap, path::PathBuf};

use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{
    error::{Error, Result},
    storage_info::FsStructure,
    FileInfo, InfoHash, Sha256Hash,
};

/// The version of the metainfo format the torrent was created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaVersion {
    V1,
    V2,
    /// Both the v1 `pieces` string and v2 piece layers are present and both
    /// must verify.
    Hybrid,
}

/// The parsed `.torrent` file.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    /// v2/hybrid: per-file piece hash runs keyed by the file's pieces root.
    #[serde(rename = "piece layers")]
    pub piece_layers: Option<BTreeMap<ByteBuf, ByteBuf>>,
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Metainfo = serde_bencode::from_bytes(buf)?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    fn validate(&self) -> Result<()> {
        if self.info.piece_length == 0 {
            return Err(Error::Validation("piece length is zero".into()));
        }
        match self.meta_version() {
            MetaVersion::V1 | MetaVersion::Hybrid => {
                let pieces = self.info.pieces.as_ref().ok_or_else(|| {
                    Error::Validation("v1 torrent without pieces".into())
                })?;
                if pieces.len() % 20 != 0 {
                    return Err(Error::Validation(
                        "pieces length is not a multiple of 20".into(),
                    ));
                }
            }
            MetaVersion::V2 => {
                if self.piece_layers.is_none() {
                    return Err(Error::Validation(
                        "v2 torrent without piece layers".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn meta_version(&self) -> MetaVersion {
        match (self.info.meta_version, self.info.pieces.is_some()) {
            (Some(2), true) => MetaVersion::Hybrid,
            (Some(2), false) => MetaVersion::V2,
            _ => MetaVersion::V1,
        }
    }

    /// Computes the torrent's canonical 20 byte identifier by re-encoding the
    /// info dictionary: the SHA-1 digest for v1 and hybrid torrents, the
    /// truncated SHA-256 digest for v2-only torrents.
    pub fn create_info_hash(&self) -> Result<InfoHash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let mut info_hash = [0; 20];
        match self.meta_version() {
            MetaVersion::V2 => {
                let digest = Sha256::digest(&info);
                info_hash.copy_from_slice(&digest[..20]);
            }
            _ => {
                let digest = Sha1::digest(&info);
                info_hash.copy_from_slice(&digest);
            }
        }
        Ok(info_hash)
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        if let Some(pieces) = &self.info.pieces {
            pieces.len() / 20
        } else {
            // v2-only: derived from the total length instead of the v1
            // pieces string
            let total = self.structure().download_len();
            ((total + self.info.piece_length - 1) / self.info.piece_length)
                as usize
        }
    }

    /// The concatenated 20 byte SHA-1 piece hashes (v1 and hybrid torrents).
    pub fn piece_hashes(&self) -> Option<&[u8]> {
        self.info.pieces.as_ref().map(|b| b.as_slice())
    }

    /// The per-piece SHA-256 hashes in global piece order (v2 and hybrid
    /// torrents).
    ///
    /// Piece layers are keyed by per-file pieces roots; layers are
    /// concatenated in key order, which is exact for single-layer torrents
    /// and an approximation of the file-tree order otherwise.
    pub fn v2_piece_hashes(&self) -> Option<Vec<Sha256Hash>> {
        let layers = self.piece_layers.as_ref()?;
        let mut hashes = Vec::new();
        for layer in layers.values() {
            for chunk in layer.chunks(32) {
                if chunk.len() != 32 {
                    return None;
                }
                let mut hash = [0; 32];
                hash.copy_from_slice(chunk);
                hashes.push(hash);
            }
        }
        Some(hashes)
    }

    /// Whether the torrent is marked private (BEP-27). Private torrents are
    /// never announced to or looked up in the DHT.
    pub fn is_private(&self) -> bool {
        self.info.private == Some(1)
    }

    /// Whether the descriptor is still waiting for the info dictionary.
    /// Parsed `.torrent` files are always complete; magnet-sourced
    /// placeholders report true until metadata arrives from peers.
    pub fn metadata_incomplete(&self) -> bool {
        false
    }

    /// The file system structure of the download.
    pub fn structure(&self) -> FsStructure {
        if let Some(files) = &self.info.files {
            let mut list = Vec::with_capacity(files.len());
            let mut torrent_offset = 0;
            for file in files.iter() {
                let len = file.length;
                list.push(FileInfo {
                    path: file.path.iter().collect(),
                    torrent_offset,
                    len,
                    attr: file.attr.clone(),
                    symlink_target: file
                        .symlink_path
                        .as_ref()
                        .map(|p| p.iter().collect::<PathBuf>()),
                    sha1: file.sha1.as_ref().and_then(|b| {
                        let b: &[u8] = b;
                        b.try_into().ok()
                    }),
                });
                torrent_offset += len;
            }
            FsStructure::Archive { files: list }
        } else {
            FsStructure::File(FileInfo {
                path: PathBuf::from(&self.info.name),
                torrent_offset: 0,
                len: self.info.length.unwrap_or_default(),
                attr: None,
                symlink_target: None,
                sha1: None,
            })
        }
    }

    /// All tracker URLs, flattened from the announce list with the single
    /// announce URL as fallback.
    pub fn trackers(&self) -> Vec<String> {
        if let Some(list) = &self.announce_list {
            let mut urls: Vec<String> =
                list.iter().flatten().cloned().collect();
            if urls.is_empty() {
                if let Some(announce) = &self.announce {
                    urls.push(announce.clone());
                }
            }
            urls
        } else {
            self.announce.iter().cloned().collect()
        }
    }
}

/// The torrent's info dictionary.
///
/// Field order matters: bencode dictionaries are sorted by key and the
/// serializer emits struct fields in declaration order, so keeping the
/// fields in their bencoded key order makes the re-encoded dictionary (and
/// with it the info hash) canonical.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    /// v2: the file tree, kept opaque. Only per-piece hashes from the piece
    /// layers are consumed; full hash-tree validation is not performed.
    #[serde(rename = "file tree", skip_serializing_if = "Option::is_none")]
    pub file_tree: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(rename = "meta version", skip_serializing_if = "Option::is_none")]
    pub meta_version: Option<u8>,
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pieces: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

/// An entry of a multi-file torrent's file list.
#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    /// BEP-47 attributes, e.g. "p" for a padding file or "x" for executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr: Option<String>,
    pub length: u64,
    pub path: Vec<String>,
    /// BEP-47: the SHA-1 of this file's content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<ByteBuf>,
    /// BEP-47: target path for symlink entries.
    #[serde(rename = "symlink path", skip_serializing_if = "Option::is_none")]
    pub symlink_path: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn single_file_info() -> Info {
        Info {
            file_tree: None,
            files: None,
            length: Some(40_000),
            meta_version: None,
            name: "single".into(),
            piece_length: 32_768,
            pieces: Some(ByteBuf::from(vec![0xabu8; 40])),
            private: None,
        }
    }

    #[test]
    fn test_parse_single_file_torrent() {
        let info = single_file_info();
        let mut torrent = Vec::new();
        torrent.extend(b"d4:info");
        torrent.extend(serde_bencode::to_bytes(&info).unwrap());
        torrent.push(b'e');

        let metainfo = Metainfo::from_bytes(&torrent).unwrap();
        assert_eq!(metainfo.info.name, "single");
        assert_eq!(metainfo.meta_version(), MetaVersion::V1);
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_hashes().unwrap().len(), 40);
        assert!(!metainfo.is_private());
        assert!(!metainfo.metadata_incomplete());

        // the info hash must be the SHA-1 of the re-encoded info dict
        let expected = Sha1::digest(serde_bencode::to_bytes(&info).unwrap());
        assert_eq!(metainfo.create_info_hash().unwrap()[..], expected[..]);
    }

    #[test]
    fn test_parse_multi_file_torrent_with_padding() {
        let info = Info {
            file_tree: None,
            files: Some(vec![
                File {
                    attr: None,
                    length: 10,
                    path: vec!["a".into()],
                    sha1: None,
                    symlink_path: None,
                },
                File {
                    attr: Some("p".into()),
                    length: 6,
                    path: vec![".pad".into(), "6".into()],
                    sha1: None,
                    symlink_path: None,
                },
                File {
                    attr: None,
                    length: 4,
                    path: vec!["dir".into(), "b".into()],
                    sha1: None,
                    symlink_path: None,
                },
            ]),
            length: None,
            meta_version: None,
            name: "archive".into(),
            piece_length: 16,
            pieces: Some(ByteBuf::from(vec![0u8; 40])),
            private: Some(1),
        };
        let mut torrent = Vec::new();
        torrent.extend(b"d4:info");
        torrent.extend(serde_bencode::to_bytes(&info).unwrap());
        torrent.push(b'e');

        let metainfo = Metainfo::from_bytes(&torrent).unwrap();
        assert!(metainfo.is_private());
        match metainfo.structure() {
            FsStructure::Archive { files } => {
                assert_eq!(files.len(), 3);
                // padding bytes occupy torrent offsets
                assert_eq!(files[1].torrent_offset, 10);
                assert!(files[1].is_padding());
                assert_eq!(files[2].torrent_offset, 16);
                assert!(!files[2].is_padding());
            }
            _ => panic!("expected archive structure"),
        }
    }

    #[test]
    fn test_hybrid_torrent_detection() {
        let mut layers = BTreeMap::new();
        layers.insert(
            ByteBuf::from(vec![1u8; 32]),
            ByteBuf::from(vec![2u8; 64]),
        );
        let metainfo = Metainfo {
            announce: None,
            announce_list: None,
            piece_layers: Some(layers),
            info: Info {
                meta_version: Some(2),
                ..single_file_info()
            },
        };
        assert_eq!(metainfo.meta_version(), MetaVersion::Hybrid);
        let v2 = metainfo.v2_piece_hashes().unwrap();
        assert_eq!(v2.len(), 2);
        assert_eq!(v2[0], [2u8; 32]);
    }

    #[test]
    fn test_invalid_pieces_length_rejected() {
        let mut info = single_file_info();
        info.pieces = Some(ByteBuf::from(vec![0u8; 21]));
        let mut torrent = Vec::new();
        torrent.extend(b"d4:info");
        torrent.extend(serde_bencode::to_bytes(&info).unwrap());
        torrent.push(b'e');
        assert!(matches!(
            Metainfo::from_bytes(&torrent),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_trackers_flatten_announce_list() {
        let metainfo = Metainfo {
            announce: Some("http://primary/announce".into()),
            announce_list: Some(vec![
                vec!["http://a/announce".into()],
                vec!["http://b/announce".into()],
            ]),
            piece_layers: None,
            info: single_file_info(),
        };
        assert_eq!(
            metainfo.trackers(),
            vec!["http://a/announce", "http://b/announce"]
        );
    }
}
