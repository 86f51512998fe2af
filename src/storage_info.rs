use std::{ops::Range, path::PathBuf};

use crate::{error::*, metainfo::Metainfo, FileIndex, PieceIndex, Sha1Hash};

/// Information about a torrent's file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
    /// BEP-47 attribute characters ("p" padding, "x" executable, "h" hidden,
    /// "l" symlink), if the torrent declares any.
    pub attr: Option<String>,
    /// BEP-47: the link target for symlink entries.
    pub symlink_target: Option<PathBuf>,
    /// BEP-47: the SHA-1 of the whole file, if the torrent declares it.
    pub sha1: Option<Sha1Hash>,
}

impl FileInfo {
    /// Creates a plain file entry without BEP-47 extensions.
    pub fn new(
        path: impl Into<PathBuf>,
        torrent_offset: u64,
        len: u64,
    ) -> Self {
        Self {
            path: path.into(),
            len,
            torrent_offset,
            attr: None,
            symlink_target: None,
            sha1: None,
        }
    }

    /// Whether this is a BEP-47 padding file. Padding bytes occupy torrent
    /// offsets but the file is never materialized on disk.
    pub fn is_padding(&self) -> bool {
        self.attr.as_deref().map_or(false, |a| a.contains('p'))
    }

    /// Returns a range that represents the file's first and one past the last
    /// bytes' offsets in the torrent.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// Returns the file's one past the last byte's offset in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Maps a torrent byte range onto this file: the returned slice starts
    /// at `torrent_offset` translated into file coordinates and is clamped
    /// to the file's tail, so `len` may safely overshoot into the following
    /// files.
    ///
    /// Panics when `torrent_offset` does not fall inside this file at all;
    /// callers resolve the owning file through the structure's intersection
    /// queries first.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        if torrent_offset < self.torrent_offset {
            panic!("torrent offset must be larger than file offset");
        }

        let torrent_end_offset = self.torrent_end_offset();
        if torrent_offset >= torrent_end_offset {
            panic!("torrent offset must be smaller than file end offset");
        }

        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(torrent_end_offset - torrent_offset),
        }
    }
}

/// Represents the location of a range of bytes within a file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, etc.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of the
    /// piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The directory the torrent's content lands in.
    ///
    /// A single file download goes straight into the configured download
    /// directory; an archive gets a subdirectory named after the torrent,
    /// since a torrent with several top level entries would otherwise
    /// scatter them over the download directory.
    pub download_dir: PathBuf,
    /// The paths and lengths of the torrent files.
    pub structure: FsStructure,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let structure = metainfo.structure();
        let piece_count = metainfo.piece_count();
        let download_len = structure.download_len();
        let piece_len = metainfo.info.piece_length as u32;
        // a torrent without pieces is pathological but must not wrap the
        // arithmetic below
        let last_piece_len = if piece_count == 0 {
            0
        } else {
            (download_len - piece_len as u64 * (piece_count - 1) as u64)
                as u32
        };

        // if this is an archive, download files into torrent's own dir
        let download_dir = if structure.is_archive() {
            download_dir.join(&metainfo.info.name)
        } else {
            download_dir
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            structure,
        }
    }

    /// Returns the zero-based indices of the files of torrent that intersect
    /// with the piece.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        log::trace!("Returning files intersecting piece {}", index);
        let piece_offset = index as u64 * self.piece_len as u64;
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        let files = self
            .structure
            .files_intersecting_bytes(piece_offset..piece_end);
        Ok(files)
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex(index))
        }
    }

    /// The piece's first byte offset in the torrent's contiguous byte array.
    pub fn torrent_piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

/// Defines the file system structure of the download.
#[derive(Clone, Debug)]
pub enum FsStructure {
    /// This is a single file download.
    File(FileInfo),
    /// The download is for multiple files, possibly with nested directories.
    Archive {
        /// The archive's files, flattened and ordered by their offset in
        /// the torrent's contiguous byte stream (padding entries
        /// included), which is what the piece-to-file intersection queries
        /// walk.
        files: Vec<FileInfo>,
    },
}

impl FsStructure {
    /// Returns true if the download is for an archive.
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive { .. })
    }

    /// Returns the total download size in bytes, padding files included.
    ///
    /// Note that this is an O(n) operation for archive downloads, where n is
    /// the number of files, so the return value should ideally be cached.
    pub fn download_len(&self) -> u64 {
        match self {
            Self::File(file) => file.len,
            Self::Archive { files } => files.iter().map(|f| f.len).sum(),
        }
    }

    /// Returns the files that overlap with the given left-inclusive range of
    /// bytes, where `bytes.start` is the offset and `bytes.end` is one past the
    /// last byte offset.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        match self {
            // when torrent only has one file, only that file can be returned
            Self::File(_) => 0..1,
            Self::Archive { files } => {
                // the file owning the range's first byte anchors the result
                let first = match files
                    .iter()
                    .enumerate()
                    .find(|(_, file)| {
                        file.byte_range().contains(&byte_range.start)
                    })
                    .map(|(index, _)| index)
                {
                    Some(index) => index,
                    None => return 0..0,
                };

                let mut file_range = first..first + 1;

                // extend over every following file that still starts inside
                // the range; enumerate before skip so the indices stay
                // absolute
                for (index, file) in
                    files.iter().enumerate().skip(first + 1)
                {
                    if !byte_range.contains(&file.torrent_offset) {
                        break;
                    }
                    // left-inclusive range: end is one past the last member
                    file_range.end = index + 1;
                }

                file_range
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_bytes::ByteBuf;

    use super::*;
    use crate::metainfo::{File, Info, Metainfo};

    fn data_file(name: &str, torrent_offset: u64, len: u64) -> FileInfo {
        FileInfo::new(name, torrent_offset, len)
    }

    fn padding_file(torrent_offset: u64, len: u64) -> FileInfo {
        let mut file =
            FileInfo::new(format!(".pad/{}", len), torrent_offset, len);
        file.attr = Some("p".into());
        file
    }

    /// A BEP-47 style layout where every file is padded out to a piece
    /// boundary: four 512 byte pieces over a 700 byte video and a 900 byte
    /// subtitle file, with padding runs of 324 and 124 bytes between them.
    fn padded_archive() -> StorageInfo {
        let files = vec![
            data_file("video.mkv", 0, 700),
            padding_file(700, 324),
            data_file("subs/eng.srt", 1024, 900),
            padding_file(1924, 124),
        ];
        StorageInfo {
            piece_count: 4,
            piece_len: 512,
            last_piece_len: 512,
            download_len: 2048,
            download_dir: PathBuf::from("/downloads/padded"),
            structure: FsStructure::Archive { files },
        }
    }

    #[test]
    fn test_padding_attribute_detection() {
        assert!(padding_file(0, 16).is_padding());

        // the padding marker may ride along other attribute characters
        let mut executable_pad = data_file("weird", 0, 16);
        executable_pad.attr = Some("xp".into());
        assert!(executable_pad.is_padding());

        let mut executable = data_file("tool", 0, 16);
        executable.attr = Some("x".into());
        assert!(!executable.is_padding());

        assert!(!data_file("plain", 0, 16).is_padding());
    }

    #[test]
    fn test_file_offsets_in_torrent() {
        let subs = data_file("subs/eng.srt", 1024, 900);
        assert_eq!(subs.byte_range(), 1024..1924);
        assert_eq!(subs.torrent_end_offset(), 1924);

        // a slice starting mid-file is clamped to the file's tail
        assert_eq!(
            subs.get_slice(1500, 2000),
            FileSlice {
                offset: 476,
                len: 424,
            }
        );
        // a slice shorter than the remaining file is returned as asked
        assert_eq!(
            subs.get_slice(1024, 10),
            FileSlice { offset: 0, len: 10 }
        );
    }

    #[test]
    #[should_panic(expected = "torrent offset must be larger than file offset")]
    fn test_get_slice_before_file_panics() {
        data_file("subs/eng.srt", 1024, 900).get_slice(1000, 50);
    }

    #[test]
    #[should_panic(
        expected = "torrent offset must be smaller than file end offset"
    )]
    fn test_get_slice_past_file_panics() {
        data_file("subs/eng.srt", 1024, 900).get_slice(1924, 50);
    }

    // Padding runs occupy torrent offsets like any other file, so piece to
    // file mapping must see them even though they are never materialized.
    #[test]
    fn test_padded_layout_piece_mapping() {
        let info = padded_archive();

        // the padding bytes count towards the download length
        assert_eq!(info.structure.download_len(), 2048);

        // piece 0 lies entirely in the video file
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..1);
        // piece 1 covers the video tail and the first padding run
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 0..2);
        // piece 2 lies entirely in the subtitle file
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 2..3);
        // piece 3 covers the subtitle tail and the trailing padding
        assert_eq!(info.files_intersecting_piece(3).unwrap(), 2..4);

        // ranges past the torrent match nothing
        assert_eq!(info.structure.files_intersecting_bytes(2048..4096), 0..0);
    }

    #[test]
    fn test_piece_len_bounds_and_offsets() {
        let info = padded_archive();
        assert_eq!(info.piece_len(0).unwrap(), 512);
        assert_eq!(info.piece_len(3).unwrap(), 512);
        assert!(matches!(
            info.piece_len(4),
            Err(Error::InvalidPieceIndex(4))
        ));
        assert_eq!(info.torrent_piece_offset(0), 0);
        assert_eq!(info.torrent_piece_offset(3), 1536);
    }

    fn single_file_metainfo(
        name: &str,
        length: u64,
        piece_length: u64,
        piece_count: usize,
    ) -> Metainfo {
        Metainfo {
            announce: None,
            announce_list: None,
            piece_layers: None,
            info: Info {
                file_tree: None,
                files: None,
                length: Some(length),
                meta_version: None,
                name: name.into(),
                piece_length,
                pieces: Some(ByteBuf::from(vec![0u8; piece_count * 20])),
                private: None,
            },
        }
    }

    #[test]
    fn test_storage_from_single_file_metainfo() {
        let metainfo = single_file_metainfo("clip.bin", 40_000, 16_384, 3);
        let info =
            StorageInfo::new(&metainfo, PathBuf::from("/downloads"));

        assert_eq!(info.piece_count, 3);
        assert_eq!(info.piece_len, 16_384);
        // 40000 - 2 * 16384
        assert_eq!(info.last_piece_len, 7_232);
        assert_eq!(info.download_len, 40_000);
        // single file downloads land directly in the download directory
        assert_eq!(info.download_dir, PathBuf::from("/downloads"));
        assert_eq!(info.piece_len(2).unwrap(), 7_232);
    }

    #[test]
    fn test_storage_from_archive_metainfo_nests_by_name() {
        let metainfo = Metainfo {
            announce: None,
            announce_list: None,
            piece_layers: None,
            info: Info {
                file_tree: None,
                files: Some(vec![
                    File {
                        attr: None,
                        length: 600,
                        path: vec!["a.txt".into()],
                        sha1: None,
                        symlink_path: None,
                    },
                    File {
                        attr: None,
                        length: 424,
                        path: vec!["b".into(), "c.txt".into()],
                        sha1: None,
                        symlink_path: None,
                    },
                ]),
                length: None,
                meta_version: None,
                name: "bundle".into(),
                piece_length: 512,
                pieces: Some(ByteBuf::from(vec![0u8; 2 * 20])),
                private: None,
            },
        };
        let info =
            StorageInfo::new(&metainfo, PathBuf::from("/downloads"));

        // archives get their own directory so multi rooted torrents don't
        // scatter files over the download directory
        assert_eq!(info.download_dir, PathBuf::from("/downloads/bundle"));
        assert_eq!(info.download_len, 1024);
        assert_eq!(info.last_piece_len, 512);
    }

    // A torrent without pieces is pathological but must construct without
    // wrapping the last piece arithmetic.
    #[test]
    fn test_zero_piece_torrent_storage() {
        let metainfo = single_file_metainfo("empty", 0, 16_384, 0);
        let info = StorageInfo::new(&metainfo, PathBuf::from("/downloads"));
        assert_eq!(info.piece_count, 0);
        assert_eq!(info.last_piece_len, 0);
        assert_eq!(info.download_len, 0);
    }
}
