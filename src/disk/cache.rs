//! The read cache: read-only memory maps per file, LRU evicted against a
//! byte budget.
//!
//! Files that are not normally mapped (one-off reads, files past their
//! torrent's lifetime) go through ephemeral maps that are dropped right
//! after the copy, so no OS level file lock outlives the read.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use lru::LruCache;
use memmap2::Mmap;

use super::error::ReadError;

struct CachedMmap {
    map: Mmap,
    len: u64,
}

/// Counters exposed for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

pub(crate) struct ReadCache {
    /// Mapped files in recency order.
    entries: LruCache<PathBuf, CachedMmap>,
    /// The byte budget the mapped files may not exceed.
    budget: u64,
    /// The total size of the currently mapped files.
    bytes: u64,
    hits: u64,
    misses: u64,
}

impl ReadCache {
    pub fn new(budget: u64) -> Self {
        Self {
            // the LRU order is tracked per entry; the byte budget is
            // enforced separately as entries have wildly varying sizes
            entries: LruCache::unbounded(),
            budget,
            bytes: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Reads the given range of the file through its cached map, creating
    /// the map on first access. Reads past the end of file are zero-filled
    /// (preallocated files may be longer than their written prefix).
    pub fn read(
        &mut self,
        path: &Path,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, ReadError> {
        if self.entries.get(path).is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
            let entry = Self::map_file(path)?;
            self.bytes += entry.len;
            self.entries.put(path.to_path_buf(), entry);
            self.evict_to_budget();
        }
        // the entry was just touched or inserted
        let entry = match self.entries.get(path) {
            Some(entry) => entry,
            // evicting a zero budget cache can drop the fresh entry
            None => return Self::read_ephemeral(path, offset, len),
        };
        Ok(copy_range(&entry.map, offset, len))
    }

    /// A one-shot read through a short-lived map that is unmapped before
    /// returning.
    pub fn read_ephemeral(
        path: &Path,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, ReadError> {
        let entry = Self::map_file(path)?;
        Ok(copy_range(&entry.map, offset, len))
    }

    /// Unmaps least recently used files until the budget holds.
    pub fn evict_to_budget(&mut self) {
        while self.bytes > self.budget {
            match self.entries.pop_lru() {
                Some((path, entry)) => {
                    log::debug!(
                        "Evicting {:?} ({} bytes) from read cache",
                        path,
                        entry.len
                    );
                    self.bytes -= entry.len;
                }
                None => break,
            }
        }
    }

    /// Drops the file's map, e.g. ahead of deleting the file.
    pub fn invalidate(&mut self, path: &Path) {
        if let Some(entry) = self.entries.pop(path) {
            self.bytes -= entry.len;
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            bytes: self.bytes,
            hits: self.hits,
            misses: self.misses,
        }
    }

    fn map_file(path: &Path) -> Result<CachedMmap, ReadError> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReadError::NotFound(path.to_path_buf())
            } else {
                ReadError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        let len = file
            .metadata()
            .map_err(|e| ReadError::Io {
                path: path.to_path_buf(),
                source: e,
            })?
            .len();
        // SAFETY: the map is read-only and the engine is the only writer of
        // these files; concurrent writes at worst surface stale bytes which
        // the piece level hashes already guard against.
        let map = unsafe {
            Mmap::map(&file).map_err(|e| ReadError::Io {
                path: path.to_path_buf(),
                source: e,
            })?
        };
        Ok(CachedMmap { map, len })
    }
}

/// Copies the requested range out of the map, zero-filling past the end.
fn copy_range(map: &Mmap, offset: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0; len];
    let file_len = map.len() as u64;
    if offset < file_len {
        let available = ((file_len - offset) as usize).min(len);
        let start = offset as usize;
        out[..available].copy_from_slice(&map[start..start + available]);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(data).unwrap();
        path
    }

    #[test]
    fn test_cache_hit_and_miss_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a", &[1, 2, 3, 4, 5]);

        let mut cache = ReadCache::new(1024 * 1024);
        assert_eq!(cache.read(&path, 0, 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(cache.read(&path, 2, 3).unwrap(), vec![3, 4, 5]);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 5);
    }

    #[test]
    fn test_eviction_respects_byte_budget() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a", &[0xaa; 64]);
        let b = write_file(dir.path(), "b", &[0xbb; 64]);
        let c = write_file(dir.path(), "c", &[0xcc; 64]);

        // room for two files only
        let mut cache = ReadCache::new(128);
        cache.read(&a, 0, 1).unwrap();
        cache.read(&b, 0, 1).unwrap();
        assert_eq!(cache.stats().entries, 2);

        cache.read(&c, 0, 1).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.bytes, 128);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ReadCache::new(1024);
        let missing = dir.path().join("missing");
        assert!(matches!(
            cache.read(&missing, 0, 1),
            Err(ReadError::NotFound(_))
        ));
    }

    #[test]
    fn test_read_past_eof_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "short", &[7, 7]);
        let mut cache = ReadCache::new(1024);
        assert_eq!(cache.read(&path, 0, 4).unwrap(), vec![7, 7, 0, 0]);
    }

    #[test]
    fn test_ephemeral_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "e", b"ephemeral");
        assert_eq!(
            ReadCache::read_ephemeral(&path, 2, 4).unwrap(),
            b"heme".to_vec()
        );
    }
}
