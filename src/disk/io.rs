//! The disk task's event loop and the per-torrent write buffers.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::{sync::mpsc, task, time};

use super::{
    cache::ReadCache, error::*, Alert, AlertReceiver, AlertSender, Command,
    CommandReceiver, CommandSender, TorrentAlert, TorrentAlertSender,
    TorrentAllocation, WriteCommand,
};
use crate::{
    conf::{DiskConf, Preallocation},
    storage_info::{FsStructure, StorageInfo},
    BlockInfo, FileIndex, PieceIndex, TorrentId,
};

/// The entity responsible for all file system access of the engine:
/// allocating torrents, batching piece writes, and serving block reads.
pub(super) struct Disk {
    conf: DiskConf,
    /// Each torrent in engine has a corresponding entry in this hashmap.
    torrents: HashMap<TorrentId, Torrent>,
    /// The shared read cache over all torrents' files.
    cache: ReadCache,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// The bounded queue on which piece writes arrive.
    write_port: mpsc::Receiver<WriteCommand>,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
}

impl Disk {
    pub(super) fn new(
        conf: DiskConf,
        write_queue_size: usize,
    ) -> (
        Self,
        CommandSender,
        mpsc::Sender<WriteCommand>,
        AlertReceiver,
    ) {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (write_chan, write_port) = mpsc::channel(write_queue_size);
        let cache = ReadCache::new(conf.mmap_cache_bytes);
        (
            Self {
                conf,
                torrents: HashMap::new(),
                cache,
                cmd_port,
                write_port,
                alert_chan,
            },
            cmd_chan,
            write_chan,
            alert_port,
        )
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        let mut stale_timer = time::interval(
            self.conf.stale_write_timeout.max(Duration::from_millis(10)),
        );

        loop {
            tokio::select! {
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::NewTorrent { id, info }) => {
                            self.allocate_torrent(id, info);
                        }
                        Some(Command::ReadBlock { id, block, result_chan }) => {
                            let result = self.read_block(id, block).await;
                            // the requester may have gone away; that's fine
                            let _ = result_chan.send(result);
                        }
                        Some(Command::CacheStats { result_chan }) => {
                            let _ = result_chan.send(self.cache.stats());
                        }
                        Some(Command::RemoveTorrent { id }) => {
                            self.remove_torrent(id).await;
                        }
                        Some(Command::Shutdown) | None => {
                            log::info!("Shutting down disk event loop");
                            self.flush_all().await;
                            break;
                        }
                    }
                }
                write = self.write_port.recv() => {
                    match write {
                        Some(write) => self.enqueue_piece(write).await,
                        None => {
                            self.flush_all().await;
                            break;
                        }
                    }
                }
                _ = stale_timer.tick() => {
                    self.flush_stale().await;
                    self.cache.evict_to_budget();
                }
            }
        }
        Ok(())
    }

    /// Sets up the torrent's directory tree, opens (and preallocates) its
    /// files, and registers the in-memory bookkeeping.
    fn allocate_torrent(&mut self, id: TorrentId, info: StorageInfo) {
        log::info!("Allocating torrent {}", id);
        if self.torrents.contains_key(&id) {
            log::warn!("Torrent {} already allocated", id);
            let _ = self.alert_chan.send(Alert::TorrentAllocation(Err(
                NewTorrentError::AlreadyExists,
            )));
            return;
        }

        // NOTE: do _not_ return on failure, we don't want to kill the disk
        // task due to disk IO errors: we just log it and notify the engine.
        match Torrent::new(info, self.conf.preallocation) {
            Ok((torrent, alert_port)) => {
                log::info!("Torrent {} successfully allocated", id);
                self.torrents.insert(id, torrent);
                let _ = self.alert_chan.send(Alert::TorrentAllocation(Ok(
                    TorrentAllocation { id, alert_port },
                )));
            }
            Err(e) => {
                log::warn!("Torrent {} allocation failure: {}", id, e);
                let _ =
                    self.alert_chan.send(Alert::TorrentAllocation(Err(e)));
            }
        }
    }

    async fn remove_torrent(&mut self, id: TorrentId) {
        if let Some(mut torrent) = self.torrents.remove(&id) {
            torrent.flush_all(self.conf.write_batch_bytes).await;
            for file in torrent.files.iter() {
                self.cache.invalidate(&file.path);
            }
            log::info!("Removed torrent {} from disk task", id);
        }
    }

    /// Queues a verified piece's payload, splitting it into per-file
    /// slices. Files whose pending bytes reach the batch threshold are
    /// flushed right away.
    async fn enqueue_piece(&mut self, write: WriteCommand) {
        let torrent = match self.torrents.get_mut(&write.id) {
            Some(torrent) => torrent,
            None => {
                log::warn!(
                    "Write for unknown torrent {} dropped", write.id
                );
                return;
            }
        };
        torrent
            .enqueue_piece(
                write.piece_index,
                Bytes::from(write.data),
                self.conf.write_batch_bytes,
            )
            .await;
    }

    /// Flushes pending writes that waited longer than the stale timeout.
    async fn flush_stale(&mut self) {
        let timeout = self.conf.stale_write_timeout;
        let batch = self.conf.write_batch_bytes;
        for torrent in self.torrents.values_mut() {
            torrent.flush_older_than(timeout, batch).await;
        }
    }

    async fn flush_all(&mut self) {
        let batch = self.conf.write_batch_bytes;
        for torrent in self.torrents.values_mut() {
            torrent.flush_all(batch).await;
        }
    }

    /// Reads a block back from the torrent's files through the read cache.
    /// Padding ranges read as zeroes.
    async fn read_block(
        &mut self,
        id: TorrentId,
        block: BlockInfo,
    ) -> Result<Vec<u8>, ReadError> {
        let torrent = match self.torrents.get_mut(&id) {
            Some(torrent) => torrent,
            None => {
                return Err(ReadError::InvalidPieceIndex(block.piece_index))
            }
        };
        if block.piece_index >= torrent.info.piece_count {
            return Err(ReadError::InvalidPieceIndex(block.piece_index));
        }
        // pending writes for the files the block touches must be on disk
        // before the read
        let range = torrent
            .info
            .files_intersecting_piece(block.piece_index)
            .map_err(|_| ReadError::InvalidPieceIndex(block.piece_index))?;
        for file_index in range.clone() {
            torrent
                .flush_file(file_index, self.conf.write_batch_bytes)
                .await;
        }

        let torrent_offset = torrent
            .info
            .torrent_piece_offset(block.piece_index)
            + block.offset as u64;
        let mut out = Vec::with_capacity(block.len as usize);
        let mut remaining = block.len as u64;
        let mut offset = torrent_offset;
        for file_index in range {
            if remaining == 0 {
                break;
            }
            let file = &torrent.files[file_index];
            if offset >= file.info.torrent_end_offset() {
                continue;
            }
            let slice = file.info.get_slice(offset, remaining);
            if file.is_padding() {
                // padding bytes occupy the piece stream but no disk space
                out.extend(std::iter::repeat(0).take(slice.len as usize));
            } else {
                let data = self.cache.read(
                    &file.path,
                    slice.offset,
                    slice.len as usize,
                )?;
                out.extend_from_slice(&data);
            }
            offset += slice.len;
            remaining -= slice.len;
        }
        if remaining > 0 {
            return Err(ReadError::InvalidPieceIndex(block.piece_index));
        }
        Ok(out)
    }
}

/// A pending write of one file slice of a piece.
#[derive(Debug)]
struct PendingWrite {
    piece_index: PieceIndex,
    /// Offset within the target file.
    offset: u64,
    data: Bytes,
    queued_at: Instant,
}

/// Torrent information related to disk IO: the file handles, the write
/// buffer, and the per-piece flush accounting.
struct Torrent {
    info: StorageInfo,
    files: Vec<TorrentFile>,
    /// The channel used to alert a torrent that a piece has been written to
    /// disk.
    alert_chan: TorrentAlertSender,
    /// The write buffer: pending file slices keyed by file index.
    pending: HashMap<FileIndex, Vec<PendingWrite>>,
    /// How many file slices of each in-flight piece still await their
    /// flush, and how many bytes have reached disk for it.
    piece_progress: HashMap<PieceIndex, (usize, u64)>,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    ///
    /// For multi-file torrents, any subdirectories in the torrent archive
    /// are created. Padding files are accounted for in the offset space but
    /// never opened or created.
    fn new(
        info: StorageInfo,
        preallocation: Preallocation,
    ) -> Result<(Self, super::TorrentAlertReceiver), NewTorrentError> {
        if !info.download_dir.is_dir() {
            log::info!(
                "Creating missing download directory {:?}",
                info.download_dir
            );
            fs::create_dir_all(&info.download_dir).map_err(|e| {
                NewTorrentError::Io {
                    path: info.download_dir.clone(),
                    source: e,
                }
            })?;
        }

        let file_infos = match &info.structure {
            FsStructure::File(file) => vec![file.clone()],
            FsStructure::Archive { files } => files.clone(),
        };

        let mut files = Vec::with_capacity(file_infos.len());
        for file_info in file_infos {
            let path = info.download_dir.join(&file_info.path);
            if file_info.is_padding() {
                log::debug!(
                    "Skipping padding file {:?} ({} bytes)",
                    path,
                    file_info.len
                );
                files.push(TorrentFile {
                    path,
                    info: file_info,
                    handle: None,
                });
                continue;
            }

            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    log::info!("Creating torrent subdir {:?}", subdir);
                    fs::create_dir_all(subdir).map_err(|e| {
                        NewTorrentError::Io {
                            path: subdir.to_path_buf(),
                            source: e,
                        }
                    })?;
                }
            }

            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", path);
                    NewTorrentError::Io {
                        path: path.clone(),
                        source: e,
                    }
                })?;
            preallocate(&handle, file_info.len, preallocation).map_err(
                |e| NewTorrentError::Io {
                    path: path.clone(),
                    source: e,
                },
            )?;

            files.push(TorrentFile {
                path,
                info: file_info,
                handle: Some(Arc::new(handle)),
            });
        }

        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                info,
                files,
                alert_chan,
                pending: HashMap::new(),
                piece_progress: HashMap::new(),
            },
            alert_port,
        ))
    }

    /// Splits the piece payload into file slices and stages them in the
    /// write buffer.
    async fn enqueue_piece(
        &mut self,
        piece_index: PieceIndex,
        data: Bytes,
        batch_bytes: usize,
    ) {
        let file_range =
            match self.info.files_intersecting_piece(piece_index) {
                Ok(range) => range,
                Err(_) => {
                    let _ = self.alert_chan.send(
                        TorrentAlert::PieceWritten {
                            piece_index,
                            result: Err(WriteError::InvalidPieceIndex(
                                piece_index,
                            )),
                        },
                    );
                    return;
                }
            };

        let mut torrent_offset =
            self.info.torrent_piece_offset(piece_index);
        let mut consumed = 0u64;
        let mut slices = 0usize;
        let piece_len = data.len() as u64;
        let mut to_flush = Vec::new();

        for file_index in file_range {
            if consumed >= piece_len {
                break;
            }
            let file = &self.files[file_index];
            let slice =
                file.info.get_slice(torrent_offset, piece_len - consumed);
            let chunk = data
                .slice(consumed as usize..(consumed + slice.len) as usize);
            torrent_offset += slice.len;
            consumed += slice.len;

            if file.is_padding() {
                // padding bytes are dropped; they exist only in the piece
                // stream
                continue;
            }

            slices += 1;
            let pending = self.pending.entry(file_index).or_default();
            pending.push(PendingWrite {
                piece_index,
                offset: slice.offset,
                data: chunk,
                queued_at: Instant::now(),
            });
            let pending_bytes: usize =
                pending.iter().map(|w| w.data.len()).sum();
            if pending_bytes >= batch_bytes {
                to_flush.push(file_index);
            }
        }

        if slices == 0 {
            // the piece fell entirely into padding ranges
            let _ = self.alert_chan.send(TorrentAlert::PieceWritten {
                piece_index,
                result: Ok(0),
            });
            return;
        }
        let progress =
            self.piece_progress.entry(piece_index).or_insert((0, 0));
        progress.0 += slices;

        for file_index in to_flush {
            self.flush_file(file_index, batch_bytes).await;
        }
    }

    /// Flushes every file whose oldest pending write exceeded the timeout.
    async fn flush_older_than(
        &mut self,
        timeout: Duration,
        batch_bytes: usize,
    ) {
        let stale: Vec<FileIndex> = self
            .pending
            .iter()
            .filter(|(_, writes)| {
                writes
                    .iter()
                    .map(|w| w.queued_at)
                    .min()
                    .map_or(false, |oldest| oldest.elapsed() > timeout)
            })
            .map(|(file_index, _)| *file_index)
            .collect();
        for file_index in stale {
            self.flush_file(file_index, batch_bytes).await;
        }
    }

    async fn flush_all(&mut self, batch_bytes: usize) {
        let files: Vec<FileIndex> = self.pending.keys().copied().collect();
        for file_index in files {
            self.flush_file(file_index, batch_bytes).await;
        }
    }

    /// Flushes the file's staged writes: requests are sorted by offset,
    /// contiguous runs are coalesced up to the staging threshold, and each
    /// run is issued as a single positioned vectored write on the blocking
    /// pool.
    async fn flush_file(&mut self, file_index: FileIndex, batch_bytes: usize) {
        let mut writes = match self.pending.remove(&file_index) {
            Some(writes) => writes,
            None => return,
        };
        writes.sort_by_key(|w| w.offset);

        let file = &self.files[file_index];
        let handle = match &file.handle {
            Some(handle) => Arc::clone(handle),
            // padding files never get pending writes
            None => return,
        };
        let path = file.path.clone();

        let runs = coalesce_runs(&writes, batch_bytes);

        log::debug!(
            "Flushing {} write(s) in {} run(s) to {:?}",
            writes.len(),
            runs.len(),
            path,
        );

        // the actual syscalls run on the blocking pool
        let write_result = task::spawn_blocking(move || {
            let mut total = 0u64;
            for run in runs.iter() {
                total += write_run(&handle, run)? as u64;
            }
            Ok::<u64, std::io::Error>(total)
        })
        .await;

        match write_result {
            Ok(Ok(count)) => {
                log::debug!("Wrote {} bytes to {:?}", count, path);
                for write in writes.iter() {
                    self.finish_slice(
                        write.piece_index,
                        write.data.len() as u64,
                    );
                }
            }
            Ok(Err(e)) => {
                log::error!("Failed to write to {:?}: {}", path, e);
                let mut failed: Vec<PieceIndex> =
                    writes.iter().map(|w| w.piece_index).collect();
                failed.sort_unstable();
                failed.dedup();
                for piece_index in failed {
                    self.piece_progress.remove(&piece_index);
                    let _ = self.alert_chan.send(
                        TorrentAlert::PieceWritten {
                            piece_index,
                            result: Err(WriteError::Io {
                                path: path.clone(),
                                source: std::io::Error::new(
                                    e.kind(),
                                    "write failed",
                                ),
                            }),
                        },
                    );
                }
            }
            Err(e) => {
                log::error!(
                    "Disk write task for {:?} panicked: {}", path, e
                );
            }
        }
    }

    /// Records a flushed slice; the piece's write alert fires once its last
    /// slice reached disk.
    fn finish_slice(&mut self, piece_index: PieceIndex, bytes: u64) {
        if let Some(progress) = self.piece_progress.get_mut(&piece_index) {
            progress.0 = progress.0.saturating_sub(1);
            progress.1 += bytes;
            if progress.0 == 0 {
                let write_count = progress.1;
                self.piece_progress.remove(&piece_index);
                let _ = self.alert_chan.send(TorrentAlert::PieceWritten {
                    piece_index,
                    result: Ok(write_count),
                });
            }
        }
    }
}

struct TorrentFile {
    /// The file's absolute path.
    path: PathBuf,
    info: crate::FileInfo,
    /// The open handle; padding files have none.
    handle: Option<Arc<File>>,
}

impl TorrentFile {
    fn is_padding(&self) -> bool {
        self.info.is_padding()
    }
}

/// A coalesced run of contiguous writes at a file offset.
#[derive(Debug)]
struct WriteRun {
    offset: u64,
    chunks: Vec<Bytes>,
}

impl WriteRun {
    fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}

/// Groups offset-sorted writes into contiguous runs no larger than the
/// staging threshold, so that each run can be issued as one positioned
/// vectored write.
fn coalesce_runs(writes: &[PendingWrite], threshold: usize) -> Vec<WriteRun> {
    let mut runs: Vec<WriteRun> = Vec::new();
    for write in writes {
        match runs.last_mut() {
            Some(run)
                if run.offset + run.len() as u64 == write.offset
                    && run.len() + write.data.len() <= threshold.max(1) =>
            {
                run.chunks.push(write.data.clone());
            }
            _ => runs.push(WriteRun {
                offset: write.offset,
                chunks: vec![write.data.clone()],
            }),
        }
    }
    runs
}

/// Issues one run as a positioned vectored write, finishing any partially
/// written tail with plain positioned writes.
#[cfg(unix)]
fn write_run(file: &File, run: &WriteRun) -> std::io::Result<usize> {
    use std::{io::IoSlice, os::unix::fs::FileExt};

    let iovecs: Vec<IoSlice> =
        run.chunks.iter().map(|c| IoSlice::new(c)).collect();
    let total = run.len();
    let written = nix::sys::uio::pwritev(file, &iovecs, run.offset as i64)
        .map_err(std::io::Error::from)?;
    if written < total {
        // IO syscalls are not guaranteed to write the whole input in one
        // go; finish the remainder chunk by chunk
        let mut skip = written;
        let mut offset = run.offset + written as u64;
        for chunk in run.chunks.iter() {
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            let rest = &chunk[skip..];
            file.write_all_at(rest, offset)?;
            offset += rest.len() as u64;
            skip = 0;
        }
    }
    Ok(total)
}

#[cfg(not(unix))]
fn write_run(file: &File, run: &WriteRun) -> std::io::Result<usize> {
    use std::io::{Seek, SeekFrom, Write};

    let mut file = file;
    file.seek(SeekFrom::Start(run.offset))?;
    for chunk in run.chunks.iter() {
        file.write_all(chunk)?;
    }
    Ok(run.len())
}

/// Applies the configured preallocation strategy to a freshly opened file.
fn preallocate(
    file: &File,
    len: u64,
    strategy: Preallocation,
) -> std::io::Result<()> {
    if len == 0 {
        return Ok(());
    }
    match strategy {
        Preallocation::None => Ok(()),
        Preallocation::Sparse => sparse_preallocate(file, len),
        Preallocation::Full => {
            use std::io::Write;
            let mut writer = std::io::BufWriter::new(file);
            let zeroes = [0u8; 8192];
            let mut remaining = len;
            while remaining > 0 {
                let n = (zeroes.len() as u64).min(remaining) as usize;
                writer.write_all(&zeroes[..n])?;
                remaining -= n as u64;
            }
            writer.flush()
        }
        Preallocation::Fallocate => {
            #[cfg(target_os = "linux")]
            {
                use std::os::fd::AsRawFd;
                nix::fcntl::posix_fallocate(
                    file.as_raw_fd(),
                    0,
                    len as i64,
                )
                .map_err(std::io::Error::from)
            }
            #[cfg(not(target_os = "linux"))]
            {
                sparse_preallocate(file, len)
            }
        }
    }
}

/// Seek-writes a single byte at `len - 1`, letting the file system create
/// a sparse file of the right size.
#[cfg(unix)]
fn sparse_preallocate(file: &File, len: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(&[0], len - 1)
}

#[cfg(not(unix))]
fn sparse_preallocate(file: &File, len: u64) -> std::io::Result<()> {
    file.set_len(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{disk, FileInfo};

    fn pending(piece: PieceIndex, offset: u64, data: &[u8]) -> PendingWrite {
        PendingWrite {
            piece_index: piece,
            offset,
            data: Bytes::copy_from_slice(data),
            queued_at: Instant::now(),
        }
    }

    #[test]
    fn test_coalesce_contiguous_runs() {
        let writes = vec![
            pending(0, 0, &[1; 10]),
            pending(0, 10, &[2; 10]),
            // gap
            pending(1, 30, &[3; 10]),
            pending(1, 40, &[4; 10]),
        ];
        let runs = coalesce_runs(&writes, 1024);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].offset, 0);
        assert_eq!(runs[0].len(), 20);
        assert_eq!(runs[1].offset, 30);
        assert_eq!(runs[1].len(), 20);
    }

    #[test]
    fn test_coalesce_respects_staging_threshold() {
        let writes = vec![
            pending(0, 0, &[1; 10]),
            pending(0, 10, &[2; 10]),
            pending(0, 20, &[3; 10]),
        ];
        // runs are capped at 20 bytes, so the third write starts a new one
        let runs = coalesce_runs(&writes, 20);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].len(), 20);
        assert_eq!(runs[1].offset, 20);
    }

    #[test]
    fn test_preallocation_strategies() {
        let dir = tempfile::tempdir().unwrap();

        let sparse = File::create(dir.path().join("sparse")).unwrap();
        preallocate(&sparse, 4096, Preallocation::Sparse).unwrap();
        assert_eq!(sparse.metadata().unwrap().len(), 4096);

        let full = File::create(dir.path().join("full")).unwrap();
        preallocate(&full, 10_000, Preallocation::Full).unwrap();
        assert_eq!(full.metadata().unwrap().len(), 10_000);

        let fallocate = File::create(dir.path().join("fallocate")).unwrap();
        preallocate(&fallocate, 4096, Preallocation::Fallocate).unwrap();
        assert_eq!(fallocate.metadata().unwrap().len(), 4096);
    }

    // End to end: allocate a two file torrent (with a padding file in the
    // middle), write both pieces, await the write alerts, and read the
    // blocks back through the cache.
    #[tokio::test]
    async fn test_write_pieces_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let download_dir = dir.path().join("archive");

        let mut pad = FileInfo::new(".pad/6", 10, 6);
        pad.attr = Some("p".into());
        let files = vec![
            FileInfo::new("a", 0, 10),
            pad,
            FileInfo::new("b", 16, 16),
        ];
        let info = StorageInfo {
            piece_count: 2,
            piece_len: 16,
            last_piece_len: 16,
            download_len: 32,
            download_dir: download_dir.clone(),
            structure: FsStructure::Archive { files },
        };

        let (_join, handle, mut alerts) = disk::spawn(DiskConf {
            preallocation: Preallocation::Sparse,
            ..DiskConf::default()
        })
        .unwrap();

        handle.allocate_new_torrent(0, info).unwrap();
        let mut torrent_alerts = match alerts.recv().await.unwrap() {
            Alert::TorrentAllocation(Ok(allocation)) => {
                assert_eq!(allocation.id, 0);
                allocation.alert_port
            }
            Alert::TorrentAllocation(Err(e)) => {
                panic!("allocation failed: {}", e)
            }
        };

        // piece 0 covers file a (10 bytes) and the padding file (6 bytes);
        // piece 1 covers file b entirely
        let piece0: Vec<u8> = (0u8..16).collect();
        let piece1: Vec<u8> = (16u8..32).collect();
        handle.write_piece(0, 0, piece0.clone()).unwrap();
        handle.write_piece(0, 1, piece1.clone()).unwrap();

        let mut written = Vec::new();
        for _ in 0..2 {
            match torrent_alerts.recv().await.unwrap() {
                TorrentAlert::PieceWritten {
                    piece_index,
                    result: Ok(_),
                } => written.push(piece_index),
                TorrentAlert::PieceWritten {
                    result: Err(e), ..
                } => panic!("piece write failed: {}", e),
            }
        }
        written.sort_unstable();
        assert_eq!(written, vec![0, 1]);

        // the padding file is never materialized
        assert!(download_dir.join("a").exists());
        assert!(download_dir.join("b").exists());
        assert!(!download_dir.join(".pad").join("6").exists());

        // read back a block spanning file a and the padding range: the
        // padding bytes read as zeroes
        let (tx, rx) = tokio::sync::oneshot::channel();
        handle
            .read_block(
                0,
                BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: 16,
                },
                tx,
            )
            .unwrap();
        let data = rx.await.unwrap().unwrap();
        assert_eq!(&data[..10], &piece0[..10]);
        assert_eq!(&data[10..], &[0; 6]);

        let (tx, rx) = tokio::sync::oneshot::channel();
        handle
            .read_block(
                0,
                BlockInfo {
                    piece_index: 1,
                    offset: 4,
                    len: 8,
                },
                tx,
            )
            .unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), &piece1[4..12]);

        // cache counters are exposed
        let (tx, rx) = tokio::sync::oneshot::channel();
        handle.cache_stats(tx).unwrap();
        let stats = rx.await.unwrap();
        assert!(stats.hits + stats.misses > 0);

        handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_piece_write_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let info = StorageInfo {
            piece_count: 1,
            piece_len: 8,
            last_piece_len: 8,
            download_len: 8,
            download_dir: dir.path().join("t"),
            structure: FsStructure::File(FileInfo::new("t", 0, 8)),
        };

        let (_join, handle, mut alerts) =
            disk::spawn(DiskConf::default()).unwrap();
        handle.allocate_new_torrent(7, info).unwrap();
        let mut torrent_alerts = match alerts.recv().await.unwrap() {
            Alert::TorrentAllocation(Ok(allocation)) => allocation.alert_port,
            Alert::TorrentAllocation(Err(e)) => {
                panic!("allocation failed: {}", e)
            }
        };

        handle.write_piece(7, 3, vec![0; 8]).unwrap();
        assert!(matches!(
            torrent_alerts.recv().await.unwrap(),
            TorrentAlert::PieceWritten {
                piece_index: 3,
                result: Err(WriteError::InvalidPieceIndex(3)),
            }
        ));
        handle.shutdown().unwrap();
    }
}
