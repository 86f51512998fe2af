//! The disk task: preallocation, batched and coalesced writes of verified
//! pieces, and block reads through the mmap read cache.
//!
//! The task is spawned once per engine; torrents register with it and get
//! back a torrent specific alert port. Commands travel on an unbounded
//! channel, except piece writes, which go through a bounded queue per the
//! backpressure contract: a full queue surfaces a retryable error to the
//! caller instead of buffering without limit.

pub(crate) mod cache;
pub(crate) mod error;
mod io;

pub(crate) use error::*;

use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task,
};

use crate::{
    conf::DiskConf, storage_info::StorageInfo, BlockInfo, PieceIndex,
    TorrentId,
};
use cache::CacheStats;
use io::Disk;

/// Spawns a disk IO task and returns a tuple with the task join handle, the
/// disk handle used for sending commands, and a channel for receiving
/// command results and other notifications.
pub(crate) fn spawn(
    conf: DiskConf,
) -> Result<(task::JoinHandle<Result<()>>, DiskHandle, AlertReceiver)> {
    log::info!("Spawning disk IO task");
    let write_queue_size = conf.write_queue_size.max(1);
    let (mut disk, cmd_chan, write_chan, alert_port) =
        Disk::new(conf, write_queue_size);
    let join_handle = task::spawn(async move { disk.start().await });
    log::info!("Spawned disk IO task");

    Ok((
        join_handle,
        DiskHandle {
            cmd_chan,
            write_chan,
        },
        alert_port,
    ))
}

/// The handle for the disk task, used to execute disk IO related tasks.
///
/// The handle may be copied an arbitrary number of times. It is an
/// abstraction over the means to communicate with the disk IO task.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
    write_chan: mpsc::Sender<WriteCommand>,
}

impl DiskHandle {
    /// Instructs the disk task to set up everything needed for a new
    /// torrent: the directory tree, the (possibly preallocated) files, and
    /// the in-memory bookkeeping.
    pub fn allocate_new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
    ) -> Result<()> {
        log::trace!("Allocating new torrent {}", id);
        self.cmd_chan
            .send(Command::NewTorrent { id, info })
            .map_err(|_| Error::Channel)
    }

    /// Queues a verified piece for eventual writing to disk.
    ///
    /// When the bounded write queue is saturated the payload is handed
    /// back in [`WriteRejection::QueueFull`] so the caller can retry
    /// later. Once the piece is flushed, the result is advertised on the
    /// torrent's alert port.
    pub fn write_piece(
        &self,
        id: TorrentId,
        piece_index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<(), WriteRejection> {
        log::trace!(
            "Queueing piece {} of torrent {} for writing", piece_index, id
        );
        self.write_chan
            .try_send(WriteCommand {
                id,
                piece_index,
                data,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(cmd) => {
                    WriteRejection::QueueFull(cmd.data)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    WriteRejection::Closed
                }
            })
    }

    /// Requests a block of a previously written piece; the result arrives
    /// on the provided oneshot channel.
    pub fn read_block(
        &self,
        id: TorrentId,
        block: BlockInfo,
        result_chan: oneshot::Sender<Result<Vec<u8>, ReadError>>,
    ) -> Result<()> {
        log::trace!("Reading block {:?} of torrent {}", block, id);
        self.cmd_chan
            .send(Command::ReadBlock {
                id,
                block,
                result_chan,
            })
            .map_err(|_| Error::Channel)
    }

    /// Queries the read cache counters.
    pub fn cache_stats(
        &self,
        result_chan: oneshot::Sender<CacheStats>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::CacheStats { result_chan })
            .map_err(|_| Error::Channel)
    }

    /// Removes the torrent's bookkeeping and closes its file handles.
    pub fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        self.cmd_chan
            .send(Command::RemoveTorrent { id })
            .map_err(|_| Error::Channel)
    }

    /// Shuts down the disk IO task, flushing all pending writes first.
    pub fn shutdown(&self) -> Result<()> {
        log::trace!("Shutting down disk IO task");
        self.cmd_chan
            .send(Command::Shutdown)
            .map_err(|_| Error::Channel)
    }
}

/// A handle wired to bare channels instead of a running disk task, so
/// tests can observe commands and control the write queue's fill level.
#[cfg(test)]
pub(crate) fn test_handle(
    write_queue_size: usize,
) -> (DiskHandle, CommandReceiver, mpsc::Receiver<WriteCommand>) {
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let (write_chan, write_port) = mpsc::channel(write_queue_size.max(1));
    (
        DiskHandle {
            cmd_chan,
            write_chan,
        },
        cmd_port,
        write_port,
    )
}

/// The channel for sending commands to the disk task.
pub(crate) type CommandSender = UnboundedSender<Command>;
/// The channel the disk task uses to listen for commands.
pub(crate) type CommandReceiver = UnboundedReceiver<Command>;

/// The type of commands that the disk can execute.
pub(crate) enum Command {
    /// Allocate a new torrent.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
    },
    /// Read back a block of a written piece.
    ReadBlock {
        id: TorrentId,
        block: BlockInfo,
        result_chan: oneshot::Sender<Result<Vec<u8>, ReadError>>,
    },
    /// Report the read cache counters.
    CacheStats {
        result_chan: oneshot::Sender<CacheStats>,
    },
    /// Drop a torrent's disk state.
    RemoveTorrent { id: TorrentId },
    /// Eventually shut down the disk task.
    Shutdown,
}

/// A piece write traveling on the bounded write queue.
pub(crate) struct WriteCommand {
    pub id: TorrentId,
    pub piece_index: PieceIndex,
    pub data: Vec<u8>,
}

/// Why a piece write was not queued.
#[derive(Debug)]
pub(crate) enum WriteRejection {
    /// The bounded queue is saturated; the payload is returned for a
    /// retry. Surfaces as [`Error::QueueFull`] at component boundaries.
    QueueFull(Vec<u8>),
    /// The disk task is gone.
    Closed,
}

impl From<WriteRejection> for Error {
    fn from(rejection: WriteRejection) -> Self {
        match rejection {
            WriteRejection::QueueFull(_) => Error::QueueFull,
            WriteRejection::Closed => Error::Channel,
        }
    }
}

/// The type of channel used to alert the engine about global events.
pub(crate) type AlertSender = UnboundedSender<Alert>;
/// The channel on which the engine can listen for global disk events.
pub(crate) type AlertReceiver = UnboundedReceiver<Alert>;

/// The alerts that the disk task may send about global events (i.e. events
/// not related to individual torrents).
#[derive(Debug)]
pub(crate) enum Alert {
    /// Torrent allocation result. If successful, the id of the allocated
    /// torrent is returned for identification, if not, the reason of the
    /// error is included.
    TorrentAllocation(Result<TorrentAllocation, NewTorrentError>),
}

/// The result of successfully allocating a torrent.
#[derive(Debug)]
pub(crate) struct TorrentAllocation {
    /// The id of the torrent that has been allocated.
    pub id: TorrentId,
    /// The port on which torrent may receive alerts.
    pub alert_port: TorrentAlertReceiver,
}

/// The type of channel used to alert a torrent about torrent specific
/// events.
pub(crate) type TorrentAlertSender = UnboundedSender<TorrentAlert>;
/// The type of channel on which a torrent can listen for piece write
/// completions.
pub(crate) type TorrentAlertReceiver = UnboundedReceiver<TorrentAlert>;

/// The alerts that the disk task may send about events related to a
/// specific torrent.
#[derive(Debug)]
pub(crate) enum TorrentAlert {
    /// Sent when a piece's blocks were flushed to disk, or when flushing
    /// them failed. The write count is the number of bytes written for the
    /// piece (padding ranges are accounted but never materialized).
    PieceWritten {
        piece_index: PieceIndex,
        result: Result<u64, WriteError>,
    },
}
