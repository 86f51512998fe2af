//! Durable snapshots of the piece engine, resumable across restarts.
//!
//! Two on-disk formats are maintained, selectable per configuration:
//!
//! * JSON: pretty-printed UTF-8, bytes hex-encoded, enum values as strings,
//!   named `<hex info hash>.checkpoint.json`.
//! * Binary: `CCBT` magic, a 1 byte version, the info hash, a big-endian
//!   timestamp and piece count, an MSB-first bitfield of verified pieces,
//!   then a length-prefixed JSON metadata blob with the remaining fields.
//!   Optionally gzip framed (`.bin.gz`).
//!
//! Saves go through a temporary file and an atomic rename, and saves for
//! the same info hash are serialized against each other.

use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::sync::Mutex;

use crate::{
    conf::{CheckpointFormat, DiskConf},
    error::{Error, Result},
    piece::PieceState,
    InfoHash, PieceIndex,
};

/// The JSON checkpoint schema version.
pub(crate) const CHECKPOINT_VERSION: &str = "1.0";

/// The binary checkpoint magic bytes.
const MAGIC: &[u8; 4] = b"CCBT";
/// The binary checkpoint format version.
const BINARY_VERSION: u8 = 1;

/// A piece state as persisted in checkpoints.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PieceStateTag {
    Missing,
    Requested,
    Downloading,
    Complete,
    Verified,
}

impl From<PieceState> for PieceStateTag {
    fn from(state: PieceState) -> Self {
        match state {
            PieceState::Missing => Self::Missing,
            PieceState::Requested => Self::Requested,
            PieceState::Downloading => Self::Downloading,
            PieceState::Complete => Self::Complete,
            PieceState::Verified => Self::Verified,
        }
    }
}

/// Download statistics carried by a checkpoint. Timestamps are seconds
/// since the Unix epoch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadStats {
    pub bytes_downloaded: u64,
    pub download_time: f64,
    pub average_speed: f64,
    pub start_time: f64,
    pub last_update: f64,
}

/// A file entry of a checkpoint, with its BEP-47 attributes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileCheckpoint {
    pub path: String,
    pub size: u64,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_path: Option<String>,
    /// Hex-encoded per-file SHA-1, when the torrent declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_sha1: Option<String>,
}

/// The durable snapshot of a torrent's piece engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TorrentCheckpoint {
    pub version: String,
    #[serde(with = "hex_bytes")]
    pub info_hash: InfoHash,
    pub torrent_name: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub total_pieces: usize,
    pub piece_length: u32,
    pub total_length: u64,
    pub verified_pieces: Vec<PieceIndex>,
    pub piece_states: HashMap<PieceIndex, PieceStateTag>,
    pub download_stats: DownloadStats,
    pub output_dir: String,
    #[serde(default)]
    pub files: Vec<FileCheckpoint>,
    #[serde(default)]
    pub peer_info: HashMap<String, u64>,
    #[serde(default)]
    pub endgame_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torrent_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnet_uri: Option<String>,
    #[serde(default)]
    pub announce_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Hex string (de)serialization of the 20 byte info hash, for the JSON
/// format.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::InfoHash;

    pub fn serialize<S: Serializer>(
        hash: &InfoHash,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<InfoHash, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes =
            hex::decode(&raw).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("info hash must be 20 bytes"))
    }
}

/// Metadata about a checkpoint file on disk.
#[derive(Debug)]
pub struct CheckpointFileInfo {
    pub path: PathBuf,
    pub info_hash: InfoHash,
    pub modified_at: SystemTime,
    pub size: u64,
    pub format: CheckpointFormat,
}

/// Manages the checkpoint directory.
pub struct CheckpointStore {
    dir: PathBuf,
    format: CheckpointFormat,
    compression: bool,
    enabled: bool,
    /// Serializes concurrent saves per info hash.
    locks: StdMutex<HashMap<InfoHash, Arc<Mutex<()>>>>,
}

impl CheckpointStore {
    /// Creates a store per the disk configuration. The checkpoint directory
    /// defaults to `.ccbt/checkpoints` under the download directory.
    pub fn new(conf: &DiskConf, download_dir: &Path) -> Result<Self> {
        let dir = conf
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| download_dir.join(".ccbt").join("checkpoints"));
        fs::create_dir_all(&dir).map_err(|e| Error::Disk {
            path: dir.clone(),
            source: e,
        })?;
        log::info!("Checkpoint store at {:?}", dir);
        Ok(Self {
            dir,
            format: conf.checkpoint_format,
            compression: conf.checkpoint_compression,
            enabled: conf.checkpoint_enabled,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    fn json_path(&self, info_hash: &InfoHash) -> PathBuf {
        self.dir
            .join(format!("{}.checkpoint.json", hex::encode(info_hash)))
    }

    fn binary_path(&self, info_hash: &InfoHash) -> PathBuf {
        let ext = if self.compression {
            "checkpoint.bin.gz"
        } else {
            "checkpoint.bin"
        };
        self.dir
            .join(format!("{}.{}", hex::encode(info_hash), ext))
    }

    fn lock_for(&self, info_hash: &InfoHash) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(locks.entry(*info_hash).or_default())
    }

    /// Saves the checkpoint in the configured format(s), updating its
    /// `updated_at` stamp. Returns the primary path written.
    pub async fn save(
        &self,
        checkpoint: &TorrentCheckpoint,
    ) -> Result<PathBuf> {
        if !self.enabled {
            return Err(Error::Validation("checkpointing is disabled".into()));
        }
        let lock = self.lock_for(&checkpoint.info_hash);
        let _guard = lock.lock().await;

        let mut checkpoint = checkpoint.clone();
        checkpoint.updated_at = now_secs();

        match self.format {
            CheckpointFormat::Json => self.save_json(&checkpoint),
            CheckpointFormat::Binary => self.save_binary(&checkpoint),
            CheckpointFormat::Both => {
                let path = self.save_json(&checkpoint)?;
                self.save_binary(&checkpoint)?;
                Ok(path)
            }
        }
    }

    fn save_json(&self, checkpoint: &TorrentCheckpoint) -> Result<PathBuf> {
        let path = self.json_path(&checkpoint.info_hash);
        let data = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| Error::Validation(format!("json: {}", e)))?;
        write_atomically(&path, &data)?;
        log::debug!("Saved JSON checkpoint {:?}", path);
        Ok(path)
    }

    fn save_binary(&self, checkpoint: &TorrentCheckpoint) -> Result<PathBuf> {
        let path = self.binary_path(&checkpoint.info_hash);
        let raw = encode_binary(checkpoint)?;
        let data = if self.compression {
            gzip_compress(&raw)?
        } else {
            raw
        };
        write_atomically(&path, &data)?;
        log::debug!("Saved binary checkpoint {:?}", path);
        Ok(path)
    }

    /// Loads the checkpoint for the torrent, trying the configured
    /// format(s).
    ///
    /// A missing checkpoint is [`Error::CheckpointNotFound`]; a present but
    /// unparsable one is [`Error::CheckpointCorrupted`]; a schema version
    /// mismatch is [`Error::CheckpointVersion`]. Only the latter two fail
    /// a resume; not-found simply means starting from zero.
    pub async fn load(
        &self,
        info_hash: &InfoHash,
    ) -> Result<TorrentCheckpoint> {
        match self.format {
            CheckpointFormat::Json => self.load_json(info_hash),
            CheckpointFormat::Binary => self.load_binary(info_hash),
            CheckpointFormat::Both => match self.load_json(info_hash) {
                Err(Error::CheckpointNotFound) => self.load_binary(info_hash),
                other => other,
            },
        }
    }

    fn load_json(&self, info_hash: &InfoHash) -> Result<TorrentCheckpoint> {
        let path = self.json_path(info_hash);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::CheckpointNotFound)
            }
            Err(e) => return Err(Error::Disk { path, source: e }),
        };
        parse_json_checkpoint(&data, Some(info_hash))
    }

    fn load_binary(&self, info_hash: &InfoHash) -> Result<TorrentCheckpoint> {
        let path = self.binary_path(info_hash);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::CheckpointNotFound)
            }
            Err(e) => return Err(Error::Disk { path, source: e }),
        };
        let data = maybe_gzip_decompress(data)?;
        decode_binary(&data, info_hash)
    }

    /// Deletes any checkpoint files for the torrent. Returns whether
    /// anything was removed.
    pub async fn delete(&self, info_hash: &InfoHash) -> Result<bool> {
        let mut deleted = false;
        for path in self.all_paths(info_hash) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    log::info!("Deleted checkpoint {:?}", path);
                    deleted = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Disk { path, source: e }),
            }
        }
        Ok(deleted)
    }

    fn all_paths(&self, info_hash: &InfoHash) -> Vec<PathBuf> {
        let hex = hex::encode(info_hash);
        vec![
            self.dir.join(format!("{}.checkpoint.json", hex)),
            self.dir.join(format!("{}.checkpoint.bin", hex)),
            self.dir.join(format!("{}.checkpoint.bin.gz", hex)),
        ]
    }

    /// Lists the checkpoint files in the store directory.
    pub async fn list(&self) -> Result<Vec<CheckpointFileInfo>> {
        let mut infos = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::Disk {
            path: self.dir.clone(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::Disk {
                path: self.dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            let (hex_part, format) =
                if let Some(hex) = name.strip_suffix(".checkpoint.json") {
                    (hex, CheckpointFormat::Json)
                } else if let Some(hex) = name.strip_suffix(".checkpoint.bin")
                {
                    (hex, CheckpointFormat::Binary)
                } else if let Some(hex) =
                    name.strip_suffix(".checkpoint.bin.gz")
                {
                    (hex, CheckpointFormat::Binary)
                } else {
                    continue;
                };
            let info_hash = match hex::decode(hex_part)
                .ok()
                .and_then(|bytes| <InfoHash>::try_from(bytes).ok())
            {
                Some(hash) => hash,
                None => continue,
            };
            let metadata = entry.metadata().map_err(|e| Error::Disk {
                path: path.clone(),
                source: e,
            })?;
            infos.push(CheckpointFileInfo {
                path,
                info_hash,
                modified_at: metadata
                    .modified()
                    .unwrap_or(SystemTime::UNIX_EPOCH),
                size: metadata.len(),
                format,
            });
        }
        Ok(infos)
    }

    /// A lightweight integrity probe: whether the torrent's checkpoint
    /// loads cleanly.
    pub async fn verify(&self, info_hash: &InfoHash) -> bool {
        self.load(info_hash).await.is_ok()
    }

    /// Exports the torrent's checkpoint as portable JSON bytes.
    pub async fn export(&self, info_hash: &InfoHash) -> Result<Vec<u8>> {
        let checkpoint = self.load(info_hash).await?;
        serde_json::to_vec_pretty(&checkpoint)
            .map_err(|e| Error::Validation(format!("json: {}", e)))
    }

    /// Deletes checkpoints whose file modification time is older than the
    /// cutoff. Returns the number of files removed.
    pub async fn cleanup_old(&self, max_age_days: u64) -> Result<usize> {
        let cutoff = SystemTime::now()
            - Duration::from_secs(max_age_days * 24 * 60 * 60);
        let mut removed = 0;
        for info in self.list().await? {
            if info.modified_at < cutoff {
                match fs::remove_file(&info.path) {
                    Ok(()) => {
                        log::info!(
                            "Removed stale checkpoint {:?}",
                            info.path
                        );
                        removed += 1;
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(Error::Disk {
                            path: info.path,
                            source: e,
                        })
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Writes a portable backup of the torrent's checkpoint to the
    /// destination path: JSON, optionally gzipped, optionally encrypted
    /// with a generated key written to a `<destination>.key` sidecar.
    pub async fn backup(
        &self,
        info_hash: &InfoHash,
        destination: &Path,
        compress: bool,
        encrypt: bool,
    ) -> Result<PathBuf> {
        let mut data = self.export(info_hash).await?;
        if compress {
            data = gzip_compress(&data)?;
        }
        if encrypt {
            data = encrypt_backup(&data, destination)?;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Disk {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        fs::write(destination, &data).map_err(|e| Error::Disk {
            path: destination.to_path_buf(),
            source: e,
        })?;
        log::info!("Wrote checkpoint backup to {:?}", destination);
        Ok(destination.to_path_buf())
    }

    /// Rehydrates a backup produced by [`CheckpointStore::backup`] into the
    /// store and returns the restored checkpoint. If a `<backup>.key`
    /// sidecar exists the backup is decrypted with it first.
    pub async fn restore_backup(
        &self,
        backup: &Path,
        expected_info_hash: Option<&InfoHash>,
    ) -> Result<TorrentCheckpoint> {
        let mut data = fs::read(backup).map_err(|e| Error::Disk {
            path: backup.to_path_buf(),
            source: e,
        })?;
        let key_path = sidecar_key_path(backup);
        if key_path.exists() {
            data = decrypt_backup(&data, &key_path)?;
        }
        if data.starts_with(&[0x1f, 0x8b]) {
            data = gzip_decompress(&data)?;
        }
        let checkpoint = parse_json_checkpoint(&data, expected_info_hash)?;
        self.save(&checkpoint).await?;
        Ok(checkpoint)
    }
}

fn parse_json_checkpoint(
    data: &[u8],
    expected_info_hash: Option<&InfoHash>,
) -> Result<TorrentCheckpoint> {
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(Error::CheckpointCorrupted("file is empty".into()));
    }
    let checkpoint: TorrentCheckpoint = serde_json::from_slice(data)
        .map_err(|e| Error::CheckpointCorrupted(format!("json: {}", e)))?;
    if checkpoint.version != CHECKPOINT_VERSION {
        return Err(Error::CheckpointVersion(checkpoint.version));
    }
    if let Some(expected) = expected_info_hash {
        if checkpoint.info_hash != *expected {
            return Err(Error::CheckpointCorrupted(
                "info hash mismatch".into(),
            ));
        }
    }
    Ok(checkpoint)
}

/// The non-bitfield fields of the binary format, carried as a JSON blob
/// after the fixed header.
#[derive(Serialize, Deserialize)]
struct BinaryMeta {
    torrent_name: String,
    piece_length: u32,
    total_length: u64,
    piece_states: HashMap<PieceIndex, PieceStateTag>,
    download_stats: DownloadStats,
    output_dir: String,
    files: Vec<FileCheckpoint>,
    peer_info: HashMap<String, u64>,
    endgame_mode: bool,
    torrent_file_path: Option<String>,
    magnet_uri: Option<String>,
    announce_urls: Vec<String>,
    display_name: Option<String>,
    created_at: f64,
}

fn encode_binary(checkpoint: &TorrentCheckpoint) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.push(BINARY_VERSION);
    buf.extend_from_slice(&checkpoint.info_hash);
    buf.extend_from_slice(&(checkpoint.updated_at as u64).to_be_bytes());
    buf.extend_from_slice(&(checkpoint.total_pieces as u32).to_be_bytes());

    // MSB-first verified bitfield
    let mut bitfield = vec![0u8; (checkpoint.total_pieces + 7) / 8];
    for index in checkpoint.verified_pieces.iter() {
        if *index < checkpoint.total_pieces {
            bitfield[index / 8] |= 1 << (7 - (index % 8));
        }
    }
    buf.extend_from_slice(&bitfield);

    let meta = BinaryMeta {
        torrent_name: checkpoint.torrent_name.clone(),
        piece_length: checkpoint.piece_length,
        total_length: checkpoint.total_length,
        piece_states: checkpoint.piece_states.clone(),
        download_stats: checkpoint.download_stats.clone(),
        output_dir: checkpoint.output_dir.clone(),
        files: checkpoint.files.clone(),
        peer_info: checkpoint.peer_info.clone(),
        endgame_mode: checkpoint.endgame_mode,
        torrent_file_path: checkpoint.torrent_file_path.clone(),
        magnet_uri: checkpoint.magnet_uri.clone(),
        announce_urls: checkpoint.announce_urls.clone(),
        display_name: checkpoint.display_name.clone(),
        created_at: checkpoint.created_at,
    };
    let meta = serde_json::to_vec(&meta)
        .map_err(|e| Error::Validation(format!("json: {}", e)))?;
    buf.extend_from_slice(&(meta.len() as u32).to_be_bytes());
    buf.extend_from_slice(&meta);
    Ok(buf)
}

fn decode_binary(
    data: &[u8],
    expected_info_hash: &InfoHash,
) -> Result<TorrentCheckpoint> {
    let corrupted =
        |reason: &str| Error::CheckpointCorrupted(reason.to_string());

    if data.len() < 4 + 1 + 20 + 8 + 4 {
        return Err(corrupted("truncated header"));
    }
    if &data[..4] != MAGIC {
        return Err(corrupted("invalid magic bytes"));
    }
    let version = data[4];
    if version != BINARY_VERSION {
        return Err(Error::CheckpointVersion(version.to_string()));
    }
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&data[5..25]);
    if info_hash != *expected_info_hash {
        return Err(corrupted("info hash mismatch"));
    }
    let timestamp =
        u64::from_be_bytes(data[25..33].try_into().unwrap());
    let total_pieces =
        u32::from_be_bytes(data[33..37].try_into().unwrap()) as usize;

    let bitfield_len = (total_pieces + 7) / 8;
    let bitfield_end = 37 + bitfield_len;
    if data.len() < bitfield_end + 4 {
        return Err(corrupted("truncated bitfield"));
    }
    let mut verified_pieces = Vec::new();
    for index in 0..total_pieces {
        let byte = data[37 + index / 8];
        if byte & (1 << (7 - (index % 8))) != 0 {
            verified_pieces.push(index);
        }
    }

    let meta_len = u32::from_be_bytes(
        data[bitfield_end..bitfield_end + 4].try_into().unwrap(),
    ) as usize;
    let meta_start = bitfield_end + 4;
    if data.len() < meta_start + meta_len {
        return Err(corrupted("truncated metadata"));
    }
    let meta: BinaryMeta =
        serde_json::from_slice(&data[meta_start..meta_start + meta_len])
            .map_err(|e| {
                Error::CheckpointCorrupted(format!("metadata: {}", e))
            })?;

    Ok(TorrentCheckpoint {
        version: CHECKPOINT_VERSION.to_string(),
        info_hash,
        torrent_name: meta.torrent_name,
        created_at: meta.created_at,
        updated_at: timestamp as f64,
        total_pieces,
        piece_length: meta.piece_length,
        total_length: meta.total_length,
        verified_pieces,
        piece_states: meta.piece_states,
        download_stats: meta.download_stats,
        output_dir: meta.output_dir,
        files: meta.files,
        peer_info: meta.peer_info,
        endgame_mode: meta.endgame_mode,
        torrent_file_path: meta.torrent_file_path,
        magnet_uri: meta.magnet_uri,
        announce_urls: meta.announce_urls,
        display_name: meta.display_name,
    })
}

/// Writes via a temporary file in the same directory and renames it over
/// the target so readers never observe a half-written checkpoint.
fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let disk_err = |source, p: &Path| Error::Disk {
        path: p.to_path_buf(),
        source,
    };
    {
        let mut file =
            fs::File::create(&tmp).map_err(|e| disk_err(e, &tmp))?;
        file.write_all(data).map_err(|e| disk_err(e, &tmp))?;
        file.sync_all().map_err(|e| disk_err(e, &tmp))?;
    }
    fs::rename(&tmp, path).map_err(|e| disk_err(e, path))?;
    Ok(())
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn sidecar_key_path(backup: &Path) -> PathBuf {
    let mut name = backup
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".key");
    backup.with_file_name(name)
}

#[cfg(feature = "gzip")]
fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::{write::GzEncoder, Compression};
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Validation(format!("gzip: {}", e)))
}

#[cfg(feature = "gzip")]
fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    use std::io::Read;

    use flate2::read::GzDecoder;
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::CheckpointCorrupted(format!("gzip: {}", e)))?;
    Ok(out)
}

#[cfg(not(feature = "gzip"))]
fn gzip_compress(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::Validation(
        "checkpoint compression requires the `gzip` feature".into(),
    ))
}

#[cfg(not(feature = "gzip"))]
fn gzip_decompress(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::Validation(
        "checkpoint compression requires the `gzip` feature".into(),
    ))
}

fn maybe_gzip_decompress(data: Vec<u8>) -> Result<Vec<u8>> {
    if data.starts_with(&[0x1f, 0x8b]) {
        gzip_decompress(&data)
    } else {
        Ok(data)
    }
}

#[cfg(feature = "encryption")]
fn encrypt_backup(data: &[u8], destination: &Path) -> Result<Vec<u8>> {
    let key = fernet::Fernet::generate_key();
    // the generated key is always valid
    let fernet = fernet::Fernet::new(&key).unwrap();
    let token = fernet.encrypt(data);
    let key_path = sidecar_key_path(destination);
    fs::write(&key_path, key.as_bytes()).map_err(|e| Error::Disk {
        path: key_path,
        source: e,
    })?;
    Ok(token.into_bytes())
}

#[cfg(feature = "encryption")]
fn decrypt_backup(data: &[u8], key_path: &Path) -> Result<Vec<u8>> {
    let key = fs::read_to_string(key_path).map_err(|e| Error::Disk {
        path: key_path.to_path_buf(),
        source: e,
    })?;
    let fernet = fernet::Fernet::new(key.trim())
        .ok_or_else(|| Error::CheckpointCorrupted("invalid key".into()))?;
    let token = std::str::from_utf8(data)
        .map_err(|_| Error::CheckpointCorrupted("invalid token".into()))?;
    fernet
        .decrypt(token)
        .map_err(|_| Error::CheckpointCorrupted("decryption failed".into()))
}

#[cfg(not(feature = "encryption"))]
fn encrypt_backup(_data: &[u8], _destination: &Path) -> Result<Vec<u8>> {
    Err(Error::Validation(
        "encrypted backups require the `encryption` feature".into(),
    ))
}

#[cfg(not(feature = "encryption"))]
fn decrypt_backup(_data: &[u8], key_path: &Path) -> Result<Vec<u8>> {
    Err(Error::Validation(format!(
        "backup has a key sidecar {:?} but the `encryption` feature is not \
        compiled in",
        key_path
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_conf(dir: &Path, format: CheckpointFormat) -> DiskConf {
        DiskConf {
            checkpoint_dir: Some(dir.to_path_buf()),
            checkpoint_format: format,
            ..DiskConf::default()
        }
    }

    fn sample_checkpoint() -> TorrentCheckpoint {
        let mut piece_states = HashMap::new();
        piece_states.insert(0, PieceStateTag::Verified);
        piece_states.insert(1, PieceStateTag::Downloading);
        piece_states.insert(2, PieceStateTag::Missing);
        TorrentCheckpoint {
            version: CHECKPOINT_VERSION.to_string(),
            info_hash: [0xab; 20],
            torrent_name: "sample".into(),
            created_at: 1_000_000.0,
            updated_at: 1_000_100.0,
            total_pieces: 3,
            piece_length: 32_768,
            total_length: 70_000,
            verified_pieces: vec![0],
            piece_states,
            download_stats: DownloadStats {
                bytes_downloaded: 32_768,
                download_time: 12.5,
                average_speed: 2621.44,
                start_time: 1_000_000.0,
                last_update: 1_000_100.0,
            },
            output_dir: "/downloads".into(),
            files: vec![FileCheckpoint {
                path: "/downloads/sample".into(),
                size: 70_000,
                exists: true,
                attributes: None,
                symlink_path: None,
                file_sha1: None,
            }],
            peer_info: HashMap::new(),
            endgame_mode: false,
            torrent_file_path: Some("/torrents/sample.torrent".into()),
            magnet_uri: None,
            announce_urls: vec!["http://tracker/announce".into()],
            display_name: Some("sample".into()),
        }
    }

    fn assert_same_modulo_updated_at(
        loaded: &TorrentCheckpoint,
        expected: &TorrentCheckpoint,
    ) {
        let mut loaded = loaded.clone();
        loaded.updated_at = expected.updated_at;
        assert_eq!(&loaded, expected);
    }

    #[tokio::test]
    async fn test_json_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(
            &test_conf(dir.path(), CheckpointFormat::Json),
            dir.path(),
        )
        .unwrap();

        let checkpoint = sample_checkpoint();
        let path = store.save(&checkpoint).await.unwrap();
        assert!(path.to_string_lossy().ends_with(".checkpoint.json"));

        let loaded = store.load(&checkpoint.info_hash).await.unwrap();
        assert_same_modulo_updated_at(&loaded, &checkpoint);
    }

    #[tokio::test]
    async fn test_binary_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(
            &test_conf(dir.path(), CheckpointFormat::Binary),
            dir.path(),
        )
        .unwrap();

        let checkpoint = sample_checkpoint();
        store.save(&checkpoint).await.unwrap();
        let loaded = store.load(&checkpoint.info_hash).await.unwrap();

        assert_eq!(loaded.verified_pieces, checkpoint.verified_pieces);
        assert_eq!(loaded.piece_states, checkpoint.piece_states);
        assert_eq!(loaded.total_pieces, checkpoint.total_pieces);
        assert_eq!(loaded.download_stats, checkpoint.download_stats);
        assert_eq!(loaded.torrent_name, checkpoint.torrent_name);
    }

    #[cfg(feature = "gzip")]
    #[tokio::test]
    async fn test_compressed_binary_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(dir.path(), CheckpointFormat::Binary);
        conf.checkpoint_compression = true;
        let store = CheckpointStore::new(&conf, dir.path()).unwrap();

        let checkpoint = sample_checkpoint();
        let path = store.save(&checkpoint).await.unwrap();
        assert!(path.to_string_lossy().ends_with(".checkpoint.bin.gz"));
        let loaded = store.load(&checkpoint.info_hash).await.unwrap();
        assert_eq!(loaded.verified_pieces, checkpoint.verified_pieces);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(
            &test_conf(dir.path(), CheckpointFormat::Both),
            dir.path(),
        )
        .unwrap();
        assert!(matches!(
            store.load(&[0; 20]).await,
            Err(Error::CheckpointNotFound)
        ));
    }

    #[tokio::test]
    async fn test_corrupted_json_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(
            &test_conf(dir.path(), CheckpointFormat::Json),
            dir.path(),
        )
        .unwrap();
        let info_hash = [1u8; 20];
        fs::write(store.json_path(&info_hash), b"{ not json").unwrap();
        assert!(matches!(
            store.load(&info_hash).await,
            Err(Error::CheckpointCorrupted(_))
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(
            &test_conf(dir.path(), CheckpointFormat::Json),
            dir.path(),
        )
        .unwrap();
        let mut checkpoint = sample_checkpoint();
        checkpoint.version = "2.0".into();
        let data = serde_json::to_vec_pretty(&checkpoint).unwrap();
        fs::write(store.json_path(&checkpoint.info_hash), data).unwrap();
        assert!(matches!(
            store.load(&checkpoint.info_hash).await,
            Err(Error::CheckpointVersion(_))
        ));
    }

    #[tokio::test]
    async fn test_binary_magic_mismatch_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(
            &test_conf(dir.path(), CheckpointFormat::Binary),
            dir.path(),
        )
        .unwrap();
        let checkpoint = sample_checkpoint();
        store.save(&checkpoint).await.unwrap();

        let path = store.binary_path(&checkpoint.info_hash);
        let mut data = fs::read(&path).unwrap();
        data[0] = b'X';
        fs::write(&path, data).unwrap();

        assert!(matches!(
            store.load(&checkpoint.info_hash).await,
            Err(Error::CheckpointCorrupted(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_old() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(
            &test_conf(dir.path(), CheckpointFormat::Json),
            dir.path(),
        )
        .unwrap();
        let checkpoint = sample_checkpoint();
        store.save(&checkpoint).await.unwrap();

        // a generous cutoff retains the fresh checkpoint
        assert_eq!(store.cleanup_old(30).await.unwrap(), 0);
        assert!(store.verify(&checkpoint.info_hash).await);

        // a zero day cutoff removes everything written before "now"
        assert_eq!(store.cleanup_old(0).await.unwrap(), 1);
        assert!(!store.verify(&checkpoint.info_hash).await);
    }

    #[cfg(feature = "gzip")]
    #[tokio::test]
    async fn test_backup_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(
            &test_conf(dir.path(), CheckpointFormat::Json),
            dir.path(),
        )
        .unwrap();
        let checkpoint = sample_checkpoint();
        store.save(&checkpoint).await.unwrap();

        let backup_path = dir.path().join("backups").join("sample.backup");
        store
            .backup(&checkpoint.info_hash, &backup_path, true, false)
            .await
            .unwrap();
        // the backup is gzip framed
        let raw = fs::read(&backup_path).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);

        store.delete(&checkpoint.info_hash).await.unwrap();
        let restored = store
            .restore_backup(&backup_path, Some(&checkpoint.info_hash))
            .await
            .unwrap();
        assert_same_modulo_updated_at(&restored, &checkpoint);
        assert!(store.verify(&checkpoint.info_hash).await);
    }

    #[tokio::test]
    async fn test_list_reports_formats() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(
            &test_conf(dir.path(), CheckpointFormat::Both),
            dir.path(),
        )
        .unwrap();
        let checkpoint = sample_checkpoint();
        store.save(&checkpoint).await.unwrap();

        let mut listed = store.list().await.unwrap();
        listed.sort_by_key(|info| info.path.clone());
        assert_eq!(listed.len(), 2);
        assert!(listed
            .iter()
            .all(|info| info.info_hash == checkpoint.info_hash));
    }
}
