//! Single-file persistence for the latest snapshot
//!
//! # Format
//!
//! ```text
//! +------------------+
//! | Magic: "STRL"    | 4 bytes
//! | Format Version   | 4 bytes (u32 LE)
//! | Payload Length   | 8 bytes (u64 LE)
//! | Payload          | MessagePack-encoded Snapshot
//! | CRC32            | 4 bytes (of all preceding bytes)
//! +------------------+
//! ```
//!
//! Writes go to `<path>.tmp`, are fsynced, then renamed over `<path>`.
//! A sibling `<path>.lock` file holds an exclusive advisory lock for as long
//! as the store is open.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use strata_core::{StrataError, StrataResult};
use tracing::debug;

use crate::snapshot::Snapshot;

/// Magic bytes: "STRL"
pub const FILE_MAGIC: [u8; 4] = *b"STRL";

/// Current file format version
pub const FILE_FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 16;

/// Encode a snapshot into the on-disk representation
pub fn encode(snapshot: &Snapshot) -> StrataResult<Vec<u8>> {
    let payload = rmp_serde::to_vec(snapshot)
        .map_err(|e| StrataError::Serialization(e.to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
    bytes.extend_from_slice(&FILE_MAGIC);
    bytes.extend_from_slice(&FILE_FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&payload);

    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    Ok(bytes)
}

/// Decode the on-disk representation
pub fn decode(bytes: &[u8]) -> StrataResult<Snapshot> {
    if bytes.len() < HEADER_LEN + 4 {
        return Err(StrataError::storage("database file is truncated"));
    }
    if bytes[0..4] != FILE_MAGIC {
        return Err(StrataError::storage("database file has an invalid header"));
    }

    let (data, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(read_array(crc_bytes)?);
    let computed_crc = crc32fast::hash(data);
    if stored_crc != computed_crc {
        return Err(StrataError::storage(format!(
            "database file checksum mismatch: expected {:08x}, computed {:08x}",
            stored_crc, computed_crc
        )));
    }

    let format_version = u32::from_le_bytes(read_array(&data[4..8])?);
    if format_version != FILE_FORMAT_VERSION {
        return Err(StrataError::storage(format!(
            "unsupported database file format version {}",
            format_version
        )));
    }

    let payload_len = u64::from_le_bytes(read_array(&data[8..16])?) as usize;
    let payload = &data[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(StrataError::storage("database file payload length mismatch"));
    }

    rmp_serde::from_slice(payload).map_err(|e| StrataError::Serialization(e.to_string()))
}

fn read_array<const N: usize>(bytes: &[u8]) -> StrataResult<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| StrataError::storage("database file is truncated"))
}

/// Open database file plus its exclusive process lock
#[derive(Debug)]
pub struct DatabaseFile {
    path: PathBuf,
    _lock: File,
}

impl DatabaseFile {
    /// Lock `<path>.lock` and return the latest persisted snapshot, if any
    pub fn open(path: &Path) -> StrataResult<(Self, Option<Snapshot>)> {
        let lock_path = sibling(path, "lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StrataError::storage(format!("failed to open lock file: {}", e)))?;
        fs2::FileExt::try_lock_exclusive(&lock).map_err(|_| {
            StrataError::storage(format!(
                "database at '{}' is already in use by another process",
                path.display()
            ))
        })?;

        let snapshot = match std::fs::read(path) {
            Ok(bytes) if bytes.is_empty() => None,
            Ok(bytes) => Some(decode(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        debug!(
            target: "strata::storage",
            path = %path.display(),
            version = ?snapshot.as_ref().map(Snapshot::version),
            "Opened database file"
        );

        Ok((
            DatabaseFile {
                path: path.to_path_buf(),
                _lock: lock,
            },
            snapshot,
        ))
    }

    /// Atomically replace the file contents with `snapshot`
    pub fn persist(&self, snapshot: &Snapshot) -> StrataResult<()> {
        let bytes = encode(snapshot)?;
        let temp_path = sibling(&self.path, "tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `<path>.<extension>` without replacing an existing extension
pub fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}
