//! Snapshot persistence for the catalog and posting store.
//!
//! Both stores live in memory and are written to disk as whole snapshots.
//! Each snapshot is one file under the storage directory:
//!
//! ```text
//! [Header: 32 bytes]
//!   - Magic: "LHSP" (4 bytes)
//!   - Version: u32 (4 bytes)
//!   - Flags: u32 (4 bytes) - compression
//!   - Body length: u64 (8 bytes)
//!   - Reserved: 12 bytes
//!
//! [Body: variable]
//!   - bincode, optionally LZ4-compressed with the size prepended
//!
//! [Footer: 8 bytes]
//!   - CRC32 of the body: u32
//!   - Magic: "PSHL" (4 bytes)
//! ```
//!
//! Writes go to a temp file first; the previous snapshot is kept as `.bak`
//! and the temp file is renamed into place.

use crate::error::{LogheapError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Magic bytes at the start of snapshot files
pub const MAGIC_HEADER: &[u8; 4] = b"LHSP";
/// Magic bytes at the end of snapshot files (reversed)
pub const MAGIC_FOOTER: &[u8; 4] = b"PSHL";
/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// File extension of snapshot files
pub const SNAPSHOT_EXT: &str = "lhs";

const HEADER_LEN: usize = 32;
const FOOTER_LEN: usize = 8;

/// Flags for the snapshot format
#[derive(Debug, Clone, Copy)]
struct SnapshotFlags(u32);

impl SnapshotFlags {
    const NONE: Self = SnapshotFlags(0);
    const COMPRESSED_LZ4: Self = SnapshotFlags(1);

    fn is_compressed(&self) -> bool {
        self.0 & 1 != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotHeader {
    magic: [u8; 4],
    version: u32,
    flags: u32,
    body_len: u64,
    reserved: [u8; 12],
}

impl SnapshotHeader {
    fn new(body_len: u64, flags: SnapshotFlags) -> Self {
        SnapshotHeader {
            magic: *MAGIC_HEADER,
            version: SNAPSHOT_VERSION,
            flags: flags.0,
            body_len,
            reserved: [0; 12],
        }
    }

    fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC_HEADER {
            return Err(LogheapError::StorageCorrupted {
                reason: "invalid magic bytes in header".to_string(),
            });
        }
        if self.version > SNAPSHOT_VERSION {
            return Err(LogheapError::StorageVersionMismatch {
                found: self.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(())
    }
}

/// Reads and writes named snapshots in one directory.
///
/// ```rust,ignore
/// let store = SnapshotStore::new("./data");
/// store.save("catalog", &catalog.snapshot())?;
/// let snapshot: CatalogSnapshot = store.load_or_default("catalog");
/// ```
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    base_dir: PathBuf,
    use_compression: bool,
}

impl SnapshotStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        SnapshotStore {
            base_dir: base_dir.as_ref().to_path_buf(),
            use_compression: true,
        }
    }

    /// Set whether to use compression when saving.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.use_compression = compress;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the snapshot called `name`.
    pub fn path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.{SNAPSHOT_EXT}"))
    }

    fn backup_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.{SNAPSHOT_EXT}.bak"))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.{SNAPSHOT_EXT}.tmp"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    /// Write `value` as snapshot `name`, replacing the previous one.
    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.base_dir)?;

        let encoded = bincode::serialize(value)?;
        let (flags, body) = if self.use_compression {
            (
                SnapshotFlags::COMPRESSED_LZ4,
                lz4_flex::compress_prepend_size(&encoded),
            )
        } else {
            (SnapshotFlags::NONE, encoded)
        };

        let temp_path = self.temp_path(name);
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);

            let header = SnapshotHeader::new(body.len() as u64, flags);
            writer.write_all(&bincode::serialize(&header)?)?;
            writer.write_all(&body)?;
            writer.write_all(&crc32fast::hash(&body).to_le_bytes())?;
            writer.write_all(MAGIC_FOOTER)?;

            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        let path = self.path(name);
        let backup_path = self.backup_path(name);
        if path.exists() {
            let _ = fs::remove_file(&backup_path);
            let _ = fs::rename(&path, &backup_path);
        }
        fs::rename(&temp_path, &path)?;

        debug!(
            snapshot = name,
            bytes = body.len(),
            compressed = flags.is_compressed(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Read snapshot `name`. A missing file yields `Ok(None)`.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path)?;
        if data.len() < HEADER_LEN + FOOTER_LEN {
            return Err(LogheapError::StorageCorrupted {
                reason: format!("{} is truncated ({} bytes)", path.display(), data.len()),
            });
        }

        let header: SnapshotHeader = bincode::deserialize(&data[..HEADER_LEN])?;
        header.validate()?;

        let body = &data[HEADER_LEN..data.len() - FOOTER_LEN];
        if body.len() as u64 != header.body_len {
            return Err(LogheapError::StorageCorrupted {
                reason: format!(
                    "body length mismatch: header says {}, found {}",
                    header.body_len,
                    body.len()
                ),
            });
        }

        let footer = &data[data.len() - FOOTER_LEN..];
        if &footer[4..8] != MAGIC_FOOTER {
            return Err(LogheapError::StorageCorrupted {
                reason: "invalid footer magic bytes".to_string(),
            });
        }
        let stored_checksum = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        let computed_checksum = crc32fast::hash(body);
        if stored_checksum != computed_checksum {
            return Err(LogheapError::StorageCorrupted {
                reason: format!(
                    "checksum mismatch: expected {stored_checksum:08x}, got {computed_checksum:08x}"
                ),
            });
        }

        let flags = SnapshotFlags(header.flags);
        let decoded = if flags.is_compressed() {
            lz4_flex::decompress_size_prepended(body).map_err(|e| LogheapError::StorageCorrupted {
                reason: format!("decompression failed: {e}"),
            })?
        } else {
            body.to_vec()
        };

        let value = bincode::deserialize(&decoded).map_err(|e| LogheapError::StorageCorrupted {
            reason: format!("deserialization failed: {e}"),
        })?;

        info!(snapshot = name, bytes = data.len(), "snapshot loaded");
        Ok(Some(value))
    }

    /// Load `name`, or start from the default when it is missing or unreadable.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        match self.load(name) {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(e) => {
                warn!(snapshot = name, error = %e, "failed to load snapshot, starting fresh");
                T::default()
            }
        }
    }

    /// Delete snapshot `name` and its backup.
    pub fn clear(&self, name: &str) -> Result<()> {
        for path in [self.path(name), self.backup_path(name)] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: BTreeMap<String, Vec<u64>>,
    }

    fn sample() -> Sample {
        let mut values = BTreeMap::new();
        values.insert("timeout".to_string(), vec![1, 2, 3]);
        values.insert("error".to_string(), vec![7]);
        Sample {
            name: "catalog".to_string(),
            values,
        }
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp_dir.path());

        store.save("catalog", &sample()).unwrap();
        assert!(store.exists("catalog"));
        assert!(store.path("catalog").ends_with("catalog.lhs"));

        let loaded: Sample = store.load("catalog").unwrap().unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_save_and_load_uncompressed() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp_dir.path()).with_compression(false);

        store.save("postings", &sample()).unwrap();
        let loaded: Sample = store.load("postings").unwrap().unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_load_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp_dir.path());

        let loaded: Option<Sample> = store.load("catalog").unwrap();
        assert!(loaded.is_none());
        let fresh: Sample = store.load_or_default("catalog");
        assert_eq!(fresh, Sample::default());
    }

    #[test]
    fn test_second_save_keeps_backup() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp_dir.path());

        store.save("catalog", &Sample::default()).unwrap();
        store.save("catalog", &sample()).unwrap();
        assert!(temp_dir.path().join("catalog.lhs.bak").exists());

        store.clear("catalog").unwrap();
        assert!(!store.exists("catalog"));
        assert!(!temp_dir.path().join("catalog.lhs.bak").exists());
    }

    #[test]
    fn test_corrupted_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp_dir.path());

        fs::write(store.path("catalog"), b"not a valid snapshot file").unwrap();
        let result: Result<Option<Sample>> = store.load("catalog");
        assert!(result.is_err());

        let fresh: Sample = store.load_or_default("catalog");
        assert_eq!(fresh, Sample::default());
    }

    #[test]
    fn test_flipped_body_byte_fails_checksum() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        store.save("catalog", &sample()).unwrap();

        let path = store.path("catalog");
        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_LEN + 2] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let err = store.load::<Sample>("catalog").unwrap_err();
        assert!(matches!(err, LogheapError::StorageCorrupted { .. }));
    }
}
