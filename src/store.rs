//! File-backed persistence for printed receipts.
//!
//! Layout under the data directory:
//! - `receipts/{full_number}.txt`: CRLF-joined body of each printed receipt
//! - `logo.jpg`: cached logo
//! - `en_ejecucion.txt`: liveness marker, present only while a cycle runs
//!
//! A receipt file's presence is the only durable "already printed" signal.
//! Writes go through a temporary file and a rename so a crash never leaves a
//! half-written record that would later compare as "changed".
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, instrument};

use crate::model::ReceiptBody;

const RECEIPTS_DIR: &str = "receipts";
const RECORD_EXT: &str = "txt";
const LOGO_FILE: &str = "logo.jpg";
const RUNNING_MARKER: &str = "en_ejecucion.txt";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("receipt number {0:?} cannot be used as a file name")]
    InvalidKey(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A persisted receipt as seen when listing the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    pub full_number: String,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReceiptStore {
    root: PathBuf,
    receipts: PathBuf,
}

impl ReceiptStore {
    /// Open (creating if needed) the store rooted at `data_dir`.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = data_dir.as_ref().to_path_buf();
        let receipts = root.join(RECEIPTS_DIR);
        fs::create_dir_all(&receipts)
            .await
            .map_err(|e| StoreError::io(&receipts, e))?;
        Ok(Self { root, receipts })
    }

    pub fn path_for(&self, full_number: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_key(full_number) {
            return Err(StoreError::InvalidKey(full_number.to_string()));
        }
        Ok(self.receipts.join(format!("{}.{}", full_number, RECORD_EXT)))
    }

    pub async fn exists(&self, full_number: &str) -> Result<bool, StoreError> {
        let path = self.path_for(full_number)?;
        fs::try_exists(&path).await.map_err(|e| StoreError::io(&path, e))
    }

    /// Raw persisted text, or `None` when the receipt was never printed.
    pub async fn read(&self, full_number: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(full_number)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Write (or fully replace) the record for `full_number`.
    #[instrument(skip_all, fields(full_number = %full_number))]
    pub async fn write(&self, full_number: &str, body: &ReceiptBody) -> Result<(), StoreError> {
        let path = self.path_for(full_number)?;
        write_atomically(&path, body.to_text().as_bytes()).await?;
        debug!(path = %path.display(), "receipt persisted");
        Ok(())
    }

    pub async fn delete(&self, full_number: &str) -> Result<(), StoreError> {
        let path = self.path_for(full_number)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Delete `record` if more than `max_age_days` whole days have passed since
    /// it was written. Returns whether it was removed.
    pub async fn delete_if_older_than(
        &self,
        record: &PersistedRecord,
        max_age_days: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if age_in_days(record.written_at, now) <= i64::from(max_age_days) {
            return Ok(false);
        }
        self.delete(&record.full_number).await?;
        Ok(true)
    }

    /// Every persisted receipt with its last write time. Non-record files are ignored.
    pub async fn list(&self) -> Result<Vec<PersistedRecord>, StoreError> {
        let mut entries = fs::read_dir(&self.receipts)
            .await
            .map_err(|e| StoreError::io(&self.receipts, e))?;
        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.receipts, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_key(stem) {
                continue;
            }
            let meta = entry.metadata().await.map_err(|e| StoreError::io(&path, e))?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().map_err(|e| StoreError::io(&path, e))?;
            records.push(PersistedRecord {
                full_number: stem.to_string(),
                written_at: DateTime::<Utc>::from(modified),
            });
        }
        records.sort_by(|a, b| a.full_number.cmp(&b.full_number));
        Ok(records)
    }

    pub fn logo_path(&self) -> PathBuf {
        self.root.join(LOGO_FILE)
    }

    pub async fn read_logo(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.logo_path();
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    pub async fn write_logo(&self, bytes: &[u8]) -> Result<(), StoreError> {
        write_atomically(&self.logo_path(), bytes).await
    }

    pub async fn discard_logo(&self) -> Result<(), StoreError> {
        let path = self.logo_path();
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    pub fn running_marker_path(&self) -> PathBuf {
        self.root.join(RUNNING_MARKER)
    }

    pub async fn mark_running(&self) -> Result<(), StoreError> {
        let path = self.running_marker_path();
        fs::write(&path, b"En ejecucion")
            .await
            .map_err(|e| StoreError::io(&path, e))
    }

    pub async fn clear_running(&self) -> Result<(), StoreError> {
        let path = self.running_marker_path();
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

/// Whole days elapsed since `written_at`, rounded down.
pub fn age_in_days(written_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - written_at).num_days()
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key != "."
        && key != ".."
        && !key.starts_with('.')
        && !key.contains(['/', '\\', '\0'])
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp, bytes).await.map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).await.map_err(|e| StoreError::io(path, e))
}
