//! File-backed update store.
//!
//! Layout under the data directory:
//!
//! ```text
//! docs/<hex doc id>/snapshot.bin
//! docs/<hex doc id>/updates/<seq, zero padded>.bin
//! ```
//!
//! Records are bincode-encoded. Every write goes to a temporary file first
//! and is renamed into place, so a crash never leaves a torn record behind.

use async_trait::async_trait;
use lfcc_core::compaction::Result;
use lfcc_core::{DocSnapshot, StoreError, UpdateRecord, UpdateStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const SNAPSHOT_FILE: &str = "snapshot.bin";
const UPDATES_DIR: &str = "updates";

/// [`UpdateStore`] persisting each document in its own directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let root = data_dir.join("docs");
        fs::create_dir_all(&root).await?;
        debug!("Opened file store at {}", root.display());
        Ok(Self { root })
    }

    fn doc_dir(&self, doc_id: &str) -> PathBuf {
        // Hex keeps arbitrary ids filesystem-safe
        self.root.join(hex::encode(doc_id.as_bytes()))
    }

    fn updates_dir(&self, doc_id: &str) -> PathBuf {
        self.doc_dir(doc_id).join(UPDATES_DIR)
    }

    fn update_path(&self, doc_id: &str, seq: u64) -> PathBuf {
        self.updates_dir(doc_id).join(format!("{:020}.bin", seq))
    }

    /// Seq encoded in an update file name.
    fn parse_seq(path: &Path) -> Option<u64> {
        if path.extension()? != "bin" {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    /// Update file paths in seq order.
    async fn update_files(&self, doc_id: &str) -> Result<Vec<(u64, PathBuf)>> {
        let dir = self.updates_dir(doc_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(seq) = Self::parse_seq(&path) {
                files.push((seq, path));
            }
        }
        files.sort_by_key(|(seq, _)| *seq);
        Ok(files)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Write via a sibling temp file and rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl UpdateStore for FileStore {
    async fn get_latest_snapshot(&self, doc_id: &str) -> Result<Option<DocSnapshot>> {
        let path = self.doc_dir(doc_id).join(SNAPSHOT_FILE);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(decode(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_updates(&self, doc_id: &str) -> Result<Vec<UpdateRecord>> {
        let mut updates = Vec::new();
        for (seq, path) in self.update_files(doc_id).await? {
            let bytes = fs::read(&path).await?;
            match decode::<UpdateRecord>(&bytes) {
                Ok(record) => updates.push(record),
                Err(e) => warn!("Skipping unreadable update {} of {}: {}", seq, doc_id, e),
            }
        }
        Ok(updates)
    }

    async fn append_update(&self, doc_id: &str, record: UpdateRecord) -> Result<()> {
        let bytes = encode(&record)?;
        write_atomic(&self.update_path(doc_id, record.seq), &bytes).await
    }

    async fn save_snapshot(&self, snapshot: DocSnapshot) -> Result<()> {
        let bytes = encode(&snapshot)?;
        let path = self.doc_dir(&snapshot.doc_id).join(SNAPSHOT_FILE);
        write_atomic(&path, &bytes).await
    }

    async fn delete_updates(&self, doc_id: &str, through_seq: u64) -> Result<usize> {
        let mut removed = 0;
        for (seq, path) in self.update_files(doc_id).await? {
            if seq > through_seq {
                break;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    async fn list_docs(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let decoded = name
                .to_str()
                .and_then(|n| hex::decode(n).ok())
                .and_then(|b| String::from_utf8(b).ok());
            match decoded {
                Some(id) => ids.push(id),
                None => warn!("Ignoring unexpected entry {:?} in store", name),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
