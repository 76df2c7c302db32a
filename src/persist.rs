//! On-disk persisted state under the configured data directory (§6).
//!
//! Only public information is persisted: cached consensus bytes and guard
//! choices. No key material ever touches disk.

use crate::error::{Result, TorError};
use std::path::{Path, PathBuf};

const CONSENSUS_FILE: &str = "cached-consensus";
const GUARDS_FILE: &str = "guards";

pub struct DataStore {
    root: PathBuf,
}

impl DataStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| TorError::Internal(format!("cannot create data directory {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn save_consensus(&self, raw: &[u8]) -> Result<()> {
        self.write_atomic(&self.path(CONSENSUS_FILE), raw).await
    }

    pub async fn load_consensus(&self) -> Option<Vec<u8>> {
        tokio::fs::read(self.path(CONSENSUS_FILE)).await.ok()
    }

    pub async fn save_guards(&self, text: &str) -> Result<()> {
        self.write_atomic(&self.path(GUARDS_FILE), text.as_bytes()).await
    }

    pub async fn load_guards(&self) -> Option<String> {
        tokio::fs::read_to_string(self.path(GUARDS_FILE)).await.ok()
    }

    /// Write via a temp file + rename so a crash mid-write never leaves a
    /// truncated consensus or guards file behind.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| TorError::Internal(format!("write {} failed: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| TorError::Internal(format!("rename {} failed: {e}", tmp.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn scratch_dir(label: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("toronoe-test-{label}-{}-{n}", std::process::id()))
    }

    #[tokio::test]
    async fn consensus_round_trips_through_disk() {
        let dir = scratch_dir("consensus");
        let store = DataStore::open(&dir).await.unwrap();
        store.save_consensus(b"hello consensus").await.unwrap();
        assert_eq!(store.load_consensus().await.unwrap(), b"hello consensus");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn guards_round_trip_through_disk() {
        let dir = scratch_dir("guards");
        let store = DataStore::open(&dir).await.unwrap();
        store.save_guards("AAAA\t1\tconfirmed\t2").await.unwrap();
        assert_eq!(store.load_guards().await.unwrap(), "AAAA\t1\tconfirmed\t2");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn missing_consensus_returns_none() {
        let dir = scratch_dir("missing");
        let store = DataStore::open(&dir).await.unwrap();
        assert!(store.load_consensus().await.is_none());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
