use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::storage::Storage;

/// Size of the persisted record: three little-endian `u64` counters.
pub const RECORD_LEN: usize = 24;

/// Usage counters that survive power cycles.
///
/// Every field only ever grows; the record is reset solely by erasing its
/// storage slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsRecord {
    pub total_visits: u64,
    pub total_response_time_ms: u64,
    pub total_runtime_seconds: u64,
}

impl StatsRecord {
    pub fn record_visit(&mut self, response_ms: u64) {
        self.total_visits = self.total_visits.saturating_add(1);
        self.total_response_time_ms = self.total_response_time_ms.saturating_add(response_ms);
    }

    pub fn add_runtime(&mut self, seconds: u64) {
        self.total_runtime_seconds = self.total_runtime_seconds.saturating_add(seconds);
    }

    pub fn average_response_ms(&self) -> f64 {
        if self.total_visits == 0 {
            return 0.0;
        }
        self.total_response_time_ms as f64 / self.total_visits as f64
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..8].copy_from_slice(&self.total_visits.to_le_bytes());
        out[8..16].copy_from_slice(&self.total_response_time_ms.to_le_bytes());
        out[16..24].copy_from_slice(&self.total_runtime_seconds.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < RECORD_LEN {
            return None;
        }
        let field = |at: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&raw[at..at + 8]);
            u64::from_le_bytes(word)
        };
        Some(Self {
            total_visits: field(0),
            total_response_time_ms: field(8),
            total_runtime_seconds: field(16),
        })
    }
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to open stats record {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("failed to read stats record {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("stats record {path} holds {found} of {RECORD_LEN} bytes")]
    Truncated { path: String, found: usize },
    #[error("failed to write stats record {path}: {source}")]
    Write { path: String, source: io::Error },
}

/// Owner of the stats slot in storage. Nothing else reads or writes it.
pub struct StatsStore {
    storage: Arc<dyn Storage>,
    path: String,
}

impl StatsStore {
    pub fn new(storage: Arc<dyn Storage>, path: impl Into<String>) -> Self {
        Self {
            storage,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads the stored record, `Ok(None)` when none has been written yet.
    pub async fn try_load(&self) -> Result<Option<StatsRecord>, StatsError> {
        if !self.storage.exists(&self.path).await {
            return Ok(None);
        }
        let mut reader = self
            .storage
            .open_read(&self.path)
            .await
            .map_err(|source| StatsError::Open {
                path: self.path.clone(),
                source,
            })?;
        let mut raw = Vec::with_capacity(RECORD_LEN);
        (&mut reader)
            .take(RECORD_LEN as u64)
            .read_to_end(&mut raw)
            .await
            .map_err(|source| StatsError::Read {
                path: self.path.clone(),
                source,
            })?;
        StatsRecord::decode(&raw)
            .map(Some)
            .ok_or_else(|| StatsError::Truncated {
                path: self.path.clone(),
                found: raw.len(),
            })
    }

    /// Boot-time load: any failure yields a zeroed record.
    pub async fn load(&self) -> StatsRecord {
        match self.try_load().await {
            Ok(Some(record)) => {
                tracing::info!(
                    path = %self.path,
                    visits = record.total_visits,
                    runtime_seconds = record.total_runtime_seconds,
                    "stats loaded"
                );
                record
            }
            Ok(None) => {
                tracing::info!(path = %self.path, "no saved stats found, starting fresh");
                StatsRecord::default()
            }
            Err(err) => {
                tracing::warn!(error = %err, "stats unreadable, starting fresh");
                StatsRecord::default()
            }
        }
    }

    pub async fn save(&self, record: &StatsRecord) -> Result<(), StatsError> {
        let mut writer = self
            .storage
            .open_write(&self.path)
            .await
            .map_err(|source| StatsError::Open {
                path: self.path.clone(),
                source,
            })?;
        let write_err = |source| StatsError::Write {
            path: self.path.clone(),
            source,
        };
        writer.write_all(&record.encode()).await.map_err(write_err)?;
        writer.shutdown().await.map_err(write_err)?;
        tracing::debug!(path = %self.path, "stats saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStorage, MemoryStorage};
    use tempfile::tempdir;

    #[test]
    fn average_is_zero_without_visits() {
        let mut record = StatsRecord::default();
        assert_eq!(record.average_response_ms(), 0.0);
        record.record_visit(10);
        record.record_visit(15);
        assert_eq!(record.average_response_ms(), 12.5);
    }

    #[test]
    fn counters_saturate_instead_of_wrapping() {
        let mut record = StatsRecord {
            total_visits: u64::MAX,
            total_response_time_ms: u64::MAX - 1,
            total_runtime_seconds: u64::MAX,
        };
        record.record_visit(5);
        record.add_runtime(1);
        assert_eq!(record.total_visits, u64::MAX);
        assert_eq!(record.total_response_time_ms, u64::MAX);
        assert_eq!(record.total_runtime_seconds, u64::MAX);
    }

    #[test]
    fn encoding_is_little_endian() {
        let record = StatsRecord {
            total_visits: 1,
            total_response_time_ms: 0x0102,
            total_runtime_seconds: 0,
        };
        let raw = record.encode();
        assert_eq!(raw[0], 1);
        assert_eq!(&raw[8..10], &[0x02, 0x01]);
        assert!(StatsRecord::decode(&raw[..RECORD_LEN - 1]).is_none());
    }

    #[tokio::test]
    async fn save_then_load_is_exact() {
        let tmp = tempdir().expect("tmp");
        let storage = Arc::new(LocalStorage::new(tmp.path()).await.expect("storage"));
        let store = StatsStore::new(storage, "/stats.bin");
        let record = StatsRecord {
            total_visits: 42,
            total_response_time_ms: 9_001,
            total_runtime_seconds: 86_400 * 3 + 7,
        };
        store.save(&record).await.expect("save");
        assert_eq!(
            std::fs::metadata(tmp.path().join("stats.bin")).expect("meta").len(),
            RECORD_LEN as u64
        );
        assert_eq!(store.try_load().await.expect("load"), Some(record));
        assert_eq!(store.load().await, record);
    }

    #[tokio::test]
    async fn missing_record_loads_as_zero() {
        let store = StatsStore::new(Arc::new(MemoryStorage::new()), "/stats.bin");
        assert!(store.try_load().await.expect("load").is_none());
        assert_eq!(store.load().await, StatsRecord::default());
    }

    #[tokio::test]
    async fn truncated_or_unreadable_record_falls_back_to_zero() {
        let storage = MemoryStorage::new();
        storage.insert("/stats.bin", vec![7u8; 10]);
        let store = StatsStore::new(Arc::new(storage.clone()), "/stats.bin");
        assert!(matches!(
            store.try_load().await,
            Err(StatsError::Truncated { found: 10, .. })
        ));
        assert_eq!(store.load().await, StatsRecord::default());

        storage.insert("/stats.bin", StatsRecord { total_visits: 3, ..Default::default() }.encode());
        storage.fail_reads("/stats.bin");
        assert!(matches!(store.try_load().await, Err(StatsError::Open { .. })));
        assert_eq!(store.load().await, StatsRecord::default());
    }

    #[tokio::test]
    async fn save_reports_open_failure() {
        let tmp = tempdir().expect("tmp");
        let storage = Arc::new(LocalStorage::new(tmp.path()).await.expect("storage"));
        let store = StatsStore::new(storage, "/../stats.bin");
        assert!(matches!(
            store.save(&StatsRecord::default()).await,
            Err(StatsError::Open { .. })
        ));
    }
}
