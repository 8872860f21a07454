use std::io;
use std::sync::Arc;

use crate::assets::{ActivityIndicator, AssetServer, ClientStream, Delivery, PreparedAsset, ServeOutcome};
use crate::config::AppConfig;
use crate::persistence::{StatsRecord, StatsStore};
use crate::resolver::{AssetRequest, Resolver};
use crate::scheduler::{FlushReport, FlushScheduler};
use crate::storage::Storage;
use crate::telemetry::{PlatformProbe, StatusReport};
use crate::upload::UploadPipeline;

/// All mutable device state, owned in one place.
///
/// Request handling and the flush timer both go through `&mut Device`, so the
/// stats record has exactly one writer at any time.
pub struct Device {
    pub assets: AssetServer,
    pub uploads: UploadPipeline,
    store: StatsStore,
    scheduler: FlushScheduler,
    stats: StatsRecord,
}

impl Device {
    pub async fn boot(
        storage: Arc<dyn Storage>,
        indicator: Arc<dyn ActivityIndicator>,
        config: &AppConfig,
    ) -> Self {
        let reserved = vec![config.stats_file.clone()];
        let store = StatsStore::new(storage.clone(), config.stats_file.clone());
        let stats = store.load().await;
        Self {
            assets: AssetServer::new(storage.clone(), Resolver::new(reserved.clone()), indicator),
            uploads: UploadPipeline::new(storage, config.upload_secret(), reserved),
            store,
            scheduler: FlushScheduler::new(config.save_interval_ms),
            stats,
        }
    }

    pub fn stats(&self) -> &StatsRecord {
        &self.stats
    }

    pub async fn prepare_asset(&mut self, request: &AssetRequest) -> Option<PreparedAsset> {
        self.assets.prepare(request).await
    }

    pub async fn deliver_asset(
        &mut self,
        prepared: PreparedAsset,
        client: &mut dyn ClientStream,
    ) -> io::Result<Delivery> {
        self.assets.deliver(prepared, &mut self.stats, client).await
    }

    pub async fn serve_asset(
        &mut self,
        request: &AssetRequest,
        client: &mut dyn ClientStream,
    ) -> ServeOutcome {
        self.assets.serve(request, &mut self.stats, client).await
    }

    pub async fn poll_flush(&mut self, now_ms: u64) -> Option<FlushReport> {
        self.scheduler.tick(now_ms, &mut self.stats, &self.store).await
    }

    /// Shutdown-equivalent flush: runtime since the last save is folded in and persisted.
    pub async fn shutdown(&mut self, now_ms: u64) -> FlushReport {
        if let Some(summary) = self.uploads.end().await {
            tracing::warn!(path = ?summary.path, "upload interrupted by shutdown");
        }
        self.scheduler
            .flush_now(now_ms, &mut self.stats, &self.store)
            .await
    }

    /// Lifetime uptime counts only the part of this session not yet flushed.
    pub fn status(&self, now_ms: u64, probe: &dyn PlatformProbe) -> StatusReport {
        let unsaved_ms = now_ms.saturating_sub(self.scheduler.last_save_ms());
        StatusReport::new(&self.stats, now_ms / 1000, unsaved_ms / 1000, probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::LogIndicator;
    use crate::storage::MemoryStorage;

    fn config() -> AppConfig {
        let mut config = AppConfig::for_storage("./unused");
        config.upload_token = Some("s3cret".into());
        config.save_interval_ms = 1_000;
        config
    }

    #[tokio::test]
    async fn boot_resumes_persisted_counters_and_keeps_counting() {
        let storage = MemoryStorage::new();
        let previous = StatsRecord {
            total_visits: 7,
            total_response_time_ms: 70,
            total_runtime_seconds: 3_600,
        };
        storage.insert("/stats.bin", previous.encode());
        storage.insert("/index.html", "home");

        let mut device = Device::boot(Arc::new(storage.clone()), Arc::new(LogIndicator), &config()).await;
        assert_eq!(*device.stats(), previous);

        let mut body = Vec::new();
        let outcome = device.serve_asset(&AssetRequest::new("/"), &mut body).await;
        assert!(matches!(outcome, ServeOutcome::Served(_)));
        assert_eq!(device.stats().total_visits, 8);

        let report = device.poll_flush(2_000).await.expect("flush due");
        assert!(report.saved);
        let persisted = StatsRecord::decode(&storage.get("/stats.bin").expect("stats")).expect("decode");
        assert_eq!(persisted.total_visits, 8);
        assert_eq!(persisted.total_runtime_seconds, 3_602);
    }

    #[tokio::test]
    async fn stats_slot_is_neither_served_nor_overwritten() {
        let storage = MemoryStorage::new();
        storage.insert("/stats.bin", StatsRecord::default().encode());
        let mut device = Device::boot(Arc::new(storage.clone()), Arc::new(LogIndicator), &config()).await;

        let outcome = device
            .serve_asset(&AssetRequest::new("/stats.bin"), &mut Vec::<u8>::new())
            .await;
        assert!(matches!(outcome, ServeOutcome::NotFound));

        device.uploads.start(Some("s3cret"), "/stats.bin").await;
        device.uploads.write(b"overwrite").await;
        device.uploads.end().await;
        assert_eq!(storage.get("/stats.bin").map(|raw| raw.len()), Some(24));
    }

    struct QuietProbe;

    impl PlatformProbe for QuietProbe {
        fn free_heap_bytes(&self) -> u64 {
            0
        }
        fn signal_dbm(&self) -> i32 {
            0
        }
    }

    #[tokio::test]
    async fn lifetime_uptime_does_not_double_count_flushed_time() {
        let storage = MemoryStorage::new();
        let mut config = config();
        config.save_interval_ms = 3_600_000;
        let mut device = Device::boot(Arc::new(storage), Arc::new(LogIndicator), &config).await;

        let before = device.status(3_599_000, &QuietProbe);
        assert_eq!(before.uptime_session, "0d 00h:59m:59s");
        assert_eq!(before.uptime_lifetime, "0d 00h:59m:59s");

        device.poll_flush(3_600_000).await.expect("flush due");
        let after = device.status(3_600_000, &QuietProbe);
        assert_eq!(after.uptime_session, "0d 01h:00m:00s");
        assert_eq!(after.uptime_lifetime, "0d 01h:00m:00s");

        let later = device.status(3_661_500, &QuietProbe);
        assert_eq!(later.uptime_lifetime, "0d 01h:01m:01s");
    }

    #[tokio::test]
    async fn shutdown_persists_partial_interval() {
        let storage = MemoryStorage::new();
        let mut device = Device::boot(Arc::new(storage.clone()), Arc::new(LogIndicator), &config()).await;
        device.uploads.start(Some("s3cret"), "half.bin").await;
        device.uploads.write(b"half").await;

        let report = device.shutdown(1_999).await;
        assert_eq!(report.runtime_added_seconds, 1);
        assert!(device.uploads.is_idle());
        assert_eq!(storage.get("/half.bin").as_deref(), Some(&b"half"[..]));
        let persisted = StatsRecord::decode(&storage.get("/stats.bin").expect("stats")).expect("decode");
        assert_eq!(persisted.total_runtime_seconds, 1);
    }
}
