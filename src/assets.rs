use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::time::Instant;

use crate::persistence::StatsRecord;
use crate::resolver::{AssetRequest, ResolvedAsset, Resolver};
use crate::storage::{AssetReader, Storage};

/// The dispatcher's "stream file to client" primitive.
#[async_trait]
pub trait ClientStream: Send {
    /// Copies `reader` to the client, returning the number of bytes sent.
    async fn stream(&mut self, reader: &mut AssetReader, asset: &ResolvedAsset) -> io::Result<u64>;
}

#[async_trait]
impl ClientStream for Vec<u8> {
    async fn stream(&mut self, reader: &mut AssetReader, _asset: &ResolvedAsset) -> io::Result<u64> {
        tokio::io::copy(reader, self).await
    }
}

/// Visible "working" signal, such as a status LED.
pub trait ActivityIndicator: Send + Sync {
    fn set_active(&self, active: bool);
}

pub struct LogIndicator;

/// Holds the indicator on and clears it when dropped, even if the delivery
/// future is cancelled mid-stream.
struct ActiveGuard<'a>(&'a dyn ActivityIndicator);

impl<'a> ActiveGuard<'a> {
    fn on(indicator: &'a dyn ActivityIndicator) -> Self {
        indicator.set_active(true);
        Self(indicator)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.set_active(false);
    }
}

impl ActivityIndicator for LogIndicator {
    fn set_active(&self, active: bool) {
        tracing::trace!(active, "activity indicator");
    }
}

/// A resolved asset with its read handle already open.
pub struct PreparedAsset {
    pub asset: ResolvedAsset,
    reader: AssetReader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub bytes: u64,
    pub elapsed_ms: u64,
}

pub enum ServeOutcome {
    Served(Delivery),
    NotFound,
    Failed(io::Error),
}

pub struct AssetServer {
    storage: Arc<dyn Storage>,
    resolver: Resolver,
    indicator: Arc<dyn ActivityIndicator>,
}

impl AssetServer {
    pub fn new(
        storage: Arc<dyn Storage>,
        resolver: Resolver,
        indicator: Arc<dyn ActivityIndicator>,
    ) -> Self {
        Self {
            storage,
            resolver,
            indicator,
        }
    }

    /// Resolves the request and opens the chosen file. `None` means the
    /// caller should answer "not found"; stats are untouched either way.
    pub async fn prepare(&self, request: &AssetRequest) -> Option<PreparedAsset> {
        let asset = self.resolver.resolve(self.storage.as_ref(), request).await?;
        match self.storage.open_read(&asset.storage_path).await {
            Ok(reader) => Some(PreparedAsset { asset, reader }),
            Err(err) => {
                tracing::warn!(
                    path = %asset.storage_path,
                    error = %err,
                    "asset vanished between existence check and open"
                );
                None
            }
        }
    }

    /// Streams a prepared asset and, on success, counts the visit and its latency.
    pub async fn deliver(
        &self,
        prepared: PreparedAsset,
        stats: &mut StatsRecord,
        client: &mut dyn ClientStream,
    ) -> io::Result<Delivery> {
        let PreparedAsset { asset, mut reader } = prepared;

        let active = ActiveGuard::on(self.indicator.as_ref());
        let started = Instant::now();
        let result = client.stream(&mut reader, &asset).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        drop(reader);
        drop(active);

        match result {
            Ok(bytes) => {
                stats.record_visit(elapsed_ms);
                tracing::debug!(
                    path = %asset.storage_path,
                    bytes,
                    elapsed_ms,
                    compressed = asset.is_compressed,
                    "asset served"
                );
                Ok(Delivery { bytes, elapsed_ms })
            }
            Err(err) => {
                tracing::warn!(path = %asset.storage_path, error = %err, "asset stream aborted");
                Err(err)
            }
        }
    }

    pub async fn serve(
        &self,
        request: &AssetRequest,
        stats: &mut StatsRecord,
        client: &mut dyn ClientStream,
    ) -> ServeOutcome {
        let Some(prepared) = self.prepare(request).await else {
            return ServeOutcome::NotFound;
        };
        match self.deliver(prepared, stats, client).await {
            Ok(delivery) => ServeOutcome::Served(delivery),
            Err(err) => ServeOutcome::Failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingIndicator {
        changes: Mutex<Vec<bool>>,
    }

    impl ActivityIndicator for RecordingIndicator {
        fn set_active(&self, active: bool) {
            self.changes.lock().unwrap().push(active);
        }
    }

    struct SlowClient {
        delay: Duration,
        received: Vec<u8>,
    }

    #[async_trait]
    impl ClientStream for SlowClient {
        async fn stream(&mut self, reader: &mut AssetReader, asset: &ResolvedAsset) -> io::Result<u64> {
            tokio::time::sleep(self.delay).await;
            self.received.stream(reader, asset).await
        }
    }

    struct StuckClient;

    #[async_trait]
    impl ClientStream for StuckClient {
        async fn stream(&mut self, _reader: &mut AssetReader, _asset: &ResolvedAsset) -> io::Result<u64> {
            std::future::pending().await
        }
    }

    struct BrokenClient;

    #[async_trait]
    impl ClientStream for BrokenClient {
        async fn stream(&mut self, _reader: &mut AssetReader, _asset: &ResolvedAsset) -> io::Result<u64> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
        }
    }

    fn server(storage: &MemoryStorage, indicator: Arc<RecordingIndicator>) -> AssetServer {
        AssetServer::new(
            Arc::new(storage.clone()),
            Resolver::new(Vec::new()),
            indicator,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn served_asset_counts_visit_and_latency() {
        let storage = MemoryStorage::new();
        storage.insert("/index.html", "<h1>hi</h1>");
        let indicator = Arc::new(RecordingIndicator::default());
        let server = server(&storage, indicator.clone());
        let mut stats = StatsRecord::default();
        let mut client = SlowClient {
            delay: Duration::from_millis(25),
            received: Vec::new(),
        };

        let outcome = server
            .serve(&AssetRequest::new("/"), &mut stats, &mut client)
            .await;

        let ServeOutcome::Served(delivery) = outcome else {
            panic!("expected asset to be served");
        };
        assert_eq!(delivery.bytes, 11);
        assert_eq!(delivery.elapsed_ms, 25);
        assert_eq!(client.received, b"<h1>hi</h1>");
        assert_eq!(stats.total_visits, 1);
        assert_eq!(stats.total_response_time_ms, 25);
        assert_eq!(*indicator.changes.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn miss_leaves_stats_alone() {
        let storage = MemoryStorage::new();
        let indicator = Arc::new(RecordingIndicator::default());
        let server = server(&storage, indicator.clone());
        let mut stats = StatsRecord::default();

        let outcome = server
            .serve(&AssetRequest::new("/nope"), &mut stats, &mut Vec::<u8>::new())
            .await;
        assert!(matches!(outcome, ServeOutcome::NotFound));
        assert_eq!(stats, StatsRecord::default());
        assert!(indicator.changes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_failure_after_existence_check_is_not_found() {
        let storage = MemoryStorage::new();
        storage.insert("/style.css", "body{}");
        storage.fail_reads("/style.css");
        let server = server(&storage, Arc::new(RecordingIndicator::default()));
        let mut stats = StatsRecord::default();

        let outcome = server
            .serve(&AssetRequest::new("/style.css"), &mut stats, &mut Vec::<u8>::new())
            .await;
        assert!(matches!(outcome, ServeOutcome::NotFound));
        assert_eq!(stats.total_visits, 0);
    }

    #[tokio::test]
    async fn aborted_stream_clears_indicator_without_counting() {
        let storage = MemoryStorage::new();
        storage.insert("/big.zip", vec![0u8; 64]);
        let indicator = Arc::new(RecordingIndicator::default());
        let server = server(&storage, indicator.clone());
        let mut stats = StatsRecord::default();

        let outcome = server
            .serve(&AssetRequest::new("/big.zip"), &mut stats, &mut BrokenClient)
            .await;
        assert!(matches!(outcome, ServeOutcome::Failed(_)));
        assert_eq!(stats, StatsRecord::default());
        assert_eq!(*indicator.changes.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_delivery_still_clears_indicator() {
        let storage = MemoryStorage::new();
        storage.insert("/big.zip", vec![0u8; 64]);
        let indicator = Arc::new(RecordingIndicator::default());
        let server = server(&storage, indicator.clone());
        let mut stats = StatsRecord::default();

        let request = AssetRequest::new("/big.zip");
        let mut client = StuckClient;
        let serving = server.serve(&request, &mut stats, &mut client);
        assert!(tokio::time::timeout(Duration::from_secs(1), serving).await.is_err());

        assert_eq!(stats, StatsRecord::default());
        assert_eq!(*indicator.changes.lock().unwrap(), vec![true, false]);
    }
}
