use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    signal,
    sync::{watch, Mutex},
    time::Duration,
};

use crate::assets::{ActivityIndicator, LogIndicator};
use crate::config::AppConfig;
use crate::device::Device;
use crate::http::{self, AppState};
use crate::platform::HostProbe;
use crate::scheduler::{self, Uptime};
use crate::storage::LocalStorage;

pub struct Service {
    config: AppConfig,
}

impl Service {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let AppConfig {
            service_name,
            listen_addr,
            storage_root,
            flush_check_ms,
            max_upload_bytes,
            send_timeout_ms,
            ..
        } = self.config.clone();

        let uptime = Uptime::start();
        let storage = Arc::new(
            LocalStorage::new(&storage_root)
                .await
                .context("prepare asset storage")?,
        );
        let indicator: Arc<dyn ActivityIndicator> = Arc::new(LogIndicator);
        let device = Arc::new(Mutex::new(
            Device::boot(storage, indicator.clone(), &self.config).await,
        ));

        let listener = TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("failed to bind {listen_addr}"))?;
        tracing::info!(
            service = %service_name,
            addr = %listen_addr,
            root = %storage_root,
            "HTTP server started"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let flush_handle = tokio::spawn(scheduler::run_flush_loop(
            device.clone(),
            uptime,
            shutdown_rx.clone(),
            Duration::from_millis(flush_check_ms.max(1)),
        ));

        let app = http::router(
            AppState {
                device: device.clone(),
                uptime,
                probe: Arc::new(HostProbe),
                indicator,
                send_timeout: Duration::from_millis(send_timeout_ms.max(1)),
            },
            max_upload_bytes,
        );

        let shutdown_signal = {
            let service_name = service_name.clone();
            let shutdown_tx = shutdown_tx.clone();
            async move {
                signal::ctrl_c().await.ok();
                tracing::info!(service = %service_name, "ctrl-c received, requesting shutdown");
                shutdown_tx.send(()).ok();
            }
        };

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .context("http server failed");

        let report =
            scheduler::stop_and_flush(&device, uptime, &shutdown_tx, flush_handle).await?;
        tracing::info!(
            service = %service_name,
            runtime_added_seconds = report.runtime_added_seconds,
            saved = report.saved,
            "final stats flush"
        );

        served
    }
}
