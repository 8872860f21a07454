use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::storage::{AssetWriter, Storage};

/// Pause after closing an accepted upload so diagnostics drain before the reply.
const SETTLE_DELAY: Duration = Duration::from_millis(2);

pub const STATUS_LOCATION: &str = "/status";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted { path: String },
    /// Token accepted but the target could not be opened; writes are dropped.
    OpenFailed { path: String },
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    /// Storage took fewer bytes than offered. The upload continues but is suspect.
    Partial { offered: usize, written: usize },
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub path: Option<String>,
    pub authorized: bool,
    /// Bytes the client sent, as reported by the dispatcher.
    pub bytes_received: u64,
    pub bytes_written: u64,
    pub suspect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    SeeOther(&'static str),
    Unauthorized,
}

struct Receiving {
    path: String,
    target: Option<AssetWriter>,
    bytes_received: u64,
    bytes_written: u64,
    suspect: bool,
}

#[derive(Default)]
enum Phase {
    #[default]
    Idle,
    Receiving(Receiving),
    Rejected {
        bytes_received: u64,
    },
}

/// Start/write/end state machine for a token-gated upload.
pub struct UploadPipeline {
    storage: Arc<dyn Storage>,
    secret: Option<String>,
    reserved: Vec<String>,
    phase: Phase,
}

impl UploadPipeline {
    pub fn new(storage: Arc<dyn Storage>, secret: Option<String>, reserved: Vec<String>) -> Self {
        if secret.is_none() {
            tracing::warn!("no upload secret configured, every upload will be refused");
        }
        Self {
            storage,
            secret,
            reserved,
            phase: Phase::Idle,
        }
    }

    pub fn authorize(&self, token: Option<&str>) -> bool {
        matches!((self.secret.as_deref(), token), (Some(secret), Some(token)) if secret == token)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    pub async fn start(&mut self, token: Option<&str>, filename: &str) -> StartOutcome {
        if let Some(stale) = self.end().await {
            tracing::warn!(path = ?stale.path, "previous upload never ended, closed it");
        }

        if !self.authorize(token) {
            tracing::warn!(filename, "unauthorized upload attempt blocked");
            self.phase = Phase::Rejected { bytes_received: 0 };
            return StartOutcome::Rejected;
        }

        let path = if filename.starts_with('/') {
            filename.to_string()
        } else {
            format!("/{filename}")
        };

        let target = if self.reserved.iter().any(|r| *r == path) {
            tracing::warn!(path = %path, "upload targets a reserved path, discarding");
            None
        } else {
            match self.storage.open_write(&path).await {
                Ok(writer) => Some(writer),
                Err(err) => {
                    tracing::error!(path = %path, error = %err, "failed to open upload target");
                    None
                }
            }
        };

        tracing::info!(path = %path, "receiving file");
        let outcome = if target.is_some() {
            StartOutcome::Accepted { path: path.clone() }
        } else {
            StartOutcome::OpenFailed { path: path.clone() }
        };
        self.phase = Phase::Receiving(Receiving {
            path,
            target,
            bytes_received: 0,
            bytes_written: 0,
            suspect: false,
        });
        outcome
    }

    pub async fn write(&mut self, chunk: &[u8]) -> WriteOutcome {
        let outcome = match &mut self.phase {
            Phase::Receiving(upload) => {
                upload.bytes_received += chunk.len() as u64;
                match upload.target.as_mut() {
                    Some(target) => {
                        let written = match target.write(chunk).await {
                            Ok(n) => n,
                            Err(err) => {
                                tracing::warn!(path = %upload.path, error = %err, "upload write errored");
                                0
                            }
                        };
                        upload.bytes_written += written as u64;
                        if written == chunk.len() {
                            WriteOutcome::Written(written)
                        } else {
                            upload.suspect = true;
                            tracing::warn!(
                                path = %upload.path,
                                offered = chunk.len(),
                                written,
                                "upload write failed"
                            );
                            WriteOutcome::Partial {
                                offered: chunk.len(),
                                written,
                            }
                        }
                    }
                    None => WriteOutcome::Ignored,
                }
            }
            Phase::Rejected { bytes_received } => {
                *bytes_received += chunk.len() as u64;
                tracing::debug!(len = chunk.len(), "dropping chunk of rejected upload");
                WriteOutcome::Ignored
            }
            Phase::Idle => {
                tracing::debug!(len = chunk.len(), "chunk outside an upload session");
                WriteOutcome::Ignored
            }
        };
        tokio::task::yield_now().await;
        outcome
    }

    /// Finishes the current session and returns to idle.
    pub async fn end(&mut self) -> Option<UploadSummary> {
        match std::mem::take(&mut self.phase) {
            Phase::Idle => None,
            Phase::Rejected { bytes_received } => Some(UploadSummary {
                path: None,
                authorized: false,
                bytes_received,
                bytes_written: 0,
                suspect: false,
            }),
            Phase::Receiving(mut upload) => {
                if let Some(mut target) = upload.target.take() {
                    if let Err(err) = target.shutdown().await {
                        upload.suspect = true;
                        tracing::warn!(path = %upload.path, error = %err, "failed to close upload");
                    }
                    tracing::info!(
                        path = %upload.path,
                        size = upload.bytes_received,
                        written = upload.bytes_written,
                        suspect = upload.suspect,
                        "upload finished"
                    );
                    tokio::time::sleep(SETTLE_DELAY).await;
                }
                Some(UploadSummary {
                    path: Some(upload.path),
                    authorized: true,
                    bytes_received: upload.bytes_received,
                    bytes_written: upload.bytes_written,
                    suspect: upload.suspect,
                })
            }
        }
    }

    /// Final response for the request, re-checking the token on its own.
    pub fn complete(&self, token: Option<&str>) -> Completion {
        if self.authorize(token) {
            Completion::SeeOther(STATUS_LOCATION)
        } else {
            Completion::Unauthorized
        }
    }
}
