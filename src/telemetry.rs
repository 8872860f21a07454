use serde::{Deserialize, Serialize};

use crate::persistence::StatsRecord;

/// Hardware readings that only the platform can supply.
pub trait PlatformProbe: Send + Sync {
    fn free_heap_bytes(&self) -> u64;
    fn signal_dbm(&self) -> i32;
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub uptime_session: String,
    pub uptime_lifetime: String,
    pub visits: u64,
    pub avg_response_time_ms: f64,
    pub free_heap_bytes: u64,
    pub wifi_signal_dbm: i32,
    pub status: String,
}

impl StatusReport {
    /// `unsaved_seconds` is the runtime not yet folded into `stats`.
    pub fn new(
        stats: &StatsRecord,
        session_seconds: u64,
        unsaved_seconds: u64,
        probe: &dyn PlatformProbe,
    ) -> Self {
        let lifetime = stats.total_runtime_seconds.saturating_add(unsaved_seconds);
        Self {
            uptime_session: format_uptime(session_seconds),
            uptime_lifetime: format_uptime(lifetime),
            visits: stats.total_visits,
            avg_response_time_ms: (stats.average_response_ms() * 10.0).round() / 10.0,
            free_heap_bytes: probe.free_heap_bytes(),
            wifi_signal_dbm: probe.signal_dbm(),
            status: "online".to_string(),
        }
    }
}

/// Renders seconds as `5d 12h:30m:05s`.
pub fn format_uptime(total_seconds: u64) -> String {
    let minutes = total_seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;
    format!(
        "{}d {:02}h:{:02}m:{:02}s",
        days,
        hours % 24,
        minutes % 60,
        total_seconds % 60
    )
}
