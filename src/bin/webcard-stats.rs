use anyhow::{Context, Result};
use serde::Serialize;
use webcard::persistence::{StatsRecord, RECORD_LEN};
use webcard::telemetry::format_uptime;

#[derive(Serialize)]
struct Inspection {
    total_visits: u64,
    total_response_time_ms: u64,
    total_runtime_seconds: u64,
    avg_response_time_ms: f64,
    uptime_lifetime: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: webcard-stats <stats.bin>"))?;
    let raw = std::fs::read(&path).with_context(|| format!("failed to read {path}"))?;
    if raw.len() > RECORD_LEN {
        tracing::warn!(path = %path, len = raw.len(), "trailing bytes after stats record ignored");
    }
    let record = StatsRecord::decode(&raw)
        .with_context(|| format!("{path} holds {} of {RECORD_LEN} bytes", raw.len()))?;

    let inspection = Inspection {
        total_visits: record.total_visits,
        total_response_time_ms: record.total_response_time_ms,
        total_runtime_seconds: record.total_runtime_seconds,
        avg_response_time_ms: (record.average_response_ms() * 10.0).round() / 10.0,
        uptime_lifetime: format_uptime(record.total_runtime_seconds),
    };
    println!("{}", serde_json::to_string_pretty(&inspection)?);
    Ok(())
}
