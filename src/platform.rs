use std::fs;

use crate::telemetry::PlatformProbe;

/// Reads free memory and link quality from the host's procfs, reporting 0
/// where the host exposes nothing.
pub struct HostProbe;

impl PlatformProbe for HostProbe {
    fn free_heap_bytes(&self) -> u64 {
        fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|raw| parse_mem_available(&raw))
            .unwrap_or(0)
    }

    fn signal_dbm(&self) -> i32 {
        fs::read_to_string("/proc/net/wireless")
            .ok()
            .and_then(|raw| parse_signal_level(&raw))
            .unwrap_or(0)
    }
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

fn parse_signal_level(wireless: &str) -> Option<i32> {
    // Two header lines, then `iface: status link level noise ...`.
    let row = wireless.lines().nth(2)?;
    let level = row.split_whitespace().nth(3)?;
    level.trim_end_matches('.').parse().ok()
}

pub fn log_platform_guidance() {
    #[cfg(target_os = "linux")]
    const TEMPLATE: &str = r#"[Unit]
Description=webcard asset server
After=network-online.target

[Service]
ExecStart=/usr/local/bin/webcard --config /etc/webcard/webcard.toml
Restart=on-failure

[Install]
WantedBy=multi-user.target
"#;

    #[cfg(not(target_os = "linux"))]
    const TEMPLATE: &str = "run `webcard --config <path>` under the platform's service manager";

    tracing::debug!(template = TEMPLATE, "service descriptor");
}
