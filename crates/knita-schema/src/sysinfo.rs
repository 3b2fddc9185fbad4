use serde::{Deserialize, Serialize};

/// Snapshot of the executor environment, reported once when a runtime opens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub total_cpu_cores: u32,
    /// Total memory in bytes, 0 when unknown.
    pub total_memory: u64,
}

impl SystemInfo {
    /// Describe the machine this process runs on.
    pub fn current() -> Self {
        let total_cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            total_cpu_cores,
            total_memory: total_memory(),
        }
    }
}

#[cfg(target_os = "linux")]
fn total_memory() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|content| parse_meminfo_total(&content))
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn total_memory() -> u64 {
    0
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo_total(content: &str) -> Option<u64> {
    let line = content.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line
        .trim_start_matches("MemTotal:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kib * 1024)
}
