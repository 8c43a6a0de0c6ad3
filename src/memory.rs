//! System memory sampling and the pressure eviction policy
//!
//! Sampling is best effort: platforms that cannot report memory yield `None`
//! and the pressure check degrades to a no-op.

use crate::models::host::InferenceHost;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

#[cfg(target_os = "macos")]
use std::process::Command;

/// Default eviction threshold, percent of system memory in use
pub const DEFAULT_PRESSURE_THRESHOLD: f64 = 85.0;

/// Point-in-time system memory utilization
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemorySample {
    pub percent_used: f64,
    pub available_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySample {
    /// Derive utilization from total and available bytes.
    pub fn from_totals(total_bytes: u64, available_bytes: u64) -> Option<Self> {
        if total_bytes == 0 {
            return None;
        }
        let available_bytes = available_bytes.min(total_bytes);
        let used = total_bytes - available_bytes;
        Some(Self {
            percent_used: used as f64 / total_bytes as f64 * 100.0,
            available_bytes,
            total_bytes,
        })
    }
}

/// Source of memory samples
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> Option<MemorySample>;
}

/// Reads the host operating system's memory counters
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemorySampler;

impl MemorySampler for SystemMemorySampler {
    fn sample(&self) -> Option<MemorySample> {
        #[cfg(target_os = "linux")]
        {
            return std::fs::read_to_string("/proc/meminfo")
                .ok()
                .and_then(|raw| parse_meminfo(&raw));
        }

        #[cfg(target_os = "macos")]
        {
            return sample_macos();
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            None
        }
    }
}

/// Parse `/proc/meminfo`. Falls back to free + buffers + cached on kernels
/// without `MemAvailable`.
pub fn parse_meminfo(raw: &str) -> Option<MemorySample> {
    let mut total_kb = None;
    let mut available_kb = None;
    let mut free_kb = 0u64;
    let mut buffers_kb = 0u64;
    let mut cached_kb = 0u64;

    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };

        match key {
            "MemTotal:" => total_kb = Some(value),
            "MemAvailable:" => available_kb = Some(value),
            "MemFree:" => free_kb = value,
            "Buffers:" => buffers_kb = value,
            "Cached:" => cached_kb = value,
            _ => {}
        }
    }

    let available_kb = available_kb.unwrap_or(free_kb + buffers_kb + cached_kb);
    MemorySample::from_totals(total_kb? * 1024, available_kb * 1024)
}

#[cfg(target_os = "macos")]
fn sample_macos() -> Option<MemorySample> {
    let output = Command::new("sysctl").args(["-n", "hw.memsize"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let total_bytes = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<u64>()
        .ok()?;

    let output = Command::new("vm_stat").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);

    let mut page_size: u64 = 16384;
    let mut reclaimable_pages: u64 = 0;

    for line in stdout.lines() {
        // "Mach Virtual Memory Statistics: (page size of 16384 bytes)"
        if let Some(start) = line.find("page size of ") {
            let after = &line[start + 13..];
            if let Some(ps) = after.split(' ').next().and_then(|v| v.parse().ok()) {
                page_size = ps;
            }
            continue;
        }

        for key in ["Pages free:", "Pages inactive:", "Pages speculative:"] {
            if let Some(rest) = line.strip_prefix(key) {
                if let Ok(v) = rest.trim().trim_end_matches('.').parse::<u64>() {
                    reclaimable_pages += v;
                }
            }
        }
    }

    MemorySample::from_totals(total_bytes, reclaimable_pages * page_size)
}

/// Ask the allocator to hand freed pages back to the OS.
///
/// Only glibc exposes this; elsewhere dropped buffers are returned lazily.
pub fn reclaim() {
    #[cfg(test)]
    RECLAIM_PASSES.with(|passes| passes.set(passes.get() + 1));

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim only walks allocator-internal free lists.
        let released = unsafe { libc::malloc_trim(0) };
        tracing::debug!(released = released != 0, "Allocator trim requested");
    }
}

#[cfg(test)]
thread_local! {
    static RECLAIM_PASSES: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// What a pressure check did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PressureAction {
    /// Memory could not be sampled
    Unavailable,
    /// Utilization at or below threshold; nothing done
    WithinBudget(MemorySample),
    /// Utilization above threshold; host cleared
    Evicted(MemorySample),
}

/// Evicts the classifier when system memory runs high.
///
/// Runs between requests only; spikes during a forward pass are not seen.
pub struct PressureMonitor {
    sampler: Arc<dyn MemorySampler>,
    threshold_percent: f64,
}

impl PressureMonitor {
    pub fn new(sampler: Arc<dyn MemorySampler>, threshold_percent: f64) -> Self {
        Self {
            sampler,
            threshold_percent,
        }
    }

    /// Monitor backed by the operating system's counters
    pub fn system(threshold_percent: f64) -> Self {
        Self::new(Arc::new(SystemMemorySampler), threshold_percent)
    }

    pub fn sample(&self) -> Option<MemorySample> {
        self.sampler.sample()
    }

    /// Sample once and clear the host if utilization exceeds the threshold.
    pub fn check_and_evict(&self, host: &InferenceHost) -> PressureAction {
        let Some(sample) = self.sample() else {
            return PressureAction::Unavailable;
        };

        if sample.percent_used <= self.threshold_percent {
            return PressureAction::WithinBudget(sample);
        }

        // Clearing also trims the allocator
        let evicted = host.clear();

        warn!(
            memory_percent = format!("{:.1}", sample.percent_used),
            threshold = self.threshold_percent,
            evicted,
            "Memory pressure, classifier cleared"
        );

        PressureAction::Evicted(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "\
MemTotal:        8000000 kB
MemFree:          500000 kB
MemAvailable:    1000000 kB
Buffers:          100000 kB
Cached:          1200000 kB
";

    #[test]
    fn test_parse_meminfo() {
        let sample = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(sample.total_bytes, 8_000_000 * 1024);
        assert_eq!(sample.available_bytes, 1_000_000 * 1024);
        assert!((sample.percent_used - 87.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let raw = "MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 50 kB\nCached: 100 kB\n";
        let sample = parse_meminfo(raw).unwrap();
        assert_eq!(sample.available_bytes, 250 * 1024);
        assert!((sample.percent_used - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_meminfo_garbage() {
        assert!(parse_meminfo("").is_none());
        assert!(parse_meminfo("MemTotal: lots kB").is_none());
        assert!(parse_meminfo("MemTotal: 0 kB\nMemAvailable: 0 kB").is_none());
    }

    #[test]
    fn test_from_totals_clamps_available() {
        let sample = MemorySample::from_totals(100, 200).unwrap();
        assert_eq!(sample.available_bytes, 100);
        assert_eq!(sample.percent_used, 0.0);
    }

    struct FixedSampler(f64);

    impl MemorySampler for FixedSampler {
        fn sample(&self) -> Option<MemorySample> {
            MemorySample::from_totals(1000, (1000.0 - self.0 * 10.0) as u64)
        }
    }

    struct TinyLoader;

    impl crate::models::loader::WeightLoader for TinyLoader {
        fn load(&self) -> crate::error::Result<crate::models::loader::LoadedModel> {
            Err(crate::error::ServeError::WeightLoad("no weights in this test".to_string()))
        }

        fn declared_output_width(&self) -> usize {
            1
        }
    }

    fn reclaim_passes() -> usize {
        RECLAIM_PASSES.with(|passes| passes.get())
    }

    #[test]
    fn test_pressure_eviction_trims_once() {
        let labels = crate::labels::ClassLabelTable::from_names(vec!["Only Car 2012".to_string()]);
        let host = InferenceHost::new(Box::new(TinyLoader), Arc::new(labels.unwrap())).unwrap();

        let monitor = PressureMonitor::new(Arc::new(FixedSampler(90.0)), 85.0);
        let before = reclaim_passes();
        assert!(matches!(
            monitor.check_and_evict(&host),
            PressureAction::Evicted(_)
        ));
        assert_eq!(reclaim_passes() - before, 1);

        let monitor = PressureMonitor::new(Arc::new(FixedSampler(50.0)), 85.0);
        let before = reclaim_passes();
        assert!(matches!(
            monitor.check_and_evict(&host),
            PressureAction::WithinBudget(_)
        ));
        assert_eq!(reclaim_passes(), before);
    }

    #[test]
    fn test_reclaim_is_callable_repeatedly() {
        reclaim();
        reclaim();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_sampler_reports_on_linux() {
        let sample = SystemMemorySampler.sample().unwrap();
        assert!(sample.total_bytes > 0);
        assert!((0.0..=100.0).contains(&sample.percent_used));
    }
}
