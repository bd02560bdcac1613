//! System load sampling used by the admission picker's "prefer big
//! packages while the CPU is idle" branch (§4.5).
//!
//! No crate in the corpus reads `/proc/loadavg` / `/proc/meminfo`; this is
//! the one module with no direct teacher grounding, so it stays a thin
//! hand-rolled parser behind a trait the picker can swap out in tests.

use color_eyre::eyre::{Context, Result};

/// A snapshot of system load, normalized so the picker doesn't need to
/// know about core counts or absolute byte sizes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    /// 1-minute load average divided by the number of CPUs. `1.0` means
    /// "fully loaded".
    pub cpu_ratio: f64,
    /// Available memory in bytes (`MemAvailable`, not `MemFree`).
    pub memory_avail: u64,
}

pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Result<ResourceSnapshot>;
}

pub struct ProcResourceSampler {
    pub num_cpus: usize,
}

impl Default for ProcResourceSampler {
    fn default() -> Self {
        Self {
            num_cpus: num_cpus::get(),
        }
    }
}

impl ResourceSampler for ProcResourceSampler {
    fn sample(&self) -> Result<ResourceSnapshot> {
        let loadavg = std::fs::read_to_string("/proc/loadavg").context("Failed to read /proc/loadavg")?;
        let one_min: f64 = loadavg
            .split_whitespace()
            .next()
            .context("/proc/loadavg was empty")?
            .parse()
            .context("Failed to parse /proc/loadavg")?;
        let cpu_ratio = one_min / self.num_cpus.max(1) as f64;

        let meminfo = std::fs::read_to_string("/proc/meminfo").context("Failed to read /proc/meminfo")?;
        let memory_avail = meminfo
            .lines()
            .find_map(|line| line.strip_prefix("MemAvailable:"))
            .and_then(|rest| rest.trim().strip_suffix("kB").map(str::trim))
            .context("MemAvailable not found in /proc/meminfo")?
            .parse::<u64>()
            .context("Failed to parse MemAvailable")?
            * 1024;

        Ok(ResourceSnapshot {
            cpu_ratio,
            memory_avail,
        })
    }
}

pub struct FixedResourceSampler(pub ResourceSnapshot);

impl ResourceSampler for FixedResourceSampler {
    fn sample(&self) -> Result<ResourceSnapshot> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_sampler_returns_its_snapshot() {
        let snapshot = ResourceSnapshot {
            cpu_ratio: 0.4,
            memory_avail: 1 << 30,
        };
        let sampler = FixedResourceSampler(snapshot);
        assert_eq!(sampler.sample().unwrap(), snapshot);
    }
}
