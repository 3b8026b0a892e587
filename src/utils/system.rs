// src/utils/system.rs: System functions

use std::time::Duration;

use anyhow::Result;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Determines number of cores that can be used for CPU based tasks
///
/// # Arguments
///
/// * `args_threads` - Upper bound from --threads
///
/// # Returns
///
/// Result<(usize, f32)> maximum cores, current cpu usage
pub async fn detect_cores_and_load(args_threads: usize) -> Result<(usize, f32)> {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_millis(100)).await;
    let cpu_load = system.global_cpu_usage();
    let max_cores = physical_cores.min(args_threads).max(1);
    Ok((max_cores, cpu_load))
}


/// Number of manifest rows allowed to run at once.
///
/// # Arguments
///
/// * `max_cores` - From detect_cores_and_load
/// * `cpu_load` - Current load in percent
///
/// # Returns
///
/// usize, at least 1
pub fn compute_max_concurrency(max_cores: usize, cpu_load: f32) -> usize {
    // Each row runs multithreaded tools, so rows are a fraction of the cores.
    let rows = if cpu_load > 50.0 { max_cores / 8 } else { max_cores / 4 };
    rows.max(1)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_max_concurrency() {
        assert_eq!(compute_max_concurrency(64, 10.0), 16);
        assert_eq!(compute_max_concurrency(64, 80.0), 8);
        assert_eq!(compute_max_concurrency(2, 0.0), 1);
    }

    #[tokio::test]
    async fn test_detect_cores_respects_thread_cap() {
        let (cores, _load) = detect_cores_and_load(1).await.unwrap();
        assert_eq!(cores, 1);
    }
}
