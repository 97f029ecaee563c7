//! Per-process metrics for the status report.
//!
//! Reports the supervisor itself plus its direct children (the encoder
//! processes), with CPU% and resident set size from the OS.

use serde::Serialize;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

#[derive(Debug, Clone, Serialize)]
pub struct ProcessMetrics {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    pub rss_bytes: u64,
}

/// Snapshot CPU/RSS for the supervisor and its direct children, sorted by
/// pid (supervisor first).
pub fn process_metrics() -> Vec<ProcessMetrics> {
    let Ok(self_pid) = sysinfo::get_current_pid() else {
        return Vec::new();
    };

    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cpu().with_memory(),
    );

    let mut metrics: Vec<ProcessMetrics> = sys
        .processes()
        .iter()
        .filter(|(pid, proc)| **pid == self_pid || proc.parent() == Some(self_pid))
        .map(|(pid, proc)| ProcessMetrics {
            pid: pid.as_u32(),
            name: proc.name().to_string_lossy().into_owned(),
            cpu_percent: proc.cpu_usage(),
            rss_bytes: proc.memory(),
        })
        .collect();

    metrics.sort_by(|a, b| {
        (a.pid != self_pid.as_u32())
            .cmp(&(b.pid != self_pid.as_u32()))
            .then(a.pid.cmp(&b.pid))
    });
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_the_supervisor_itself() {
        let metrics = process_metrics();
        assert!(!metrics.is_empty());
        let self_pid = sysinfo::get_current_pid().unwrap().as_u32();
        assert_eq!(metrics[0].pid, self_pid);
        assert!(metrics[0].rss_bytes > 0);
    }
}
