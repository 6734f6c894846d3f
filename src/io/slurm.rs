//! Batch scheduler introspection for sizing local worker pools

use regex::Regex;
use std::process::Command;

/// CPU cores granted to the current SLURM job's tasks, if running under one.
///
/// Reads `TresPerTask=cpu:N` (or `cpus-per-task=N`) from `scontrol show job`.
pub fn node_cpu_cores() -> Option<usize> {
    let job_id = std::env::var("SLURM_JOB_ID").ok()?;
    let output = Command::new("scontrol")
        .args(["show", "job", job_id.trim()])
        .output()
        .map_err(|e| log::debug!("scontrol unavailable: {}", e))
        .ok()?;
    if !output.status.success() {
        log::debug!("scontrol exited with {}", output.status);
        return None;
    }
    parse_cpus_per_task(&String::from_utf8_lossy(&output.stdout))
}

/// Extract the per-task CPU count from `scontrol show job` output
pub fn parse_cpus_per_task(text: &str) -> Option<usize> {
    let tres = Regex::new(r"TresPerTask=(?:\S*,)?cpu[:=](\d+)").ok()?;
    let cpus = Regex::new(r"(?i)cpus-per-task=(\d+)").ok()?;
    tres.captures(text)
        .or_else(|| cpus.captures(text))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .filter(|&n| n > 0)
}

/// Worker count for a local pool: scheduler allocation, else host parallelism
pub fn local_worker_count() -> usize {
    node_cpu_cores()
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1)
}
