//! Sizing the worker pool from the host's CPU topology.

use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

/// Environment variable that pins the worker count.
pub const WORKERS_ENV: &str = "TSUMIKI_WORKERS";

/// Deadline for physical core detection.
pub const DETECTION_DEADLINE: Duration = Duration::from_millis(500);

/// Upper bound on the pool size picked automatically.
pub const MAX_WORKERS: usize = 64;

/// Returns the number of execution units available to this process, never
/// less than 1.
///
/// An explicit [`WORKERS_ENV`] override wins. Otherwise the logical count
/// honors any cgroup CPU quota the host exposes. With `prefer_true_count`
/// hyperthread siblings are collapsed into physical cores, as long as the
/// detection finishes within [`DETECTION_DEADLINE`].
pub fn estimate_worker_count(prefer_true_count: bool) -> usize {
    if let Some(count) = env_override() {
        return count;
    }

    let logical = num_cpus::get().max(1);
    if !prefer_true_count {
        return logical;
    }

    detect_real_cores_with(num_cpus::get_physical, DETECTION_DEADLINE)
        .filter(|&physical| physical <= logical)
        .unwrap_or(logical)
}

/// The size a pool should have when nobody asked for a specific one: every
/// physical core but one, which is left to the orchestrating thread.
pub fn default_pool_size() -> usize {
    if let Some(count) = env_override() {
        return count;
    }

    estimate_worker_count(true)
        .saturating_sub(1)
        .clamp(1, MAX_WORKERS)
}

/// Physical core count, or `None` when detection fails or times out.
pub fn detect_real_cores() -> Option<usize> {
    detect_real_cores_with(num_cpus::get_physical, DETECTION_DEADLINE)
}

/// Runs `probe` on a helper thread and waits at most `deadline` for it.
///
/// A probe that reports 0, panics, or misses the deadline counts as a
/// failed detection. A late probe is left to finish on its own.
pub fn detect_real_cores_with<F>(probe: F, deadline: Duration) -> Option<usize>
where
    F: FnOnce() -> usize + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);

    let spawned = thread::Builder::new()
        .name("tsumiki-cpu-probe".into())
        .spawn(move || {
            let _ = tx.send(probe());
        });

    if let Err(err) = spawned {
        tracing::debug!("could not spawn the core detection thread: {err}");
        return None;
    }

    match rx.recv_timeout(deadline) {
        Ok(0) => None,
        Ok(count) => Some(count),
        Err(RecvTimeoutError::Timeout) => {
            tracing::debug!("physical core detection timed out after {deadline:?}");
            None
        }
        Err(RecvTimeoutError::Disconnected) => None,
    }
}

fn env_override() -> Option<usize> {
    parse_override(std::env::var(WORKERS_ENV).ok()?.as_str())
}

fn parse_override(value: &str) -> Option<usize> {
    match value.trim().parse::<usize>() {
        Ok(0) | Err(_) => {
            tracing::warn!("ignoring invalid {WORKERS_ENV}={value:?}");
            None
        }
        Ok(count) => Some(count),
    }
}
