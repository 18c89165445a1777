//! Worker-pool sizing policy.
//!
//! Pure functions over an injected CPU count so the policy is testable on
//! any host. Oversubscribing a constrained resource (GPU context, shared
//! in-memory model) degrades throughput instead of improving it, hence
//! the hard caps.

/// Cap on caller-requested workers for bulk batch runs.
pub const BULK_WORKER_CAP: usize = 16;

/// Cap on caller-requested workers when items share one trained model.
pub const SHARED_MODEL_WORKER_CAP: usize = 8;

/// Auto-sized shared-model inference keeps concurrency low; contention on
/// the model lock dominates past two workers.
const SHARED_MODEL_AUTO_WORKERS: usize = 2;

/// GPU execution contexts rarely pipeline well above two concurrent ops.
const GPU_MAX_WORKERS: usize = 2;

/// Fraction of host CPUs used for CPU-bound correction work; the rest is
/// headroom for the host process.
const CPU_FRACTION: f64 = 0.6;

/// I/O-bound fan-out tolerates higher concurrency than CPU-bound work.
const IO_FRACTION: f64 = 0.8;
const IO_MIN_WORKERS: usize = 2;

/// Compute the worker-pool size for a batch of `item_count` items.
///
/// A caller override is respected but clamped to
/// `[1, min(hard_cap, item_count)]`; without one, GPU hosts get at most
/// two workers and CPU hosts get 60% of their cores, never more workers
/// than items.
pub fn compute_workers(
    item_count: usize,
    cpus: usize,
    has_gpu: bool,
    override_workers: Option<usize>,
    hard_cap: usize,
) -> usize {
    debug_assert!(item_count > 0, "caller admits only non-empty batches");

    if let Some(requested) = override_workers {
        return requested.clamp(1, hard_cap.min(item_count).max(1));
    }

    if has_gpu {
        return GPU_MAX_WORKERS.min(item_count).max(1);
    }

    let optimal = ((CPU_FRACTION * cpus as f64).floor() as usize).max(1);
    optimal.min(item_count).max(1)
}

/// Pool size for I/O-bound fan-out (persisting many encoded results):
/// `min(max(2, floor(0.8 * cpus)), task_count)`.
pub fn io_workers(task_count: usize, cpus: usize) -> usize {
    let optimal = ((IO_FRACTION * cpus as f64).floor() as usize).max(IO_MIN_WORKERS);
    optimal.min(task_count).max(1)
}

/// Pool size for inference against the shared trained model.
///
/// The bulk policy applies first (so a one-CPU host still gets one
/// worker), then the auto path is capped at two; a caller override goes
/// through the usual clamp with the shared-model hard cap.
pub fn shared_model_workers(
    item_count: usize,
    cpus: usize,
    has_gpu: bool,
    override_workers: Option<usize>,
) -> usize {
    let sized = compute_workers(
        item_count,
        cpus,
        has_gpu,
        override_workers,
        SHARED_MODEL_WORKER_CAP,
    );
    match override_workers {
        Some(_) => sized,
        None => sized.min(SHARED_MODEL_AUTO_WORKERS),
    }
}

/// [`compute_workers`] against the actual host CPU count.
pub fn compute_workers_for_host(
    item_count: usize,
    has_gpu: bool,
    override_workers: Option<usize>,
    hard_cap: usize,
) -> usize {
    compute_workers(item_count, num_cpus::get(), has_gpu, override_workers, hard_cap)
}

/// [`io_workers`] against the actual host CPU count.
pub fn io_workers_for_host(task_count: usize) -> usize {
    io_workers(task_count, num_cpus::get())
}

/// [`shared_model_workers`] against the actual host CPU count.
pub fn shared_model_workers_for_host(
    item_count: usize,
    has_gpu: bool,
    override_workers: Option<usize>,
) -> usize {
    shared_model_workers(item_count, num_cpus::get(), has_gpu, override_workers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_item_cpu_host_gets_one_worker() {
        assert_eq!(compute_workers(1, 8, false, None, BULK_WORKER_CAP), 1);
    }

    #[test]
    fn test_gpu_path_caps_at_two() {
        assert_eq!(compute_workers(100, 32, true, None, BULK_WORKER_CAP), 2);
        assert_eq!(compute_workers(1, 32, true, None, BULK_WORKER_CAP), 1);
    }

    #[test]
    fn test_override_capped_by_item_count() {
        assert_eq!(compute_workers(3, 8, false, Some(10), BULK_WORKER_CAP), 3);
    }

    #[test]
    fn test_override_capped_by_hard_cap() {
        assert_eq!(compute_workers(100, 8, false, Some(40), BULK_WORKER_CAP), 16);
        assert_eq!(
            compute_workers(100, 8, false, Some(40), SHARED_MODEL_WORKER_CAP),
            8
        );
    }

    #[test]
    fn test_override_floor_is_one() {
        assert_eq!(compute_workers(5, 8, false, Some(0), BULK_WORKER_CAP), 1);
    }

    #[test]
    fn test_cpu_fraction_on_eight_core_host() {
        // 0.6 * 8 = 4.8, floored to 4, well under 1000 items
        assert_eq!(compute_workers(1000, 8, false, None, BULK_WORKER_CAP), 4);
    }

    #[test]
    fn test_cpu_path_never_exceeds_items() {
        assert_eq!(compute_workers(2, 16, false, None, BULK_WORKER_CAP), 2);
    }

    #[test]
    fn test_cpu_path_minimum_one_worker() {
        assert_eq!(compute_workers(4, 1, false, None, BULK_WORKER_CAP), 1);
    }

    #[test]
    fn test_shared_model_auto_respects_host_sizing() {
        // Plenty of cores: auto path settles at two
        assert_eq!(shared_model_workers(10, 8, false, None), 2);
        // One-core host: the CPU policy wins, not the flat two
        assert_eq!(shared_model_workers(10, 1, false, None), 1);
        // Single item never gets a second worker
        assert_eq!(shared_model_workers(1, 8, false, None), 1);
    }

    #[test]
    fn test_shared_model_override_uses_hard_cap() {
        assert_eq!(shared_model_workers(10, 8, false, Some(5)), 5);
        assert_eq!(shared_model_workers(100, 8, false, Some(40)), 8);
    }

    #[test]
    fn test_io_policy_is_more_aggressive() {
        // 0.8 * 8 = 6.4 -> 6
        assert_eq!(io_workers(50, 8), 6);
        // floor of two workers even on tiny hosts
        assert_eq!(io_workers(50, 1), 2);
        // still capped by task count
        assert_eq!(io_workers(3, 8), 3);
    }
}
