use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

// 0 means "not configured": fall back to the number of online CPUs.
static NUM_THREADS: AtomicUsize = AtomicUsize::new(0);

fn online_cpus() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Sets the process-wide worker-thread count consulted by multi-threaded
/// GEMM dispatch. Passing `0` restores the default of one worker per
/// online CPU. Intended to be called once by the hosting application.
pub fn set_num_threads(n: usize) {
    NUM_THREADS.store(n, Ordering::Relaxed);
}

/// Returns the effective worker-thread count.
pub fn num_threads() -> usize {
    match NUM_THREADS.load(Ordering::Relaxed) {
        0 => online_cpus(),
        n => n,
    }
}

/// Returns the number of online CPUs, ignoring any configured override.
pub fn max_threads() -> usize {
    online_cpus()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        set_num_threads(3);
        assert_eq!(num_threads(), 3);
        set_num_threads(0);
        assert!(num_threads() >= 1);
    }

    #[test]
    fn test_max_threads_positive() {
        assert!(max_threads() >= 1);
    }
}
