use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use rayon::{ThreadPool, ThreadPoolBuilder};

/// Multiply-adds below which a matmul row range runs on the calling thread.
pub const DEFAULT_MATMUL_THRESHOLD: usize = 1 << 16;

/// Elements per task for elementwise kernels.
pub const DEFAULT_CHUNK_LEN: usize = 1 << 14;

/// Tuning knobs of the CPU kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuConfig {
    /// Worker threads for the kernel's pool. `None` lets rayon decide.
    pub num_threads: Option<usize>,
    /// Work threshold (rows * k * n) for bisecting a matmul row range.
    pub matmul_threshold: usize,
    /// Elements handled by one task in elementwise and reduction kernels.
    pub chunk_len: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            num_threads: None,
            matmul_threshold: DEFAULT_MATMUL_THRESHOLD,
            chunk_len: DEFAULT_CHUNK_LEN,
        }
    }
}

static POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();
static MATMUL_THRESHOLD: AtomicUsize = AtomicUsize::new(DEFAULT_MATMUL_THRESHOLD);
static CHUNK_LEN: AtomicUsize = AtomicUsize::new(DEFAULT_CHUNK_LEN);

/// Apply a configuration. Thresholds take effect immediately; the thread
/// pool is built on first use, so `num_threads` only applies if this runs
/// before any kernel does.
pub fn configure(config: &CpuConfig) {
    MATMUL_THRESHOLD.store(config.matmul_threshold, Ordering::Relaxed);
    CHUNK_LEN.store(config.chunk_len.max(1), Ordering::Relaxed);

    let threads = config.num_threads;
    let mut built = false;
    POOL.get_or_init(|| {
        built = true;
        build_pool(threads)
    });
    if !built && threads.is_some() {
        log::warn!("cpu thread pool already running, ignoring num_threads={threads:?}");
    }
}

/// Current matmul bisection threshold.
pub fn matmul_threshold() -> usize {
    MATMUL_THRESHOLD.load(Ordering::Relaxed)
}

pub(crate) fn chunk_len() -> usize {
    CHUNK_LEN.load(Ordering::Relaxed)
}

fn build_pool(threads: Option<usize>) -> Option<ThreadPool> {
    let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("vole-cpu-{i}"));
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    match builder.build() {
        Ok(pool) => {
            log::debug!("cpu kernel pool started with {} threads", pool.current_num_threads());
            Some(pool)
        }
        Err(e) => {
            log::warn!("cpu kernel pool failed to start ({e}), using the global rayon pool");
            None
        }
    }
}

/// Run `f` inside the kernel's pool. Blocks until it (and every task it
/// forks) has finished.
pub(crate) fn install<R: Send>(f: impl FnOnce() -> R + Send) -> R {
    match POOL.get_or_init(|| build_pool(None)) {
        Some(pool) => pool.install(f),
        None => f(),
    }
}

/// Threads available to kernels.
pub fn num_threads() -> usize {
    install(rayon::current_num_threads)
}
