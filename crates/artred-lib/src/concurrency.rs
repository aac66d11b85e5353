//! Work distribution for the detection passes.
//!
//! Each pass spawns a fixed set of scoped OS threads which claim contiguous
//! blocks of sequence ids from a shared cursor until the id space is
//! exhausted. The spawning thread only waits, emitting a heartbeat at a fixed
//! interval, and joins every worker before the pass returns.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upper bound on worker threads for any pass
pub const MAX_WORKER_THREADS: usize = 128;
/// Sequences per worker below which fewer threads are started
const SEQS_PER_THREAD: u32 = 10_000;
const MAX_BLOCK_SEQS: u32 = 4000;
const MIN_BLOCK_SEQS: u32 = 64;
/// Interval between progress reports while a pass runs
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const JOIN_POLL: Duration = Duration::from_millis(20);

/// Threads to start for a pass over `num_seqs` sequences.
pub fn worker_threads(num_seqs: u32, configured: usize) -> usize {
    if num_seqs < SEQS_PER_THREAD {
        return 1;
    }
    let wanted = num_seqs.div_ceil(SEQS_PER_THREAD) as usize;
    wanted.min(configured.clamp(1, MAX_WORKER_THREADS))
}

/// Hands out contiguous, even-sized blocks of ids `1..=last` to competing workers.
///
/// Blocks start on odd ids and hold an even number of ids, so both mates of a
/// pair always land in the same block.
#[derive(Debug)]
pub struct RangeAllocator {
    next: AtomicU64,
    last: u64,
    block: u64,
}

impl RangeAllocator {
    pub fn new(last: u32, threads: usize) -> Self {
        let block = if threads <= 1 {
            MAX_BLOCK_SEQS
        } else {
            let per = (last as u64 + threads as u64 - 1) / (threads as u64 * 100);
            (per as u32).clamp(MIN_BLOCK_SEQS, MAX_BLOCK_SEQS)
        };
        let block = (block + 1) & !1;
        Self { next: AtomicU64::new(1), last: last as u64, block: block as u64 }
    }

    pub fn block_size(&self) -> u32 {
        self.block as u32
    }

    /// Claim the next block, clipped at the last id; `None` once exhausted.
    pub fn claim(&self) -> Option<RangeInclusive<u32>> {
        let mut cur = self.next.load(Ordering::Relaxed);
        loop {
            if cur > self.last {
                return None;
            }
            let end = (cur + self.block - 1).min(self.last);
            match self.next.compare_exchange_weak(cur, end + 1, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Some(cur as u32..=end as u32),
                Err(actual) => cur = actual,
            }
        }
    }
}

/// Run `worker(thread_index)` on `threads` scoped threads, calling `heartbeat`
/// every `interval` until all have finished, and collect their results in
/// thread order. A panicking worker aborts the pass by resuming its panic.
pub fn run_workers<T, W, H>(threads: usize, interval: Duration, worker: W, mut heartbeat: H) -> Vec<T>
where
    T: Send,
    W: Fn(usize) -> T + Sync,
    H: FnMut(),
{
    let threads = threads.clamp(1, MAX_WORKER_THREADS);
    std::thread::scope(|scope| {
        let worker = &worker;
        let handles: Vec<_> = (0..threads).map(|t| scope.spawn(move || worker(t))).collect();
        let mut last_beat = Instant::now();
        while !handles.iter().all(|h| h.is_finished()) {
            std::thread::sleep(JOIN_POLL);
            if last_beat.elapsed() >= interval {
                heartbeat();
                last_beat = Instant::now();
            }
        }
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    })
}
