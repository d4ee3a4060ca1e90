//! Debug binary for watching the tree adapt under contention.
//!
//! Runs a hot-spot workload (every thread hammers a narrow key range) and
//! a uniform workload, then prints the resulting shape and the debug
//! counters. A watchdog reports threads that stop making progress.
//!
//! Run with:
//! ```bash
//! cargo run --release --features tracing
//! ```

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use catree::{AdaptationConfig, CaTree, debug_counters, reset_debug_counters};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

// =============================================================================
// Key Generation
// =============================================================================

/// Xorshift; the driver only needs cheap spread, not quality.
struct KeyGen(u64);

impl KeyGen {
    const fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    const fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

// =============================================================================
// Thread progress tracking for hang detection
// =============================================================================

struct ThreadProgress {
    /// Current operation index for each thread
    current_op: Vec<AtomicUsize>,
    /// Current key being processed by each thread
    current_key: Vec<AtomicU64>,
    /// Last time each thread made progress
    last_progress_ms: Vec<AtomicU64>,
    done: Vec<AtomicBool>,
    start: Instant,
}

impl ThreadProgress {
    fn new(num_threads: usize) -> Self {
        Self {
            current_op: (0..num_threads).map(|_| AtomicUsize::new(0)).collect(),
            current_key: (0..num_threads).map(|_| AtomicU64::new(0)).collect(),
            last_progress_ms: (0..num_threads).map(|_| AtomicU64::new(0)).collect(),
            done: (0..num_threads).map(|_| AtomicBool::new(false)).collect(),
            start: Instant::now(),
        }
    }

    fn update(&self, thread_id: usize, op: usize, key: u64) {
        self.current_op[thread_id].store(op, Ordering::Relaxed);
        self.current_key[thread_id].store(key, Ordering::Relaxed);
        self.last_progress_ms[thread_id]
            .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn mark_done(&self, thread_id: usize) {
        self.done[thread_id].store(true, Ordering::Relaxed);
    }

    fn report_stuck(&self, timeout_ms: u64) -> Vec<(usize, usize, u64, u64)> {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let mut stuck = Vec::new();

        for i in 0..self.done.len() {
            if self.done[i].load(Ordering::Relaxed) {
                continue;
            }
            let last = self.last_progress_ms[i].load(Ordering::Relaxed);
            if now_ms.saturating_sub(last) > timeout_ms {
                stuck.push((
                    i,
                    self.current_op[i].load(Ordering::Relaxed),
                    self.current_key[i].load(Ordering::Relaxed),
                    now_ms - last,
                ));
            }
        }
        stuck
    }

    fn all_done(&self) -> bool {
        self.done.iter().all(|d| d.load(Ordering::Relaxed))
    }
}

// =============================================================================
// Workloads
// =============================================================================

#[derive(Clone, Copy, Debug)]
enum Workload {
    /// All threads write inside `[0, width)`.
    HotSpot { width: u64 },
    /// Keys spread over `[0, key_space)`, one range query per 100 ops.
    Uniform { key_space: u64 },
}

impl Workload {
    fn key(self, rng: &mut KeyGen) -> u64 {
        match self {
            Self::HotSpot { width } => rng.next() % width,
            Self::Uniform { key_space } => rng.next() % key_space,
        }
    }
}

fn run(name: &str, workload: Workload, threads: usize, ops_per_thread: usize) {
    println!("\n{}", "=".repeat(80));
    println!("{name}: {workload:?} ({threads} threads, {ops_per_thread} ops/thread)");
    println!("{}", "=".repeat(80));

    reset_debug_counters();
    let tree: Arc<CaTree<u64, u64>> = Arc::new(CaTree::with_config(AdaptationConfig::new()));
    let progress = Arc::new(ThreadProgress::new(threads));
    let stop_watchdog = Arc::new(AtomicBool::new(false));

    let watchdog = {
        let progress = Arc::clone(&progress);
        let stop = Arc::clone(&stop_watchdog);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(500));
                for (tid, op, key, stall_ms) in &progress.report_stuck(2000) {
                    eprintln!("!!! STUCK: Thread {tid} at op {op} key={key} for {stall_ms}ms");
                }
                if progress.all_done() {
                    break;
                }
            }
        })
    };

    let start = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let progress = Arc::clone(&progress);
            thread::spawn(move || {
                let mut rng = KeyGen::new(0x9e37_79b9_7f4a_7c15 ^ t as u64);

                for op in 0..ops_per_thread {
                    let key = workload.key(&mut rng);
                    progress.update(t, op, key);

                    let op_start = Instant::now();
                    match op % 100 {
                        0 => {
                            let _ = tree.sub_set(&key, &key.saturating_add(1000));
                        }
                        1..=9 => {
                            let _ = tree.remove(&key);
                        }
                        10..=49 => {
                            let _ = tree.put(key, key);
                        }
                        _ => {
                            let _ = tree.get(&key);
                        }
                    }

                    let op_elapsed = op_start.elapsed();
                    if op_elapsed > Duration::from_millis(100) {
                        eprintln!("[T{t:02}] SLOW op {op} key={key} took {op_elapsed:?}");
                    }
                }

                progress.mark_done(t);
            })
        })
        .collect();

    for h in handles {
        let _ = h.join();
    }

    stop_watchdog.store(true, Ordering::Relaxed);
    let _ = watchdog.join();

    let elapsed = start.elapsed();
    let shape = tree.shape();
    let counters = debug_counters();

    println!(
        "{name} DONE: {} ops in {:?} ({:.0} ops/sec), len={}",
        threads * ops_per_thread,
        elapsed,
        (threads * ops_per_thread) as f64 / elapsed.as_secs_f64(),
        tree.len()
    );
    println!(
        "  shape: {} partitions, {} route nodes, depth {}",
        shape.partitions, shape.route_nodes, shape.max_depth
    );
    println!("  counters: {counters:#?}");
    assert_eq!(tree.locks_held(), 0, "locks leaked");
}

// =============================================================================
// Main
// =============================================================================

fn main() {
    eprintln!("CaTree Adaptation Driver");
    eprintln!("========================");
    eprintln!("Watchdog will report any thread stuck for >2 seconds.");

    let threads = thread::available_parallelism().map_or(4, usize::from);

    run("hot-spot", Workload::HotSpot { width: 64 }, threads, 200_000);
    run("uniform", Workload::Uniform { key_space: 1_000_000 }, threads, 200_000);

    eprintln!("\nAll runs completed!");
}
