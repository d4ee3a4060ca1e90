//! Filepath: src/stamped.rs
//!
//! Stamped lock for partition concurrency control.
//!
//! [`StampedLock`] combines a write bit, a shared reader count, and a version
//! counter in a single `u64`. It supports three access modes:
//!
//! 1. Writers: `write()` / `try_write()` return a [`WriteGuard`]. Releasing a
//!    write lock bumps the version.
//! 2. Readers: `read()` / `try_read()` return a [`ReadGuard`]. Readers never
//!    bump the version, so they do not disturb optimistic readers. A writer
//!    blocked in `write()` raises a waiting bit that turns new readers away
//!    until it gets in, so a stream of readers cannot starve it.
//! 3. Optimistic readers: `optimistic()` hands out a token, the caller reads,
//!    then `validate(token)` reports whether a writer intervened.
//!
//! # Type-State Pattern
//! Guards are the only proof that a lock is held and release it on drop
//! (panic-safe).
//!
//! ```rust,ignore
//! let token = lock.optimistic();
//! let snapshot = partition.load_state();
//! if token.is_some_and(|t| lock.validate(t)) {
//!     // snapshot is consistent
//! }
//! ```

use std::marker::PhantomData;

#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, Ordering, fence};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, Ordering, fence};



// ============================================================================
//  Bit Constants
// ============================================================================

/// Mask of the shared reader count (low 31 bits).
const READER_MASK: u64 = (1 << 31) - 1;

/// A writer is blocked in `write()`; new readers must wait.
const WRITER_WAITING: u64 = 1 << 31;

/// Write bit: the lock is held exclusively.
const WRITE_BIT: u64 = 1 << 32;

/// Low bit of the version counter.
const VERSION_LOWBIT: u64 = 1 << 33;

/// Bits that make up a stamp: version and write bit, never the reader count
/// or the waiting bit.
const STAMP_MASK: u64 = !(READER_MASK | WRITER_WAITING);

/// Spin rounds (doubling) before waiting threads start yielding.
const SPIN_LIMIT: u32 = 6;

// ============================================================================
//  StampedLock
// ============================================================================

/// A versioned reader-writer lock with optimistic reads.
///
/// # Layout
/// Bits 33-63: `version` | Bit 32: `write` | Bit 31: `writer waiting` | Bits 0-30: `readers`
///
/// # Example
///
/// ```rust
/// use catree::stamped::StampedLock;
///
/// let lock = StampedLock::new();
/// let token = lock.optimistic().expect("not write locked");
///
/// {
///     let _reader = lock.read();
///     assert!(lock.validate(token), "readers do not invalidate tokens");
/// }
///
/// drop(lock.write());
/// assert!(!lock.validate(token), "a writer invalidates tokens");
/// ```
#[derive(Debug)]
pub struct StampedLock {
    state: AtomicU64,
}

// ============================================================================
//  Guards (Type-State Pattern)
// ============================================================================

/// Proof that the write lock is held.
///
/// Cannot be constructed except through [`StampedLock::write()`] or
/// [`StampedLock::try_write()`]. Dropping it releases the lock and bumps the
/// version, invalidating every outstanding optimistic token.
///
/// `PhantomData<*mut ()>` keeps the guard `!Send` and `!Sync`: a lock must
/// be released by the thread that took it.
#[derive(Debug)]
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct WriteGuard<'a> {
    lock: &'a StampedLock,
    _marker: PhantomData<*mut ()>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        // One RMW: waiting writers set their bit concurrently. Adding the
        // (set) write bit clears it and carries one into the version.
        self.lock.state.fetch_add(WRITE_BIT, Ordering::Release);
    }
}

/// Proof that a shared read lock is held.
///
/// Dropping it decrements the reader count. The version is untouched.
#[derive(Debug)]
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct ReadGuard<'a> {
    lock: &'a StampedLock,
    _marker: PhantomData<*mut ()>,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

impl StampedLock {
    /// Create an unlocked lock at version zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    // ========================================================================
    //  Accessors
    // ========================================================================

    /// Check if the write lock is held.
    #[inline]
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        (self.state.load(Ordering::Relaxed) & WRITE_BIT) != 0
    }

    /// Number of shared readers currently holding the lock.
    #[inline]
    #[must_use]
    pub fn reader_count(&self) -> u64 {
        self.state.load(Ordering::Relaxed) & READER_MASK
    }

    /// Check if the lock is held in any mode.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        (self.state.load(Ordering::Relaxed) & (WRITE_BIT | READER_MASK)) != 0
    }

    /// Check if a writer is blocked waiting for this lock.
    #[inline]
    #[must_use]
    pub fn has_waiting_writer(&self) -> bool {
        (self.state.load(Ordering::Relaxed) & WRITER_WAITING) != 0
    }

    /// Current version counter (number of completed write sections).
    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.load(Ordering::Relaxed) / VERSION_LOWBIT
    }

    // ========================================================================
    //  Optimistic Reads
    // ========================================================================

    /// Get a token for an optimistic read.
    ///
    /// # Returns
    /// `None` while the write lock is held, otherwise a stamp to pass to
    /// [`validate()`](Self::validate) after reading.
    #[inline]
    #[must_use]
    pub fn optimistic(&self) -> Option<u64> {
        let value: u64 = self.state.load(Ordering::Acquire);

        if value & WRITE_BIT == 0 {
            Some(value & STAMP_MASK)
        } else {
            None
        }
    }

    /// Check that no write section began since `token` was issued.
    ///
    /// The acquire fence keeps the caller's preceding reads from being
    /// reordered after the state load.
    #[inline]
    #[must_use]
    pub fn validate(&self, token: u64) -> bool {
        fence(Ordering::Acquire);
        (self.state.load(Ordering::Relaxed) & STAMP_MASK) == token
    }

    // ========================================================================
    //  Write Lock
    // ========================================================================

    /// Try to take the write lock without waiting.
    ///
    /// # Returns
    /// `Some(guard)` if acquired, `None` if held in any mode.
    #[must_use]
    pub fn try_write(&self) -> Option<WriteGuard<'_>> {
        let value: u64 = self.state.load(Ordering::Relaxed);

        if value & (WRITE_BIT | READER_MASK) != 0 {
            return None;
        }

        let locked: u64 = (value | WRITE_BIT) & !WRITER_WAITING;
        self.state
            .compare_exchange(value, locked, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;

        // Stores made under the lock must not become visible before the
        // write bit, or a validating reader could accept them.
        fence(Ordering::Release);

        Some(WriteGuard {
            lock: self,
            _marker: PhantomData,
        })
    }

    /// Take the write lock, waiting for readers and writers to leave.
    ///
    /// While waiting, new readers are turned away.
    #[must_use = "releasing a lock without using the guard is a logic error"]
    pub fn write(&self) -> WriteGuard<'_> {
        let mut backoff = Backoff::new();

        loop {
            if let Some(guard) = self.try_write() {
                return guard;
            }

            self.state.fetch_or(WRITER_WAITING, Ordering::Relaxed);
            backoff.snooze();
        }
    }

    // ========================================================================
    //  Read Lock
    // ========================================================================

    /// Try to take a shared read lock without waiting for a writer.
    ///
    /// Fails while a writer holds the lock or is waiting for it. Spurious
    /// failure is possible when another reader races on the count.
    #[must_use]
    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        let value: u64 = self.state.load(Ordering::Relaxed);

        if value & (WRITE_BIT | WRITER_WAITING) != 0 || (value & READER_MASK) == READER_MASK {
            return None;
        }

        self.state
            .compare_exchange(value, value + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ReadGuard {
                lock: self,
                _marker: PhantomData,
            })
    }

    /// Take a shared read lock, waiting for any writer to leave and for
    /// waiting writers to get in first.
    #[must_use = "releasing a lock without using the guard is a logic error"]
    pub fn read(&self) -> ReadGuard<'_> {
        let mut backoff = Backoff::new();

        loop {
            if let Some(guard) = self.try_read() {
                return guard;
            }

            backoff.snooze();
        }
    }
}

impl Default for StampedLock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
//  Backoff
// ============================================================================

/// Exponential spinning that degrades into yielding.
struct Backoff {
    step: u32,
}

impl Backoff {
    const fn new() -> Self {
        Self { step: 0 }
    }

    #[cfg(not(loom))]
    fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1_u32 << self.step) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }

    #[cfg(loom)]
    fn snooze(&mut self) {
        let _ = (self.step, SPIN_LIMIT);
        loom::thread::yield_now();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_unlocked() {
        let lock = StampedLock::new();

        assert!(!lock.is_locked());
        assert!(!lock.is_write_locked());
        assert_eq!(lock.reader_count(), 0);
        assert_eq!(lock.version(), 0);
    }

    #[test]
    fn test_write_roundtrip_bumps_version() {
        let lock = StampedLock::new();

        {
            let _guard: WriteGuard<'_> = lock.write();
            assert!(lock.is_write_locked());
            assert!(lock.is_locked());
        }

        assert!(!lock.is_locked());
        assert_eq!(lock.version(), 1);
    }

    #[test]
    fn test_read_roundtrip_keeps_version() {
        let lock = StampedLock::new();

        {
            let _first: ReadGuard<'_> = lock.read();
            let _second: ReadGuard<'_> = lock.read();
            assert_eq!(lock.reader_count(), 2);
            assert!(!lock.is_write_locked());
        }

        assert_eq!(lock.reader_count(), 0);
        assert_eq!(lock.version(), 0);
    }

    #[test]
    fn test_try_write_fails_while_held() {
        let lock = StampedLock::new();

        let guard: Option<WriteGuard<'_>> = lock.try_write();
        assert!(guard.is_some());
        assert!(lock.try_write().is_none());
        assert!(lock.try_read().is_none());

        drop(guard);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_try_write_fails_with_readers() {
        let lock = StampedLock::new();
        let reader: ReadGuard<'_> = lock.read();

        assert!(lock.try_write().is_none());

        drop(reader);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_optimistic_unavailable_while_write_locked() {
        let lock = StampedLock::new();
        let _guard: WriteGuard<'_> = lock.write();

        assert!(lock.optimistic().is_none());
    }

    #[test]
    fn test_token_survives_readers() {
        let lock = StampedLock::new();
        let token: u64 = lock.optimistic().unwrap();

        drop(lock.read());
        let _held: ReadGuard<'_> = lock.read();

        assert!(lock.validate(token));
    }

    #[test]
    fn test_token_invalidated_by_writer() {
        let lock = StampedLock::new();
        let token: u64 = lock.optimistic().unwrap();

        drop(lock.write());

        assert!(!lock.validate(token));
        let fresh: u64 = lock.optimistic().unwrap();
        assert!(lock.validate(fresh));
    }

    #[test]
    fn test_token_invalidated_during_write_section() {
        let lock = StampedLock::new();
        let token: u64 = lock.optimistic().unwrap();

        let _guard: WriteGuard<'_> = lock.write();

        // Write bit is part of the stamp.
        assert!(!lock.validate(token));
    }

    #[test]
    fn test_version_wraparound() {
        let lock = StampedLock {
            state: AtomicU64::new(STAMP_MASK & !WRITE_BIT),
        };
        let token: u64 = lock.optimistic().unwrap();

        drop(lock.write());

        assert!(!lock.validate(token));
        assert!(!lock.is_locked());
        assert_eq!(lock.version(), 0);
    }
}
