//! Success/failure counters shared by every worker.
//!
//! Two implementations back the same trait:
//! - `LockedCounters`: mutex-guarded pair for the thread backend
//! - `SharedCounters`: one atomic word in an anonymous `MAP_SHARED`
//!   mapping, inherited by forked workers of the process backend
//!
//! Each connection records exactly one outcome, after its terminal
//! outcome is known.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Terminal outcome of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub success: u64,
    pub fail: u64,
}

impl StatusSnapshot {
    /// Connections that reached a terminal outcome.
    pub fn total(&self) -> u64 {
        self.success + self.fail
    }
}

pub trait StatusCounters: Send + Sync {
    fn record_success(&self);
    fn record_failure(&self);
    fn snapshot(&self) -> StatusSnapshot;

    fn record(&self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.record_success(),
            Outcome::Failure => self.record_failure(),
        }
    }
}

/// Mutex-guarded counters for workers sharing one address space.
#[derive(Debug, Default)]
pub struct LockedCounters {
    inner: Mutex<StatusSnapshot>,
}

impl LockedCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusCounters for LockedCounters {
    fn record_success(&self) {
        // A worker that panicked cannot leave the pair half-updated
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .success += 1;
    }

    fn record_failure(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail += 1;
    }

    fn snapshot(&self) -> StatusSnapshot {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Success count lives in the high half of the word, failures in the low half.
const SUCCESS_UNIT: u64 = 1 << 32;
const FAIL_UNIT: u64 = 1;
const HALF_MASK: u64 = u32::MAX as u64;

fn unpack(word: u64) -> StatusSnapshot {
    StatusSnapshot {
        success: word >> 32,
        fail: word & HALF_MASK,
    }
}

/// Counters visible to every process forked after construction.
///
/// Both counts share one 64-bit atomic so a snapshot is a single load.
/// Each count saturates at `u32::MAX`; an increment past that is dropped
/// so it cannot carry into the other half.
pub struct SharedCounters {
    word: NonNull<AtomicU64>,
}

// SAFETY: the mapping is only accessed through `AtomicU64` operations and
// stays valid until `Drop`.
unsafe impl Send for SharedCounters {}
unsafe impl Sync for SharedCounters {}

impl SharedCounters {
    /// Map a zeroed, process-shared counter word.
    pub fn new() -> io::Result<Self> {
        // SAFETY: anonymous mapping with no fd; the result is checked
        // against MAP_FAILED before use.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                std::mem::size_of::<AtomicU64>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Anonymous mappings are zero-filled and page aligned
        let word = NonNull::new(addr.cast::<AtomicU64>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Self { word })
    }

    fn word(&self) -> &AtomicU64 {
        // SAFETY: `word` points into a live mapping owned by `self`.
        unsafe { self.word.as_ref() }
    }

    /// Add one `unit` unless that half is already full.
    fn saturating_bump(&self, unit: u64) {
        let _ = self
            .word()
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                let count = (word / unit) & HALF_MASK;
                (count < HALF_MASK).then_some(word + unit)
            });
    }
}

impl StatusCounters for SharedCounters {
    fn record_success(&self) {
        self.saturating_bump(SUCCESS_UNIT);
    }

    fn record_failure(&self) {
        self.saturating_bump(FAIL_UNIT);
    }

    fn snapshot(&self) -> StatusSnapshot {
        unpack(self.word().load(Ordering::SeqCst))
    }
}

impl Drop for SharedCounters {
    fn drop(&mut self) {
        // SAFETY: unmapping the region created in `new`; no references
        // outlive `self`.
        unsafe {
            libc::munmap(
                self.word.as_ptr().cast::<libc::c_void>(),
                std::mem::size_of::<AtomicU64>(),
            );
        }
    }
}

impl std::fmt::Debug for SharedCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCounters")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
