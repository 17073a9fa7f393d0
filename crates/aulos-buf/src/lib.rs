#![forbid(unsafe_code)]

//! Bounded circular byte buffer used as the sole synchronization primitive
//! between the network side (producer) and a demux worker (consumer).
//!
//! One [`ByteRingBuffer`] is owned by exactly one fetch session. All handles
//! are clones of the same underlying buffer; `wait_for_size` is the only
//! blocking call, bounded by an explicit timeout, and both `abort` and
//! `signal_end_of_data` wake every waiter immediately.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufError {
    #[error("grow_to({requested}) would shrink the buffer below its capacity of {capacity}")]
    ShrinkRequested { requested: usize, capacity: usize },

    #[error("grow_to is only valid while the buffer is drained ({occupied} bytes occupied)")]
    NotEmpty { occupied: usize },
}

pub type BufResult<T> = Result<T, BufError>;

/// Outcome of [`ByteRingBuffer::wait_for_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The requested number of bytes is buffered.
    Ready,
    /// End of data was signaled and fewer bytes than requested will ever
    /// arrive. Whatever is still buffered can be popped.
    EndOfData,
    /// The buffer was aborted.
    Aborted,
    /// The timeout elapsed before any of the above.
    TimedOut,
}

impl WaitOutcome {
    /// True when the wait ended for a reason other than the timeout.
    pub fn is_decided(self) -> bool {
        !matches!(self, Self::TimedOut)
    }
}

struct State {
    buf: Vec<u8>,
    head: usize,
    len: usize,
    end_of_data: bool,
    aborted: bool,
}

impl State {
    fn free(&self) -> usize {
        self.buf.len() - self.len
    }
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// Bounded circular byte buffer. Clone is cheap; all clones share the same
/// underlying storage.
#[derive(Clone)]
pub struct ByteRingBuffer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ByteRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ByteRingBuffer")
            .field("capacity", &state.buf.len())
            .field("occupied", &state.len)
            .field("end_of_data", &state.end_of_data)
            .field("aborted", &state.aborted)
            .finish()
    }
}

impl ByteRingBuffer {
    /// Create a buffer with a fixed capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ByteRingBuffer capacity must be > 0");
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    buf: vec![0u8; capacity],
                    head: 0,
                    len: 0,
                    end_of_data: false,
                    aborted: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.state.lock().buf.len()
    }

    pub fn occupied(&self) -> usize {
        self.inner.state.lock().len
    }

    pub fn free(&self) -> usize {
        self.inner.state.lock().free()
    }

    pub fn is_end_of_data(&self) -> bool {
        self.inner.state.lock().end_of_data
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.state.lock().aborted
    }

    /// Append `data` without blocking.
    ///
    /// Returns false — and writes nothing — if there is not enough free
    /// space, or the buffer is aborted, or end of data was already signaled.
    pub fn push(&self, data: &[u8]) -> bool {
        self.push_with(data.len(), |a, b| {
            let first = a.len().min(data.len());
            a[..first].copy_from_slice(&data[..first]);
            let rest = data.len() - first;
            b[..rest].copy_from_slice(&data[first..]);
            data.len()
        })
    }

    /// Zero-copy write window.
    ///
    /// Opens exactly `len` writable bytes as up to two contiguous spans (two
    /// when the window wraps the end of the circular storage) and calls
    /// `fill` with them. `fill` returns how many bytes it actually wrote,
    /// counted from the start of the first span; only that many are
    /// committed. Returns false — without invoking `fill` — under the same
    /// conditions as [`push`](Self::push).
    pub fn push_with<F>(&self, len: usize, fill: F) -> bool
    where
        F: FnOnce(&mut [u8], &mut [u8]) -> usize,
    {
        let mut state = self.inner.state.lock();
        if state.aborted || state.end_of_data || state.free() < len {
            return false;
        }
        if len == 0 {
            return true;
        }

        let cap = state.buf.len();
        let tail = (state.head + state.len) % cap;
        let first = (cap - tail).min(len);
        let second = len - first;

        let written = {
            // `second <= head` because free space never overlaps occupied
            // bytes, so the two spans are disjoint.
            let (front, back) = state.buf.split_at_mut(tail);
            fill(&mut back[..first], &mut front[..second])
        };
        let written = written.min(len);
        state.len += written;

        drop(state);
        self.inner.cond.notify_all();
        true
    }

    /// Pop up to `max_len` buffered bytes without blocking.
    pub fn pop(&self, max_len: usize) -> Vec<u8> {
        let mut out = vec![0u8; max_len];
        let n = self.pop_into(&mut out);
        out.truncate(n);
        out
    }

    /// Pop into `buf`, returning how many bytes were written.
    pub fn pop_into(&self, buf: &mut [u8]) -> usize {
        let mut state = self.inner.state.lock();
        let n = state.len.min(buf.len());
        if n == 0 {
            return 0;
        }

        let cap = state.buf.len();
        let first = (cap - state.head).min(n);
        buf[..first].copy_from_slice(&state.buf[state.head..state.head + first]);
        if n > first {
            buf[first..n].copy_from_slice(&state.buf[..n - first]);
        }

        state.head = (state.head + n) % cap;
        state.len -= n;

        drop(state);
        self.inner.cond.notify_all();
        n
    }

    /// Drop up to `n` buffered bytes, returning how many were dropped.
    pub fn skip(&self, n: usize) -> usize {
        let mut state = self.inner.state.lock();
        let n = state.len.min(n);
        if n == 0 {
            return 0;
        }
        let cap = state.buf.len();
        state.head = (state.head + n) % cap;
        state.len -= n;

        drop(state);
        self.inner.cond.notify_all();
        n
    }

    /// Block until at least `min_len` bytes are buffered, end of data is
    /// signaled, or the buffer is aborted — bounded by `timeout`.
    ///
    /// This is the only blocking primitive in the subsystem.
    pub fn wait_for_size(&self, min_len: usize, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();

        loop {
            if state.aborted {
                return WaitOutcome::Aborted;
            }
            if state.len >= min_len {
                return WaitOutcome::Ready;
            }
            if state.end_of_data {
                return WaitOutcome::EndOfData;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::TimedOut;
            }
            self.inner.cond.wait_for(&mut state, remaining);
        }
    }

    /// Mark that no more bytes will ever be pushed. Idempotent.
    pub fn signal_end_of_data(&self) {
        let mut state = self.inner.state.lock();
        state.end_of_data = true;
        drop(state);
        self.inner.cond.notify_all();
    }

    /// Wake every waiter and make all subsequent pushes fail. Idempotent.
    pub fn abort(&self) {
        let mut state = self.inner.state.lock();
        state.aborted = true;
        drop(state);
        self.inner.cond.notify_all();
    }

    /// Enlarge the buffer to `new_capacity`.
    ///
    /// Only valid while the buffer is drained; used when a caller
    /// underestimated the leading-metadata size.
    ///
    /// # Errors
    ///
    /// [`BufError::ShrinkRequested`] if `new_capacity` is below the current
    /// capacity, [`BufError::NotEmpty`] if any bytes are still buffered.
    pub fn grow_to(&self, new_capacity: usize) -> BufResult<()> {
        let mut state = self.inner.state.lock();
        if new_capacity < state.buf.len() {
            return Err(BufError::ShrinkRequested {
                requested: new_capacity,
                capacity: state.buf.len(),
            });
        }
        if state.len > 0 {
            return Err(BufError::NotEmpty { occupied: state.len });
        }
        state.buf = vec![0u8; new_capacity];
        state.head = 0;
        Ok(())
    }
}
