//! The real-time output handoff to the host audio callback.
//!
//! Two fixed-size stereo slots, an atomic active-slot index, and a
//! per-slot atomic `ready` flag. The producer (audio processing thread)
//! writes into the inactive slot and publishes it with a release store;
//! the consumer (host callback) does an acquire load of the active index,
//! an acquire load of that slot's `ready` flag, a bounded copy, and a
//! release clear of `ready` — no mutex is ever touched from the consumer
//! side, satisfying the callback's non-blocking contract.
//!
//! The slot data itself lives behind [`UnsafeCell`] rather than a mutex,
//! since the consumer runs on the host's real-time audio callback and must
//! never take a lock. Safety rests on there being exactly one producer and
//! one consumer per buffer, and on the producer never touching a slot the
//! active index still points at (it always writes the *other* slot first,
//! then republishes the index).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::worker::MAX_BUFFER_SIZE;

struct Slot {
    left: UnsafeCell<[f32; MAX_BUFFER_SIZE]>,
    right: UnsafeCell<[f32; MAX_BUFFER_SIZE]>,
    len: AtomicUsize,
    ready: AtomicU8,
    timestamp_us: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            left: UnsafeCell::new([0.0; MAX_BUFFER_SIZE]),
            right: UnsafeCell::new([0.0; MAX_BUFFER_SIZE]),
            len: AtomicUsize::new(0),
            ready: AtomicU8::new(0),
            timestamp_us: AtomicU64::new(0),
        }
    }
}

// SAFETY: the only live mutable access to a `Slot`'s arrays is from the
// single producer (while `ready == 0`) or the single consumer (while
// `ready == 1`, until it clears it back to 0); the two never overlap
// because the producer only ever writes the slot the active index does
// *not* currently reference.
unsafe impl Sync for Slot {}

/// A double-buffered stereo handoff from one producer thread to one
/// consumer (the host's pull callback).
pub struct RtOutputBuffer {
    slots: [Slot; 2],
    active: AtomicUsize,
    underrun_count: AtomicU64,
    consumed_lock: Mutex<()>,
    consumed_cv: Condvar,
}

impl Default for RtOutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RtOutputBuffer {
    pub fn new() -> Self {
        Self {
            slots: [Slot::new(), Slot::new()],
            active: AtomicUsize::new(0),
            underrun_count: AtomicU64::new(0),
            consumed_lock: Mutex::new(()),
            consumed_cv: Condvar::new(),
        }
    }

    /// Producer side: writes `left`/`right` (each `len <= MAX_BUFFER_SIZE`
    /// samples) into the inactive slot and publishes it.
    ///
    /// # Panics
    ///
    /// Panics if `left.len() != right.len()` or either exceeds
    /// `MAX_BUFFER_SIZE`. Both are programmer errors the worker pool's
    /// fixed-size scratch should make unreachable.
    pub fn publish(&self, left: &[f32], right: &[f32], timestamp_us: u64) {
        assert_eq!(left.len(), right.len());
        assert!(left.len() <= MAX_BUFFER_SIZE);

        let inactive = 1 - self.active.load(Ordering::Acquire);
        let slot = &self.slots[inactive];

        // SAFETY: `inactive` is not the slot the active index currently
        // references, so the consumer cannot be reading it concurrently.
        unsafe {
            (*slot.left.get())[..left.len()].copy_from_slice(left);
            (*slot.right.get())[..right.len()].copy_from_slice(right);
        }
        slot.len.store(left.len(), Ordering::Relaxed);
        slot.timestamp_us.store(timestamp_us, Ordering::Relaxed);
        slot.ready.store(1, Ordering::Release);
        self.active.store(inactive, Ordering::Release);
    }

    /// Consumer side: the host's pull callback. Copies up to
    /// `out_left.len()` samples into `out_left`/`out_right`. If the active
    /// slot is not ready (the producer has fallen behind), fills both with
    /// silence and returns `false` — this is the defined xrun behavior at
    /// the core boundary. Never blocks, never allocates, never
    /// takes a lock.
    pub fn consume_into(&self, out_left: &mut [f32], out_right: &mut [f32]) -> bool {
        debug_assert_eq!(out_left.len(), out_right.len());

        let idx = self.active.load(Ordering::Acquire);
        let slot = &self.slots[idx];

        if slot.ready.load(Ordering::Acquire) == 0 {
            out_left.fill(0.0);
            out_right.fill(0.0);
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let available = slot.len.load(Ordering::Relaxed);
        let n = available.min(out_left.len());

        // SAFETY: `ready == 1` and we have not yet cleared it, so the
        // producer will not touch this slot until our release-store below.
        unsafe {
            out_left[..n].copy_from_slice(&(*slot.left.get())[..n]);
            out_right[..n].copy_from_slice(&(*slot.right.get())[..n]);
        }
        if n < out_left.len() {
            out_left[n..].fill(0.0);
            out_right[n..].fill(0.0);
        }

        slot.ready.store(0, Ordering::Release);
        // Wakes the producer if it's parked in `wait_for_consumption`. This
        // does not acquire `consumed_lock`, so it cannot block the caller.
        self.consumed_cv.notify_one();

        true
    }

    /// Producer side: blocks (with a bounded timeout so a stalled callback
    /// cannot deadlock shutdown) until the consumer has cleared a slot's
    /// `ready` flag, or until `timeout` elapses.
    pub fn wait_for_consumption(&self, timeout: Duration) {
        let mut guard = self.consumed_lock.lock();
        self.consumed_cv.wait_for(&mut guard, timeout);
    }

    /// Total number of times [`Self::consume_into`] observed an unready
    /// slot. Monitored from a non-RT context to log underruns without
    /// logging from the callback itself.
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

/// The contract a host audio device implements against this crate. The core
/// never calls these itself; an embedding program's pull callback does.
pub trait AudioSink {
    fn prepare(&mut self, sample_rate: u32, block_size: usize);
    /// Must be non-blocking on the real-time thread: no mutex, no
    /// allocation, bounded copies only.
    fn pull(&mut self, out_left: &mut [f32], out_right: &mut [f32]);
    fn release(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_without_publish_yields_silence() {
        let buf = RtOutputBuffer::new();
        let mut l = vec![1.0; 8];
        let mut r = vec![1.0; 8];
        let produced = buf.consume_into(&mut l, &mut r);
        assert!(!produced);
        assert!(l.iter().all(|&v| v == 0.0));
        assert!(r.iter().all(|&v| v == 0.0));
        assert_eq!(buf.underrun_count(), 1);
    }

    #[test]
    fn publish_then_consume_roundtrips() {
        let buf = RtOutputBuffer::new();
        let left = vec![0.25; 4];
        let right = vec![-0.25; 4];
        buf.publish(&left, &right, 0);

        let mut out_l = vec![0.0; 4];
        let mut out_r = vec![0.0; 4];
        let produced = buf.consume_into(&mut out_l, &mut out_r);

        assert!(produced);
        assert_eq!(out_l, left);
        assert_eq!(out_r, right);
    }

    #[test]
    fn slot_is_not_reread_after_consumption() {
        let buf = RtOutputBuffer::new();
        buf.publish(&[1.0; 2], &[1.0; 2], 0);

        let mut l = vec![0.0; 2];
        let mut r = vec![0.0; 2];
        assert!(buf.consume_into(&mut l, &mut r));

        // ready was cleared; a second consume before the next publish must
        // report underrun, never replay the old block.
        let produced_again = buf.consume_into(&mut l, &mut r);
        assert!(!produced_again);
    }

    #[test]
    fn short_publish_zero_fills_remainder() {
        let buf = RtOutputBuffer::new();
        buf.publish(&[0.5, 0.5], &[0.5, 0.5], 0);

        let mut l = vec![9.0; 4];
        let mut r = vec![9.0; 4];
        buf.consume_into(&mut l, &mut r);

        assert_eq!(&l[..2], &[0.5, 0.5]);
        assert_eq!(&l[2..], &[0.0, 0.0]);
    }
}
