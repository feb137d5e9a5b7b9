//! The preprocessed-frame double buffer.
//!
//! Two [`PreprocessedFrame`]s plus an active-slot index. The preprocessor
//! (image-rate thread) writes into the inactive slot and only then flips
//! the active index, so a reader locking the active slot's mutex never
//! observes a frame that is currently being written. Each worker takes the
//! lock exactly once per block, for one batched copy into its own scratch —
//! never once per note.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::frame::PreprocessedFrame;

pub struct PreprocessedDoubleBuffer {
    slots: [Mutex<PreprocessedFrame>; 2],
    active: AtomicUsize,
}

impl PreprocessedDoubleBuffer {
    pub fn new(num_notes: usize, num_partials: usize) -> Self {
        Self {
            slots: [
                Mutex::new(PreprocessedFrame::zeroed(num_notes, num_partials)),
                Mutex::new(PreprocessedFrame::zeroed(num_notes, num_partials)),
            ],
            active: AtomicUsize::new(0),
        }
    }

    /// Writes a new frame. `build` receives a mutable reference to the
    /// currently-inactive slot, already zeroed from its previous use; it
    /// should overwrite every field and set `valid = true`. The slot is
    /// published (made active) only after `build` returns.
    pub fn write(&self, build: impl FnOnce(&mut PreprocessedFrame)) {
        let inactive = 1 - self.active.load(Ordering::Acquire);
        {
            let mut slot = self.slots[inactive].lock();
            build(&mut slot);
        }
        self.active.store(inactive, Ordering::Release);
    }

    /// Takes the one-lock-per-block batched copy of the current active
    /// frame's contents into `out`, via `copy`. Safe to call concurrently
    /// from multiple workers; they simply serialize briefly on the mutex.
    pub fn read(&self, copy: impl FnOnce(&PreprocessedFrame)) {
        let active = self.active.load(Ordering::Acquire);
        let slot = self.slots[active].lock();
        copy(&slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_see_only_fully_written_frames() {
        let buf = PreprocessedDoubleBuffer::new(4, 2);

        buf.write(|frame| {
            frame.additive.notes.fill(0.5);
            frame.valid = true;
        });

        buf.read(|frame| {
            assert!(frame.valid);
            assert!(frame.additive.notes.iter().all(|&v| v == 0.5));
        });
    }

    #[test]
    fn write_alternates_slots() {
        let buf = PreprocessedDoubleBuffer::new(2, 1);

        buf.write(|frame| frame.additive.notes[0] = 1.0);
        buf.read(|frame| assert_eq!(frame.additive.notes[0], 1.0));

        buf.write(|frame| frame.additive.notes[0] = 2.0);
        buf.read(|frame| assert_eq!(frame.additive.notes[0], 2.0));
    }
}
