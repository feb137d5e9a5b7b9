//! The additive synthesis worker pool.
//!
//! A persistent pool of threads, each owning a disjoint, contiguous range of
//! notes for the lifetime of the engine. Every audio block, the pool:
//!
//! 1. publishes the block length and releases every worker at the start
//!    barrier,
//! 2. each worker copies this block's targets for its own notes out of the
//!    [`crate::sync::double_buffer::PreprocessedDoubleBuffer`] (one lock,
//!    one batched copy — never per note), advances its notes' envelopes and
//!    pan ramps sample-by-sample, and accumulates its own stereo partial
//!    sum,
//! 3. every worker waits at the done barrier before the mixer reads the
//!    partial sums.
//!
//! Repartitioning (changing `num_workers` or `num_notes`) requires a full
//! pool rebuild; it is not supported while the pool is running.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use atomic::Atomic;
use parking_lot::{Mutex, RwLock};

use crate::note::{Note, NoteBank};
use crate::pow_lut::response_pow;
use crate::sync::{Barrier, PreprocessedDoubleBuffer, WaitResult};
use crate::waveform::WaveformBank;

/// Upper bound on an audio block's frame count. Every fixed-size scratch
/// buffer on the RT path is sized to this at startup so no block-processing
/// code ever allocates.
pub const MAX_BUFFER_SIZE: usize = 4096;

/// One worker's accumulated contribution for the current block: an unpanned
/// mono sum, the panned stereo sums, and the two envelope tracks the mixer's
/// response curve normalizes against.
pub struct WorkerPartialSum {
    pub mono: [f32; MAX_BUFFER_SIZE],
    pub left: [f32; MAX_BUFFER_SIZE],
    pub right: [f32; MAX_BUFFER_SIZE],
    /// Element-wise max of every note's current envelope in this partition.
    pub max_envelope: [f32; MAX_BUFFER_SIZE],
    /// Sum of every note's `envelope ^ volume_weighting_exponent` in this
    /// partition — the mixer's normalization denominator input.
    pub sum_envelope: [f32; MAX_BUFFER_SIZE],
    pub len: usize,
}

impl WorkerPartialSum {
    fn silence() -> Self {
        Self {
            mono: [0.0; MAX_BUFFER_SIZE],
            left: [0.0; MAX_BUFFER_SIZE],
            right: [0.0; MAX_BUFFER_SIZE],
            max_envelope: [0.0; MAX_BUFFER_SIZE],
            sum_envelope: [0.0; MAX_BUFFER_SIZE],
            len: 0,
        }
    }
}

/// Splits `num_notes` notes into `num_workers` contiguous, disjoint, nearly
/// equal ranges. The first `num_notes % num_workers` workers get one extra
/// note, so every note is covered exactly once and no range is empty as
/// long as `num_workers <= num_notes`.
pub fn partition_notes(num_notes: usize, num_workers: usize) -> Vec<Range<usize>> {
    assert!(num_workers > 0 && num_workers <= num_notes);

    let base = num_notes / num_workers;
    let remainder = num_notes % num_workers;

    let mut ranges = Vec::with_capacity(num_workers);
    let mut start = 0;
    for worker in 0..num_workers {
        let len = base + usize::from(worker < remainder);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

struct WorkerContext {
    range: Range<usize>,
    notes: Arc<Mutex<Vec<Note>>>,
    waveform: Arc<RwLock<WaveformBank>>,
    frame_buffer: Arc<PreprocessedDoubleBuffer>,
    start_barrier: Arc<Barrier>,
    done_barrier: Arc<Barrier>,
    must_exit: Arc<AtomicBool>,
    block_len: Arc<AtomicUsize>,
    partial_sum: Arc<Mutex<WorkerPartialSum>>,
    volume_weighting_exponent: Arc<Atomic<f32>>,
    stereo_enabled: Arc<AtomicBool>,
}

fn worker_main(ctx: WorkerContext) {
    if let Err(err) =
        thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
    {
        log::warn!("could not raise synthesis worker thread priority: {err:?}");
    }

    let partition_len = ctx.range.len();
    let mut target_volume = vec![0.0f32; partition_len];
    let mut target_left_gain = vec![std::f32::consts::FRAC_1_SQRT_2; partition_len];
    let mut target_right_gain = vec![std::f32::consts::FRAC_1_SQRT_2; partition_len];

    loop {
        if let WaitResult::ShuttingDown = ctx.start_barrier.wait() {
            return;
        }
        if ctx.must_exit.load(Ordering::Acquire) {
            ctx.done_barrier.wait();
            continue;
        }

        let len = ctx.block_len.load(Ordering::Acquire).min(MAX_BUFFER_SIZE);
        let stereo_enabled = ctx.stereo_enabled.load(Ordering::Relaxed);
        let volume_weighting_exponent = ctx.volume_weighting_exponent.load(Ordering::Relaxed);

        ctx.frame_buffer.read(|frame| {
            for (i, idx) in ctx.range.clone().enumerate() {
                target_volume[i] = frame.additive.notes[idx];
                target_left_gain[i] = frame.stereo.left_gains[idx];
                target_right_gain[i] = frame.stereo.right_gains[idx];
            }
        });

        {
            let waveform = ctx.waveform.read();
            let mut sum = ctx.partial_sum.lock();
            sum.mono[..len].fill(0.0);
            sum.left[..len].fill(0.0);
            sum.right[..len].fill(0.0);
            sum.max_envelope[..len].fill(0.0);
            sum.sum_envelope[..len].fill(0.0);

            let mut notes = ctx.notes.lock();
            for (i, note) in notes.iter_mut().enumerate() {
                let area_size = note.geometry.area_size;
                let gain_step_l = (target_left_gain[i] - note.last_left_gain) / len.max(1) as f32;
                let gain_step_r =
                    (target_right_gain[i] - note.last_right_gain) / len.max(1) as f32;
                let mut left_gain = note.last_left_gain;
                let mut right_gain = note.last_right_gain;

                note.target_volume = target_volume[i];

                for s in 0..len {
                    let alpha = if note.target_volume >= note.current_volume {
                        note.coeffs.alpha_up
                    } else {
                        note.coeffs.alpha_down_weighted
                    };
                    note.current_volume += alpha * (note.target_volume - note.current_volume);

                    let sample = waveform.sample(&note.geometry, note.current_index);
                    let voiced = sample * note.current_volume;

                    sum.mono[s] += voiced;
                    if stereo_enabled {
                        sum.left[s] += voiced * left_gain;
                        sum.right[s] += voiced * right_gain;
                    }

                    sum.max_envelope[s] = sum.max_envelope[s].max(note.current_volume);
                    sum.sum_envelope[s] +=
                        response_pow(note.current_volume, 1.0 / volume_weighting_exponent.max(1e-6));

                    left_gain += gain_step_l;
                    right_gain += gain_step_r;
                    note.current_index = (note.current_index + 1) % area_size;
                }

                note.last_left_gain = target_left_gain[i];
                note.last_right_gain = target_right_gain[i];
            }

            sum.len = len;
        }

        ctx.done_barrier.wait();
    }
}

/// Owns the persistent worker threads and the shared state they read and
/// write each block. Constructed once per engine lifetime; `num_workers`
/// cannot change without rebuilding the pool.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    start_barrier: Arc<Barrier>,
    done_barrier: Arc<Barrier>,
    must_exit: Arc<AtomicBool>,
    block_len: Arc<AtomicUsize>,
    partial_sums: Vec<Arc<Mutex<WorkerPartialSum>>>,
    ranges: Vec<Range<usize>>,
    note_handles: Vec<Arc<Mutex<Vec<Note>>>>,
    volume_weighting_exponent: Arc<Atomic<f32>>,
    stereo_enabled: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `num_workers` threads, each owning a contiguous partition of
    /// `notes` per [`partition_notes`].
    pub fn new(
        num_workers: usize,
        notes: NoteBank,
        waveform: Arc<RwLock<WaveformBank>>,
        frame_buffer: Arc<PreprocessedDoubleBuffer>,
        volume_weighting_exponent: f32,
        stereo_enabled: bool,
    ) -> Self {
        let num_notes = notes.len();
        let ranges = partition_notes(num_notes, num_workers);

        let must_exit = Arc::new(AtomicBool::new(false));
        // Participants = workers + 1 (the audio thread also waits at the
        // done barrier before reading partial sums).
        let start_barrier = Arc::new(Barrier::new(num_workers + 1, Arc::clone(&must_exit)));
        let done_barrier = Arc::new(Barrier::new(num_workers + 1, Arc::clone(&must_exit)));
        let block_len = Arc::new(AtomicUsize::new(0));
        let volume_weighting_exponent = Arc::new(Atomic::new(volume_weighting_exponent));
        let stereo_enabled = Arc::new(AtomicBool::new(stereo_enabled));

        let mut notes = notes;
        let mut handles = Vec::with_capacity(num_workers);
        let mut partial_sums = Vec::with_capacity(num_workers);
        let mut note_handles = Vec::with_capacity(num_workers);

        for range in ranges.clone() {
            let partition: Vec<Note> = notes.partition_mut(range.clone()).to_vec();
            let notes_handle = Arc::new(Mutex::new(partition));
            note_handles.push(Arc::clone(&notes_handle));

            let partial_sum = Arc::new(Mutex::new(WorkerPartialSum::silence()));
            partial_sums.push(Arc::clone(&partial_sum));

            let ctx = WorkerContext {
                range,
                notes: notes_handle,
                waveform: Arc::clone(&waveform),
                frame_buffer: Arc::clone(&frame_buffer),
                start_barrier: Arc::clone(&start_barrier),
                done_barrier: Arc::clone(&done_barrier),
                must_exit: Arc::clone(&must_exit),
                block_len: Arc::clone(&block_len),
                partial_sum,
                volume_weighting_exponent: Arc::clone(&volume_weighting_exponent),
                stereo_enabled: Arc::clone(&stereo_enabled),
            };

            let handle = std::thread::Builder::new()
                .name("sp3ctra-worker".to_string())
                .spawn(move || worker_main(ctx))
                .expect("failed to spawn synthesis worker thread");

            handles.push(handle);
        }

        Self {
            handles,
            start_barrier,
            done_barrier,
            must_exit,
            block_len,
            partial_sums,
            ranges,
            note_handles,
            volume_weighting_exponent,
            stereo_enabled,
        }
    }

    /// Updates the envelope-weighting exponent used by every worker's
    /// response-curve input, effective from the next block. Lock-free: a
    /// plain atomic store, safe to call from the control thread at any time.
    pub fn set_volume_weighting_exponent(&self, exponent: f32) {
        self.volume_weighting_exponent.store(exponent, Ordering::Relaxed);
    }

    /// Toggles whether workers accumulate panned stereo sums, effective from
    /// the next block.
    pub fn set_stereo_enabled(&self, enabled: bool) {
        self.stereo_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Applies new note geometry (e.g. from a waveform bank hot reload) to
    /// every worker's partition, re-deriving each note's envelope
    /// coefficients for its new frequency so `alpha_down_weighted` stays
    /// correct for the post-reload geometry.
    ///
    /// # Safety requirement
    ///
    /// Must only be called between rounds — after a [`Self::run_block`]
    /// call has returned and before the next one starts. The audio thread
    /// is itself a barrier participant, so as long as it calls this only in
    /// that window, no worker is touching its partition concurrently; this
    /// method does still take each partition's mutex defensively.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_geometry_reload(
        &self,
        geometries: &[crate::waveform::NoteGeometry],
        tau_up_s: f32,
        tau_down_s: f32,
        decay_freq_ref_hz: f32,
        decay_freq_beta: f32,
        sample_rate: f32,
    ) {
        for (range, handle) in self.ranges.iter().zip(&self.note_handles) {
            let mut notes = handle.lock();
            for (note, &geometry) in notes.iter_mut().zip(&geometries[range.clone()]) {
                note.geometry = geometry;
                note.current_index %= geometry.area_size.max(1);
                note.recompute_coeffs(
                    tau_up_s,
                    tau_down_s,
                    decay_freq_ref_hz,
                    decay_freq_beta,
                    sample_rate,
                );
            }
        }
    }

    /// Runs one block of length `len` (`<= MAX_BUFFER_SIZE`) across every
    /// worker and blocks until they've all finished, or until shutdown is
    /// observed.
    ///
    /// On return, [`Self::partial_sums`] holds each worker's contribution
    /// for this block, ready for the mixer to combine.
    pub fn run_block(&self, len: usize) -> WaitResult {
        debug_assert!(len <= MAX_BUFFER_SIZE);
        self.block_len.store(len, Ordering::Release);

        if let WaitResult::ShuttingDown = self.start_barrier.wait() {
            return WaitResult::ShuttingDown;
        }
        self.done_barrier.wait()
    }

    pub fn partial_sums(&self) -> &[Arc<Mutex<WorkerPartialSum>>] {
        &self.partial_sums
    }

    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.must_exit.store(true, Ordering::Release);
        self.start_barrier.release_all();
        self.done_barrier.release_all();

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::note::NoteBank;

    #[test]
    fn partition_covers_every_note_exactly_once() {
        let ranges = partition_notes(10, 3);
        let mut covered = vec![false; 10];
        for range in &ranges {
            for idx in range.clone() {
                assert!(!covered[idx], "note {idx} covered twice");
                covered[idx] = true;
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn partition_is_contiguous_and_ordered() {
        let ranges = partition_notes(3456, 8);
        assert_eq!(ranges.len(), 8);
        let mut next_start = 0;
        for range in &ranges {
            assert_eq!(range.start, next_start);
            assert!(!range.is_empty());
            next_start = range.end;
        }
        assert_eq!(next_start, 3456);
    }

    #[test]
    #[should_panic]
    fn partition_rejects_more_workers_than_notes() {
        partition_notes(2, 4);
    }

    #[test]
    fn pool_produces_nonzero_output_for_a_loud_frame() {
        let (waveform, geometries) = WaveformBank::build(55.0, 880.0, 16, 48_000.0, 1, 12);
        let notes = NoteBank::new(&geometries, 0.001, 0.05, 440.0, 0.25, 48_000.0);
        let waveform = Arc::new(RwLock::new(waveform));
        let frame_buffer = Arc::new(PreprocessedDoubleBuffer::new(16, 1));
        frame_buffer.write(|frame| {
            frame.additive.notes.fill(1.0);
            frame.valid = true;
        });

        let pool = WorkerPool::new(4, notes, waveform, frame_buffer, 1.5, true);
        for _ in 0..200 {
            assert_eq!(pool.run_block(64), WaitResult::Completed);
        }

        let any_nonzero = pool.partial_sums().iter().any(|sum| {
            let sum = sum.lock();
            sum.mono[..sum.len].iter().any(|&v| v.abs() > 1e-4)
        });
        assert!(any_nonzero);
    }

    #[test]
    fn pool_shuts_down_promptly_on_drop() {
        let (waveform, geometries) = WaveformBank::build(55.0, 880.0, 8, 48_000.0, 1, 12);
        let notes = NoteBank::new(&geometries, 0.01, 0.1, 440.0, 0.25, 48_000.0);
        let waveform = Arc::new(RwLock::new(waveform));
        let frame_buffer = Arc::new(PreprocessedDoubleBuffer::new(8, 1));

        let pool = WorkerPool::new(2, notes, waveform, frame_buffer, 1.5, true);
        let start = std::time::Instant::now();
        drop(pool);
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
