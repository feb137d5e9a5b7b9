//! The waveform bank: a minimum-memory sinusoidal table shared
//! by every note.
//!
//! Only one cycle per microtone ("comma") step of the *lowest* octave is
//! stored. A note in a higher octave reuses that cycle by striding through
//! it with `octave_coeff = 2^octave` samples at a time, which is exactly
//! equivalent to resampling the same periodic waveform at twice the rate
//! per octave — no extra storage, no extra generation work.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Clamp floor for any computed period length, in samples. A period of 0
/// or 1 samples cannot represent a sinusoid at all.
const MIN_AREA_SIZE: usize = 2;

/// The geometry a single note needs to read the shared table: where its
/// reference-octave cycle starts, how long that cycle is, the octave
/// stride, and the note's own (octave-scaled) period length.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoteGeometry {
    pub frequency: f32,
    /// Samples per period at this note's own (possibly higher-octave)
    /// frequency. The note's phase accumulator wraps modulo this value.
    pub area_size: usize,
    /// `2^octave`: the stride into the shared reference-octave cycle.
    pub octave_coeff: usize,
    /// Offset of this note's reference-octave cycle within the shared
    /// table.
    pub start_index: usize,
    /// Length of that reference-octave cycle, in samples.
    pub cycle_len: usize,
}

/// A pending hot-reload request for the frequency range, honored
/// synchronously between audio blocks.
struct ReloadRequest {
    pending: AtomicBool,
    low_bits: AtomicU32,
    high_bits: AtomicU32,
}

impl ReloadRequest {
    fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            low_bits: AtomicU32::new(0),
            high_bits: AtomicU32::new(0),
        }
    }

    fn request(&self, low: f32, high: f32) {
        self.low_bits.store(low.to_bits(), Ordering::Relaxed);
        self.high_bits.store(high.to_bits(), Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
    }

    /// Atomically takes the pending request, if any.
    fn take(&self) -> Option<(f32, f32)> {
        if self
            .pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let low = f32::from_bits(self.low_bits.load(Ordering::Relaxed));
        let high = f32::from_bits(self.high_bits.load(Ordering::Relaxed));
        Some((low, high))
    }
}

/// The shared reference-octave cycle table, read-only after construction
/// except for a full (but block-synchronous) rebuild on hot reload.
pub struct WaveformBank {
    table: Vec<f32>,
    reload: ReloadRequest,
}

impl WaveformBank {
    /// Builds the table and the per-note geometry for `num_notes` notes
    /// logarithmically distributed from `low_frequency` to `high_frequency`.
    ///
    /// Deterministic given `(low_frequency, high_frequency, num_notes,
    /// sample_rate, comma_per_semitone, semitone_per_octave)` — bit-identical
    /// on re-init.
    pub fn build(
        low_frequency: f32,
        high_frequency: f32,
        num_notes: usize,
        sample_rate: f32,
        comma_per_semitone: u32,
        semitone_per_octave: u32,
    ) -> (Self, Vec<NoteGeometry>) {
        let commas_per_octave = (comma_per_semitone * semitone_per_octave).max(1) as usize;

        // One stored cycle per comma of the reference (lowest) octave.
        let mut cycle_starts = Vec::with_capacity(commas_per_octave);
        let mut cycle_lens = Vec::with_capacity(commas_per_octave);
        let mut table = Vec::new();

        for c in 0..commas_per_octave {
            let freq = low_frequency * 2f32.powf(c as f32 / commas_per_octave as f32);
            let len = (sample_rate / freq).round().max(MIN_AREA_SIZE as f32) as usize;

            cycle_starts.push(table.len());
            cycle_lens.push(len);

            for i in 0..len {
                let phase = i as f32 / len as f32;
                table.push((phase * std::f32::consts::TAU).sin());
            }
        }

        let notes = Self::build_geometry(
            low_frequency,
            high_frequency,
            num_notes,
            commas_per_octave,
            &cycle_starts,
            &cycle_lens,
        );

        (Self { table, reload: ReloadRequest::new() }, notes)
    }

    fn build_geometry(
        low_frequency: f32,
        high_frequency: f32,
        num_notes: usize,
        commas_per_octave: usize,
        cycle_starts: &[usize],
        cycle_lens: &[usize],
    ) -> Vec<NoteGeometry> {
        let mut notes = Vec::with_capacity(num_notes);
        let ratio = (high_frequency / low_frequency).max(1.0);

        for n in 0..num_notes {
            let t = if num_notes > 1 { n as f32 / (num_notes - 1) as f32 } else { 0.0 };
            let target_freq = low_frequency * ratio.powf(t);

            let octave = (target_freq / low_frequency).log2().floor().max(0.0);
            let octave_coeff = 2usize.pow(octave as u32);

            let freq_in_ref_octave = target_freq / octave_coeff as f32;
            let comma_index = ((freq_in_ref_octave / low_frequency).log2()
                * commas_per_octave as f32)
                .round()
                .clamp(0.0, (commas_per_octave - 1) as f32) as usize;

            let cycle_len = cycle_lens[comma_index];
            let area_size = (cycle_len / octave_coeff).max(MIN_AREA_SIZE);
            let snapped_freq =
                low_frequency * 2f32.powf(comma_index as f32 / commas_per_octave as f32)
                    * octave_coeff as f32;

            notes.push(NoteGeometry {
                frequency: snapped_freq,
                area_size,
                octave_coeff,
                start_index: cycle_starts[comma_index],
                cycle_len,
            });
        }

        notes
    }

    /// Reads the sample at table offset `geometry.start_index +
    /// (phase * geometry.octave_coeff) % geometry.cycle_len`.
    #[inline]
    pub fn sample(&self, geometry: &NoteGeometry, phase: usize) -> f32 {
        let offset = (phase * geometry.octave_coeff) % geometry.cycle_len;
        self.table[geometry.start_index + offset]
    }

    /// Requests a hot reload of the frequency range. Honored by
    /// [`Self::apply_pending_reload`] between audio blocks.
    pub fn request_reload(&self, low_frequency: f32, high_frequency: f32) {
        self.reload.request(low_frequency, high_frequency);
    }

    /// If a reload is pending, rebuilds the table and geometry for
    /// `num_notes` notes and returns the new geometry. Must only be called
    /// while the worker pool is parked at the start barrier.
    pub fn apply_pending_reload(
        &mut self,
        num_notes: usize,
        sample_rate: f32,
        comma_per_semitone: u32,
        semitone_per_octave: u32,
    ) -> Option<Vec<NoteGeometry>> {
        let (low, high) = self.reload.take()?;
        let (rebuilt, notes) = Self::build(
            low,
            high,
            num_notes,
            sample_rate,
            comma_per_semitone,
            semitone_per_octave,
        );
        self.table = rebuilt.table;
        Some(notes)
    }
}
