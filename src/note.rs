//! Per-note DSP state and envelope coefficients.

use rand::Rng;

use crate::waveform::NoteGeometry;

/// Floor for [`EnvelopeCoeffs::alpha_up`] — an attack coefficient of exactly
/// zero would mean a note can never rise toward its target.
pub const ALPHA_MIN: f32 = 1e-6;
/// Bounds for [`EnvelopeCoeffs::alpha_down_weighted`] after frequency
/// weighting, so an extreme `decay_freq_beta` cannot produce a coefficient
/// of zero (note never decays) or above one (overshoots in a single step).
pub const DECAY_MIN: f32 = 1e-6;
pub const DECAY_MAX: f32 = 1.0;

/// Precomputed one-pole envelope coefficients for a single note.
/// Kept free of `exp`/`log` on the block path — recomputed only at init or
/// when the attack/release time constants change.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EnvelopeCoeffs {
    pub alpha_up: f32,
    pub alpha_down_weighted: f32,
}

/// Computes `(alpha_up, alpha_down_weighted)` for a note at `frequency` Hz.
///
/// `alpha_down_weighted` is frequency-weighted so higher partials decay
/// faster than lower ones, via `alpha_down * (f / f_ref)^(-beta)`.
pub fn compute_envelope_coeffs(
    tau_up_s: f32,
    tau_down_s: f32,
    frequency: f32,
    decay_freq_ref_hz: f32,
    decay_freq_beta: f32,
    sample_rate: f32,
) -> EnvelopeCoeffs {
    let alpha_up = (1.0 - (-1.0 / (tau_up_s * sample_rate)).exp()).clamp(ALPHA_MIN, 1.0);

    let alpha_down = 1.0 - (-1.0 / (tau_down_s * sample_rate)).exp();
    let freq_weight = (frequency / decay_freq_ref_hz).powf(-decay_freq_beta);
    let alpha_down_weighted = (alpha_down * freq_weight).clamp(DECAY_MIN, DECAY_MAX);

    EnvelopeCoeffs { alpha_up, alpha_down_weighted }
}

/// One pitch slot's complete DSP state.
#[derive(Clone, Copy, Debug)]
pub struct Note {
    pub geometry: NoteGeometry,
    /// Phase accumulator; always `< geometry.area_size`. Mutated only
    /// during precomputation of the next block.
    pub current_index: usize,
    pub current_volume: f32,
    pub target_volume: f32,
    pub coeffs: EnvelopeCoeffs,
    /// Pan gains actually applied at the end of the previous block, so the
    /// worker can linearly ramp toward this block's target gains instead of
    /// stepping them.
    pub last_left_gain: f32,
    pub last_right_gain: f32,
}

impl Note {
    fn new(geometry: NoteGeometry, coeffs: EnvelopeCoeffs, initial_phase: usize) -> Self {
        let area_size = geometry.area_size.max(1);
        Self {
            geometry,
            current_index: initial_phase % area_size,
            current_volume: 0.0,
            target_volume: 0.0,
            coeffs,
            last_left_gain: std::f32::consts::FRAC_1_SQRT_2,
            last_right_gain: std::f32::consts::FRAC_1_SQRT_2,
        }
    }

    /// Recomputes this note's envelope coefficients; called when the
    /// attack/release time constants change, never on the
    /// per-sample path.
    pub fn recompute_coeffs(
        &mut self,
        tau_up_s: f32,
        tau_down_s: f32,
        decay_freq_ref_hz: f32,
        decay_freq_beta: f32,
        sample_rate: f32,
    ) {
        self.coeffs = compute_envelope_coeffs(
            tau_up_s,
            tau_down_s,
            self.geometry.frequency,
            decay_freq_ref_hz,
            decay_freq_beta,
            sample_rate,
        );
    }
}

/// The complete note bank: one [`Note`] per pitch slot.
pub struct NoteBank {
    notes: Vec<Note>,
}

impl NoteBank {
    /// Builds a note per entry in `geometries`, with envelope coefficients
    /// from `(tau_up_s, tau_down_s, decay_freq_ref_hz, decay_freq_beta,
    /// sample_rate)` and a randomized initial phase per note.
    pub fn new(
        geometries: &[NoteGeometry],
        tau_up_s: f32,
        tau_down_s: f32,
        decay_freq_ref_hz: f32,
        decay_freq_beta: f32,
        sample_rate: f32,
    ) -> Self {
        let mut rng = rand::rng();
        let notes = geometries
            .iter()
            .map(|&geometry| {
                let coeffs = compute_envelope_coeffs(
                    tau_up_s,
                    tau_down_s,
                    geometry.frequency,
                    decay_freq_ref_hz,
                    decay_freq_beta,
                    sample_rate,
                );
                let initial_phase = rng.random_range(0..geometry.area_size.max(1));
                Note::new(geometry, coeffs, initial_phase)
            })
            .collect();

        Self { notes }
    }

    /// Replaces every note's geometry (used after a waveform-bank hot
    /// reload) while preserving its current envelope state, re-deriving
    /// coefficients for the new frequency and clamping the phase into the
    /// new, possibly-shorter period.
    pub fn apply_new_geometry(
        &mut self,
        geometries: &[NoteGeometry],
        tau_up_s: f32,
        tau_down_s: f32,
        decay_freq_ref_hz: f32,
        decay_freq_beta: f32,
        sample_rate: f32,
    ) {
        for (note, &geometry) in self.notes.iter_mut().zip(geometries) {
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

    /// Recomputes every note's envelope coefficients in place, e.g. after
    /// the attack/release time constants change.
    pub fn recompute_all_coeffs(
        &mut self,
        tau_up_s: f32,
        tau_down_s: f32,
        decay_freq_ref_hz: f32,
        decay_freq_beta: f32,
        sample_rate: f32,
    ) {
        for note in &mut self.notes {
            note.recompute_coeffs(
                tau_up_s,
                tau_down_s,
                decay_freq_ref_hz,
                decay_freq_beta,
                sample_rate,
            );
        }
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn as_slice(&self) -> &[Note] {
        &self.notes
    }

    pub fn partition_mut(&mut self, range: std::ops::Range<usize>) -> &mut [Note] {
        &mut self.notes[range]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_up_increases_with_shorter_attack() {
        let fast = compute_envelope_coeffs(0.001, 0.1, 440.0, 440.0, 0.25, 48_000.0);
        let slow = compute_envelope_coeffs(0.1, 0.1, 440.0, 440.0, 0.25, 48_000.0);
        assert!(fast.alpha_up > slow.alpha_up);
    }

    #[test]
    fn higher_partials_decay_faster() {
        let low = compute_envelope_coeffs(0.01, 0.1, 110.0, 440.0, 0.25, 48_000.0);
        let high = compute_envelope_coeffs(0.01, 0.1, 4_000.0, 440.0, 0.25, 48_000.0);
        assert!(high.alpha_down_weighted > low.alpha_down_weighted);
    }

    #[test]
    fn coefficients_are_always_in_bounds() {
        for freq in [20.0, 110.0, 440.0, 8_000.0, 20_000.0] {
            let c = compute_envelope_coeffs(0.001, 0.001, freq, 440.0, 2.0, 48_000.0);
            assert!((ALPHA_MIN..=1.0).contains(&c.alpha_up));
            assert!((DECAY_MIN..=DECAY_MAX).contains(&c.alpha_down_weighted));
        }
    }

    #[test]
    fn initial_phase_is_within_area_size() {
        let (_bank, geometries) =
            crate::waveform::WaveformBank::build(55.0, 880.0, 64, 48_000.0, 1, 12);
        let notes = NoteBank::new(&geometries, 0.01, 0.1, 440.0, 0.25, 48_000.0);
        for note in notes.as_slice() {
            assert!(note.current_index < note.geometry.area_size);
        }
    }
}
