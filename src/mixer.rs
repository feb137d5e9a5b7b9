//! The additive mixer: combines the worker pool's per-partition
//! partial sums into one stereo block, applies summation-response
//! normalization, soft limiting, contrast shaping, and an anti-startup
//! fade-in, then hands the result to the caller for publishing.
//!
//! The normalization step is the "how many partials are sounding" to "how
//! loud each one should be" curve: it divides the raw summed signal by a
//! response curve evaluated on the summed *envelope* (not on the signal's
//! own instantaneous magnitude), so loudness tracks how many notes are
//! actually active rather than how their phases happen to line up in a
//! given sample.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::pow_lut::response_pow;
use crate::worker::{WorkerPartialSum, MAX_BUFFER_SIZE};

/// Headroom applied before the response curve, so that `num_notes` notes at
/// full volume cannot clip the curve's input domain outright.
const PRE_SCALE: f32 = 0.35;

/// `summation_response_exponent` values within this tolerance of `2.0` use
/// the direct `sqrt` fast path instead of [`response_pow`].
const SQRT_EXPONENT_EPSILON: f32 = 1e-3;

/// Below this summed-envelope level, output is forced to exact silence
/// rather than dividing by a response curve that is itself near zero.
const SUM_ENVELOPE_EPSILON: f32 = 1e-6;

/// Number of samples over which output ramps from silence to full gain
/// after the mixer is constructed, avoiding a DC step at stream start.
fn fade_in_len(sample_rate: f32) -> usize {
    (sample_rate * 0.05) as usize
}

/// Combines worker output, shapes it, and writes the result into
/// caller-owned output slices. Owned and driven exclusively by the audio
/// processing thread; never shared.
pub struct Mixer {
    summation_response_exponent: f32,
    summation_base_level: f32,
    soft_limit_threshold: f32,
    soft_limit_knee: f32,
    fade_in_len: usize,
    fade_in_progress: usize,
    stereo_enabled: bool,
    /// Scratch summed-envelope buffer, preallocated to avoid any allocation
    /// on the block path.
    sum_envelope_scratch: Box<[f32; MAX_BUFFER_SIZE]>,
    /// Element-wise max envelope across every worker for the last processed
    /// block. Not part of the normalization formula itself; exposed so an
    /// embedding program can drive level metering or a lighting output from
    /// the same per-sample loudness data the mixer already computed.
    max_envelope: Box<[f32; MAX_BUFFER_SIZE]>,
}

impl Mixer {
    pub fn new(
        summation_response_exponent: f32,
        summation_base_level: f32,
        soft_limit_threshold: f32,
        soft_limit_knee: f32,
        sample_rate: f32,
        stereo_enabled: bool,
    ) -> Self {
        Self {
            summation_response_exponent,
            summation_base_level,
            soft_limit_threshold,
            soft_limit_knee,
            fade_in_len: fade_in_len(sample_rate),
            fade_in_progress: 0,
            stereo_enabled,
            sum_envelope_scratch: Box::new([0.0; MAX_BUFFER_SIZE]),
            max_envelope: Box::new([0.0; MAX_BUFFER_SIZE]),
        }
    }

    pub fn set_stereo_enabled(&mut self, enabled: bool) {
        self.stereo_enabled = enabled;
    }

    /// Restarts the anti-click fade from silence. Called by the audio
    /// processing thread whenever it applies a waveform-bank hot reload, so
    /// the table swap rides across a dip-to-silence-and-back rather than a
    /// single startup ramp — this is the "global exponential fade... rides
    /// the output across the regeneration" behavior the waveform bank's hot
    /// reload relies on to suppress clicks.
    pub fn restart_fade(&mut self) {
        self.fade_in_progress = 0;
    }

    /// Element-wise max envelope across every worker's partition for the
    /// most recently processed block, one entry per sample.
    pub fn max_envelope(&self, len: usize) -> &[f32] {
        &self.max_envelope[..len.min(MAX_BUFFER_SIZE)]
    }

    pub fn set_summation_response_exponent(&mut self, exponent: f32) {
        self.summation_response_exponent = exponent;
    }

    pub fn set_summation_base_level(&mut self, level: f32) {
        self.summation_base_level = level;
    }

    pub fn set_soft_limit_threshold(&mut self, threshold: f32) {
        self.soft_limit_threshold = threshold;
    }

    pub fn set_soft_limit_knee(&mut self, knee: f32) {
        self.soft_limit_knee = knee;
    }

    /// Combines `worker_sums` (each holding `len <= MAX_BUFFER_SIZE` valid
    /// samples), shapes the result, and writes `len` samples into
    /// `out_left`/`out_right`.
    ///
    /// Per sample: sums every worker's mono/left/right contributions and its
    /// max/sum envelope tracks, divides the pre-scaled signal by the
    /// response curve evaluated on the summed envelope (forcing silence
    /// where the summed envelope is negligible), soft-limits, applies the
    /// frame contrast factor and start-up fade, then hard-clips to `[-1,
    /// 1]`. When stereo is disabled the unpanned mono sum is duplicated to
    /// both channels instead of the panned left/right sums.
    pub fn process(
        &mut self,
        worker_sums: &[Arc<Mutex<WorkerPartialSum>>],
        len: usize,
        contrast_factor: f32,
        out_left: &mut [f32],
        out_right: &mut [f32],
    ) {
        debug_assert!(len <= MAX_BUFFER_SIZE);
        debug_assert!(out_left.len() >= len && out_right.len() >= len);

        let mut mono = [0.0f32; MAX_BUFFER_SIZE];
        out_left[..len].fill(0.0);
        out_right[..len].fill(0.0);
        mono[..len].fill(0.0);
        self.sum_envelope_scratch[..len].fill(0.0);
        self.max_envelope[..len].fill(0.0);

        for worker_sum in worker_sums {
            let sum = worker_sum.lock();
            let n = sum.len.min(len);
            for s in 0..n {
                mono[s] += sum.mono[s];
                out_left[s] += sum.left[s];
                out_right[s] += sum.right[s];
                self.max_envelope[s] = self.max_envelope[s].max(sum.max_envelope[s]);
                self.sum_envelope_scratch[s] += sum.sum_envelope[s];
            }
        }

        let contrast = contrast_factor.clamp(0.0, 1.0);
        for s in 0..len {
            let raw_left = if self.stereo_enabled { out_left[s] } else { mono[s] };
            let raw_right = if self.stereo_enabled { out_right[s] } else { mono[s] };
            let response = self.response_for(self.sum_envelope_scratch[s]);

            out_left[s] = self.soft_limit(raw_left * PRE_SCALE * response) * contrast;
            out_right[s] = self.soft_limit(raw_right * PRE_SCALE * response) * contrast;
        }

        self.apply_fade_in(&mut out_left[..len], &mut out_right[..len]);

        for s in 0..len {
            out_left[s] = out_left[s].clamp(-1.0, 1.0);
            out_right[s] = out_right[s].clamp(-1.0, 1.0);
        }
    }

    /// Returns the reciprocal of the response curve `(sum_envelope +
    /// base)^(1/exponent)`, i.e. the factor the raw signal is multiplied by
    /// to normalize it — or exactly `0.0` if `sum_envelope` is below
    /// [`SUM_ENVELOPE_EPSILON`], per the mixer's division-by-near-zero
    /// tie-break.
    fn response_for(&self, sum_envelope: f32) -> f32 {
        if sum_envelope < SUM_ENVELOPE_EPSILON {
            return 0.0;
        }

        let magnitude = sum_envelope + self.summation_base_level;
        let response = if (self.summation_response_exponent - 2.0).abs() < SQRT_EXPONENT_EPSILON {
            magnitude.sqrt()
        } else {
            response_pow(magnitude, self.summation_response_exponent)
        };

        if response <= 1e-9 {
            0.0
        } else {
            response.recip()
        }
    }

    /// `tanh`-kneed soft limiter: transparent below `soft_limit_threshold`,
    /// compresses smoothly above it.
    fn soft_limit(&self, x: f32) -> f32 {
        let magnitude = x.abs();
        if magnitude <= self.soft_limit_threshold {
            return x;
        }

        let over = (magnitude - self.soft_limit_threshold) / self.soft_limit_knee;
        let compressed = self.soft_limit_threshold + self.soft_limit_knee * over.tanh();
        compressed * x.signum()
    }

    fn apply_fade_in(&mut self, left: &mut [f32], right: &mut [f32]) {
        if self.fade_in_progress >= self.fade_in_len {
            return;
        }

        for s in 0..left.len() {
            if self.fade_in_progress >= self.fade_in_len {
                break;
            }
            let gain = self.fade_in_progress as f32 / self.fade_in_len.max(1) as f32;
            left[s] *= gain;
            right[s] *= gain;
            self.fade_in_progress += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerPartialSum;

    /// A worker sum with matching mono/left/right signal and matching
    /// max/sum envelope, all at one constant value.
    fn make_sum(signal: f32, envelope: f32, len: usize) -> Arc<Mutex<WorkerPartialSum>> {
        make_sum_panned(signal, signal, signal, envelope, len)
    }

    fn make_sum_panned(
        mono: f32,
        left: f32,
        right: f32,
        envelope: f32,
        len: usize,
    ) -> Arc<Mutex<WorkerPartialSum>> {
        let mut sum = WorkerPartialSum {
            mono: [0.0; MAX_BUFFER_SIZE],
            left: [0.0; MAX_BUFFER_SIZE],
            right: [0.0; MAX_BUFFER_SIZE],
            max_envelope: [0.0; MAX_BUFFER_SIZE],
            sum_envelope: [0.0; MAX_BUFFER_SIZE],
            len,
        };
        sum.mono[..len].fill(mono);
        sum.left[..len].fill(left);
        sum.right[..len].fill(right);
        sum.max_envelope[..len].fill(envelope);
        sum.sum_envelope[..len].fill(envelope);
        Arc::new(Mutex::new(sum))
    }

    #[test]
    fn silence_in_is_silence_out_past_fade_in() {
        let mut mixer = Mixer::new(2.0, 0.0, 0.85, 0.1, 48_000.0, true);
        mixer.fade_in_progress = mixer.fade_in_len;

        let sums = vec![make_sum(0.0, 0.0, 16)];
        let mut left = vec![0.0; 16];
        let mut right = vec![0.0; 16];
        mixer.process(&sums, 16, 1.0, &mut left, &mut right);

        assert!(left.iter().all(|&v| v.abs() < 1e-6));
    }

    #[test]
    fn output_never_exceeds_unity() {
        let mut mixer = Mixer::new(2.0, 0.05, 0.85, 0.1, 48_000.0, true);
        mixer.fade_in_progress = mixer.fade_in_len;

        let sums =
            vec![make_sum(50.0, 50.0, 16), make_sum(50.0, 50.0, 16), make_sum(50.0, 50.0, 16)];
        let mut left = vec![0.0; 16];
        let mut right = vec![0.0; 16];
        mixer.process(&sums, 16, 1.0, &mut left, &mut right);

        assert!(left.iter().all(|&v| v.abs() <= 1.0));
        assert!(right.iter().all(|&v| v.abs() <= 1.0));
    }

    #[test]
    fn restart_fade_dips_output_back_to_silence() {
        let mut mixer = Mixer::new(2.0, 0.05, 0.85, 0.1, 48_000.0, true);
        mixer.fade_in_progress = mixer.fade_in_len;

        mixer.restart_fade();
        let sums = vec![make_sum(1.0, 1.0, 8)];
        let mut left = vec![0.0; 8];
        let mut right = vec![0.0; 8];
        mixer.process(&sums, 8, 1.0, &mut left, &mut right);

        assert_eq!(left[0], 0.0, "a restarted fade must dip back to exact silence");
    }

    #[test]
    fn fade_in_ramps_from_silence() {
        let mut mixer = Mixer::new(2.0, 0.05, 0.85, 0.1, 48_000.0, true);
        let sums = vec![make_sum(1.0, 1.0, 8)];
        let mut left = vec![0.0; 8];
        let mut right = vec![0.0; 8];
        mixer.process(&sums, 8, 1.0, &mut left, &mut right);

        assert_eq!(left[0], 0.0);
        assert!(left[7].abs() >= left[1].abs());
    }

    #[test]
    fn contrast_factor_attenuates_output() {
        let mut a = Mixer::new(2.0, 0.05, 0.85, 0.1, 48_000.0, true);
        a.fade_in_progress = a.fade_in_len;
        let mut b = Mixer::new(2.0, 0.05, 0.85, 0.1, 48_000.0, true);
        b.fade_in_progress = b.fade_in_len;

        let sums_a = vec![make_sum(10.0, 10.0, 8)];
        let sums_b = vec![make_sum(10.0, 10.0, 8)];
        let mut left_a = vec![0.0; 8];
        let mut right_a = vec![0.0; 8];
        let mut left_b = vec![0.0; 8];
        let mut right_b = vec![0.0; 8];

        a.process(&sums_a, 8, 1.0, &mut left_a, &mut right_a);
        b.process(&sums_b, 8, 0.1, &mut left_b, &mut right_b);

        assert!(left_b[0].abs() < left_a[0].abs());
    }

    #[test]
    fn near_zero_summed_envelope_forces_exact_silence() {
        let mut mixer = Mixer::new(2.0, 0.0, 0.85, 0.1, 48_000.0, true);
        mixer.fade_in_progress = mixer.fade_in_len;

        // A nonzero signal with a vanishingly small summed envelope would
        // otherwise blow up dividing by a near-zero response; the mixer
        // must force silence instead.
        let sums = vec![make_sum(5.0, 1e-9, 8)];
        let mut left = vec![0.0; 8];
        let mut right = vec![0.0; 8];
        mixer.process(&sums, 8, 1.0, &mut left, &mut right);

        assert!(left.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn stereo_disabled_duplicates_mono_to_both_channels() {
        let sums = vec![make_sum_panned(1.0, 1.6, 0.3, 1.0, 8)];

        let mut mono_mixer = Mixer::new(2.0, 0.05, 0.95, 0.3, 48_000.0, false);
        mono_mixer.fade_in_progress = mono_mixer.fade_in_len;
        let mut left_m = vec![0.0; 8];
        let mut right_m = vec![0.0; 8];
        mono_mixer.process(&sums, 8, 1.0, &mut left_m, &mut right_m);
        assert_eq!(left_m, right_m);

        let mut stereo_mixer = Mixer::new(2.0, 0.05, 0.95, 0.3, 48_000.0, true);
        stereo_mixer.fade_in_progress = stereo_mixer.fade_in_len;
        let mut left_s = vec![0.0; 8];
        let mut right_s = vec![0.0; 8];
        stereo_mixer.process(&sums, 8, 1.0, &mut left_s, &mut right_s);
        assert!((left_s[0] - right_s[0]).abs() > 1e-4);
    }

    /// As the number of equal-envelope active notes doubles, per-note output
    /// amplitude should scale by `2^(-1/response_exponent)`.
    #[test]
    fn summation_normalization_follows_inverse_root_law() {
        let exponent = 2.0f32;
        let per_note_envelope = 0.3f32;

        let amplitude_per_note = |n: usize| -> f32 {
            let mut mixer = Mixer::new(exponent, 0.0, 0.95, 0.3, 48_000.0, true);
            mixer.fade_in_progress = mixer.fade_in_len;
            let total = n as f32 * per_note_envelope;
            let sums = vec![make_sum(total, total, 4)];
            let mut left = vec![0.0; 4];
            let mut right = vec![0.0; 4];
            mixer.process(&sums, 4, 1.0, &mut left, &mut right);
            left[0] / n as f32
        };

        let a = amplitude_per_note(8);
        let b = amplitude_per_note(16);
        let expected_ratio = 2f32.powf(-1.0 / exponent);
        let actual_ratio = b / a;

        assert!(
            (actual_ratio - expected_ratio).abs() < 0.02,
            "expected ratio {expected_ratio}, got {actual_ratio}"
        );
    }
}
