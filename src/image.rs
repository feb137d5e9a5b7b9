//! The image-row preprocessor: turns one streamed RGB scanline
//! into a [`PreprocessedFrame`].
//!
//! Decoding the incoming image stream (UDP framing, row reassembly) is an
//! external collaborator's job; this module only consumes one already
//! decoded row at a time.

use crate::frame::PreprocessedFrame;

/// Three equal-length channel slices for one scanline. Never owns the
/// pixel data — the caller's ingestion layer does.
pub struct ImageRow<'a> {
    pub r: &'a [u8],
    pub g: &'a [u8],
    pub b: &'a [u8],
}

impl<'a> ImageRow<'a> {
    /// Returns `None` if the channel slices are not all the same length.
    pub fn new(r: &'a [u8], g: &'a [u8], b: &'a [u8]) -> Option<Self> {
        if r.len() == g.len() && g.len() == b.len() {
            Some(Self { r, g, b })
        } else {
            None
        }
    }

    pub fn width(&self) -> usize {
        self.r.len()
    }

    /// Rec. 601 luma of pixel `i`, normalized to `[0, 1]`.
    #[inline]
    fn luma(&self, i: usize) -> f32 {
        (0.299 * self.r[i] as f32 + 0.587 * self.g[i] as f32 + 0.114 * self.b[i] as f32) / 255.0
    }

    /// Color warmth of pixel `i` in `[-1, 1]`: negative is cool (blue),
    /// positive is warm (red).
    #[inline]
    fn warmth(&self, i: usize) -> f32 {
        (self.r[i] as f32 - self.b[i] as f32) / 255.0
    }
}

/// Single-bin Goertzel magnitude of `signal` at `normalized_freq` (cycles
/// per sample, in `[0, 0.5]`). Used instead of pulling in a full FFT crate:
/// the polyphonic engine only ever needs `K` specific bins, and `K` is
/// small, so computing exactly those bins directly is cheaper
/// than a full transform and avoids a dependency whose other `N/2`
/// frequencies would go unused.
fn goertzel_magnitude(signal: &[f32], normalized_freq: f32) -> f32 {
    let omega = std::f32::consts::TAU * normalized_freq;
    let coeff = 2.0 * omega.cos();
    let (mut s_prev, mut s_prev2) = (0.0f32, 0.0f32);

    for &x in signal {
        let s = x + coeff * s_prev - s_prev2;
        s_prev2 = s_prev;
        s_prev = s;
    }

    (s_prev2 * s_prev2 + s_prev * s_prev - coeff * s_prev * s_prev2)
        .max(0.0)
        .sqrt()
}

/// Converts image rows into [`PreprocessedFrame`]s. Stateless beyond its
/// configuration: every field of the output is recomputed fresh from the
/// current row, never carried over from the previous one.
pub struct Preprocessor {
    num_notes: usize,
    pixels_per_note: usize,
    num_oscillators: usize,
    brightness_gamma: f32,
}

impl Preprocessor {
    pub fn new(
        num_notes: usize,
        pixels_per_note: usize,
        num_oscillators: usize,
        brightness_gamma: f32,
    ) -> Self {
        Self { num_notes, pixels_per_note, num_oscillators, brightness_gamma }
    }

    /// Writes the full preprocessed frame for `row` into `frame`, which must
    /// already be sized for `num_notes` notes and `num_oscillators`
    /// partials. Leaves `frame` untouched and returns `false` if `row` is
    /// too narrow to cover even one note.
    pub fn process(&self, row: &ImageRow<'_>, timestamp_us: u64, frame: &mut PreprocessedFrame) -> bool {
        let width = row.width();
        if width < self.pixels_per_note.max(1) {
            return false;
        }

        let mut warmth_sum = 0.0f32;

        for note_idx in 0..self.num_notes {
            let start = (note_idx * self.pixels_per_note).min(width.saturating_sub(1));
            let end = ((note_idx + 1) * self.pixels_per_note).min(width).max(start + 1);

            let mut luma_sum = 0.0f32;
            let mut warmth_bucket = 0.0f32;
            let bucket_len = (end - start) as f32;

            for i in start..end {
                luma_sum += row.luma(i);
                warmth_bucket += row.warmth(i);
            }

            let luma_avg = luma_sum / bucket_len;
            let warmth_avg = warmth_bucket / bucket_len;
            warmth_sum += warmth_avg;

            let target = (1.0 - luma_avg).clamp(0.0, 1.0).powf(self.brightness_gamma);
            frame.additive.notes[note_idx] = target;

            let pan = warmth_avg.clamp(-1.0, 1.0);
            frame.stereo.pan_positions[note_idx] = pan;
            let angle = (pan + 1.0) * std::f32::consts::FRAC_PI_4;
            frame.stereo.left_gains[note_idx] = angle.cos();
            frame.stereo.right_gains[note_idx] = angle.sin();
        }

        let (mut min_target, mut max_target) = (1.0f32, 0.0f32);
        for &v in &frame.additive.notes {
            min_target = min_target.min(v);
            max_target = max_target.max(v);
        }
        frame.additive.contrast_factor = (max_target - min_target).clamp(0.0, 1.0);

        self.fill_polyphonic(row, warmth_sum / self.num_notes.max(1) as f32, frame);

        frame.valid = true;
        frame.timestamp_us = timestamp_us;
        true
    }

    fn fill_polyphonic(&self, row: &ImageRow<'_>, frame_warmth: f32, frame: &mut PreprocessedFrame) {
        let k = self.num_oscillators.min(frame.polyphonic.magnitudes.len());
        if k == 0 {
            return;
        }

        let width = row.width();
        let grayscale: Vec<f32> = (0..width).map(|i| row.luma(i)).collect();

        let pan = frame_warmth.clamp(-1.0, 1.0);
        let angle = (pan + 1.0) * std::f32::consts::FRAC_PI_4;
        let (left_gain, right_gain) = (angle.cos(), angle.sin());

        for i in 0..k {
            // Bins spaced across the usable spatial-frequency range,
            // avoiding the DC and Nyquist edges where Goertzel magnitude is
            // least meaningful.
            let t = (i + 1) as f32 / (k + 1) as f32;
            let normalized_freq = 0.02 + t * 0.46;

            let magnitude = goertzel_magnitude(&grayscale, normalized_freq) / width.max(1) as f32;
            frame.polyphonic.magnitudes[i] = magnitude.clamp(0.0, 1.0);

            // Heuristic peakiness proxy: later, finer bins are less likely
            // to land exactly on an integer harmonic of the image's
            // dominant spatial frequency, tempered by the frame's contrast.
            let base_harmonicity = 1.0 - i as f32 / k as f32;
            frame.polyphonic.harmonicity[i] =
                (base_harmonicity * (0.5 + 0.5 * frame.additive.contrast_factor)).clamp(0.0, 1.0);

            frame.polyphonic.detune_cents[i] = (frame_warmth * 25.0).clamp(-50.0, 50.0);
            frame.polyphonic.inharmonic_ratios[i] = (i + 1) as f32 + frame_warmth.abs() * 0.5;

            frame.polyphonic.left_gains[i] = left_gain;
            frame.polyphonic.right_gains[i] = right_gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_row(width: usize, r: u8, g: u8, b: u8) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        (vec![r; width], vec![g; width], vec![b; width])
    }

    #[test]
    fn rejects_mismatched_channel_lengths() {
        let r = vec![0u8; 4];
        let g = vec![0u8; 3];
        let b = vec![0u8; 4];
        assert!(ImageRow::new(&r, &g, &b).is_none());
    }

    #[test]
    fn black_row_produces_loud_notes() {
        let pre = Preprocessor::new(4, 8, 4, 1.0);
        let (r, g, b) = solid_row(32, 0, 0, 0);
        let row = ImageRow::new(&r, &g, &b).unwrap();
        let mut frame = PreprocessedFrame::zeroed(4, 4);

        assert!(pre.process(&row, 0, &mut frame));
        assert!(frame.additive.notes.iter().all(|&v| v > 0.9));
    }

    #[test]
    fn white_row_produces_silent_notes() {
        let pre = Preprocessor::new(4, 8, 4, 1.0);
        let (r, g, b) = solid_row(32, 255, 255, 255);
        let row = ImageRow::new(&r, &g, &b).unwrap();
        let mut frame = PreprocessedFrame::zeroed(4, 4);

        assert!(pre.process(&row, 0, &mut frame));
        assert!(frame.additive.notes.iter().all(|&v| v < 0.05));
    }

    #[test]
    fn red_row_pans_right_blue_row_pans_left() {
        let pre = Preprocessor::new(2, 8, 2, 1.0);

        let (r, g, b) = solid_row(16, 255, 0, 0);
        let row = ImageRow::new(&r, &g, &b).unwrap();
        let mut red_frame = PreprocessedFrame::zeroed(2, 2);
        pre.process(&row, 0, &mut red_frame);

        let (r, g, b) = solid_row(16, 0, 0, 255);
        let row = ImageRow::new(&r, &g, &b).unwrap();
        let mut blue_frame = PreprocessedFrame::zeroed(2, 2);
        pre.process(&row, 0, &mut blue_frame);

        assert!(red_frame.stereo.right_gains[0] > red_frame.stereo.left_gains[0]);
        assert!(blue_frame.stereo.left_gains[0] > blue_frame.stereo.right_gains[0]);
    }

    #[test]
    fn too_narrow_a_row_is_rejected_without_mutating_the_frame() {
        let pre = Preprocessor::new(4, 8, 4, 1.0);
        let (r, g, b) = solid_row(2, 10, 10, 10);
        let row = ImageRow::new(&r, &g, &b).unwrap();
        let mut frame = PreprocessedFrame::zeroed(4, 4);

        assert!(!pre.process(&row, 0, &mut frame));
        assert!(!frame.valid);
    }

    #[test]
    fn high_contrast_row_reports_high_contrast_factor() {
        let pre = Preprocessor::new(2, 8, 2, 1.0);
        let mut r = vec![0u8; 16];
        for px in r.iter_mut().skip(8) {
            *px = 255;
        }
        let g = r.clone();
        let b = r.clone();
        let row = ImageRow::new(&r, &g, &b).unwrap();
        let mut frame = PreprocessedFrame::zeroed(2, 2);

        pre.process(&row, 0, &mut frame);
        assert!(frame.additive.contrast_factor > 0.8);
    }
}
