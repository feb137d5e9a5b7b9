//! The preprocessed frame: everything the worker pool and the
//! polyphonic voice engine read out of one image row.

/// Per-note additive-engine targets derived from one image row.
#[derive(Clone, Debug)]
pub struct AdditiveData {
    /// Per-note target volume in `[0, 1]`, already grayscale-inverted,
    /// gamma-corrected, and locally averaged.
    pub notes: Vec<f32>,
    /// Scalar in `[0, 1]` characterizing the frame's intensity spread.
    pub contrast_factor: f32,
}

/// Per-note stereo panning derived from a colorimetric measure.
#[derive(Clone, Debug)]
pub struct StereoData {
    /// Pan position in `[-1, +1]`, cold (blue) → left, warm (red) → right.
    pub pan_positions: Vec<f32>,
    /// Equal-power left gain, `≈ 0.707` at center.
    pub left_gains: Vec<f32>,
    /// Equal-power right gain, `≈ 0.707` at center.
    pub right_gains: Vec<f32>,
}

/// Per-partial shaping for the polyphonic voice engine, indexed `0..K`
/// where `K == poly_max_oscillators`.
#[derive(Clone, Debug)]
pub struct PolyphonicData {
    pub magnitudes: Vec<f32>,
    pub left_gains: Vec<f32>,
    pub right_gains: Vec<f32>,
    /// `[0, 1]`: 1 = on the integer harmonic series, 0 = inharmonic.
    pub harmonicity: Vec<f32>,
    pub detune_cents: Vec<f32>,
    pub inharmonic_ratios: Vec<f32>,
}

/// One fully preprocessed image row, ready for the worker pool and the
/// polyphonic engine to read.
#[derive(Clone, Debug)]
pub struct PreprocessedFrame {
    pub additive: AdditiveData,
    pub stereo: StereoData,
    pub polyphonic: PolyphonicData,
    pub valid: bool,
    /// Microseconds since an arbitrary epoch, set when the frame was
    /// written.
    pub timestamp_us: u64,
}

impl PreprocessedFrame {
    /// Builds a zeroed frame sized for `num_notes` additive notes and `k`
    /// polyphonic partials, with pan centered.
    pub fn zeroed(num_notes: usize, k: usize) -> Self {
        Self {
            additive: AdditiveData {
                notes: vec![0.0; num_notes],
                contrast_factor: 0.0,
            },
            stereo: StereoData {
                pan_positions: vec![0.0; num_notes],
                left_gains: vec![std::f32::consts::FRAC_1_SQRT_2; num_notes],
                right_gains: vec![std::f32::consts::FRAC_1_SQRT_2; num_notes],
            },
            polyphonic: PolyphonicData {
                magnitudes: vec![0.0; k],
                left_gains: vec![std::f32::consts::FRAC_1_SQRT_2; k],
                right_gains: vec![std::f32::consts::FRAC_1_SQRT_2; k],
                harmonicity: vec![1.0; k],
                detune_cents: vec![0.0; k],
                inharmonic_ratios: vec![1.0; k],
            },
            valid: false,
            timestamp_us: 0,
        }
    }

    /// Resets targets to silence and centered pan — the "preprocessed frame
    /// not valid" recovery behavior. Used when the engine must produce
    /// output from a frame that was never written, or was written for a
    /// different `num_notes`/`k`.
    pub fn clear_to_silence(&mut self) {
        self.additive.notes.fill(0.0);
        self.additive.contrast_factor = 0.0;
        self.stereo.pan_positions.fill(0.0);
        self.stereo
            .left_gains
            .fill(std::f32::consts::FRAC_1_SQRT_2);
        self.stereo
            .right_gains
            .fill(std::f32::consts::FRAC_1_SQRT_2);
        self.polyphonic.magnitudes.fill(0.0);
        self.valid = false;
    }
}
