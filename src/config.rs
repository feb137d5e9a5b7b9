//! Runtime configuration.
//!
//! The engine never loads configuration from disk or the network itself —
//! that's the embedding program's job. This module only owns the shape of
//! the configuration and its validation rules.

use crate::error::{EngineError, Result};

/// All engine-tunable parameters, grouped by subsystem.
///
/// Every field here is runtime-settable where sensible; fields that require
/// re-deriving dependent state when changed (e.g. `low_frequency`) go
/// through a dedicated setter on the owning component rather than being
/// mutated directly on a live `Config`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    // --- Audio ---
    pub sampling_frequency: f32,
    pub audio_buffer_size: usize,
    pub stereo_mode_enabled: bool,

    // --- Additive bank ---
    pub low_frequency: f32,
    pub high_frequency: f32,
    pub comma_per_semitone: u32,
    pub semitone_per_octave: u32,
    pub pixels_per_note: usize,
    pub num_notes: usize,
    /// Exponent applied to `(1 - luma)` when deriving a note's target
    /// volume from image brightness; `1.0` is a linear response.
    pub brightness_gamma: f32,

    // --- Envelope ---
    pub tau_up_base_ms: f32,
    pub tau_down_base_ms: f32,
    pub decay_freq_ref_hz: f32,
    pub decay_freq_beta: f32,

    // --- Mixer ---
    pub summation_response_exponent: f32,
    pub summation_base_level: f32,
    pub volume_weighting_exponent: f32,
    pub soft_limit_threshold: f32,
    pub soft_limit_knee: f32,

    // --- Concurrency ---
    pub num_workers: usize,

    // --- Polyphonic ---
    pub poly_num_voices: usize,
    pub poly_max_oscillators: usize,
    pub poly_amp_attack_ms: f32,
    pub poly_amp_decay_ms: f32,
    pub poly_amp_sustain: f32,
    pub poly_amp_release_ms: f32,
    pub poly_filter_attack_ms: f32,
    pub poly_filter_decay_ms: f32,
    pub poly_filter_sustain: f32,
    pub poly_filter_release_ms: f32,
    pub poly_filter_cutoff_hz: f32,
    pub poly_filter_env_depth_hz: f32,
    pub poly_lfo_rate_hz: f32,
    pub poly_lfo_depth_semitones: f32,
    pub poly_amplitude_gamma: f32,
    pub poly_min_audible_amplitude: f32,
    pub poly_master_volume: f32,
    pub poly_high_freq_harmonic_limit_hz: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sampling_frequency: 48_000.0,
            audio_buffer_size: 512,
            stereo_mode_enabled: true,

            low_frequency: 55.0,
            high_frequency: 880.0,
            comma_per_semitone: 1,
            semitone_per_octave: 12,
            pixels_per_note: 8,
            num_notes: 256,
            brightness_gamma: 1.0,

            tau_up_base_ms: 5.0,
            tau_down_base_ms: 80.0,
            decay_freq_ref_hz: 440.0,
            decay_freq_beta: 0.25,

            summation_response_exponent: 2.0,
            summation_base_level: 0.05,
            volume_weighting_exponent: 1.5,
            soft_limit_threshold: 0.85,
            soft_limit_knee: 0.1,

            num_workers: num_cpus::get().clamp(1, 32),

            poly_num_voices: 8,
            poly_max_oscillators: 16,
            poly_amp_attack_ms: 5.0,
            poly_amp_decay_ms: 50.0,
            poly_amp_sustain: 0.7,
            poly_amp_release_ms: 250.0,
            poly_filter_attack_ms: 10.0,
            poly_filter_decay_ms: 120.0,
            poly_filter_sustain: 0.5,
            poly_filter_release_ms: 300.0,
            poly_filter_cutoff_hz: 800.0,
            poly_filter_env_depth_hz: 4000.0,
            poly_lfo_rate_hz: 0.2,
            poly_lfo_depth_semitones: 0.1,
            poly_amplitude_gamma: 1.0,
            poly_min_audible_amplitude: 1e-4,
            poly_master_volume: 0.5,
            poly_high_freq_harmonic_limit_hz: 18_000.0,
        }
    }
}

impl Config {
    /// Validates every field, returning the first violation found as a
    /// [`EngineError::Configuration`].
    ///
    /// This is the only place configuration errors are raised: once a
    /// `Config` passes `validate`, the engine assumes it is safe to build
    /// fixed-size allocations from it and never re-checks these bounds.
    pub fn validate(&self) -> Result<()> {
        macro_rules! require {
            ($cond:expr, $msg:literal) => {
                if !($cond) {
                    return Err(EngineError::Configuration($msg.to_string()));
                }
            };
        }

        require!(
            matches!(self.sampling_frequency, 8_000.0..=192_000.0),
            "sampling_frequency must be in [8000, 192000] Hz"
        );
        require!(self.audio_buffer_size > 0, "audio_buffer_size must be > 0");
        require!(
            self.audio_buffer_size <= crate::worker::MAX_BUFFER_SIZE,
            "audio_buffer_size must not exceed MAX_BUFFER_SIZE"
        );

        require!(self.num_notes > 0, "num_notes must be > 0");
        require!(
            self.low_frequency > 0.0 && self.low_frequency < self.high_frequency,
            "low_frequency must be positive and less than high_frequency"
        );
        require!(
            self.high_frequency < self.sampling_frequency * 0.5,
            "high_frequency must be below the Nyquist frequency"
        );
        require!(self.comma_per_semitone > 0, "comma_per_semitone must be > 0");
        require!(
            self.semitone_per_octave > 0,
            "semitone_per_octave must be > 0"
        );
        require!(self.pixels_per_note > 0, "pixels_per_note must be > 0");
        require!(self.brightness_gamma > 0.0, "brightness_gamma must be > 0");

        require!(self.tau_up_base_ms > 0.0, "tau_up_base_ms must be > 0");
        require!(self.tau_down_base_ms > 0.0, "tau_down_base_ms must be > 0");
        require!(
            self.decay_freq_ref_hz > 0.0,
            "decay_freq_ref_hz must be > 0"
        );

        require!(
            self.summation_response_exponent > 0.0,
            "summation_response_exponent must be > 0"
        );
        require!(
            self.summation_base_level >= 0.0,
            "summation_base_level must be >= 0"
        );
        require!(
            self.volume_weighting_exponent > 0.0,
            "volume_weighting_exponent must be > 0"
        );
        require!(
            self.soft_limit_threshold > 0.0 && self.soft_limit_threshold < 1.0,
            "soft_limit_threshold must be in (0, 1)"
        );
        require!(
            self.soft_limit_knee > 0.0,
            "soft_limit_knee must be > 0"
        );

        require!(self.num_workers > 0, "num_workers must be > 0");
        require!(
            self.num_workers <= self.num_notes,
            "num_workers must not exceed num_notes"
        );

        require!(self.poly_num_voices > 0, "poly_num_voices must be > 0");
        require!(
            self.poly_max_oscillators > 0,
            "poly_max_oscillators must be > 0"
        );
        require!(
            self.poly_filter_cutoff_hz > 0.0,
            "poly_filter_cutoff_hz must be > 0"
        );
        require!(
            self.poly_amplitude_gamma > 0.0,
            "poly_amplitude_gamma must be > 0"
        );
        require!(
            self.poly_master_volume >= 0.0,
            "poly_master_volume must be >= 0"
        );
        require!(
            self.poly_high_freq_harmonic_limit_hz > 0.0,
            "poly_high_freq_harmonic_limit_hz must be > 0"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_high_frequency_past_nyquist() {
        let mut cfg = Config::default();
        cfg.high_frequency = cfg.sampling_frequency;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_more_workers_than_notes() {
        let mut cfg = Config::default();
        cfg.num_notes = 2;
        cfg.num_workers = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_oversized_buffer() {
        let mut cfg = Config::default();
        cfg.audio_buffer_size = crate::worker::MAX_BUFFER_SIZE + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_nonpositive_volume_weighting_exponent() {
        let mut cfg = Config::default();
        cfg.volume_weighting_exponent = 0.0;
        assert!(cfg.validate().is_err());
    }
}
