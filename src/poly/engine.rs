//! The polyphonic voice engine: a MIDI-driven complement to the
//! additive engine, sharing the same preprocessed-frame and RT-output
//! contracts but synthesizing a small number of voices directly rather than
//! reading from the waveform bank.

use crate::frame::PreprocessedFrame;
use crate::midi::MidiEvent;
use crate::pow_lut::response_pow;

use super::adsr::{compute_adsr_coeffs, AdsrCoeffs};
use super::voice::{choose_voice_for_note_on, find_voice_for_note_off, HarmonicKind, Voice};

const GAMMA_EPSILON: f32 = 1e-3;

/// `raw_amp.powf(gamma)`, expressed via [`response_pow`] (which computes
/// `x.powf(1/exponent)`) so both engines share one cached-`powf` primitive.
#[inline]
fn amplitude_gamma_shape(raw_amp: f32, gamma: f32) -> f32 {
    if (gamma - 1.0).abs() < GAMMA_EPSILON || raw_amp <= 0.0 {
        return raw_amp.max(0.0);
    }
    response_pow(raw_amp, gamma.recip())
}

pub struct PolyEngineParams {
    pub filter_cutoff_hz: f32,
    pub filter_env_depth_hz: f32,
    pub lfo_rate_hz: f32,
    pub lfo_depth_semitones: f32,
    pub amplitude_gamma: f32,
    pub min_audible_amplitude: f32,
    pub master_volume: f32,
    /// Partials whose resolved frequency exceeds this are skipped outright,
    /// ahead of the Nyquist check, so the voice count doesn't silently inflate
    /// CPU cost with partials the ear can barely use.
    pub high_freq_harmonic_limit_hz: f32,
}

/// Owns every voice and the shared modulation state (the global LFO). Driven
/// once per audio block from the same audio processing thread that drives
/// the additive worker pool, reading the same preprocessed frame.
pub struct PolyEngine {
    voices: Vec<Voice>,
    voice_counter: u64,
    lfo_phase: f32,
    num_oscillators: usize,
    params: PolyEngineParams,
    /// Scratch for this block's per-partial harmonic classification, sized
    /// once to `num_oscillators` and overwritten in place each block — never
    /// reallocated on the processing path.
    harmonic_kinds: Vec<HarmonicKind>,
}

impl PolyEngine {
    pub fn new(
        num_voices: usize,
        num_oscillators: usize,
        amp_attack_ms: f32,
        amp_decay_ms: f32,
        amp_sustain: f32,
        amp_release_ms: f32,
        filter_attack_ms: f32,
        filter_decay_ms: f32,
        filter_sustain: f32,
        filter_release_ms: f32,
        sample_rate: f32,
        params: PolyEngineParams,
    ) -> Self {
        let amp_coeffs =
            compute_adsr_coeffs(amp_attack_ms, amp_decay_ms, amp_sustain, amp_release_ms, sample_rate);
        let filter_coeffs = compute_adsr_coeffs(
            filter_attack_ms,
            filter_decay_ms,
            filter_sustain,
            filter_release_ms,
            sample_rate,
        );

        let voices = (0..num_voices)
            .map(|_| Voice::new(num_oscillators, amp_coeffs, filter_coeffs))
            .collect();

        let harmonic_kinds = vec![HarmonicKind::Harmonic(1); num_oscillators];

        Self { voices, voice_counter: 0, lfo_phase: 0.0, num_oscillators, params, harmonic_kinds }
    }

    pub fn set_amp_envelope(&mut self, coeffs: AdsrCoeffs) {
        for voice in &mut self.voices {
            voice.amp_env.set_coeffs(coeffs);
        }
    }

    pub fn set_filter_envelope(&mut self, coeffs: AdsrCoeffs) {
        for voice in &mut self.voices {
            voice.filter_env.set_coeffs(coeffs);
        }
    }

    pub fn set_filter_cutoff_hz(&mut self, hz: f32) {
        self.params.filter_cutoff_hz = hz;
    }

    pub fn set_filter_env_depth_hz(&mut self, hz: f32) {
        self.params.filter_env_depth_hz = hz;
    }

    pub fn set_lfo_rate_hz(&mut self, hz: f32) {
        self.params.lfo_rate_hz = hz;
    }

    pub fn set_lfo_depth_semitones(&mut self, semitones: f32) {
        self.params.lfo_depth_semitones = semitones;
    }

    pub fn set_amplitude_gamma(&mut self, gamma: f32) {
        self.params.amplitude_gamma = gamma;
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        self.params.master_volume = volume;
    }

    pub fn handle_midi(&mut self, event: MidiEvent) {
        match event {
            MidiEvent::NoteOn { note, velocity } => {
                let normalized = event.normalized_velocity();
                if normalized > 0.0 {
                    self.note_on(note, normalized);
                } else {
                    // Velocity-zero Note On is a Note Off, per MIDI convention.
                    self.note_off(note);
                }
            }
            MidiEvent::NoteOff { note } => self.note_off(note),
            MidiEvent::ControlChange { .. } => {}
        }
    }

    fn note_on(&mut self, note: u8, velocity: f32) {
        let idx = choose_voice_for_note_on(&self.voices);
        self.voice_counter += 1;
        self.voices[idx].trigger_on(note, velocity, self.voice_counter);
    }

    fn note_off(&mut self, note: u8) {
        if let Some(idx) = find_voice_for_note_off(&self.voices, note) {
            self.voices[idx].trigger_off();
        }
    }

    /// Synthesizes `len` stereo samples from the currently active voices,
    /// shaped by `frame`'s polyphonic data, into `out_left`/`out_right`.
    pub fn process(
        &mut self,
        frame: &PreprocessedFrame,
        len: usize,
        sample_rate: f32,
        out_left: &mut [f32],
        out_right: &mut [f32],
    ) {
        out_left[..len].fill(0.0);
        out_right[..len].fill(0.0);

        let k = self
            .num_oscillators
            .min(frame.polyphonic.magnitudes.len());
        if k == 0 {
            return;
        }

        for i in 0..k {
            self.harmonic_kinds[i] = HarmonicKind::choose(
                i,
                frame.polyphonic.harmonicity[i],
                frame.polyphonic.detune_cents[i],
                frame.polyphonic.inharmonic_ratios[i],
            );
        }

        for s in 0..len {
            self.lfo_phase = (self.lfo_phase + self.params.lfo_rate_hz / sample_rate).fract();
            let lfo_semitones =
                (self.lfo_phase * std::f32::consts::TAU).sin() * self.params.lfo_depth_semitones;
            let lfo_pitch_mult = 2f32.powf(lfo_semitones / 12.0);

            for voice in self.voices.iter_mut() {
                if voice.is_idle() {
                    continue;
                }

                let (amp_level, filter_level) = voice.tick_envelopes();
                let cutoff =
                    self.params.filter_cutoff_hz + self.params.filter_env_depth_hz * filter_level;

                for i in 0..k {
                    let ratio = self.harmonic_kinds[i].ratio();
                    let freq = voice.base_frequency * ratio * lfo_pitch_mult;

                    if !(0.0..sample_rate * 0.5).contains(&freq)
                        || freq > self.params.high_freq_harmonic_limit_hz
                    {
                        continue;
                    }

                    voice.phases[i] = (voice.phases[i] + freq / sample_rate).fract();
                    let osc = (voice.phases[i] * std::f32::consts::TAU).sin();

                    // Spectral roll-off: a smooth per-partial shelf above the
                    // envelope-modulated cutoff, not a biquad.
                    let rolloff = if freq <= cutoff { 1.0 } else { (cutoff / freq).powi(2) };

                    let raw_amp = frame.polyphonic.magnitudes[i] * amp_level * voice.velocity * rolloff;
                    if raw_amp < self.params.min_audible_amplitude {
                        continue;
                    }

                    let shaped = amplitude_gamma_shape(raw_amp, self.params.amplitude_gamma);
                    let sample = osc * shaped;

                    out_left[s] += sample * frame.polyphonic.left_gains[i];
                    out_right[s] += sample * frame.polyphonic.right_gains[i];
                }
            }

            out_left[s] *= self.params.master_volume;
            out_right[s] *= self.params.master_volume;
        }
    }

    pub fn num_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn active_voice_count(&self) -> usize {
        self.voices.iter().filter(|v| !v.is_idle()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PreprocessedFrame;

    fn engine() -> PolyEngine {
        PolyEngine::new(
            4,
            4,
            5.0,
            50.0,
            0.7,
            150.0,
            10.0,
            100.0,
            0.5,
            200.0,
            48_000.0,
            PolyEngineParams {
                filter_cutoff_hz: 2_000.0,
                filter_env_depth_hz: 2_000.0,
                lfo_rate_hz: 0.0,
                lfo_depth_semitones: 0.0,
                amplitude_gamma: 1.0,
                min_audible_amplitude: 1e-5,
                master_volume: 1.0,
                high_freq_harmonic_limit_hz: 18_000.0,
            },
        )
    }

    #[test]
    fn silent_until_a_note_is_triggered() {
        let mut engine = engine();
        let frame = PreprocessedFrame::zeroed(1, 4);
        let mut left = vec![0.0; 32];
        let mut right = vec![0.0; 32];
        engine.process(&frame, 32, 48_000.0, &mut left, &mut right);
        assert!(left.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn note_on_produces_nonzero_audio_after_attack() {
        let mut engine = engine();
        let mut frame = PreprocessedFrame::zeroed(1, 4);
        frame.polyphonic.magnitudes.fill(1.0);
        frame.valid = true;

        engine.handle_midi(MidiEvent::NoteOn { note: 69, velocity: 100 });

        let mut left = vec![0.0; 4_000];
        let mut right = vec![0.0; 4_000];
        engine.process(&frame, 4_000, 48_000.0, &mut left, &mut right);

        assert!(left.iter().any(|&v| v.abs() > 1e-4));
        assert_eq!(engine.active_voice_count(), 1);
    }

    #[test]
    fn note_off_eventually_silences_the_voice() {
        let mut engine = engine();
        let mut frame = PreprocessedFrame::zeroed(1, 4);
        frame.polyphonic.magnitudes.fill(1.0);
        frame.valid = true;

        engine.handle_midi(MidiEvent::NoteOn { note: 69, velocity: 100 });
        let mut scratch_l = vec![0.0; 2_000];
        let mut scratch_r = vec![0.0; 2_000];
        engine.process(&frame, 2_000, 48_000.0, &mut scratch_l, &mut scratch_r);

        engine.handle_midi(MidiEvent::NoteOff { note: 69 });
        for _ in 0..50 {
            engine.process(&frame, 2_000, 48_000.0, &mut scratch_l, &mut scratch_r);
        }

        assert_eq!(engine.active_voice_count(), 0);
    }

    #[test]
    fn high_freq_harmonic_limit_mutes_partials_above_it() {
        let mut engine = PolyEngine::new(
            1,
            4,
            1.0,
            1.0,
            1.0,
            1.0,
            10.0,
            100.0,
            0.5,
            200.0,
            48_000.0,
            PolyEngineParams {
                filter_cutoff_hz: 2_000.0,
                filter_env_depth_hz: 0.0,
                lfo_rate_hz: 0.0,
                lfo_depth_semitones: 0.0,
                amplitude_gamma: 1.0,
                min_audible_amplitude: 1e-6,
                master_volume: 1.0,
                // note 69 (440 Hz) * harmonics 1..4 peaks at 1760 Hz; a limit
                // below that should silence every partial past the first.
                high_freq_harmonic_limit_hz: 500.0,
            },
        );
        let mut frame = PreprocessedFrame::zeroed(1, 4);
        frame.polyphonic.magnitudes.fill(1.0);
        frame.valid = true;

        engine.handle_midi(MidiEvent::NoteOn { note: 69, velocity: 100 });
        let mut left = vec![0.0; 4_000];
        let mut right = vec![0.0; 4_000];
        engine.process(&frame, 4_000, 48_000.0, &mut left, &mut right);

        assert!(left.iter().any(|&v| v.abs() > 1e-4), "the fundamental partial should still sound");
    }

    #[test]
    fn velocity_zero_note_on_behaves_as_note_off() {
        let mut engine = engine();
        engine.handle_midi(MidiEvent::NoteOn { note: 60, velocity: 100 });
        assert_eq!(engine.active_voice_count(), 1);
        engine.handle_midi(MidiEvent::NoteOn { note: 60, velocity: 0 });

        let frame = PreprocessedFrame::zeroed(1, 4);
        let mut left = vec![0.0; 48_000];
        let mut right = vec![0.0; 48_000];
        engine.process(&frame, 48_000, 48_000.0, &mut left, &mut right);
        assert_eq!(engine.active_voice_count(), 0);
    }
}
