//! A single polyphonic voice: one MIDI note, up to `K` additive partials
//! shaped by the shared [`crate::frame::PolyphonicData`].

use std::time::{Duration, Instant};

use super::adsr::{Adsr, AdsrCoeffs, Stage};

/// How long after a voice's amplitude envelope finishes its release a
/// matching Note Off is still honored as a legal (if redundant) match. Covers
/// the race between the envelope completing on its own and a late Note Off
/// arriving just after — without this, a Note Off that loses that race would
/// silently match nothing and leave a stuck stolen voice the caller thinks it
/// released.
pub const NOTE_OFF_GRACE: Duration = Duration::from_millis(50);

/// How a partial's frequency is derived from the voice's fundamental.
/// Precomputed once per block from [`crate::frame::PolyphonicData`], so the
/// per-sample oscillator loop does a plain multiply, never a branch on
/// harmonicity. Three cases, chosen per partial from a continuous
/// `harmonicity` parameter: sitting exactly on the integer harmonic series,
/// a detuned near-integer partial, or a fixed inharmonic ratio.
#[derive(Clone, Copy, Debug)]
pub enum HarmonicKind {
    /// The `n`th harmonic of the fundamental (`n >= 1`), untouched.
    Harmonic(u32),
    /// The `n`th harmonic, detuned by `detune_cents` — a partial that's
    /// "nearly" harmonic rather than exactly on the series.
    SemiHarmonic { harmonic: u32, detune_cents: f32 },
    /// A fixed ratio of the fundamental, for partials below the
    /// inharmonicity threshold, looked up from `inharmonic_ratios[k]` rather
    /// than derived.
    Inharmonic(f32),
}

impl HarmonicKind {
    /// Chooses the dispatch for partial `i` (1-indexed harmonic number `i +
    /// 1`) from its continuous `harmonicity` value: `>= HARMONIC_THRESHOLD`
    /// sits exactly on the series, `<= INHARMONIC_THRESHOLD` uses the
    /// precomputed inharmonic ratio, anything between is a detuned harmonic.
    #[inline]
    pub fn choose(i: usize, harmonicity: f32, detune_cents: f32, inharmonic_ratio: f32) -> Self {
        let harmonic = (i + 1) as u32;
        if harmonicity >= HARMONIC_THRESHOLD {
            Self::Harmonic(harmonic)
        } else if harmonicity <= INHARMONIC_THRESHOLD {
            Self::Inharmonic(inharmonic_ratio)
        } else {
            Self::SemiHarmonic { harmonic, detune_cents }
        }
    }

    /// The partial's frequency multiplier relative to the voice fundamental,
    /// already folding in any detune.
    #[inline]
    pub fn ratio(self) -> f32 {
        match self {
            Self::Harmonic(n) => n as f32,
            Self::SemiHarmonic { harmonic, detune_cents } => {
                harmonic as f32 * 2f32.powf(detune_cents / 1_200.0)
            }
            Self::Inharmonic(ratio) => ratio,
        }
    }
}

/// At or above this `harmonicity`, a partial sits exactly on the integer
/// harmonic series with no detune.
pub const HARMONIC_THRESHOLD: f32 = 0.75;
/// At or below this `harmonicity`, a partial uses its precomputed inharmonic
/// ratio rather than any multiple of the fundamental.
pub const INHARMONIC_THRESHOLD: f32 = 0.25;

fn midi_note_to_frequency(note: u8) -> f32 {
    440.0 * 2f32.powf((note as f32 - 69.0) / 12.0)
}

/// One allocatable voice. Holds its own phase accumulator per partial so
/// reassigning a voice to a new note does not require resetting unrelated
/// state.
pub struct Voice {
    pub note: u8,
    pub base_frequency: f32,
    pub velocity: f32,
    pub amp_env: Adsr,
    pub filter_env: Adsr,
    /// Phase in `[0, 1)` per partial, `0..num_oscillators`.
    pub phases: Vec<f32>,
    /// Monotonic allocation order, used to break voice-stealing and
    /// Note Off matching ties.
    pub triggered_at: u64,
    /// When this voice's amplitude envelope last finished its release and
    /// went idle, if it has since this voice was last triggered. Backs the
    /// [`NOTE_OFF_GRACE`] window.
    idle_since: Option<Instant>,
}

impl Voice {
    pub fn new(num_oscillators: usize, amp_coeffs: AdsrCoeffs, filter_coeffs: AdsrCoeffs) -> Self {
        Self {
            note: 0,
            base_frequency: 0.0,
            velocity: 0.0,
            amp_env: Adsr::new(amp_coeffs),
            filter_env: Adsr::new(filter_coeffs),
            phases: vec![0.0; num_oscillators],
            triggered_at: 0,
            idle_since: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.amp_env.is_idle()
    }

    pub fn is_releasing(&self) -> bool {
        self.amp_env.stage() == Stage::Release
    }

    /// Whether this voice went idle recently enough that a late Note Off for
    /// its old note should still be honored as a legal (if redundant) match.
    pub fn is_within_note_off_grace(&self) -> bool {
        self.idle_since.is_some_and(|t| t.elapsed() < NOTE_OFF_GRACE)
    }

    /// Allocates this voice to `note`/`velocity`, resetting phases so a
    /// reused voice never carries over artifacts from its previous note.
    pub fn trigger_on(&mut self, note: u8, velocity: f32, triggered_at: u64) {
        self.note = note;
        self.base_frequency = midi_note_to_frequency(note);
        self.velocity = velocity;
        self.phases.iter_mut().for_each(|p| *p = 0.0);
        self.triggered_at = triggered_at;
        self.idle_since = None;
        self.amp_env.trigger_on();
        self.filter_env.trigger_on();
    }

    pub fn trigger_off(&mut self) {
        self.amp_env.trigger_off();
        self.filter_env.trigger_off();
    }

    /// Advances both envelopes by one sample. Records the moment this voice
    /// first went idle so [`Self::is_within_note_off_grace`] has a reference
    /// point. Returns `(amplitude_level, filter_level)`.
    pub fn tick_envelopes(&mut self) -> (f32, f32) {
        let was_idle = self.amp_env.is_idle();
        let amp_level = self.amp_env.tick();
        let filter_level = self.filter_env.tick();
        if !was_idle && self.amp_env.is_idle() {
            self.idle_since = Some(Instant::now());
        }
        (amp_level, filter_level)
    }
}

/// Picks the voice to allocate a Note On to: an idle voice first, then the
/// quietest currently-releasing voice, then the oldest voice overall
/// (steal).
pub fn choose_voice_for_note_on(voices: &[Voice]) -> usize {
    if let Some(idx) = voices.iter().position(Voice::is_idle) {
        return idx;
    }

    let quietest_releasing = voices
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_releasing())
        .min_by(|(_, a), (_, b)| {
            a.amp_env
                .level()
                .partial_cmp(&b.amp_env.level())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(idx, _)| idx);

    if let Some(idx) = quietest_releasing {
        return idx;
    }

    voices
        .iter()
        .enumerate()
        .min_by_key(|(_, v)| v.triggered_at)
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// Finds the voice to release for a matching Note Off: the oldest
/// non-idle voice sounding `note` (attack, decay, sustain, *or* already
/// releasing all count — re-releasing an already-releasing voice is a
/// harmless no-op). If none is found, falls back to a voice that went idle
/// within [`NOTE_OFF_GRACE`], tolerating a Note Off that lost the race
/// against its own envelope's completion.
pub fn find_voice_for_note_off(voices: &[Voice], note: u8) -> Option<usize> {
    let matches_note = |v: &&Voice| v.note == note;

    if let Some((idx, _)) = voices
        .iter()
        .enumerate()
        .filter(|(_, v)| matches_note(&v) && !v.is_idle())
        .min_by_key(|(_, v)| v.triggered_at)
    {
        return Some(idx);
    }

    voices
        .iter()
        .enumerate()
        .filter(|(_, v)| matches_note(&v) && v.is_idle() && v.is_within_note_off_grace())
        .min_by_key(|(_, v)| v.triggered_at)
        .map(|(idx, _)| idx)
}
