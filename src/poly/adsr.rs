//! Coefficient-based ADSR envelope.
//!
//! Uses the same one-pole exponential-ramp shape as [`crate::note`]'s
//! envelope coefficients rather than a sample-accurate linear ramp, so both
//! engines share one mental model of "envelope" even though they serve
//! different instruments.

const STAGE_EPSILON: f32 = 1e-3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Precomputed per-stage coefficients. Shared by every voice using the same
/// attack/decay/sustain/release settings; recomputed only when those
/// settings change.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdsrCoeffs {
    pub attack_alpha: f32,
    pub decay_alpha: f32,
    pub sustain_level: f32,
    pub release_alpha: f32,
}

fn one_pole_alpha(tau_ms: f32, sample_rate: f32) -> f32 {
    let tau_s = (tau_ms / 1_000.0).max(1e-4);
    (1.0 - (-1.0 / (tau_s * sample_rate)).exp()).clamp(1e-6, 1.0)
}

pub fn compute_adsr_coeffs(
    attack_ms: f32,
    decay_ms: f32,
    sustain_level: f32,
    release_ms: f32,
    sample_rate: f32,
) -> AdsrCoeffs {
    AdsrCoeffs {
        attack_alpha: one_pole_alpha(attack_ms, sample_rate),
        decay_alpha: one_pole_alpha(decay_ms, sample_rate),
        sustain_level: sustain_level.clamp(0.0, 1.0),
        release_alpha: one_pole_alpha(release_ms, sample_rate),
    }
}

/// One ADSR instance. A voice owns two: one shaping amplitude, one shaping
/// the spectral roll-off cutoff.
#[derive(Clone, Copy, Debug)]
pub struct Adsr {
    coeffs: AdsrCoeffs,
    stage: Stage,
    level: f32,
}

impl Adsr {
    pub fn new(coeffs: AdsrCoeffs) -> Self {
        Self { coeffs, stage: Stage::Idle, level: 0.0 }
    }

    pub fn set_coeffs(&mut self, coeffs: AdsrCoeffs) {
        self.coeffs = coeffs;
    }

    pub fn trigger_on(&mut self) {
        self.stage = Stage::Attack;
    }

    /// No-op if already idle or releasing.
    pub fn trigger_off(&mut self) {
        if !matches!(self.stage, Stage::Idle | Stage::Release) {
            self.stage = Stage::Release;
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Idle
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    /// Advances the envelope by one sample and returns the new level.
    pub fn tick(&mut self) -> f32 {
        match self.stage {
            Stage::Idle => self.level = 0.0,
            Stage::Attack => {
                self.level += self.coeffs.attack_alpha * (1.0 - self.level);
                if 1.0 - self.level < STAGE_EPSILON {
                    self.level = 1.0;
                    self.stage = Stage::Decay;
                }
            }
            Stage::Decay => {
                let target = self.coeffs.sustain_level;
                self.level += self.coeffs.decay_alpha * (target - self.level);
                if (self.level - target).abs() < STAGE_EPSILON {
                    self.level = target;
                    self.stage = Stage::Sustain;
                }
            }
            Stage::Sustain => self.level = self.coeffs.sustain_level,
            Stage::Release => {
                self.level += self.coeffs.release_alpha * (0.0 - self.level);
                if self.level < STAGE_EPSILON {
                    self.level = 0.0;
                    self.stage = Stage::Idle;
                }
            }
        }
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coeffs() -> AdsrCoeffs {
        compute_adsr_coeffs(5.0, 50.0, 0.7, 200.0, 48_000.0)
    }

    #[test]
    fn idle_envelope_stays_at_zero() {
        let mut env = Adsr::new(coeffs());
        assert_eq!(env.tick(), 0.0);
        assert!(env.is_idle());
    }

    #[test]
    fn full_cycle_reaches_sustain_then_returns_to_idle() {
        let mut env = Adsr::new(coeffs());
        env.trigger_on();

        for _ in 0..20_000 {
            env.tick();
        }
        assert_eq!(env.stage(), Stage::Sustain);
        assert!((env.level() - 0.7).abs() < 1e-2);

        env.trigger_off();
        for _ in 0..20_000 {
            env.tick();
        }
        assert!(env.is_idle());
        assert_eq!(env.level(), 0.0);
    }

    #[test]
    fn release_from_idle_is_a_no_op() {
        let mut env = Adsr::new(coeffs());
        env.trigger_off();
        assert!(env.is_idle());
    }
}
