//! Control-Change parameter mapping registry.
//!
//! Maps `(controller, channel)` pairs to a named engine parameter with a
//! declared scaling and range, and dispatches registered callbacks with
//! both the normalized `[0, 1]` CC value and the value scaled into the
//! parameter's raw units.
//!
//! Registration and CC dispatch both happen on the control thread, never on
//! the audio callback or inside a worker's block loop, so a plain
//! [`parking_lot::Mutex`] around the mapping table is acceptable here —
//! unlike the preprocessed-buffer mutex in [`crate::sync::double_buffer`],
//! this one is never touched from a real-time thread.

use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::midi::MidiEvent;

/// Every engine parameter reachable through MIDI CC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamId {
    SummationResponseExponent,
    SummationBaseLevel,
    VolumeWeightingExponent,
    SoftLimitThreshold,
    SoftLimitKnee,
    PolyFilterCutoffHz,
    PolyFilterEnvDepthHz,
    PolyLfoRateHz,
    PolyLfoDepthSemitones,
    PolyAmplitudeGamma,
    PolyMasterVolume,
}

/// How a normalized `[0, 1]` CC value maps onto a parameter's raw range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScaleKind {
    Linear,
    Logarithmic,
    Exponential,
    /// Quantizes the normalized value into `steps` discrete levels before
    /// scaling into the range.
    Discrete(u32),
}

impl ScaleKind {
    fn scale(self, normalized: f32, range: &RangeInclusive<f32>) -> f32 {
        let (lo, hi) = (*range.start(), *range.end());
        let t = normalized.clamp(0.0, 1.0);

        match self {
            Self::Linear => lo + (hi - lo) * t,
            Self::Logarithmic => {
                let lo = lo.max(f32::MIN_POSITIVE);
                let hi = hi.max(lo);
                (lo.ln() + (hi.ln() - lo.ln()) * t).exp()
            }
            Self::Exponential => lo + (hi - lo) * t * t,
            Self::Discrete(steps) => {
                let steps = steps.max(1);
                let quantized = (t * steps as f32).round() / steps as f32;
                lo + (hi - lo) * quantized
            }
        }
    }
}

/// A single `(controller, channel) -> parameter` mapping.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamMapping {
    pub controller: u8,
    /// `None` matches any channel.
    pub channel: Option<u8>,
    pub param: ParamId,
    pub scale: ScaleKind,
    pub range: RangeInclusive<f32>,
}

type ParamCallback = Box<dyn Fn(ParamId, f32, f32) + Send + Sync>;

/// Holds the mapping table and registered callbacks, and dispatches
/// incoming `ControlChange` events to them.
pub struct ParamRegistry {
    mappings: Mutex<Arc<[ParamMapping]>>,
    callbacks: Mutex<Vec<ParamCallback>>,
}

impl Default for ParamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self {
            mappings: Mutex::new(Arc::from(Vec::new().into_boxed_slice())),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the entire mapping table. Mappings are swapped as a unit
    /// (never mutated element-by-element) so a concurrent `handle_cc` always
    /// sees a consistent table.
    pub fn set_mappings(&self, mappings: Vec<ParamMapping>) {
        *self.mappings.lock() = Arc::from(mappings.into_boxed_slice());
    }

    /// Registers a callback invoked for every matching CC event with
    /// `(param, normalized, raw)`.
    pub fn register(&self, callback: impl Fn(ParamId, f32, f32) + Send + Sync + 'static) {
        self.callbacks.lock().push(Box::new(callback));
    }

    /// Routes a decoded MIDI event. Non-`ControlChange` events are ignored.
    pub fn handle_event(&self, event: MidiEvent) {
        if let MidiEvent::ControlChange { controller, channel, value } = event {
            self.handle_cc(controller, channel, value);
        }
    }

    fn handle_cc(&self, controller: u8, channel: u8, value: u8) {
        let normalized = f32::from(value) / 127.0;
        let mappings = self.mappings.lock().clone();
        let callbacks = self.callbacks.lock();

        for mapping in mappings.iter() {
            if mapping.controller != controller {
                continue;
            }
            if let Some(required_channel) = mapping.channel {
                if required_channel != channel {
                    continue;
                }
            }

            let raw = mapping.scale.scale(normalized, &mapping.range);
            for callback in callbacks.iter() {
                callback(mapping.param, normalized, raw);
            }
        }
    }
}
