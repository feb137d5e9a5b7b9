//! The polyphonic MIDI-driven voice engine.

pub mod adsr;
pub mod engine;
pub mod voice;

pub use engine::{PolyEngine, PolyEngineParams};
pub use voice::{HarmonicKind, Voice};
