//! Sp3ctra core: a real-time image-to-sound additive synthesizer.
//!
//! One continuously streamed RGB scanline per frame drives a bank of
//! additive oscillators and, independently, a MIDI-driven
//! polyphonic voice engine that shapes its partials from the same image
//! data. Both engines hand their output to the embedding
//! program through a lock-free, non-blocking real-time buffer
//! rather than owning any audio device themselves.
//!
//! This crate never touches a sound card, a MIDI port, a DMX universe, an
//! on-screen display, or the filesystem — those are the embedding program's
//! job. See [`engine::Sp3ctraEngine`] for the entry point.

pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod image;
pub mod midi;
pub mod mixer;
pub mod note;
pub mod param;
pub mod poly;
pub mod pow_lut;
pub mod sync;
pub mod waveform;
pub mod worker;

pub use config::Config;
pub use engine::{OwnedImageRow, Sp3ctraEngine};
pub use error::{EngineError, Result};
pub use midi::MidiEvent;
pub use param::{ParamId, ParamMapping, ParamRegistry, ScaleKind};
pub use sync::{AudioSink, RtOutputBuffer};
