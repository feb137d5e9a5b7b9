//! MIDI event contract.
//!
//! MIDI input itself is an external collaborator — something upstream
//! parses a MIDI byte stream and hands us these already-decoded events.

/// A decoded MIDI event relevant to the polyphonic voice engine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MidiEvent {
    /// Allocates or steals a voice and triggers attack on both envelopes.
    NoteOn { note: u8, velocity: u8 },
    /// Triggers release on the oldest matching non-idle voice.
    NoteOff { note: u8 },
    /// Routed through the [`crate::param::ParamRegistry`].
    ControlChange { controller: u8, channel: u8, value: u8 },
}

impl MidiEvent {
    /// Velocity normalized to `[0, 1]`, or `0.0` for non-`NoteOn` events.
    pub fn normalized_velocity(self) -> f32 {
        match self {
            Self::NoteOn { velocity, .. } => f32::from(velocity) / 127.0,
            _ => 0.0,
        }
    }
}
