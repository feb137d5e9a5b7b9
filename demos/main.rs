//! Smoke-test binary: drives [`sp3ctra_core::Sp3ctraEngine`] with a
//! synthetic scrolling test-card image and a synthetic MIDI note generator,
//! and plays the result through the default audio device via `cpal`.
//!
//! Not part of the core's public contract — audio device I/O is explicitly
//! out of scope for the library itself (see `lib.rs`). This binary exists
//! only to exercise the engine end to end.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use sp3ctra_core::{Config, MidiEvent, OwnedImageRow, Sp3ctraEngine};

const IMAGE_WIDTH: usize = 2_048;
const ROW_INTERVAL: Duration = Duration::from_millis(20);

/// Generates a scrolling vertical color-bar test card, one row at a time, so
/// the additive engine has a continuously changing target to chase.
fn generate_row(phase: f32) -> OwnedImageRow {
    let mut r = vec![0u8; IMAGE_WIDTH];
    let mut g = vec![0u8; IMAGE_WIDTH];
    let mut b = vec![0u8; IMAGE_WIDTH];

    for x in 0..IMAGE_WIDTH {
        let t = x as f32 / IMAGE_WIDTH as f32;
        let hue = (t + phase).fract();
        let (rr, gg, bb) = hsv_to_rgb(hue);
        r[x] = rr;
        g[x] = gg;
        b[x] = bb;
    }

    OwnedImageRow::new(r, g, b, 0)
}

fn hsv_to_rgb(hue: f32) -> (u8, u8, u8) {
    let i = (hue * 6.0).floor() as i32;
    let f = hue * 6.0 - i as f32;
    let (r, g, b) = match i.rem_euclid(6) {
        0 => (1.0, f, 0.0),
        1 => (1.0 - f, 1.0, 0.0),
        2 => (0.0, 1.0, f),
        3 => (0.0, 1.0 - f, 1.0),
        4 => (f, 0.0, 1.0),
        _ => (1.0, 0.0, 1.0 - f),
    };
    ((r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8)
}

/// A slow arpeggio over a minor pentatonic scale, so the polyphonic engine
/// has something audible to demonstrate alongside the additive bank.
fn spawn_midi_generator(engine: Arc<Sp3ctraEngine>) {
    const SCALE: [u8; 5] = [60, 63, 65, 67, 70];
    std::thread::spawn(move || {
        let mut step = 0usize;
        loop {
            let note = SCALE[step % SCALE.len()];
            engine.submit_midi(MidiEvent::NoteOn { note, velocity: 96 });
            std::thread::sleep(Duration::from_millis(400));
            engine.submit_midi(MidiEvent::NoteOff { note });
            step += 1;
        }
    });
}

fn spawn_image_generator(engine: Arc<Sp3ctraEngine>) {
    std::thread::spawn(move || {
        let mut phase = 0.0f32;
        loop {
            engine.submit_image_row(generate_row(phase));
            phase = (phase + 0.01).fract();
            std::thread::sleep(ROW_INTERVAL);
        }
    });
}

fn main() {
    env_logger::init();

    let host = cpal::default_host();
    let device = host.default_output_device().expect("no default output device");
    let supported = device
        .default_output_config()
        .expect("no default output config");
    let sample_rate = supported.sample_rate().0 as f32;
    let channels = supported.channels() as usize;

    let mut config = Config::default();
    config.sampling_frequency = sample_rate;
    config.num_notes = 256;
    config.num_workers = num_cpus::get().clamp(1, 8);

    let engine = Arc::new(Sp3ctraEngine::new(config).expect("engine should start"));
    spawn_image_generator(Arc::clone(&engine));
    spawn_midi_generator(Arc::clone(&engine));

    let stream_config: cpal::StreamConfig = supported.config();
    let underruns_logged = Arc::new(AtomicU64::new(0));
    let mut scratch = CallbackScratch::default();

    let stream_engine = Arc::clone(&engine);
    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                pull_into_interleaved(&stream_engine, data, channels, &underruns_logged, &mut scratch);
            },
            move |err| log::error!("audio stream error: {err}"),
            None,
        )
        .expect("failed to build output stream");

    stream.play().expect("failed to start output stream");
    log::info!("sp3ctra demo running at {sample_rate} Hz, {channels} channel(s); Ctrl+C to exit");

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

/// Reusable per-callback scratch, so the audio callback itself never
/// allocates once the stream is running — mirroring the non-allocation
/// discipline the core's own RT path follows, even though this
/// callback is the embedding program's responsibility, not the core's.
#[derive(Default)]
struct CallbackScratch {
    additive_left: Vec<f32>,
    additive_right: Vec<f32>,
    poly_left: Vec<f32>,
    poly_right: Vec<f32>,
}

impl CallbackScratch {
    fn resize(&mut self, frames: usize) {
        self.additive_left.resize(frames, 0.0);
        self.additive_right.resize(frames, 0.0);
        self.poly_left.resize(frames, 0.0);
        self.poly_right.resize(frames, 0.0);
    }
}

/// Pulls one block from both real-time output buffers, sums them, and
/// interleaves into `data`.
fn pull_into_interleaved(
    engine: &Sp3ctraEngine,
    data: &mut [f32],
    channels: usize,
    underruns_logged: &AtomicU64,
    scratch: &mut CallbackScratch,
) {
    let frames = data.len() / channels.max(1);
    scratch.resize(frames);

    let additive_ok = engine
        .additive_output()
        .consume_into(&mut scratch.additive_left, &mut scratch.additive_right);
    let poly_ok = engine
        .poly_output()
        .consume_into(&mut scratch.poly_left, &mut scratch.poly_right);

    if !additive_ok && !poly_ok {
        underruns_logged.fetch_add(1, Ordering::Relaxed);
    }

    for (i, frame) in data.chunks_mut(channels).enumerate() {
        let left = scratch.additive_left[i] + scratch.poly_left[i];
        let right = scratch.additive_right[i] + scratch.poly_right[i];
        if channels == 1 {
            frame[0] = 0.5 * (left + right);
        } else {
            frame[0] = left;
            frame[1] = right;
            for sample in frame.iter_mut().skip(2) {
                *sample = 0.0;
            }
        }
    }
}
