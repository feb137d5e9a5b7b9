//! The top-level engine: owns every stage from one streamed
//! image row down to the real-time output handoff, and ties the additive
//! worker pool, the polyphonic voice engine, and the parameter registry
//! together on two persistent threads.
//!
//! Image ingestion (UDP framing, row reassembly) and MIDI byte parsing are
//! both external collaborators' jobs; this module only accepts already
//! decoded rows and events through bounded channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::frame::PreprocessedFrame;
use crate::image::{ImageRow, Preprocessor};
use crate::midi::MidiEvent;
use crate::mixer::Mixer;
use crate::note::NoteBank;
use crate::param::{ParamId, ParamRegistry};
use crate::poly::{PolyEngine, PolyEngineParams};
use crate::sync::{PreprocessedDoubleBuffer, RtOutputBuffer, WaitResult};
use crate::waveform::WaveformBank;
use crate::worker::WorkerPool;

/// Depth of the image-row ingestion channel. Small on purpose: at ~50 Hz
/// line-scan rate against a 44.1 kHz+ audio thread, the preprocessor should
/// never fall meaningfully behind, so a deep queue would only let stale rows
/// pile up.
const IMAGE_CHANNEL_DEPTH: usize = 4;
/// Depth of the MIDI ingestion channel. Generous relative to the image
/// channel since note events arrive in bursts (chords) rather than at a
/// steady rate.
const MIDI_CHANNEL_DEPTH: usize = 256;

/// One streamed scanline, owned so it can cross the channel into the
/// preprocessor thread. [`ImageRow`] itself only ever borrows.
pub struct OwnedImageRow {
    pub r: Vec<u8>,
    pub g: Vec<u8>,
    pub b: Vec<u8>,
    pub timestamp_us: u64,
}

impl OwnedImageRow {
    pub fn new(r: Vec<u8>, g: Vec<u8>, b: Vec<u8>, timestamp_us: u64) -> Self {
        Self { r, g, b, timestamp_us }
    }
}

/// The real-time engine. Construction spawns the preprocessor and audio
/// processing threads immediately; dropping the engine tears both down.
pub struct Sp3ctraEngine {
    config: Config,
    waveform: Arc<RwLock<WaveformBank>>,
    param_registry: Arc<ParamRegistry>,
    additive_output: Arc<RtOutputBuffer>,
    poly_output: Arc<RtOutputBuffer>,
    worker_pool: Arc<WorkerPool>,
    mixer: Arc<Mutex<Mixer>>,
    image_tx: Option<Sender<OwnedImageRow>>,
    midi_tx: Sender<MidiEvent>,
    must_exit: Arc<AtomicBool>,
    preproc_thread: Option<JoinHandle<()>>,
    audio_thread: Option<JoinHandle<()>>,
}

impl Sp3ctraEngine {
    /// Validates `config`, builds every stage, and starts the engine's two
    /// background threads. Fails only on configuration rejection or a
    /// startup resource failure.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let (waveform_bank, geometries) = WaveformBank::build(
            config.low_frequency,
            config.high_frequency,
            config.num_notes,
            config.sampling_frequency,
            config.comma_per_semitone,
            config.semitone_per_octave,
        );
        let waveform = Arc::new(RwLock::new(waveform_bank));

        let notes = NoteBank::new(
            &geometries,
            config.tau_up_base_ms / 1_000.0,
            config.tau_down_base_ms / 1_000.0,
            config.decay_freq_ref_hz,
            config.decay_freq_beta,
            config.sampling_frequency,
        );

        let frame_buffer = Arc::new(PreprocessedDoubleBuffer::new(
            config.num_notes,
            config.poly_max_oscillators,
        ));

        let worker_pool = Arc::new(WorkerPool::new(
            config.num_workers,
            notes,
            Arc::clone(&waveform),
            Arc::clone(&frame_buffer),
            config.volume_weighting_exponent,
            config.stereo_mode_enabled,
        ));

        let mixer = Arc::new(Mutex::new(Mixer::new(
            config.summation_response_exponent,
            config.summation_base_level,
            config.soft_limit_threshold,
            config.soft_limit_knee,
            config.sampling_frequency,
            config.stereo_mode_enabled,
        )));

        let poly_engine = Arc::new(Mutex::new(PolyEngine::new(
            config.poly_num_voices,
            config.poly_max_oscillators,
            config.poly_amp_attack_ms,
            config.poly_amp_decay_ms,
            config.poly_amp_sustain,
            config.poly_amp_release_ms,
            config.poly_filter_attack_ms,
            config.poly_filter_decay_ms,
            config.poly_filter_sustain,
            config.poly_filter_release_ms,
            config.sampling_frequency,
            PolyEngineParams {
                filter_cutoff_hz: config.poly_filter_cutoff_hz,
                filter_env_depth_hz: config.poly_filter_env_depth_hz,
                lfo_rate_hz: config.poly_lfo_rate_hz,
                lfo_depth_semitones: config.poly_lfo_depth_semitones,
                amplitude_gamma: config.poly_amplitude_gamma,
                min_audible_amplitude: config.poly_min_audible_amplitude,
                master_volume: config.poly_master_volume,
                high_freq_harmonic_limit_hz: config.poly_high_freq_harmonic_limit_hz,
            },
        )));

        let preprocessor = Preprocessor::new(
            config.num_notes,
            config.pixels_per_note,
            config.poly_max_oscillators,
            config.brightness_gamma,
        );

        let additive_output = Arc::new(RtOutputBuffer::new());
        let poly_output = Arc::new(RtOutputBuffer::new());
        let param_registry = Arc::new(ParamRegistry::new());

        register_param_routing(
            &param_registry,
            Arc::clone(&mixer),
            Arc::clone(&poly_engine),
            Arc::clone(&worker_pool),
        );

        let (image_tx, image_rx) = crossbeam_channel::bounded(IMAGE_CHANNEL_DEPTH);
        let (midi_tx, midi_rx) = crossbeam_channel::bounded(MIDI_CHANNEL_DEPTH);
        let must_exit = Arc::new(AtomicBool::new(false));

        let preproc_frame_buffer = Arc::clone(&frame_buffer);
        let preproc_thread = std::thread::Builder::new()
            .name("sp3ctra-preprocessor".to_string())
            .spawn(move || preprocessor_main(image_rx, preprocessor, preproc_frame_buffer))
            .map_err(|e| EngineError::ResourceExhaustion(e.to_string()))?;

        let audio_ctx = AudioThreadContext {
            must_exit: Arc::clone(&must_exit),
            worker_pool: Arc::clone(&worker_pool),
            mixer: Arc::clone(&mixer),
            poly_engine,
            frame_buffer: Arc::clone(&frame_buffer),
            waveform: Arc::clone(&waveform),
            additive_output: Arc::clone(&additive_output),
            poly_output: Arc::clone(&poly_output),
            param_registry: Arc::clone(&param_registry),
            midi_rx,
            block_len: config.audio_buffer_size,
            num_notes: config.num_notes,
            num_partials: config.poly_max_oscillators,
            sample_rate: config.sampling_frequency,
            comma_per_semitone: config.comma_per_semitone,
            semitone_per_octave: config.semitone_per_octave,
            tau_up_base_ms: config.tau_up_base_ms,
            tau_down_base_ms: config.tau_down_base_ms,
            decay_freq_ref_hz: config.decay_freq_ref_hz,
            decay_freq_beta: config.decay_freq_beta,
        };

        let audio_thread = std::thread::Builder::new()
            .name("sp3ctra-audio".to_string())
            .spawn(move || audio_main(audio_ctx))
            .map_err(|e| EngineError::ResourceExhaustion(e.to_string()))?;

        Ok(Self {
            config,
            waveform,
            param_registry,
            additive_output,
            poly_output,
            worker_pool,
            mixer,
            image_tx: Some(image_tx),
            midi_tx,
            must_exit,
            preproc_thread: Some(preproc_thread),
            audio_thread: Some(audio_thread),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn param_registry(&self) -> &Arc<ParamRegistry> {
        &self.param_registry
    }

    /// The additive engine's real-time output handoff, for the embedding
    /// program's audio callback to pull from via [`crate::sync::AudioSink`]
    /// or directly.
    pub fn additive_output(&self) -> &Arc<RtOutputBuffer> {
        &self.additive_output
    }

    /// The polyphonic engine's real-time output handoff, kept separate from
    /// [`Self::additive_output`] so the embedding program can mix, route, or
    /// monitor the two engines independently.
    pub fn poly_output(&self) -> &Arc<RtOutputBuffer> {
        &self.poly_output
    }

    /// Requests a hot reload of the additive bank's frequency range. Honored
    /// between audio blocks by the audio processing thread, not immediately.
    pub fn request_frequency_range_reload(&self, low_frequency: f32, high_frequency: f32) {
        self.waveform.read().request_reload(low_frequency, high_frequency);
    }

    /// Toggles stereo panning for the additive engine, effective from the
    /// next block. The worker pool and the mixer must agree on this flag —
    /// the pool decides whether to accumulate panned sums at all, the mixer
    /// decides whether to read them instead of duplicating the mono sum —
    /// so this is the only place either should be flipped from.
    pub fn set_stereo_enabled(&self, enabled: bool) {
        self.worker_pool.set_stereo_enabled(enabled);
        self.mixer.lock().set_stereo_enabled(enabled);
    }

    /// Submits one decoded image row. Drops the row and returns `false`
    /// without blocking if the preprocessor has fallen behind — a dropped
    /// stale scanline is preferable to blocking the ingestion thread.
    pub fn submit_image_row(&self, row: OwnedImageRow) -> bool {
        match self.image_tx.as_ref().expect("image channel taken only on drop").try_send(row) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("image ingestion channel full, dropping row");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Submits one decoded MIDI event. Drops and returns `false` without
    /// blocking if the channel is full.
    pub fn submit_midi(&self, event: MidiEvent) -> bool {
        match self.midi_tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("MIDI ingestion channel full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl Drop for Sp3ctraEngine {
    fn drop(&mut self) {
        // Dropping the sender first closes the channel, so the
        // preprocessor's `for row in rx.iter()` ends on its own.
        self.image_tx.take();
        self.must_exit.store(true, Ordering::Release);

        if let Some(handle) = self.preproc_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.audio_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Wires every externally-reachable [`ParamId`] to the component that owns
/// it.
fn register_param_routing(
    registry: &ParamRegistry,
    mixer: Arc<Mutex<Mixer>>,
    poly_engine: Arc<Mutex<PolyEngine>>,
    worker_pool: Arc<WorkerPool>,
) {
    registry.register(move |param, _normalized, raw| match param {
        ParamId::SummationResponseExponent => mixer.lock().set_summation_response_exponent(raw),
        ParamId::SummationBaseLevel => mixer.lock().set_summation_base_level(raw),
        ParamId::VolumeWeightingExponent => worker_pool.set_volume_weighting_exponent(raw),
        ParamId::SoftLimitThreshold => mixer.lock().set_soft_limit_threshold(raw),
        ParamId::SoftLimitKnee => mixer.lock().set_soft_limit_knee(raw),
        ParamId::PolyFilterCutoffHz => poly_engine.lock().set_filter_cutoff_hz(raw),
        ParamId::PolyFilterEnvDepthHz => poly_engine.lock().set_filter_env_depth_hz(raw),
        ParamId::PolyLfoRateHz => poly_engine.lock().set_lfo_rate_hz(raw),
        ParamId::PolyLfoDepthSemitones => poly_engine.lock().set_lfo_depth_semitones(raw),
        ParamId::PolyAmplitudeGamma => poly_engine.lock().set_amplitude_gamma(raw),
        ParamId::PolyMasterVolume => poly_engine.lock().set_master_volume(raw),
    });
}

fn preprocessor_main(
    image_rx: Receiver<OwnedImageRow>,
    preprocessor: Preprocessor,
    frame_buffer: Arc<PreprocessedDoubleBuffer>,
) {
    for owned_row in image_rx.iter() {
        let row = match ImageRow::new(&owned_row.r, &owned_row.g, &owned_row.b) {
            Some(row) => row,
            None => {
                log::warn!("dropped image row with mismatched channel lengths");
                continue;
            }
        };

        frame_buffer.write(|frame| {
            if !preprocessor.process(&row, owned_row.timestamp_us, frame) {
                log::warn!("dropped image row narrower than one note; publishing silence");
                frame.clear_to_silence();
            }
        });
    }
}

struct AudioThreadContext {
    must_exit: Arc<AtomicBool>,
    worker_pool: Arc<WorkerPool>,
    mixer: Arc<Mutex<Mixer>>,
    poly_engine: Arc<Mutex<PolyEngine>>,
    frame_buffer: Arc<PreprocessedDoubleBuffer>,
    waveform: Arc<RwLock<WaveformBank>>,
    additive_output: Arc<RtOutputBuffer>,
    poly_output: Arc<RtOutputBuffer>,
    param_registry: Arc<ParamRegistry>,
    midi_rx: Receiver<MidiEvent>,
    block_len: usize,
    num_notes: usize,
    num_partials: usize,
    sample_rate: f32,
    comma_per_semitone: u32,
    semitone_per_octave: u32,
    tau_up_base_ms: f32,
    tau_down_base_ms: f32,
    decay_freq_ref_hz: f32,
    decay_freq_beta: f32,
}

/// The audio processing thread's body: drains MIDI, applies any pending
/// waveform-bank reload, runs one worker-pool block, mixes and shapes it,
/// runs the polyphonic engine over the same frame, and publishes both
/// engines' output. Every scratch buffer is preallocated before the loop so
/// no iteration allocates.
fn audio_main(ctx: AudioThreadContext) {
    let AudioThreadContext {
        must_exit,
        worker_pool,
        mixer,
        poly_engine,
        frame_buffer,
        waveform,
        additive_output,
        poly_output,
        param_registry,
        midi_rx,
        block_len,
        num_notes,
        num_partials,
        sample_rate,
        comma_per_semitone,
        semitone_per_octave,
        tau_up_base_ms,
        tau_down_base_ms,
        decay_freq_ref_hz,
        decay_freq_beta,
    } = ctx;

    if let Err(err) =
        thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
    {
        log::warn!("could not raise audio processing thread priority: {err:?}");
    }

    let mut additive_left = vec![0.0f32; block_len];
    let mut additive_right = vec![0.0f32; block_len];
    let mut poly_left = vec![0.0f32; block_len];
    let mut poly_right = vec![0.0f32; block_len];
    let mut contrast_factor = 0.0f32;
    let mut frame_snapshot = PreprocessedFrame::zeroed(num_notes, num_partials);

    let consume_timeout = Duration::from_secs_f32(4.0 * block_len as f32 / sample_rate);
    let mut timestamp_us: u64 = 0;
    let sample_period_us = (1_000_000.0 * block_len as f32 / sample_rate) as u64;

    loop {
        if must_exit.load(Ordering::Acquire) {
            break;
        }

        while let Ok(event) = midi_rx.try_recv() {
            param_registry.handle_event(event);
            poly_engine.lock().handle_midi(event);
        }

        if let Some(new_geometries) = waveform.write().apply_pending_reload(
            num_notes,
            sample_rate,
            comma_per_semitone,
            semitone_per_octave,
        ) {
            worker_pool.apply_geometry_reload(
                &new_geometries,
                tau_up_base_ms / 1_000.0,
                tau_down_base_ms / 1_000.0,
                decay_freq_ref_hz,
                decay_freq_beta,
                sample_rate,
            );
            mixer.lock().restart_fade();
        }

        if let WaitResult::ShuttingDown = worker_pool.run_block(block_len) {
            break;
        }

        frame_buffer.read(|frame| {
            contrast_factor = frame.additive.contrast_factor;
            frame_snapshot.polyphonic.magnitudes.copy_from_slice(&frame.polyphonic.magnitudes);
            frame_snapshot.polyphonic.left_gains.copy_from_slice(&frame.polyphonic.left_gains);
            frame_snapshot.polyphonic.right_gains.copy_from_slice(&frame.polyphonic.right_gains);
            frame_snapshot.polyphonic.harmonicity.copy_from_slice(&frame.polyphonic.harmonicity);
            frame_snapshot.polyphonic.detune_cents.copy_from_slice(&frame.polyphonic.detune_cents);
            frame_snapshot
                .polyphonic
                .inharmonic_ratios
                .copy_from_slice(&frame.polyphonic.inharmonic_ratios);
        });

        mixer.lock().process(
            worker_pool.partial_sums(),
            block_len,
            contrast_factor,
            &mut additive_left,
            &mut additive_right,
        );
        additive_output.publish(&additive_left, &additive_right, timestamp_us);

        poly_engine.lock().process(
            &frame_snapshot,
            block_len,
            sample_rate,
            &mut poly_left,
            &mut poly_right,
        );
        poly_output.publish(&poly_left, &poly_right, timestamp_us);

        timestamp_us = timestamp_us.wrapping_add(sample_period_us);
        additive_output.wait_for_consumption(consume_timeout);
    }
}
