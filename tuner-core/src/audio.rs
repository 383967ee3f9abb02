//! # Audio Capture Module
//!
//! The [`AudioSource`] / [`AudioStream`] traits describe anything that can
//! deliver fixed-size mono frames to a callback. Three sources ship with the
//! crate:
//! - [`CpalSource`]: real-time capture from an input device via CPAL
//! - [`BufferSource`]: frames cut from an in-memory signal
//! - [`WavSource`]: a [`BufferSource`] loaded from a WAV file
//!
//! Frames are handed to the callback on the source's own thread, which the
//! analysis code treats as a real-time path.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SupportedStreamConfigRange;
use crossbeam_channel::{Receiver, Sender};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, TunerError};

/// Callback receiving one frame of exactly `frame_size` samples.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Stream parameters requested by the analysis pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub channels: u16,
    pub sample_rate: u32,
    pub frame_size: usize,
}

/// Something that can open a frame stream.
pub trait AudioSource: Send {
    /// Opens a stream that will call `on_frame` once started.
    fn open_stream(&mut self, spec: &StreamSpec, on_frame: FrameCallback)
        -> Result<Box<dyn AudioStream>>;
}

/// Handle to an opened stream. `stop` and `close` tolerate repeated calls.
pub trait AudioStream: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Accumulates arbitrarily sized chunks into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Appends `data` and emits every complete frame, oldest first.
    pub fn push(&mut self, data: &[f32], mut emit: impl FnMut(&[f32])) {
        if self.frame_size == 0 {
            return;
        }
        self.pending.extend_from_slice(data);
        while self.pending.len() >= self.frame_size {
            emit(&self.pending[..self.frame_size]);
            self.pending.drain(..self.frame_size);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// CPAL capture
// ---------------------------------------------------------------------------

/// Captures from a CPAL input device.
///
/// A `cpal::Stream` may not leave the thread that built it, so each opened
/// stream lives on a dedicated thread and is driven through a command channel.
#[derive(Debug, Clone, Default)]
pub struct CpalSource {
    device_name: Option<String>,
}

impl CpalSource {
    /// Captures from the host's default input device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures from the input device whose name matches `name`.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self { device_name: Some(name.into()) }
    }
}

enum StreamCommand {
    Play(Sender<Result<()>>),
    Pause(Sender<Result<()>>),
    Close,
}

impl AudioSource for CpalSource {
    fn open_stream(
        &mut self,
        spec: &StreamSpec,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn AudioStream>> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (control_tx, control_rx) = crossbeam_channel::unbounded::<StreamCommand>();
        let spec = spec.clone();
        let device_name = self.device_name.clone();

        let thread = thread::Builder::new()
            .name("audio-input".into())
            .spawn(move || run_capture_thread(device_name, spec, on_frame, ready_tx, control_rx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                control: control_tx,
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(TunerError::Audio("audio thread exited during setup".into()))
            }
        }
    }
}

fn run_capture_thread(
    device_name: Option<String>,
    spec: StreamSpec,
    on_frame: FrameCallback,
    ready: Sender<Result<()>>,
    control: Receiver<StreamCommand>,
) {
    let stream = match build_input_stream(device_name.as_deref(), &spec, on_frame) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    for command in control.iter() {
        match command {
            StreamCommand::Play(reply) => {
                let _ = reply.send(stream.play().map_err(TunerError::audio));
            }
            StreamCommand::Pause(reply) => {
                let _ = reply.send(stream.pause().map_err(TunerError::audio));
            }
            StreamCommand::Close => break,
        }
    }

    if let Err(e) = stream.pause() {
        log::warn!("Error pausing input stream: {}", e);
    }
    drop(stream);
    log::debug!("Audio input thread finished");
}

fn build_input_stream(
    device_name: Option<&str>,
    spec: &StreamSpec,
    mut on_frame: FrameCallback,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(wanted) => host
            .input_devices()
            .map_err(TunerError::audio)?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| TunerError::Audio(format!("No input device named '{wanted}'")))?,
        None => host
            .default_input_device()
            .ok_or_else(|| TunerError::Audio("No input device available".into()))?,
    };

    log::info!(
        "Using audio input device: {}",
        device.name().unwrap_or_else(|_| "<unknown>".into())
    );

    let configs = device
        .supported_input_configs()
        .map_err(TunerError::audio)?
        .collect::<Vec<_>>();
    let supported_config = find_supported_config(configs, spec.channels, spec.sample_rate)
        .ok_or_else(|| {
            TunerError::Audio(format!(
                "No f32 input format supports {} Hz",
                spec.sample_rate
            ))
        })?;

    let config: cpal::StreamConfig = supported_config
        .with_sample_rate(cpal::SampleRate(spec.sample_rate))
        .into();
    let channels = config.channels.max(1) as usize;
    log::info!(
        "Selected input format: {} Hz, {} channel(s), {} samples per frame",
        spec.sample_rate,
        channels,
        spec.frame_size
    );

    let mut assembler = FrameAssembler::new(spec.frame_size);
    let mut mono = Vec::with_capacity(spec.frame_size);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if channels == 1 {
                    assembler.push(data, |frame| on_frame(frame));
                } else {
                    mono.clear();
                    mono.extend(
                        data.chunks_exact(channels)
                            .map(|c| c.iter().sum::<f32>() / channels as f32),
                    );
                    assembler.push(&mono, |frame| on_frame(frame));
                }
            },
            |err| log::error!("An error occurred on the audio stream: {}", err),
            None,
        )
        .map_err(TunerError::audio)?;

    Ok(stream)
}

/// Picks an f32 configuration whose rate range contains `target_rate`
/// exactly, preferring the requested channel count and then the fewest
/// channels.
///
/// The rate is never substituted: the analysis pipeline is configured for
/// `target_rate`, so a device that cannot capture at it yields `None`.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    channels: u16,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .filter(|c| c.min_sample_rate().0 <= target_rate && target_rate <= c.max_sample_rate().0)
        .min_by_key(|c| (c.channels() != channels, c.channels()))
}

struct CpalStream {
    control: Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn request(&self, make: impl FnOnce(Sender<Result<()>>) -> StreamCommand) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.control
            .send(make(reply_tx))
            .map_err(|_| TunerError::Audio("audio thread is gone".into()))?;
        reply_rx
            .recv()
            .map_err(|_| TunerError::Audio("audio thread did not answer".into()))?
    }
}

impl AudioStream for CpalStream {
    fn start(&mut self) -> Result<()> {
        if self.thread.is_none() {
            return Err(TunerError::Audio("stream is closed".into()));
        }
        self.request(StreamCommand::Play)
    }

    fn stop(&mut self) -> Result<()> {
        if self.thread.is_none() {
            return Ok(());
        }
        self.request(StreamCommand::Pause)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(thread) = self.thread.take() {
            let _ = self.control.send(StreamCommand::Close);
            thread
                .join()
                .map_err(|_| TunerError::Audio("audio thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ---------------------------------------------------------------------------
// In-memory and file sources
// ---------------------------------------------------------------------------

/// Delivers frames cut from an in-memory mono signal.
///
/// A trailing partial frame is not delivered. With `realtime` enabled the
/// playback thread sleeps one frame duration between frames; `looping`
/// restarts from the beginning at the end of the signal.
#[derive(Debug, Clone)]
pub struct BufferSource {
    samples: Arc<[f32]>,
    sample_rate: u32,
    realtime: bool,
    looping: bool,
    finished: Arc<AtomicBool>,
}

impl BufferSource {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            realtime: false,
            looping: false,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Flag set once a non-looping source has delivered its last frame.
    pub fn finished_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.finished)
    }
}

impl AudioSource for BufferSource {
    fn open_stream(
        &mut self,
        spec: &StreamSpec,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn AudioStream>> {
        if spec.sample_rate != self.sample_rate {
            return Err(TunerError::Audio(format!(
                "signal is sampled at {} Hz but {} Hz was requested",
                self.sample_rate, spec.sample_rate
            )));
        }
        if spec.frame_size == 0 {
            return Err(TunerError::Audio("frame size must be positive".into()));
        }
        self.finished.store(false, Ordering::SeqCst);
        Ok(Box::new(BufferStream {
            samples: Arc::clone(&self.samples),
            frame_size: spec.frame_size,
            frame_duration: Duration::from_secs_f64(spec.frame_size as f64 / spec.sample_rate as f64),
            realtime: self.realtime,
            looping: self.looping,
            position: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            finished: Arc::clone(&self.finished),
            callback: Arc::new(Mutex::new(on_frame)),
            thread: None,
            closed: false,
        }))
    }
}

struct BufferStream {
    samples: Arc<[f32]>,
    frame_size: usize,
    frame_duration: Duration,
    realtime: bool,
    looping: bool,
    position: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    callback: Arc<Mutex<FrameCallback>>,
    thread: Option<JoinHandle<()>>,
    closed: bool,
}

impl AudioStream for BufferStream {
    fn start(&mut self) -> Result<()> {
        if self.closed {
            return Err(TunerError::Audio("stream is closed".into()));
        }
        if self.thread.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let samples = Arc::clone(&self.samples);
        let position = Arc::clone(&self.position);
        let running = Arc::clone(&self.running);
        let finished = Arc::clone(&self.finished);
        let callback = Arc::clone(&self.callback);
        let (frame_size, frame_duration, realtime, looping) =
            (self.frame_size, self.frame_duration, self.realtime, self.looping);

        let thread = thread::Builder::new().name("buffer-playback".into()).spawn(move || {
            while running.load(Ordering::SeqCst) {
                let start = position.load(Ordering::SeqCst);
                if start + frame_size > samples.len() {
                    if looping && samples.len() >= frame_size {
                        position.store(0, Ordering::SeqCst);
                        continue;
                    }
                    finished.store(true, Ordering::SeqCst);
                    break;
                }
                {
                    let mut on_frame = callback.lock().unwrap_or_else(PoisonError::into_inner);
                    on_frame(&samples[start..start + frame_size]);
                }
                position.store(start + frame_size, Ordering::SeqCst);
                if realtime {
                    thread::sleep(frame_duration);
                }
            }
        })?;
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| TunerError::Audio("playback thread panicked".into()))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.stop()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for BufferStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Loads WAV files into a [`BufferSource`].
pub struct WavSource;

impl WavSource {
    /// Reads a WAV file, mixing all channels down to mono and normalizing
    /// integer PCM to [-1, 1].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<BufferSource> {
        let reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<std::result::Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let samples: Vec<f32> = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks_exact(channels)
                .map(|c| c.iter().sum::<f32>() / channels as f32)
                .collect()
        };

        log::info!(
            "Loaded {} ({} samples at {} Hz, {} channel(s))",
            path.as_ref().display(),
            samples.len(),
            spec.sample_rate,
            channels
        );
        Ok(BufferSource::new(samples, spec.sample_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::{SampleFormat, SampleRate, SupportedBufferSize};

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn supported_config_prefers_requested_channels() {
        let configs = vec![
            range(2, 8_000, 96_000, SampleFormat::F32),
            range(1, 8_000, 96_000, SampleFormat::I16),
            range(1, 44_100, 48_000, SampleFormat::F32),
            range(4, 8_000, 96_000, SampleFormat::F32),
        ];
        let chosen = find_supported_config(configs.clone(), 1, 44_100).unwrap();
        assert_eq!((chosen.channels(), chosen.sample_format()), (1, SampleFormat::F32));

        // Mono f32 stops at 48 kHz; the stereo range is the next best.
        let chosen = find_supported_config(configs, 1, 96_000).unwrap();
        assert_eq!(chosen.channels(), 2);
    }

    #[test]
    fn supported_config_requires_exact_rate() {
        let configs = vec![
            range(1, 48_000, 48_000, SampleFormat::F32),
            range(1, 8_000, 96_000, SampleFormat::I16),
        ];
        assert!(find_supported_config(configs, 1, 44_100).is_none());
        assert!(find_supported_config(Vec::new(), 1, 44_100).is_none());
    }

    fn spec(frame_size: usize) -> StreamSpec {
        StreamSpec { channels: 1, sample_rate: 8_000, frame_size }
    }

    #[test]
    fn assembler_emits_fixed_frames() {
        let mut assembler = FrameAssembler::new(4);
        let mut frames: Vec<Vec<f32>> = Vec::new();
        assembler.push(&[1.0, 2.0, 3.0], |f| frames.push(f.to_vec()));
        assert!(frames.is_empty());
        assembler.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |f| frames.push(f.to_vec()));
        assert_eq!(frames, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn buffer_source_delivers_every_full_frame() {
        let signal: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let mut source = BufferSource::new(signal, 8_000);
        let finished = source.finished_flag();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut stream = source
            .open_stream(&spec(4), Box::new(move |f: &[f32]| tx.send(f.to_vec()).unwrap()))
            .unwrap();
        stream.start().unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(second, vec![4.0, 5.0, 6.0, 7.0]);

        stream.stop().unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
        stream.close().unwrap();
        stream.close().unwrap();
        assert!(stream.start().is_err());
    }

    #[test]
    fn buffer_source_rejects_rate_mismatch() {
        let mut source = BufferSource::new(vec![0.0; 16], 44_100);
        assert!(source.open_stream(&spec(4), Box::new(|_: &[f32]| {})).is_err());
    }

    #[test]
    fn wav_source_normalizes_and_downmixes() {
        let path = std::env::temp_dir().join(format!("tuner-wav-{}.wav", std::process::id()));
        let wav_spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, wav_spec).unwrap();
        for _ in 0..4 {
            writer.write_sample(16_384i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let source = WavSource::open(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(source.sample_rate(), 8_000);
        assert_eq!(source.len(), 4);
        assert!(source.samples.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }
}
