// End-to-end tests of the start/stop lifecycle with a hand-driven audio
// source and stub estimators, so no audio hardware is needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tuner_core::audio::{AudioSource, AudioStream, BufferSource, FrameCallback, StreamSpec};
use tuner_core::detector::{default_estimator_factory, EstimatorFactory, LifecycleState};
use tuner_core::pitch::{EstimatorSpec, PitchEstimator};
use tuner_core::{PitchDetector, Status, TunerConfig, TunerError};

const SAMPLE_RATE: u32 = 44_100;
const FRAME_SIZE: usize = 1024;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ManualState {
    callback: Option<FrameCallback>,
    running: bool,
    opens: usize,
    closes: usize,
    fail_open: bool,
    fail_start: bool,
    fail_close: bool,
}

/// Audio source whose frames are pushed by the test itself.
#[derive(Clone, Default)]
struct ManualSource {
    state: Arc<Mutex<ManualState>>,
}

impl ManualSource {
    /// Delivers one frame synchronously; false if the stream is not running.
    fn deliver(&self, frame: &[f32]) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return false;
        }
        match state.callback.as_mut() {
            Some(on_frame) => {
                on_frame(frame);
                true
            }
            None => false,
        }
    }

    fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    fn set_fail_open(&self, fail: bool) {
        self.state.lock().unwrap().fail_open = fail;
    }

    fn set_fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    fn set_fail_close(&self, fail: bool) {
        self.state.lock().unwrap().fail_close = fail;
    }
}

impl AudioSource for ManualSource {
    fn open_stream(
        &mut self,
        spec: &StreamSpec,
        on_frame: FrameCallback,
    ) -> tuner_core::Result<Box<dyn AudioStream>> {
        assert_eq!(spec.channels, 1);
        let mut state = self.state.lock().unwrap();
        if state.fail_open {
            return Err(TunerError::Audio("No input device available".into()));
        }
        state.opens += 1;
        state.callback = Some(on_frame);
        Ok(Box::new(ManualStream {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

struct ManualStream {
    state: Arc<Mutex<ManualState>>,
    closed: bool,
}

impl AudioStream for ManualStream {
    fn start(&mut self) -> tuner_core::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_start {
            return Err(TunerError::Audio("device busy".into()));
        }
        state.running = true;
        Ok(())
    }

    fn stop(&mut self) -> tuner_core::Result<()> {
        self.state.lock().unwrap().running = false;
        Ok(())
    }

    fn close(&mut self) -> tuner_core::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.callback = None;
        state.closes += 1;
        if state.fail_close {
            return Err(TunerError::Audio("device vanished".into()));
        }
        Ok(())
    }
}

/// Counts what the lifecycle does with its estimators.
#[derive(Clone, Default)]
struct EstimatorLog {
    created: Arc<AtomicUsize>,
    estimates: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

/// Reports a fixed pitch for every frame it is given.
struct FixedEstimator {
    pitch: f32,
    log: EstimatorLog,
}

impl PitchEstimator for FixedEstimator {
    fn estimate(&mut self, _frame: &[f32]) -> f32 {
        self.log.estimates.fetch_add(1, Ordering::SeqCst);
        self.pitch
    }

    fn release(&mut self) {
        self.log.releases.fetch_add(1, Ordering::SeqCst);
    }
}

fn fixed_factory(pitch: f32, log: &EstimatorLog) -> EstimatorFactory {
    let log = log.clone();
    Box::new(move |spec: &EstimatorSpec| {
        assert_eq!(spec.frame_size, FRAME_SIZE);
        assert_eq!(spec.sample_rate, SAMPLE_RATE);
        log.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FixedEstimator { pitch, log: log.clone() }) as Box<dyn PitchEstimator>)
    })
}

fn sine(freq: f32, amplitude: f32) -> Vec<f32> {
    (0..FRAME_SIZE)
        .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / SAMPLE_RATE as f32).sin())
        .collect()
}

fn detector_with(source: &ManualSource, factory: EstimatorFactory) -> PitchDetector {
    PitchDetector::with_parts(TunerConfig::default(), Box::new(source.clone()), factory).unwrap()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn single_loud_frame_among_silence() {
    let source = ManualSource::default();
    let log = EstimatorLog::default();
    let detector = detector_with(&source, fixed_factory(880.0, &log));

    assert_eq!(detector.start(), Status::Started);
    let silence = vec![0.0; FRAME_SIZE];
    let tone = sine(880.0, 0.5);
    for i in 0..50 {
        let frame = if i == 30 { &tone } else { &silence };
        assert!(source.deliver(frame));
    }
    let status = detector.stop();

    assert_eq!(status.to_string(), "Pitch detection stopped");
    assert_eq!(detector.latest_pitch(), 880.0);
    assert_eq!(detector.latest_note(), "A5");
    assert_eq!(detector.latest_cents(), 0.0);
    assert_eq!(log.estimates.load(Ordering::SeqCst), 1);

    let stats = detector.stats();
    assert_eq!(stats.frames_received, 50);
    assert_eq!(stats.frames_gated, 49);
    assert_eq!(stats.results_published, 1);
}

#[test]
fn sine_at_440_resolves_to_a4() {
    let source = ManualSource::default();
    let log = EstimatorLog::default();
    let detector = detector_with(&source, fixed_factory(440.0, &log));

    detector.start();
    assert!(source.deliver(&sine(440.0, 0.5)));
    detector.stop();

    let result = detector.latest_result();
    assert_eq!(result.pitch, 440.0);
    assert_eq!(result.note, "A4");
    assert!(result.cents.abs() < 1e-4);
}

#[test]
fn yin_end_to_end_on_real_sine() {
    for (freq, name) in [(110.0, "A2"), (196.0, "G3"), (261.63, "C4"), (440.0, "A4")] {
        let source = ManualSource::default();
        let detector = detector_with(&source, default_estimator_factory());

        detector.start();
        for _ in 0..3 {
            assert!(source.deliver(&sine(freq, 0.5)));
        }
        detector.stop();

        assert_eq!(detector.latest_note(), name);
        assert!(detector.latest_cents().abs() < 5.0, "{name}: {} cents", detector.latest_cents());
    }
}

#[test]
fn silence_leaves_latest_result_unchanged() {
    let source = ManualSource::default();
    let log = EstimatorLog::default();
    let detector = detector_with(&source, fixed_factory(440.0, &log));

    detector.start();
    source.deliver(&sine(440.0, 0.5));
    assert!(wait_for(|| detector.latest_pitch() == 440.0));
    let before = detector.latest_result();

    for _ in 0..20 {
        source.deliver(&vec![0.0; FRAME_SIZE]);
        source.deliver(&sine(440.0, 0.001));
    }
    detector.stop();

    assert_eq!(detector.latest_result(), before);
    assert_eq!(log.estimates.load(Ordering::SeqCst), 1);
    assert_eq!(detector.stats().frames_gated, 40);
}

#[test]
fn start_twice_keeps_one_session() {
    let source = ManualSource::default();
    let log = EstimatorLog::default();
    let detector = detector_with(&source, fixed_factory(440.0, &log));

    assert_eq!(detector.start(), Status::Started);
    let second = detector.start();
    assert_eq!(second.to_string(), "Pitch detection is already running");
    assert_eq!(source.opens(), 1);
    assert_eq!(log.created.load(Ordering::SeqCst), 1);
    assert_eq!(detector.state(), LifecycleState::Running);
    detector.stop();
}

#[test]
fn stop_twice_releases_once() {
    let source = ManualSource::default();
    let log = EstimatorLog::default();
    let detector = detector_with(&source, fixed_factory(440.0, &log));

    detector.start();
    assert_eq!(detector.stop(), Status::Stopped);
    let second = detector.stop();
    assert_eq!(second.to_string(), "Pitch detection is not running");
    assert_eq!(source.closes(), 1);
    assert_eq!(log.releases.load(Ordering::SeqCst), 1);
    assert!(!detector.is_running());
}

#[test]
fn frames_after_stop_are_not_analysed() {
    let source = ManualSource::default();
    let log = EstimatorLog::default();
    let detector = detector_with(&source, fixed_factory(440.0, &log));

    detector.start();
    detector.stop();
    assert!(!source.deliver(&sine(440.0, 0.5)));
    assert_eq!(log.estimates.load(Ordering::SeqCst), 0);
    assert!(detector.latest_result().is_empty());
}

#[test]
fn restart_builds_a_fresh_session() {
    let source = ManualSource::default();
    let log = EstimatorLog::default();
    let detector = detector_with(&source, fixed_factory(440.0, &log));

    for _ in 0..3 {
        assert_eq!(detector.start(), Status::Started);
        source.deliver(&sine(440.0, 0.5));
        assert_eq!(detector.stop(), Status::Stopped);
    }
    assert_eq!(source.opens(), 3);
    assert_eq!(source.closes(), 3);
    assert_eq!(log.created.load(Ordering::SeqCst), 3);
    assert_eq!(log.releases.load(Ordering::SeqCst), 3);
    assert_eq!(detector.latest_note(), "A4");
}

#[test]
fn open_failure_leaves_detector_idle() {
    let source = ManualSource::default();
    source.set_fail_open(true);
    let log = EstimatorLog::default();
    let detector = detector_with(&source, fixed_factory(440.0, &log));

    let status = detector.start();
    assert!(matches!(status, Status::Failed(_)));
    assert_eq!(
        status.to_string(),
        "Failed to start pitch detection: Audio error: No input device available"
    );
    assert!(!detector.is_running());
    assert_eq!(log.releases.load(Ordering::SeqCst), 1);
    assert_eq!(detector.stop(), Status::NotRunning);

    source.set_fail_open(false);
    assert_eq!(detector.start(), Status::Started);
    detector.stop();
}

#[test]
fn stream_start_failure_rolls_back() {
    let source = ManualSource::default();
    source.set_fail_start(true);
    let log = EstimatorLog::default();
    let detector = detector_with(&source, fixed_factory(440.0, &log));

    assert!(matches!(detector.start(), Status::Failed(_)));
    assert!(!detector.is_running());
    assert_eq!(source.closes(), 1);
    assert_eq!(log.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn close_errors_do_not_block_rollback_or_stop() {
    let source = ManualSource::default();
    source.set_fail_start(true);
    source.set_fail_close(true);
    let log = EstimatorLog::default();
    let detector = detector_with(&source, fixed_factory(440.0, &log));

    assert!(matches!(detector.start(), Status::Failed(_)));
    assert!(!detector.is_running());
    assert_eq!(source.closes(), 1);
    assert_eq!(log.releases.load(Ordering::SeqCst), 1);

    source.set_fail_start(false);
    assert_eq!(detector.start(), Status::Started);
    assert_eq!(detector.stop(), Status::Stopped);
    assert_eq!(source.closes(), 2);
    assert_eq!(log.releases.load(Ordering::SeqCst), 2);
}

#[test]
fn estimator_failure_never_opens_the_source() {
    let source = ManualSource::default();
    let factory: EstimatorFactory = Box::new(|_spec: &EstimatorSpec| {
        Err(TunerError::Estimator("out of memory".into()))
    });
    let detector = detector_with(&source, factory);

    assert!(matches!(detector.start(), Status::Failed(_)));
    assert_eq!(source.opens(), 0);
    assert!(!detector.is_running());
}

#[test]
fn termination_stops_consumer_and_blocks_restart() {
    let source = ManualSource::default();
    let log = EstimatorLog::default();
    let detector = detector_with(&source, fixed_factory(440.0, &log));

    detector.start();
    source.deliver(&sine(440.0, 0.5));
    assert!(wait_for(|| detector.latest_note() == "A4"));

    let trigger = detector.termination_trigger();
    trigger.trigger();
    assert!(trigger.is_triggered());

    assert_eq!(detector.stop(), Status::Stopped);
    assert_eq!(detector.start(), Status::ShuttingDown);
    assert!(!detector.is_running());
    assert_eq!(detector.latest_note(), "A4");
}

#[test]
fn dropping_a_running_detector_stops_it() {
    let source = ManualSource::default();
    let log = EstimatorLog::default();
    {
        let detector = detector_with(&source, fixed_factory(440.0, &log));
        detector.start();
    }
    assert_eq!(source.closes(), 1);
    assert_eq!(log.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn accessors_work_from_other_threads() {
    let source = ManualSource::default();
    let log = EstimatorLog::default();
    let detector = Arc::new(detector_with(&source, fixed_factory(440.0, &log)));

    detector.start();
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let detector = Arc::clone(&detector);
            thread::spawn(move || {
                for _ in 0..200 {
                    let result = detector.latest_result();
                    assert!(result.is_empty() || result.note == "A4");
                }
            })
        })
        .collect();
    for _ in 0..20 {
        source.deliver(&sine(440.0, 0.5));
    }
    for reader in readers {
        reader.join().unwrap();
    }
    detector.stop();
    assert_eq!(detector.latest_note(), "A4");
}

#[test]
fn buffer_source_runs_through_the_pipeline() {
    let signal: Vec<f32> = (0..FRAME_SIZE * 8)
        .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / SAMPLE_RATE as f32).sin())
        .collect();
    let source = BufferSource::new(signal, SAMPLE_RATE);
    let finished = source.finished_flag();
    let detector =
        PitchDetector::with_parts(TunerConfig::default(), Box::new(source), default_estimator_factory())
            .unwrap();

    assert_eq!(detector.start(), Status::Started);
    assert!(wait_for(|| finished.load(Ordering::SeqCst)));
    detector.stop();

    assert_eq!(detector.latest_note(), "A4");
    assert_eq!(detector.stats().frames_received, 8);
}
