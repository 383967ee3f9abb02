//! # Lifecycle Controller
//!
//! [`PitchDetector`] owns the Idle/Running state machine, the handles to the
//! audio stream and the pitch estimator, and the latest published result.
//!
//! All state transitions happen under a single mutex held for the whole
//! transition. Callers see outcomes only as a [`Status`]; failures inside
//! the analysis loop are logged and never reach them.
//!
//! ## Features
//! - Idempotent start and stop with status strings for every outcome
//! - Rollback of partially built sessions when a start step fails
//! - Pending pitches are published before stop returns
//! - Process-wide termination that blocks further starts

use crossbeam_channel::Sender;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::analysis::{
    AnalysisStats, Consumer, FrameProcessor, LatestResult, SharedEstimator, StatsSnapshot,
    TerminationTrigger,
};
use crate::audio::{AudioSource, AudioStream, CpalSource, FrameCallback, StreamSpec};
use crate::config::TunerConfig;
use crate::error::Result;
use crate::pitch::{new_estimator, EstimatorSpec, PitchEstimator};
use crate::preprocess::{FramePreprocessor, Window};
use crate::tuning::PitchResolver;
use crate::DetectionResult;

/// Builds a fresh estimator for each detection session.
pub type EstimatorFactory =
    Box<dyn Fn(&EstimatorSpec) -> Result<Box<dyn PitchEstimator>> + Send + Sync>;

/// Factory for the built-in estimators.
pub fn default_estimator_factory() -> EstimatorFactory {
    Box::new(new_estimator)
}

/// Outcome of [`PitchDetector::start`] and [`PitchDetector::stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Started,
    AlreadyRunning,
    Stopped,
    NotRunning,
    /// Start aborted; the detector is still idle.
    Failed(String),
    /// Termination was requested; the detector will not start again.
    ShuttingDown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Started => write!(f, "Pitch detection started"),
            Status::AlreadyRunning => write!(f, "Pitch detection is already running"),
            Status::Stopped => write!(f, "Pitch detection stopped"),
            Status::NotRunning => write!(f, "Pitch detection is not running"),
            Status::Failed(reason) => write!(f, "Failed to start pitch detection: {reason}"),
            Status::ShuttingDown => write!(f, "Pitch detection is shutting down"),
        }
    }
}

/// Lifecycle state of a [`PitchDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
}

/// Resources of one Start..Stop span.
struct Session {
    stream: Box<dyn AudioStream>,
    estimator: SharedEstimator,
    stop: Sender<()>,
    consumer: JoinHandle<()>,
}

impl Session {
    fn shutdown(self) {
        let Session { mut stream, estimator, stop, consumer } = self;

        // The stop channel fires by disconnecting, so it can only fire once.
        drop(stop);

        if let Err(e) = stream.stop() {
            log::warn!("Error stopping audio stream: {}", e);
        }
        close_stream(stream.as_mut());
        if consumer.join().is_err() {
            log::error!("Consumer thread panicked");
        }
        release_estimator(&estimator);
    }
}

fn close_stream(stream: &mut dyn AudioStream) {
    if let Err(e) = stream.close() {
        log::warn!("Error closing audio stream: {}", e);
    }
}

fn release_estimator(estimator: &SharedEstimator) {
    let taken = estimator.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(mut estimator) = taken {
        estimator.release();
    }
}

struct Inner {
    state: LifecycleState,
    source: Box<dyn AudioSource>,
    session: Option<Session>,
}

/// Real-time pitch tracker with a start/stop lifecycle.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct PitchDetector {
    config: TunerConfig,
    window: Window,
    resolver: PitchResolver,
    estimator_factory: EstimatorFactory,
    inner: Mutex<Inner>,
    latest: Arc<LatestResult>,
    stats: Arc<AnalysisStats>,
    termination: TerminationTrigger,
}

impl PitchDetector {
    /// Detector capturing from the default input device with the built-in
    /// YIN estimator.
    pub fn new(config: TunerConfig) -> Result<Self> {
        Self::with_parts(config, Box::new(CpalSource::new()), default_estimator_factory())
    }

    /// Detector over a custom audio source and estimator factory.
    ///
    /// # Arguments
    /// * `config` - Validated before anything is built
    /// * `source` - Opened on every start, closed on every stop
    /// * `estimator_factory` - Called once per start with the session's [`EstimatorSpec`]
    ///
    /// # Returns
    /// * `TunerError::Config` if `config` is invalid
    pub fn with_parts(
        config: TunerConfig,
        source: Box<dyn AudioSource>,
        estimator_factory: EstimatorFactory,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            window: Window::hann(config.frame_size),
            resolver: PitchResolver::with_reference(config.reference_a4),
            config,
            estimator_factory,
            inner: Mutex::new(Inner {
                state: LifecycleState::Idle,
                source,
                session: None,
            }),
            latest: Arc::new(LatestResult::default()),
            stats: Arc::new(AnalysisStats::default()),
            termination: TerminationTrigger::new(),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts background analysis.
    ///
    /// Builds the estimator, opens and starts the audio stream and spawns the
    /// consumer. If any step fails, everything built so far is released and
    /// the detector stays idle.
    ///
    /// # Returns
    /// * `Status::Started`, `Status::AlreadyRunning`, `Status::ShuttingDown`
    ///   or `Status::Failed` with the reason
    pub fn start(&self) -> Status {
        let mut inner = self.lock_inner();
        if inner.state == LifecycleState::Running {
            log::info!("Pitch detection is already running");
            return Status::AlreadyRunning;
        }
        if self.termination.is_triggered() {
            log::warn!("Refusing to start: termination was requested");
            return Status::ShuttingDown;
        }

        match self.launch(inner.source.as_mut()) {
            Ok(session) => {
                inner.session = Some(session);
                inner.state = LifecycleState::Running;
                log::info!(
                    "Pitch detection started ({} Hz, {} samples per frame, gate {})",
                    self.config.sample_rate,
                    self.config.frame_size,
                    self.config.noise_gate_threshold
                );
                Status::Started
            }
            Err(e) => {
                log::error!("Failed to start pitch detection: {}", e);
                Status::Failed(e.to_string())
            }
        }
    }

    /// Builds every resource of a session, undoing the partial work if any
    /// step fails.
    fn launch(&self, source: &mut dyn AudioSource) -> Result<Session> {
        let estimator = (self.estimator_factory)(&self.estimator_spec())?;
        let estimator: SharedEstimator = Arc::new(Mutex::new(Some(estimator)));
        self.stats.reset();

        let (handoff_tx, handoff_rx) = crossbeam_channel::bounded(self.config.handoff_capacity);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let mut processor = FrameProcessor::new(
            FramePreprocessor::new(self.window.clone(), self.config.noise_gate_threshold),
            Arc::clone(&estimator),
            handoff_tx,
            Arc::clone(&self.stats),
        );
        let on_frame: FrameCallback = Box::new(move |frame: &[f32]| {
            processor.process(frame);
        });

        let stream_spec = StreamSpec {
            channels: 1,
            sample_rate: self.config.sample_rate,
            frame_size: self.config.frame_size,
        };
        let mut stream = match source.open_stream(&stream_spec, on_frame) {
            Ok(stream) => stream,
            Err(e) => {
                release_estimator(&estimator);
                return Err(e);
            }
        };

        let consumer = Consumer::new(
            handoff_rx,
            stop_rx,
            &self.termination,
            self.resolver.clone(),
            Arc::clone(&self.latest),
            Arc::clone(&self.stats),
        );
        let spawned = thread::Builder::new()
            .name("pitch-consumer".into())
            .spawn(move || {
                consumer.run_guarded();
            });
        let consumer = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                close_stream(stream.as_mut());
                release_estimator(&estimator);
                return Err(e.into());
            }
        };

        if let Err(e) = stream.start() {
            Session { stream, estimator, stop: stop_tx, consumer }.shutdown();
            return Err(e);
        }

        Ok(Session { stream, estimator, stop: stop_tx, consumer })
    }

    fn estimator_spec(&self) -> EstimatorSpec {
        EstimatorSpec {
            threshold: self.config.yin_threshold,
            spectral_refinement: self.config.spectral_refinement,
            ..EstimatorSpec::yin(self.config.frame_size, self.config.sample_rate)
        }
    }

    /// Stops background analysis and releases the stream and estimator.
    pub fn stop(&self) -> Status {
        let mut inner = self.lock_inner();
        if inner.state == LifecycleState::Idle {
            log::info!("Pitch detection is not running");
            return Status::NotRunning;
        }

        inner.state = LifecycleState::Idle;
        if let Some(session) = inner.session.take() {
            session.shutdown();
        }
        let stats = self.stats.snapshot();
        log::info!(
            "Pitch detection stopped ({} frames, {} gated, {} results, {} dropped, {} faults)",
            stats.frames_received,
            stats.frames_gated,
            stats.results_published,
            stats.pitches_dropped,
            stats.faults
        );
        Status::Stopped
    }

    /// True between a successful start and the next stop.
    pub fn is_running(&self) -> bool {
        self.lock_inner().state == LifecycleState::Running
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lock_inner().state
    }

    /// Most recently detected pitch in Hz, 0.0 if none yet.
    pub fn latest_pitch(&self) -> f32 {
        self.latest.snapshot().pitch
    }

    /// Closest note to the most recent pitch, empty if none yet.
    pub fn latest_note(&self) -> String {
        self.latest.snapshot().note.clone()
    }

    /// Cents deviation of the most recent pitch.
    pub fn latest_cents(&self) -> f32 {
        self.latest.snapshot().cents
    }

    /// The whole latest reading as one consistent snapshot.
    pub fn latest_result(&self) -> DetectionResult {
        self.latest.snapshot().as_ref().clone()
    }

    /// Counters of the current or most recent session.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The validated configuration this detector was built with.
    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    /// Handle the host process fires on SIGINT/SIGTERM.
    pub fn termination_trigger(&self) -> TerminationTrigger {
        self.termination.clone()
    }
}

impl Drop for PitchDetector {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
