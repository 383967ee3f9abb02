//! # Analysis Loop
//!
//! Two halves joined by a bounded handoff channel:
//! - [`FrameProcessor`] runs inside the audio source's frame callback. It
//!   gates, windows and estimates each frame, then offers non-zero pitches
//!   to the handoff with `try_send`, dropping them when the buffer is full.
//! - [`Consumer`] runs on its own thread. It resolves each pitch to a note
//!   and publishes the [`DetectionResult`] into [`LatestResult`].
//!
//! The consumer waits on three inputs at once: a new pitch, the session's
//! stop signal, and the process-wide [`TerminationTrigger`].

use crossbeam_channel::{select, Receiver, Sender, TrySendError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};

use crate::pitch::PitchEstimator;
use crate::preprocess::{FrameLengthMismatch, FramePreprocessor, Gate};
use crate::tuning::PitchResolver;
use crate::DetectionResult;

/// Estimator slot shared by the frame callback and the lifecycle controller.
/// `None` before construction and after release.
pub type SharedEstimator = Arc<Mutex<Option<Box<dyn PitchEstimator>>>>;

/// Latest published [`DetectionResult`].
///
/// The consumer swaps in a new immutable snapshot; the write lock is only
/// held for the pointer swap.
#[derive(Debug, Default)]
pub struct LatestResult {
    current: RwLock<Arc<DetectionResult>>,
}

impl LatestResult {
    /// Replaces the current reading with `result`.
    pub fn publish(&self, result: DetectionResult) {
        let next = Arc::new(result);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Current reading; cheap to clone and never torn.
    pub fn snapshot(&self) -> Arc<DetectionResult> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Counters updated from the frame callback and the consumer.
#[derive(Debug, Default)]
pub struct AnalysisStats {
    frames_received: AtomicU64,
    frames_gated: AtomicU64,
    frames_without_pitch: AtomicU64,
    frames_skipped: AtomicU64,
    pitches_forwarded: AtomicU64,
    pitches_dropped: AtomicU64,
    faults: AtomicU64,
    results_published: AtomicU64,
}

/// Plain copy of [`AnalysisStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_gated: u64,
    pub frames_without_pitch: u64,
    /// Frames skipped because the estimator was missing or busy.
    pub frames_skipped: u64,
    pub pitches_forwarded: u64,
    /// Pitches dropped because the handoff buffer was full.
    pub pitches_dropped: u64,
    /// Frames whose processing failed and was contained.
    pub faults: u64,
    pub results_published: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl AnalysisStats {
    /// Reads every counter. Counters are read one by one, so a snapshot
    /// taken while frames are flowing may be off by one between fields.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_gated: self.frames_gated.load(Ordering::Relaxed),
            frames_without_pitch: self.frames_without_pitch.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            pitches_forwarded: self.pitches_forwarded.load(Ordering::Relaxed),
            pitches_dropped: self.pitches_dropped.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            results_published: self.results_published.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in [
            &self.frames_received,
            &self.frames_gated,
            &self.frames_without_pitch,
            &self.frames_skipped,
            &self.pitches_forwarded,
            &self.pitches_dropped,
            &self.faults,
            &self.results_published,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// What happened to one delivered frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    /// No estimator is installed (startup or teardown).
    NotReady,
    /// The estimator was locked by someone else; the frame was skipped
    /// instead of blocking the delivery path.
    Busy,
    /// RMS at or below the noise gate.
    Gated,
    /// The estimator found no pitch.
    NoPitch,
    /// Pitch handed to the consumer.
    Forwarded(f32),
    /// Pitch dropped because the handoff buffer was full or closed.
    Dropped(f32),
    /// Processing failed; the failure was logged and contained.
    Fault,
}

/// Per-frame work done on the audio delivery path.
pub struct FrameProcessor {
    preprocessor: FramePreprocessor,
    estimator: SharedEstimator,
    handoff: Sender<f32>,
    stats: Arc<AnalysisStats>,
}

impl FrameProcessor {
    /// Creates the per-frame stage of one detection session.
    ///
    /// # Arguments
    /// * `preprocessor` - Noise gate and window for this session's frame size
    /// * `estimator` - Slot shared with the controller, which empties it on release
    /// * `handoff` - Sending half of the bounded channel to the consumer
    /// * `stats` - Counters shared with the controller
    pub fn new(
        preprocessor: FramePreprocessor,
        estimator: SharedEstimator,
        handoff: Sender<f32>,
        stats: Arc<AnalysisStats>,
    ) -> Self {
        Self { preprocessor, estimator, handoff, stats }
    }

    /// Processes one frame. Never panics and never blocks on the handoff.
    pub fn process(&mut self, frame: &[f32]) -> FrameOutcome {
        bump(&self.stats.frames_received);
        match panic::catch_unwind(AssertUnwindSafe(|| self.process_frame(frame))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(mismatch)) => {
                bump(&self.stats.faults);
                log::warn!("Skipping frame: {}", mismatch);
                FrameOutcome::Fault
            }
            Err(payload) => {
                bump(&self.stats.faults);
                log::error!("Frame analysis panicked, skipping frame: {}", panic_message(&*payload));
                FrameOutcome::Fault
            }
        }
    }

    fn process_frame(&mut self, frame: &[f32]) -> Result<FrameOutcome, FrameLengthMismatch> {
        let mut slot = match self.estimator.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                bump(&self.stats.frames_skipped);
                return Ok(FrameOutcome::Busy);
            }
            // A previous frame panicked inside the estimator; keep going.
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let Some(estimator) = slot.as_mut() else {
            bump(&self.stats.frames_skipped);
            return Ok(FrameOutcome::NotReady);
        };

        if let Gate::Closed { rms } = self.preprocessor.process(frame)? {
            bump(&self.stats.frames_gated);
            log::trace!("Frame gated (rms {:.5})", rms);
            return Ok(FrameOutcome::Gated);
        }

        let pitch = estimator.estimate(self.preprocessor.conditioned());
        drop(slot);

        if !(pitch.is_finite() && pitch > 0.0) {
            bump(&self.stats.frames_without_pitch);
            return Ok(FrameOutcome::NoPitch);
        }

        match self.handoff.try_send(pitch) {
            Ok(()) => {
                bump(&self.stats.pitches_forwarded);
                Ok(FrameOutcome::Forwarded(pitch))
            }
            Err(TrySendError::Full(pitch)) => {
                bump(&self.stats.pitches_dropped);
                log::debug!("Handoff buffer full, dropping {:.2} Hz", pitch);
                Ok(FrameOutcome::Dropped(pitch))
            }
            Err(TrySendError::Disconnected(pitch)) => {
                bump(&self.stats.pitches_dropped);
                Ok(FrameOutcome::Dropped(pitch))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Cancellation input shared by everything that should wind down when the
/// host process is asked to terminate.
///
/// Firing closes an internal channel, so every current and future
/// [`Consumer`] sees it immediately. The host wires OS signals to
/// [`TerminationTrigger::trigger`].
#[derive(Debug, Clone)]
pub struct TerminationTrigger {
    inner: Arc<TerminationInner>,
}

#[derive(Debug)]
struct TerminationInner {
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
    triggered: AtomicBool,
}

impl TerminationTrigger {
    /// Creates an unfired trigger.
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(TerminationInner {
                sender: Mutex::new(Some(sender)),
                receiver,
                triggered: AtomicBool::new(false),
            }),
        }
    }

    /// Requests termination. Firing more than once is a no-op.
    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            log::info!("Termination requested");
        }
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Whether [`TerminationTrigger::trigger`] has been called on any clone.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub(crate) fn receiver(&self) -> Receiver<()> {
        self.inner.receiver.clone()
    }
}

impl Default for TerminationTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the consumer stage returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    /// The session's stop signal fired.
    Stopped,
    /// The termination trigger fired.
    Terminated,
    /// Every handoff sender is gone.
    Disconnected,
}

/// Result-computation stage of the analysis loop.
pub struct Consumer {
    handoff: Receiver<f32>,
    stop: Receiver<()>,
    termination: Receiver<()>,
    resolver: PitchResolver,
    latest: Arc<LatestResult>,
    stats: Arc<AnalysisStats>,
}

impl Consumer {
    /// Creates the consumer stage of one detection session.
    ///
    /// # Arguments
    /// * `handoff` - Receiving half of the bounded pitch channel
    /// * `stop` - Session stop signal; fires when its sender is dropped
    /// * `termination` - Process-wide trigger; the consumer listens on its channel
    /// * `resolver` - Maps each pitch to a note and cents deviation
    /// * `latest` - Where results are published
    /// * `stats` - Counters shared with the controller
    pub fn new(
        handoff: Receiver<f32>,
        stop: Receiver<()>,
        termination: &TerminationTrigger,
        resolver: PitchResolver,
        latest: Arc<LatestResult>,
        stats: Arc<AnalysisStats>,
    ) -> Self {
        Self {
            handoff,
            stop,
            termination: termination.receiver(),
            resolver,
            latest,
            stats,
        }
    }

    /// Runs until stopped or terminated.
    ///
    /// The stop and termination channels never carry values; they fire by
    /// disconnecting. On stop, pitches already in the handoff buffer are
    /// published before returning.
    pub fn run(self) -> ConsumerExit {
        loop {
            select! {
                recv(self.handoff) -> msg => match msg {
                    Ok(pitch) => self.publish(pitch),
                    Err(_) => return ConsumerExit::Disconnected,
                },
                recv(self.stop) -> _ => {
                    while let Ok(pitch) = self.handoff.try_recv() {
                        self.publish(pitch);
                    }
                    return ConsumerExit::Stopped;
                },
                recv(self.termination) -> _ => return ConsumerExit::Terminated,
            }
        }
    }

    /// [`Consumer::run`] with any panic caught and logged.
    pub fn run_guarded(self) -> Option<ConsumerExit> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
            Ok(exit) => {
                log::debug!("Consumer stage exited: {:?}", exit);
                Some(exit)
            }
            Err(payload) => {
                log::error!("Consumer stage panicked: {}", panic_message(&*payload));
                None
            }
        }
    }

    fn publish(&self, pitch: f32) {
        let (note, cents) = self.resolver.resolve(pitch);
        log::trace!("{:.2} Hz -> {} {:+.1} cents", pitch, note, cents);
        self.latest.publish(DetectionResult { pitch, note, cents });
        bump(&self.stats.results_published);
    }
}
