//! # Stage: Playback Continuity Controller
//!
//! ## Responsibility
//! Decide where the video resumes after a reload, keep the persisted
//! checkpoint current while playing, and hold the stream in a "live" feel by
//! undoing pauses, seeks and stalls.
//!
//! ## Guarantees
//! - Exactly one resume policy per deployment ([`PlaybackMode`]); on-demand
//!   and live arithmetic are never mixed
//! - A stale on-demand checkpoint is cleared and playback starts at 0
//! - Checkpoints are written only for positive times that moved by at least
//!   the configured granularity
//! - Terminal end clears every session key
//!
//! ## NOT Responsible For
//! - Chat history (see [`crate::engine`])
//! - Decoding or fetching media; [`MediaElement`] is the seam

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::{PlaybackConfig, PlaybackMode};
use crate::store::{SessionStore, VideoCheckpoint};

/// Positions closer than this to the last observed time are not seek attempts.
const SEEK_TOLERANCE_SECS: f64 = 0.5;

// ---------------------------------------------------------------------------
// Resume arithmetic
// ---------------------------------------------------------------------------

/// Where to resume, and why.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResumeDecision {
    /// Nothing persisted.
    Fresh,
    /// Resume at `offset_secs`.
    Resume { offset_secs: f64 },
    /// On-demand checkpoint older than the staleness threshold.
    Stale { elapsed_secs: f64 },
}

impl ResumeDecision {
    pub fn offset_secs(&self) -> f64 {
        match *self {
            ResumeDecision::Resume { offset_secs } => offset_secs,
            ResumeDecision::Fresh | ResumeDecision::Stale { .. } => 0.0,
        }
    }
}

/// Compute the resume position from a checkpoint and the current wall clock.
///
/// - `OnDemand`: the saved offset while `elapsed < staleness`, else stale.
/// - `Live`: saved offset plus elapsed wall-clock time.
///
/// A negative elapsed time (clock moved backwards) counts as zero.
pub fn resume_offset(
    mode: PlaybackMode,
    checkpoint: Option<VideoCheckpoint>,
    now_ms: i64,
    staleness: Duration,
) -> ResumeDecision {
    let Some(cp) = checkpoint else {
        return ResumeDecision::Fresh;
    };
    let elapsed_secs = (now_ms.saturating_sub(cp.captured_at_ms)).max(0) as f64 / 1_000.0;
    match mode {
        PlaybackMode::OnDemand => {
            if elapsed_secs < staleness.as_secs_f64() {
                ResumeDecision::Resume { offset_secs: cp.offset_secs }
            } else {
                ResumeDecision::Stale { elapsed_secs }
            }
        }
        PlaybackMode::Live => ResumeDecision::Resume { offset_secs: cp.offset_secs + elapsed_secs },
    }
}

// ---------------------------------------------------------------------------
// Media seam
// ---------------------------------------------------------------------------

/// Result of asking the media to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayResult {
    Playing,
    /// Autoplay refused until the viewer interacts.
    NeedsGesture,
}

/// The video element as seen by the controller.
pub trait MediaElement: Send {
    fn current_time(&self) -> f64;
    fn set_current_time(&mut self, secs: f64);
    fn play(&mut self) -> PlayResult;
    fn is_paused(&self) -> bool;
    /// `None` for unbounded streams.
    fn duration(&self) -> Option<f64>;
}

/// Wall-clock driven stand-in for a video element.
pub struct SimulatedMedia {
    clock: SharedClock,
    duration: Option<f64>,
    base_secs: f64,
    playing_since_ms: Option<i64>,
    autoplay_allowed: bool,
    gesture_given: bool,
}

impl SimulatedMedia {
    pub fn new(clock: SharedClock, duration: Option<f64>) -> Self {
        Self {
            clock,
            duration,
            base_secs: 0.0,
            playing_since_ms: None,
            autoplay_allowed: true,
            gesture_given: false,
        }
    }

    /// Refuse `play()` until [`grant_gesture`](Self::grant_gesture).
    pub fn block_autoplay(mut self) -> Self {
        self.autoplay_allowed = false;
        self
    }

    pub fn grant_gesture(&mut self) {
        self.gesture_given = true;
    }

    /// Viewer-initiated pause.
    pub fn pause(&mut self) {
        self.base_secs = self.current_time();
        self.playing_since_ms = None;
    }

    pub fn is_ended(&self) -> bool {
        self.duration.is_some_and(|d| self.current_time() >= d)
    }

    fn clamp(&self, secs: f64) -> f64 {
        let secs = secs.max(0.0);
        match self.duration {
            Some(d) => secs.min(d),
            None => secs,
        }
    }
}

impl MediaElement for SimulatedMedia {
    fn current_time(&self) -> f64 {
        let t = match self.playing_since_ms {
            Some(since) => {
                self.base_secs + (self.clock.now_ms().saturating_sub(since)).max(0) as f64 / 1_000.0
            }
            None => self.base_secs,
        };
        self.clamp(t)
    }

    fn set_current_time(&mut self, secs: f64) {
        self.base_secs = self.clamp(secs);
        if self.playing_since_ms.is_some() {
            self.playing_since_ms = Some(self.clock.now_ms());
        }
    }

    fn play(&mut self) -> PlayResult {
        if !self.autoplay_allowed && !self.gesture_given {
            return PlayResult::NeedsGesture;
        }
        if self.playing_since_ms.is_none() {
            self.playing_since_ms = Some(self.clock.now_ms());
        }
        PlayResult::Playing
    }

    fn is_paused(&self) -> bool {
        self.playing_since_ms.is_none()
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// What happened when playback was (re)started.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResumeOutcome {
    Playing { offset_secs: f64 },
    /// Show a "start" action; call [`PlaybackController::start_after_gesture`].
    NeedsGesture { offset_secs: f64 },
    /// The resume point is past the end of the stream; the session was cleared.
    Ended,
}

/// What a checkpoint tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Checkpointed,
    Unchanged,
    Ended,
}

pub struct PlaybackController<M> {
    media: M,
    store: Arc<SessionStore>,
    clock: SharedClock,
    cfg: PlaybackConfig,
    resume_at: f64,
    last_observed: f64,
    /// Wall clock at which `last_observed` was read.
    last_observed_at_ms: i64,
    last_checkpoint: Option<f64>,
    ended: bool,
}

impl<M: MediaElement> PlaybackController<M> {
    pub fn new(media: M, store: Arc<SessionStore>, clock: SharedClock, cfg: PlaybackConfig) -> Self {
        Self {
            media,
            store,
            clock,
            cfg,
            resume_at: 0.0,
            last_observed: 0.0,
            last_observed_at_ms: 0,
            last_checkpoint: None,
            ended: false,
        }
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut M {
        &mut self.media
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn resume_at(&self) -> f64 {
        self.resume_at
    }

    fn observe(&mut self, t: f64) {
        self.last_observed = t;
        self.last_observed_at_ms = self.clock.now_ms();
    }

    fn start_at(&mut self, offset_secs: f64) -> ResumeOutcome {
        self.media.set_current_time(offset_secs);
        self.observe(offset_secs);
        match self.media.play() {
            PlayResult::Playing => ResumeOutcome::Playing { offset_secs },
            PlayResult::NeedsGesture => {
                info!(offset_secs, "autoplay refused, waiting for viewer gesture");
                ResumeOutcome::NeedsGesture { offset_secs }
            }
        }
    }

    /// Restore position from the persisted checkpoint and start playing.
    pub fn on_mount(&mut self) -> ResumeOutcome {
        let decision = resume_offset(
            self.cfg.mode,
            self.store.load_video_checkpoint(),
            self.clock.now_ms(),
            self.cfg.staleness(),
        );
        if let ResumeDecision::Stale { elapsed_secs } = decision {
            info!(elapsed_secs, "video checkpoint is stale, starting from the beginning");
            self.store.clear_video_checkpoint();
        }
        let offset = decision.offset_secs();
        if self.media.duration().is_some_and(|d| offset >= d) {
            info!(offset_secs = offset, "broadcast already over");
            self.on_ended();
            return ResumeOutcome::Ended;
        }
        self.resume_at = offset;
        debug!(?decision, mode = ?self.cfg.mode, "playback resume decided");
        self.start_at(offset)
    }

    /// Retry play at the resume offset after the viewer interacted.
    pub fn start_after_gesture(&mut self) -> ResumeOutcome {
        if self.ended {
            return ResumeOutcome::Ended;
        }
        self.start_at(self.resume_at)
    }

    /// Record the current position; write a checkpoint when it moved enough.
    pub fn on_time_update(&mut self) -> bool {
        if self.ended {
            return false;
        }
        let t = self.media.current_time();
        self.observe(t);
        if t <= 0.0 {
            return false;
        }
        let moved = self
            .last_checkpoint
            .map_or(true, |prev| (t - prev).abs() >= self.cfg.checkpoint_granularity_secs);
        if moved {
            self.store.save_video_checkpoint(t, self.clock.now_ms());
            self.last_checkpoint = Some(t);
        }
        moved
    }

    /// Undo a pause.
    pub fn on_pause(&mut self) -> PlayResult {
        if self.ended || !self.media.is_paused() {
            return PlayResult::Playing;
        }
        debug!("pause attempt corrected");
        let result = self.media.play();
        let t = self.media.current_time();
        self.observe(t);
        result
    }

    /// Undo a seek by snapping back to the last observed position.
    pub fn on_seeking(&mut self) -> bool {
        let t = self.media.current_time();
        if (t - self.last_observed).abs() <= SEEK_TOLERANCE_SECS {
            return false;
        }
        self.snap_back(t);
        true
    }

    fn snap_back(&mut self, attempted: f64) {
        debug!(attempted, restored = self.last_observed, "seek attempt corrected");
        let restored = self.last_observed;
        self.media.set_current_time(restored);
        self.observe(restored);
    }

    /// Detect a seek that happened between samples: while playing, the
    /// position should have advanced by the wall-clock time since the last
    /// observation.
    fn correct_drift(&mut self) -> bool {
        let elapsed = (self.clock.now_ms().saturating_sub(self.last_observed_at_ms)).max(0) as f64 / 1_000.0;
        let expected = self.last_observed + elapsed;
        let t = self.media.current_time();
        if (t - expected).abs() <= SEEK_TOLERANCE_SECS {
            return false;
        }
        self.snap_back(t);
        true
    }

    pub fn on_stalled(&mut self) -> PlayResult {
        debug!("stall, re-issuing play");
        let result = self.media.play();
        let t = self.media.current_time();
        self.observe(t);
        result
    }

    /// Terminal end: clear the whole persisted session.
    pub fn on_ended(&mut self) {
        if !self.ended {
            self.ended = true;
            self.store.clear_session();
            info!("broadcast ended, session state cleared");
        }
    }

    /// One checkpoint-loop step: detect end, correct pauses and seeks,
    /// checkpoint.
    pub fn tick(&mut self) -> TickOutcome {
        if self.ended {
            return TickOutcome::Ended;
        }
        if self.media.duration().is_some_and(|d| self.media.current_time() >= d) {
            self.on_ended();
            return TickOutcome::Ended;
        }
        if self.media.is_paused() {
            self.on_pause();
        } else {
            self.correct_drift();
        }
        if self.on_time_update() {
            TickOutcome::Checkpointed
        } else {
            TickOutcome::Unchanged
        }
    }
}

impl<M: MediaElement + 'static> PlaybackController<M> {
    /// Sample the media every `checkpoint_interval_ms` until the stream ends
    /// or the handle is dropped.
    pub fn spawn_checkpoint_loop(controller: Arc<Mutex<Self>>) -> PlaybackHandle {
        let period = {
            let guard = controller.lock().unwrap_or_else(PoisonError::into_inner);
            Duration::from_millis(guard.cfg.checkpoint_interval_ms.max(1))
        };
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let outcome = controller.lock().unwrap_or_else(PoisonError::into_inner).tick();
                if outcome == TickOutcome::Ended {
                    break;
                }
            }
        });
        PlaybackHandle { task }
    }
}

/// Owner of the checkpoint loop. Dropping it stops the loop.
pub struct PlaybackHandle {
    task: JoinHandle<()>,
}

impl PlaybackHandle {
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
