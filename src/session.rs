//! # Stage: Live Session
//!
//! ## Responsibility
//! Own every timer of one mounted view: the chat sync loop, the crowd
//! counters and the playback checkpoint loop. Mounting restores playback and
//! chat; unmounting tears all of it down.
//!
//! ## Guarantees
//! - Playback resume is decided before chat restore, both before the first
//!   sync cycle
//! - Unmount (or drop) stops all timers and invalidates in-flight fetches
//! - Off-air (outside every broadcast slot) there is no filler and no crowd
//!   counter runs
//!
//! ## NOT Responsible For
//! - Rendering (the binary or an embedding UI subscribes to the engine)

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::info;

use crate::clock::SharedClock;
use crate::config::{CrowdConfig, LivecastConfig};
use crate::engine::{ChatSyncEngine, SyncHandle};
use crate::gateway::ChatGateway;
use crate::message::Origin;
use crate::playback::{MediaElement, PlaybackController, PlaybackHandle, ResumeOutcome};
use crate::scroll::{ScrollAction, ScrollFollower};
use crate::store::SessionStore;
use crate::synthetic::{make_rng, CounterHandle, CrowdCounter};
use crate::timeline::Timeline;

pub struct LiveSession<M: MediaElement + 'static> {
    engine: Arc<ChatSyncEngine>,
    playback: Arc<Mutex<PlaybackController<M>>>,
    resume: ResumeOutcome,
    scroll: ScrollFollower,
    sync: Option<SyncHandle>,
    checkpoint: Option<PlaybackHandle>,
    crowd: CrowdConfig,
    counters: Vec<CounterHandle>,
}

fn spawn_counters(crowd: &CrowdConfig) -> Vec<CounterHandle> {
    crowd
        .counters
        .iter()
        .enumerate()
        .map(|(i, c)| CrowdCounter::new(c.clone(), make_rng(crowd.seed, 100 + i as u64)).spawn())
        .collect()
}

impl<M: MediaElement + 'static> LiveSession<M> {
    /// Restore state and start all timers, on air. Must be called inside a
    /// tokio runtime.
    pub fn mount(
        cfg: &LivecastConfig,
        gateway: Arc<dyn ChatGateway>,
        store: Arc<SessionStore>,
        clock: SharedClock,
        media: M,
    ) -> Self {
        Self::mount_with_slot(cfg, gateway, store, clock, media, true)
    }

    /// Like [`mount`](Self::mount), with the broadcast slot state known up
    /// front so the first sync cycle is already gated.
    pub fn mount_with_slot(
        cfg: &LivecastConfig,
        gateway: Arc<dyn ChatGateway>,
        store: Arc<SessionStore>,
        clock: SharedClock,
        media: M,
        on_air: bool,
    ) -> Self {
        let mut controller =
            PlaybackController::new(media, Arc::clone(&store), Arc::clone(&clock), cfg.playback.clone());
        let resume = controller.on_mount();
        let playback = Arc::new(Mutex::new(controller));

        let engine = Arc::new(ChatSyncEngine::new(gateway, store, clock, cfg));
        let crowd_on = cfg.crowd.enabled && on_air;
        engine.set_crowd_enabled(crowd_on);
        let restored = engine.restore_history();

        let sync = Some(engine.start());
        let checkpoint = Some(PlaybackController::spawn_checkpoint_loop(Arc::clone(&playback)));
        let counters = if crowd_on { spawn_counters(&cfg.crowd) } else { Vec::new() };

        info!(?resume, history_restored = restored, on_air, counters = counters.len(), "live session mounted");
        Self {
            engine,
            playback,
            resume,
            scroll: ScrollFollower::new(cfg.sync.scroll_threshold_px),
            sync,
            checkpoint,
            crowd: cfg.crowd.clone(),
            counters,
        }
    }

    pub fn engine(&self) -> &Arc<ChatSyncEngine> {
        &self.engine
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Timeline>> {
        self.engine.subscribe()
    }

    pub fn resume_outcome(&self) -> ResumeOutcome {
        self.resume
    }

    /// Lock the playback controller, e.g. to forward media events.
    pub fn playback(&self) -> MutexGuard<'_, PlaybackController<M>> {
        self.playback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Viewer pressed "start" after an autoplay refusal.
    pub fn start_after_gesture(&mut self) -> ResumeOutcome {
        let outcome = self.playback().start_after_gesture();
        self.resume = outcome;
        outcome
    }

    pub fn scroll(&mut self) -> &mut ScrollFollower {
        &mut self.scroll
    }

    /// Feed a newly published timeline to the scroll follower. Filler is
    /// regenerated every cycle and does not count as unseen.
    pub fn on_published(&mut self, previous: &Timeline, current: &Timeline) -> ScrollAction {
        let before: HashSet<&str> = previous.messages.iter().map(|m| m.id.as_str()).collect();
        let arrived = current
            .messages
            .iter()
            .filter(|m| m.origin != Origin::Synthetic && !before.contains(m.id.as_str()))
            .count();
        self.scroll.on_messages_arrived(arrived)
    }

    /// Current value of every crowd counter, in configuration order.
    pub fn counters(&self) -> Vec<(String, u64)> {
        self.counters.iter().map(|c| (c.name().to_string(), c.current())).collect()
    }

    /// Slot opened or closed: gate filler generation and the crowd counters.
    /// A no-op after unmount or when crowd simulation is disabled.
    pub fn set_on_air(&mut self, on_air: bool) {
        if !self.is_mounted() {
            return;
        }
        let crowd_on = self.crowd.enabled && on_air;
        if self.engine.crowd_enabled() == crowd_on {
            return;
        }
        info!(on_air, "broadcast slot changed");
        self.engine.set_crowd_enabled(crowd_on);
        if crowd_on {
            self.counters = spawn_counters(&self.crowd);
        } else {
            for c in self.counters.drain(..) {
                c.stop();
            }
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.sync.is_some()
    }

    /// Stop every timer. Idempotent.
    pub fn unmount(&mut self) {
        if let Some(sync) = self.sync.take() {
            sync.stop();
        }
        if let Some(cp) = self.checkpoint.take() {
            cp.stop();
        }
        for c in self.counters.drain(..) {
            c.stop();
        }
        info!("live session unmounted");
    }
}

impl<M: MediaElement + 'static> Drop for LiveSession<M> {
    fn drop(&mut self) {
        if self.is_mounted() {
            self.unmount();
        }
    }
}
