//! # Stage: Chat Synchronization Engine
//!
//! ## Responsibility
//! Poll the chat gateway on a fixed cadence, merge remote, filler and
//! locally-authored messages into one timeline, publish it to subscribers and
//! persist it.
//!
//! ## Guarantees
//! - Atomic publication: subscribers see a whole merged timeline or the
//!   previous one, never a partial merge
//! - Non-blocking send: a local message is visible before its POST resolves,
//!   and a failed POST never retracts it
//! - Fail-soft: fetch errors empty the remote set for that cycle and back off
//!   per [`RetryPolicy`]; nothing here returns a cycle error
//! - Ordered publication: a timeline is published and persisted under the
//!   same lock that merged it, so an older merge never overwrites a newer one
//! - Stable remote ordering: entries without a usable wire timestamp keep the
//!   instant they were first seen for as long as the service returns them
//! - Stale cycles are dropped: a fetch that resolves after
//!   [`ChatSyncEngine::invalidate`] neither publishes nor persists
//!
//! ## NOT Responsible For
//! - Rendering or scroll position (see [`crate::scroll`])
//! - Video state (see [`crate::playback`])

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::config::{CrowdConfig, LivecastConfig, RetryPolicy, SyncConfig};
use crate::error::{LivecastError, Result};
use crate::gateway::ChatGateway;
use crate::message::{ChatMessage, Origin};
use crate::store::SessionStore;
use crate::synthetic::{make_rng, FillerGenerator};
use crate::timeline::{merge, MergeOptions, Timeline};

/// Consecutive fetch failures after which logging escalates to `error!`.
const ESCALATE_AFTER: u32 = 5;

/// Where the engine is within a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Fetching,
    Merging,
    Published,
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Tracks consecutive fetch failures and when the next attempt is allowed.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
    retry_at_ms: Option<i64>,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, failures: 0, retry_at_ms: None }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure at `now_ms`; returns the delay until the next attempt.
    pub fn record_failure(&mut self, now_ms: i64) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.policy.delay_after(self.failures);
        self.retry_at_ms = Some(now_ms.saturating_add(delay.as_millis() as i64));
        delay
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.retry_at_ms = None;
    }

    /// `true` while the retry delay has not yet elapsed.
    pub fn should_skip(&self, now_ms: i64) -> bool {
        self.retry_at_ms.is_some_and(|at| now_ms < at)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineInner {
    state: SyncState,
    local: Vec<ChatMessage>,
    last_remote: Vec<ChatMessage>,
    /// First-seen instant per remote id whose time is observation-stamped.
    first_seen: HashMap<String, i64>,
    last_filler: Vec<ChatMessage>,
    filler: FillerGenerator<StdRng>,
    backoff: Backoff,
    cycles: u64,
    remote_ok: bool,
}

/// A message accepted by [`ChatSyncEngine::send`].
pub struct Outgoing {
    pub message: ChatMessage,
    /// The background POST, if a runtime was available to run it.
    pub dispatch: Option<JoinHandle<Result<ChatMessage>>>,
}

pub struct ChatSyncEngine {
    gateway: Arc<dyn ChatGateway>,
    store: Arc<SessionStore>,
    clock: SharedClock,
    sync: SyncConfig,
    crowd: CrowdConfig,
    staleness_ms: i64,
    crowd_enabled: AtomicBool,
    active: AtomicBool,
    generation: AtomicU64,
    history_restored: AtomicBool,
    inner: Mutex<EngineInner>,
    tx: watch::Sender<Arc<Timeline>>,
}

impl ChatSyncEngine {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        store: Arc<SessionStore>,
        clock: SharedClock,
        cfg: &LivecastConfig,
    ) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Timeline::default()));
        let inner = EngineInner {
            state: SyncState::Idle,
            local: Vec::new(),
            last_remote: Vec::new(),
            first_seen: HashMap::new(),
            last_filler: Vec::new(),
            filler: FillerGenerator::new(&cfg.crowd, make_rng(cfg.crowd.seed, 1)),
            backoff: Backoff::new(cfg.sync.retry.clone()),
            cycles: 0,
            remote_ok: false,
        };
        Self {
            gateway,
            store,
            clock,
            sync: cfg.sync.clone(),
            crowd: cfg.crowd.clone(),
            staleness_ms: (cfg.playback.staleness_secs as i64).saturating_mul(1_000),
            crowd_enabled: AtomicBool::new(cfg.crowd.enabled),
            active: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            history_restored: AtomicBool::new(false),
            inner: Mutex::new(inner),
            tx,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Timeline>> {
        self.tx.subscribe()
    }

    /// The most recently published timeline.
    pub fn current(&self) -> Arc<Timeline> {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> SyncState {
        self.lock_inner().state
    }

    pub fn local_messages(&self) -> Vec<ChatMessage> {
        self.lock_inner().local.clone()
    }

    pub fn local_message_count(&self) -> usize {
        self.lock_inner().local.len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock_inner().backoff.failures()
    }

    pub fn history_restored(&self) -> bool {
        self.history_restored.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Toggle filler generation, e.g. when a broadcast slot opens or closes.
    pub fn set_crowd_enabled(&self, enabled: bool) {
        self.crowd_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn crowd_enabled(&self) -> bool {
        self.crowd_enabled.load(Ordering::SeqCst)
    }

    /// Abandon any cycle currently awaiting its fetch.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Stop accepting work. In-flight cycles are abandoned.
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.invalidate();
    }

    /// Persist and publish. Callers hold the `inner` guard so publications
    /// happen in merge order.
    fn publish(&self, _inner: &EngineInner, timeline: Arc<Timeline>, now_ms: i64) {
        self.store.save_chat_history(&timeline.messages, now_ms);
        self.tx.send_replace(timeline);
    }

    /// Load the persisted timeline if it is fresh enough.
    ///
    /// A fresh history becomes the published timeline and its locally-authored
    /// entries rejoin the local set. A stale one is cleared. Returns whether
    /// anything was restored.
    pub fn restore_history(&self) -> bool {
        let Some(history) = self.store.load_chat_history() else {
            return false;
        };
        let now = self.clock.now_ms();
        let elapsed = now.saturating_sub(history.saved_at_ms);
        if elapsed >= self.staleness_ms {
            info!(elapsed_ms = elapsed, "discarding stale chat history");
            self.store.clear_chat_history();
            return false;
        }
        let restored = history.messages.len();
        {
            let mut inner = self.lock_inner();
            for m in &history.messages {
                if m.is_local() {
                    if !inner.local.iter().any(|l| l.id == m.id) {
                        inner.local.push(m.clone());
                    }
                } else if m.origin == Origin::Remote && m.sent_at.is_observed() {
                    inner.first_seen.insert(m.id.clone(), m.sort_key_ms());
                }
            }
            self.tx.send_replace(Arc::new(Timeline { messages: history.messages, cycle: 0, remote_ok: false }));
        }
        self.history_restored.store(true, Ordering::SeqCst);
        info!(messages = restored, elapsed_ms = elapsed, "restored chat history");
        true
    }

    /// Run one fetch → merge → publish → persist cycle.
    ///
    /// Returns the published timeline, or `None` when the engine is shut down
    /// or the cycle was invalidated while fetching.
    pub async fn sync_once(&self) -> Option<Arc<Timeline>> {
        if !self.is_active() {
            return None;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let skip_fetch = {
            let mut inner = self.lock_inner();
            inner.state = SyncState::Fetching;
            inner.backoff.should_skip(self.clock.now_ms())
        };

        let fetched = if skip_fetch {
            debug!("backing off, skipping fetch this cycle");
            None
        } else {
            Some(self.gateway.fetch_messages().await)
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("sync cycle invalidated while fetching, dropping result");
            return None;
        }

        let now = self.clock.now_ms();
        let timeline = {
            let mut inner = self.lock_inner();
            inner.state = SyncState::Merging;
            match fetched {
                Some(Ok(remote)) => {
                    if inner.backoff.failures() > 0 {
                        info!(after_failures = inner.backoff.failures(), "chat fetch recovered");
                    }
                    inner.backoff.record_success();
                    let remote = stabilize_observed(&mut inner.first_seen, remote);
                    inner.last_remote = remote;
                    inner.remote_ok = true;
                }
                Some(Err(e)) => {
                    let retry_in = inner.backoff.record_failure(now);
                    let consecutive_failures = inner.backoff.failures();
                    if consecutive_failures >= ESCALATE_AFTER {
                        error!(
                            error = %e,
                            consecutive_failures,
                            retry_in_ms = retry_in.as_millis() as u64,
                            "chat fetch failed repeatedly"
                        );
                    } else {
                        warn!(error = %e, retry_in_ms = retry_in.as_millis() as u64, "chat fetch failed");
                    }
                    inner.last_remote.clear();
                    inner.remote_ok = false;
                }
                None => {
                    inner.last_remote.clear();
                }
            }

            let suppress_filler =
                self.crowd.exclude_filler_with_live_traffic && !inner.last_remote.is_empty();
            inner.last_filler = if self.crowd_enabled() && !suppress_filler {
                inner.filler.batch(now)
            } else {
                Vec::new()
            };

            let messages = merge(
                &inner.last_filler,
                &inner.last_remote,
                &inner.local,
                &MergeOptions::from(&self.sync),
            );
            inner.cycles += 1;
            inner.state = SyncState::Published;
            let timeline = Arc::new(Timeline { messages, cycle: inner.cycles, remote_ok: inner.remote_ok });
            self.publish(&inner, Arc::clone(&timeline), now);
            timeline
        };
        Some(timeline)
    }

    /// Append a local message, republish immediately, then POST it in the
    /// background.
    ///
    /// # Errors
    /// - [`LivecastError::EmptyMessage`] for blank bodies.
    /// - [`LivecastError::Inactive`] after [`shutdown`](Self::shutdown).
    pub fn send(&self, body: &str) -> Result<Outgoing> {
        let body = body.trim();
        if body.is_empty() {
            return Err(LivecastError::EmptyMessage);
        }
        if !self.is_active() {
            return Err(LivecastError::Inactive);
        }
        let now = self.clock.now_ms();
        let message = ChatMessage::local(self.sync.viewer_name.clone(), body, now);

        {
            let mut inner = self.lock_inner();
            inner.local.push(message.clone());
            let messages = merge(
                &inner.last_filler,
                &inner.last_remote,
                &inner.local,
                &MergeOptions::from(&self.sync),
            );
            let timeline = Arc::new(Timeline { messages, cycle: inner.cycles, remote_ok: inner.remote_ok });
            self.publish(&inner, timeline, now);
        }

        let dispatch = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let gateway = Arc::clone(&self.gateway);
                let author = message.author.clone();
                let text = message.body.clone();
                Some(handle.spawn(async move {
                    let result = gateway.post_message(&author, &text).await;
                    if let Err(e) = &result {
                        warn!(error = %e, "chat post failed, message kept locally");
                    }
                    result
                }))
            }
            Err(_) => {
                warn!("no async runtime, chat post not dispatched");
                None
            }
        };
        Ok(Outgoing { message, dispatch })
    }

    /// Run [`sync_once`](Self::sync_once) every poll interval until the
    /// returned handle is stopped or dropped.
    pub fn start(self: &Arc<Self>) -> SyncHandle {
        self.active.store(true, Ordering::SeqCst);
        let engine = Arc::clone(self);
        let period = self.sync.poll_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !engine.is_active() {
                    break;
                }
                engine.sync_once().await;
            }
        });
        SyncHandle { engine: Arc::clone(self), task }
    }
}

/// Pin observation-stamped remote entries to the instant their id was first
/// seen, and forget ids the service no longer returns.
fn stabilize_observed(first_seen: &mut HashMap<String, i64>, remote: Vec<ChatMessage>) -> Vec<ChatMessage> {
    {
        let present: HashSet<&str> = remote.iter().map(|m| m.id.as_str()).collect();
        first_seen.retain(|id, _| present.contains(id.as_str()));
    }
    remote
        .into_iter()
        .map(|mut m| {
            if m.sent_at.is_observed() {
                let at = *first_seen.entry(m.id.clone()).or_insert_with(|| m.sort_key_ms());
                m.sent_at = m.sent_at.restamp(at);
            }
            m
        })
        .collect()
}

/// Owner of a running sync loop. Dropping it stops the loop.
pub struct SyncHandle {
    engine: Arc<ChatSyncEngine>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn engine(&self) -> &Arc<ChatSyncEngine> {
        &self.engine
    }

    pub fn stop(&self) {
        self.engine.shutdown();
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::SentAt;
    use async_trait::async_trait;

    #[derive(Default)]
    struct StaticGateway {
        remote: Vec<ChatMessage>,
        fail: bool,
    }

    #[async_trait]
    impl ChatGateway for StaticGateway {
        async fn fetch_messages(&self) -> Result<Vec<ChatMessage>> {
            if self.fail {
                Err(LivecastError::Http { status: 503, url: "mock".into() })
            } else {
                Ok(self.remote.clone())
            }
        }

        async fn post_message(&self, author: &str, body: &str) -> Result<ChatMessage> {
            Ok(ChatMessage::local(author, body, 0))
        }
    }

    fn engine(gw: StaticGateway, clock: &ManualClock, crowd: bool) -> ChatSyncEngine {
        let mut cfg = LivecastConfig::default();
        cfg.crowd.enabled = crowd;
        cfg.crowd.seed = Some(42);
        ChatSyncEngine::new(
            Arc::new(gw),
            Arc::new(SessionStore::in_memory("test")),
            Arc::new(clock.clone()),
            &cfg,
        )
    }

    #[test]
    fn backoff_skips_until_delay_elapses() {
        let mut b = Backoff::new(RetryPolicy::Fixed { interval_ms: 1_000 });
        assert!(!b.should_skip(0));
        assert_eq!(b.record_failure(0), Duration::from_millis(1_000));
        assert!(b.should_skip(999));
        assert!(!b.should_skip(1_000));
        b.record_success();
        assert_eq!(b.failures(), 0);
        assert!(!b.should_skip(0));
    }

    fn untimed(id: &str, at: i64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            author: "A".into(),
            body: id.into(),
            sent_at: SentAt::observed(at),
            origin: Origin::Remote,
            is_privileged: false,
        }
    }

    #[test]
    fn observed_times_are_pinned_and_pruned() {
        let mut seen = HashMap::new();
        let first = stabilize_observed(&mut seen, vec![untimed("remote-a", 1_000), untimed("remote-b", 1_000)]);
        assert_eq!(first[0].sort_key_ms(), 1_000);

        let second = stabilize_observed(&mut seen, vec![untimed("remote-a", 4_000)]);
        assert_eq!(second[0].sort_key_ms(), 1_000);
        assert!(!seen.contains_key("remote-b"));

        let third = stabilize_observed(&mut seen, vec![untimed("remote-b", 7_000)]);
        assert_eq!(third[0].sort_key_ms(), 7_000);
    }

    #[tokio::test]
    async fn cycle_with_crowd_includes_filler() {
        let clock = ManualClock::new(10_000_000);
        let e = engine(StaticGateway::default(), &clock, true);
        let t = e.sync_once().await.unwrap();
        assert_eq!(t.len(), 10);
        assert!(t.messages.iter().all(|m| m.origin == Origin::Synthetic));
        assert_eq!(e.state(), SyncState::Published);
    }

    #[tokio::test]
    async fn failed_fetch_yields_empty_remote_and_counts() {
        let clock = ManualClock::new(10_000_000);
        let e = engine(StaticGateway { fail: true, ..Default::default() }, &clock, false);
        let t = e.sync_once().await.unwrap();
        assert!(t.is_empty());
        assert!(!t.remote_ok);
        assert_eq!(e.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn send_rejects_blank_body() {
        let clock = ManualClock::new(0);
        let e = engine(StaticGateway::default(), &clock, false);
        assert!(matches!(e.send("   "), Err(LivecastError::EmptyMessage)));
        assert_eq!(e.local_message_count(), 0);
    }

    #[tokio::test]
    async fn send_after_shutdown_is_inactive() {
        let clock = ManualClock::new(0);
        let e = engine(StaticGateway::default(), &clock, false);
        e.shutdown();
        assert!(matches!(e.send("hi"), Err(LivecastError::Inactive)));
        assert!(e.sync_once().await.is_none());
    }

    #[tokio::test]
    async fn exclude_filler_once_real_traffic_exists() {
        let clock = ManualClock::new(10_000_000);
        let remote = vec![ChatMessage {
            id: "remote-1".into(),
            author: "A".into(),
            body: "hi".into(),
            sent_at: SentAt::from_ms(9_000_000),
            origin: Origin::Remote,
            is_privileged: false,
        }];
        let mut cfg = LivecastConfig::default();
        cfg.crowd.exclude_filler_with_live_traffic = true;
        let e = ChatSyncEngine::new(
            Arc::new(StaticGateway { remote, fail: false }),
            Arc::new(SessionStore::in_memory("test")),
            Arc::new(clock.clone()),
            &cfg,
        );
        let t = e.sync_once().await.unwrap();
        assert_eq!(t.len(), 1);
    }
}
