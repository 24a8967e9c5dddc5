//! # Stage: Synthetic Activity Generator
//!
//! ## Responsibility
//! Cosmetic crowd activity: filler chat batches stamped into the recent past,
//! and viewer/online counters that random-walk above a floor on a jittered
//! timer.
//!
//! ## Guarantees
//! - Deterministic under a fixed seed: every random draw goes through the
//!   injected [`rand::Rng`]
//! - Filler timestamps are strictly in the past relative to `now_ms` (when
//!   spacing > 0) and ascend within a batch
//! - Counters never drop below their configured floor
//!
//! ## NOT Responsible For
//! - Deciding whether filler is shown (the sync engine owns that policy)
//! - Persisting filler; batches are regenerated every cycle

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::config::{CounterConfig, CounterModel, CrowdConfig};
use crate::message::{ChatMessage, Origin, SentAt};

/// Default author pool.
pub const DEFAULT_NAMES: &[&str] = &[
    "Ali", "Zahra", "Mohammad", "Fatemeh", "Hossein", "Maryam", "Reza", "Sara", "Amir", "Negin",
    "Mahdi", "Samira", "Sina", "Mahsa", "Arman", "Narges", "Parisa", "Kamran", "Elham", "Saeed",
    "Niloufar", "Shayan", "Farzaneh", "Pouyan", "Shadi", "Yaser", "Neda", "Aida", "Shahab", "Farhad",
];

/// Default body pool.
pub const DEFAULT_PHRASES: &[&str] = &[
    "This session is fantastic! 🔥",
    "Ready to start, 100% motivated ✊",
    "Best investment I've made, great returns 📈",
    "Teaching quality is excellent ⭐",
    "Really inspiring session, thank you 🙏",
    "Starting tomorrow!",
    "How can I get in touch with you? 📱",
    "Six months in and the results are great 💪",
    "Support was very helpful, thanks to the team",
    "All my questions got answered, great",
    "Waiting for the next webinar!",
    "Very practical and useful, thanks",
    "Everything was explained clearly",
    "Going forward with real motivation!",
];

/// Build the generator RNG: seeded when `seed` is set (mixed with `salt` so
/// independent streams differ), otherwise from OS entropy.
pub fn make_rng(seed: Option<u64>, salt: u64) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        None => StdRng::from_entropy(),
    }
}

// ---------------------------------------------------------------------------
// Filler messages
// ---------------------------------------------------------------------------

/// Produces batches of filler chat messages.
pub struct FillerGenerator<R> {
    names: Vec<String>,
    phrases: Vec<String>,
    batch_size: usize,
    spacing_ms: i64,
    batches: u64,
    rng: R,
}

impl<R: Rng> FillerGenerator<R> {
    pub fn new(cfg: &CrowdConfig, rng: R) -> Self {
        Self {
            names: cfg.names.clone(),
            phrases: cfg.phrases.clone(),
            batch_size: cfg.batch_size,
            spacing_ms: cfg.spacing_ms.max(0),
            batches: 0,
            rng,
        }
    }

    /// A fresh batch ending one spacing before `now_ms`, oldest first.
    ///
    /// Authors and bodies are drawn with replacement. Empty pools yield an
    /// empty batch.
    pub fn batch(&mut self, now_ms: i64) -> Vec<ChatMessage> {
        if self.names.is_empty() || self.phrases.is_empty() {
            return Vec::new();
        }
        self.batches += 1;
        let count = self.batch_size;
        (0..count)
            .map(|i| {
                let author = self.names[self.rng.gen_range(0..self.names.len())].clone();
                let body = self.phrases[self.rng.gen_range(0..self.phrases.len())].clone();
                let back = (count - i) as i64 * self.spacing_ms;
                ChatMessage {
                    id: format!("filler-{}-{}", self.batches, i),
                    author,
                    body,
                    sent_at: SentAt::from_ms(now_ms - back),
                    origin: Origin::Synthetic,
                    is_privileged: false,
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// A floor-bounded random counter with a jittered update interval.
pub struct CrowdCounter<R> {
    cfg: CounterConfig,
    value: u64,
    rng: R,
}

impl<R: Rng> CrowdCounter<R> {
    pub fn new(cfg: CounterConfig, rng: R) -> Self {
        let initial = match cfg.model {
            CounterModel::Jitter { base, .. } => base,
            CounterModel::RandomWalk { start, .. } => start,
        };
        let value = initial.max(cfg.floor);
        Self { cfg, value, rng }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Advance one tick and return the new value.
    pub fn step(&mut self) -> u64 {
        let floor = self.cfg.floor;
        self.value = match self.cfg.model {
            CounterModel::Jitter { base, spread } => {
                let s = spread as i64;
                let variation = if s == 0 { 0 } else { self.rng.gen_range(-s..s) };
                (base as i64 + variation).max(floor as i64) as u64
            }
            CounterModel::RandomWalk { rise_probability, max_step, .. } => {
                let change = self.rng.gen_range(1..=max_step.max(1));
                if self.rng.gen_bool(rise_probability.clamp(0.0, 1.0)) {
                    self.value.saturating_add(change)
                } else {
                    self.value.saturating_sub(change / 3).max(floor)
                }
            }
        };
        self.value
    }

    /// Random delay inside the configured band (inclusive).
    pub fn next_delay(&mut self) -> Duration {
        let lo = self.cfg.min_interval_ms;
        let hi = self.cfg.max_interval_ms.max(lo);
        Duration::from_millis(self.rng.gen_range(lo..=hi))
    }
}

impl<R: Rng + Send + 'static> CrowdCounter<R> {
    /// Run on its own timer until the returned handle is dropped or stopped.
    pub fn spawn(mut self) -> CounterHandle {
        let (tx, rx) = watch::channel(self.value);
        let name = self.cfg.name.clone();
        let task = tokio::spawn(async move {
            loop {
                let delay = self.next_delay();
                tokio::time::sleep(delay).await;
                let v = self.step();
                trace!(counter = %self.cfg.name, value = v, "crowd counter tick");
                if tx.send(v).is_err() {
                    break;
                }
            }
        });
        CounterHandle { name, rx, task }
    }
}

/// Owner of a running counter task. Dropping it stops the timer.
pub struct CounterHandle {
    name: String,
    rx: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl CounterHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current(&self) -> u64 {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.rx.clone()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for CounterHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crowd(batch_size: usize) -> CrowdConfig {
        CrowdConfig { batch_size, ..CrowdConfig::default() }
    }

    #[test]
    fn batch_has_configured_size_and_synthetic_origin() {
        let mut g = FillerGenerator::new(&crowd(10), make_rng(Some(1), 0));
        let batch = g.batch(1_000_000);
        assert_eq!(batch.len(), 10);
        assert!(batch.iter().all(|m| m.origin == Origin::Synthetic));
    }

    #[test]
    fn batch_timestamps_are_in_the_past_and_ascending() {
        let now = 10_000_000;
        let mut g = FillerGenerator::new(&crowd(10), make_rng(Some(2), 0));
        let batch = g.batch(now);
        assert!(batch.iter().all(|m| m.sort_key_ms() < now));
        assert!(batch.windows(2).all(|w| w[0].sort_key_ms() < w[1].sort_key_ms()));
        assert_eq!(batch[0].sort_key_ms(), now - 10 * 60_000);
        assert_eq!(batch[9].sort_key_ms(), now - 60_000);
    }

    #[test]
    fn batch_draws_from_pools() {
        let cfg = crowd(25);
        let mut g = FillerGenerator::new(&cfg, make_rng(Some(3), 0));
        for m in g.batch(0) {
            assert!(cfg.names.contains(&m.author));
            assert!(cfg.phrases.contains(&m.body));
        }
    }

    #[test]
    fn ids_are_unique_across_batches() {
        let mut g = FillerGenerator::new(&crowd(5), make_rng(Some(4), 0));
        let a = g.batch(0);
        let b = g.batch(0);
        let ids: std::collections::HashSet<_> = a.iter().chain(b.iter()).map(|m| m.id.clone()).collect();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn same_seed_same_batch() {
        let mut a = FillerGenerator::new(&crowd(8), make_rng(Some(7), 0));
        let mut b = FillerGenerator::new(&crowd(8), make_rng(Some(7), 0));
        assert_eq!(a.batch(500), b.batch(500));
    }

    #[test]
    fn empty_pool_yields_empty_batch() {
        let mut cfg = crowd(10);
        cfg.phrases.clear();
        let mut g = FillerGenerator::new(&cfg, make_rng(Some(1), 0));
        assert!(g.batch(0).is_empty());
    }

    #[test]
    fn jitter_counter_respects_floor_and_band() {
        let mut c = CrowdCounter::new(CounterConfig::online(), make_rng(Some(9), 0));
        for _ in 0..500 {
            let v = c.step();
            assert!(v >= 1_100, "below floor: {v}");
            assert!((1_100..1_300).contains(&v), "outside band: {v}");
        }
    }

    #[test]
    fn random_walk_never_below_floor() {
        let mut cfg = CounterConfig::viewers();
        cfg.model = CounterModel::RandomWalk { start: 2_000, rise_probability: 0.0, max_step: 15 };
        let mut c = CrowdCounter::new(cfg, make_rng(Some(10), 0));
        for _ in 0..1_000 {
            assert!(c.step() >= 2_000);
        }
    }

    #[test]
    fn like_counter_is_monotonic() {
        let mut c = CrowdCounter::new(CounterConfig::likes(), make_rng(Some(11), 0));
        let mut prev = c.value();
        for _ in 0..200 {
            let v = c.step();
            assert!(v > prev);
            assert!(v - prev <= 8);
            prev = v;
        }
    }

    #[test]
    fn next_delay_within_band() {
        let mut c = CrowdCounter::new(CounterConfig::online(), make_rng(Some(12), 0));
        for _ in 0..200 {
            let d = c.next_delay();
            assert!(d >= Duration::from_secs(20) && d <= Duration::from_secs(40));
        }
    }

    #[test]
    fn zero_spread_jitter_is_constant() {
        let mut cfg = CounterConfig::online();
        cfg.model = CounterModel::Jitter { base: 1_500, spread: 0 };
        let mut c = CrowdCounter::new(cfg, make_rng(Some(1), 0));
        assert_eq!(c.step(), 1_500);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_counter_publishes_on_timer() {
        let mut cfg = CounterConfig::likes();
        cfg.min_interval_ms = 1_000;
        cfg.max_interval_ms = 1_000;
        let handle = CrowdCounter::new(cfg, make_rng(Some(13), 0)).spawn();
        let start = handle.current();
        let mut rx = handle.subscribe();
        tokio::time::advance(Duration::from_millis(1_001)).await;
        rx.changed().await.unwrap();
        assert!(*rx.borrow() > start);
        handle.stop();
    }
}
