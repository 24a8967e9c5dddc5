//! Runtime configuration.
//!
//! Loaded from a TOML file in which every section is optional, then
//! overridden by `LIVECAST_*` environment variables and finally by CLI flags.
//!
//! ```toml
//! [gateway]
//! base_url = "http://127.0.0.1:8080/api"
//!
//! [sync]
//! poll_interval_ms = 3000
//! retry = { kind = "exponential", base_ms = 3000, factor = 2.0, max_ms = 60000 }
//!
//! [crowd]
//! enabled = true
//! batch_size = 10
//!
//! [playback]
//! mode = "on_demand"
//! staleness_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LivecastError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LivecastConfig {
    pub gateway: GatewayConfig,
    pub sync: SyncConfig,
    pub crowd: CrowdConfig,
    pub playback: PlaybackConfig,
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,
}

/// Remote chat service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL; `/chat` and `/webinar` are appended.
    pub base_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            connect_timeout_ms: 3_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// How remote fetch failures are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Wait a constant interval after every failure.
    Fixed { interval_ms: u64 },
    /// `base * factor^(failures-1)`, capped at `max_ms`.
    Exponential { base_ms: u64, factor: f64, max_ms: u64 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential { base_ms: 3_000, factor: 2.0, max_ms: 60_000 }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        match *self {
            RetryPolicy::Fixed { interval_ms } => Duration::from_millis(interval_ms),
            RetryPolicy::Exponential { base_ms, factor, max_ms } => {
                let exp = (failures - 1).min(32) as i32;
                let raw = base_ms as f64 * factor.max(1.0).powi(exp);
                Duration::from_millis(raw.min(max_ms as f64) as u64)
            }
        }
    }
}

/// Chat synchronization engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub poll_interval_ms: u64,
    /// Number of entries in the rendered view.
    pub visible_window: usize,
    /// Drop later entries whose id already appeared in the merged set.
    pub dedup_by_id: bool,
    /// A remote entry matching a local one (author + body) within this window
    /// is treated as the server echo of that local message. `0` disables.
    pub echo_window_ms: u64,
    /// Distance from the bottom, in pixels, that still counts as "at bottom".
    pub scroll_threshold_px: f64,
    pub retry: RetryPolicy,
    /// Author used for local messages when none is given.
    pub viewer_name: String,
    /// Author substituted for remote entries without one.
    pub default_author: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            visible_window: 15,
            dedup_by_id: true,
            echo_window_ms: 10_000,
            scroll_threshold_px: 50.0,
            retry: RetryPolicy::default(),
            viewer_name: "Guest".to_string(),
            default_author: "Viewer".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Shape of a crowd counter's random walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum CounterModel {
    /// Re-sampled around a fixed base every tick.
    Jitter { base: u64, spread: u64 },
    /// Cumulative walk that mostly rises.
    RandomWalk { start: u64, rise_probability: f64, max_step: u64 },
}

/// One synthetic counter (online people, attendance, viewers, likes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterConfig {
    pub name: String,
    #[serde(flatten)]
    pub model: CounterModel,
    pub floor: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl CounterConfig {
    pub fn online() -> Self {
        Self {
            name: "online".to_string(),
            model: CounterModel::Jitter { base: 1_200, spread: 100 },
            floor: 1_100,
            min_interval_ms: 20_000,
            max_interval_ms: 40_000,
        }
    }

    pub fn attendance() -> Self {
        Self {
            name: "attendance".to_string(),
            model: CounterModel::Jitter { base: 2_400, spread: 100 },
            floor: 2_300,
            min_interval_ms: 30_000,
            max_interval_ms: 60_000,
        }
    }

    pub fn viewers() -> Self {
        Self {
            name: "viewers".to_string(),
            model: CounterModel::RandomWalk { start: 2_347, rise_probability: 0.8, max_step: 15 },
            floor: 2_000,
            min_interval_ms: 3_000,
            max_interval_ms: 5_000,
        }
    }

    pub fn likes() -> Self {
        Self {
            name: "likes".to_string(),
            model: CounterModel::RandomWalk { start: 1_923, rise_probability: 1.0, max_step: 8 },
            floor: 0,
            min_interval_ms: 4_000,
            max_interval_ms: 7_000,
        }
    }
}

/// Crowd simulation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrowdConfig {
    pub enabled: bool,
    pub batch_size: usize,
    /// Gap between consecutive filler timestamps.
    pub spacing_ms: i64,
    /// Stop padding once the remote service returns real messages.
    pub exclude_filler_with_live_traffic: bool,
    /// Fixed seed for reproducible crowds; `None` seeds from entropy.
    pub seed: Option<u64>,
    pub names: Vec<String>,
    pub phrases: Vec<String>,
    pub counters: Vec<CounterConfig>,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            spacing_ms: 60_000,
            exclude_filler_with_live_traffic: false,
            seed: None,
            names: crate::synthetic::DEFAULT_NAMES.iter().map(|s| s.to_string()).collect(),
            phrases: crate::synthetic::DEFAULT_PHRASES.iter().map(|s| s.to_string()).collect(),
            counters: vec![
                CounterConfig::online(),
                CounterConfig::attendance(),
                CounterConfig::viewers(),
                CounterConfig::likes(),
            ],
        }
    }
}

/// How the resume offset is derived after a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// Fixed asset: resume at the saved offset unless the snapshot is stale.
    OnDemand,
    /// Continuously advancing broadcast: resume at saved offset + elapsed.
    Live,
}

/// Playback continuity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub mode: PlaybackMode,
    pub staleness_secs: u64,
    /// Minimum change in playback time worth a checkpoint write.
    pub checkpoint_granularity_secs: f64,
    pub checkpoint_interval_ms: u64,
    pub video_url: String,
    /// Length of the simulated stream used by the CLI; `None` never ends.
    pub simulated_duration_secs: Option<f64>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            mode: PlaybackMode::OnDemand,
            staleness_secs: 300,
            checkpoint_granularity_secs: 1.0,
            checkpoint_interval_ms: 1_000,
            video_url: "/video1.mp4".to_string(),
            simulated_duration_secs: Some(75.0 * 60.0),
        }
    }
}

impl PlaybackConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

/// Where session state is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file; `None` keeps state in memory only.
    pub path: Option<PathBuf>,
    /// Prefix for every persisted key.
    pub namespace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: Some(PathBuf::from("livecast-session.db")), namespace: "webinar".to_string() }
    }
}

/// Daily broadcast window, local time, `HH:MM`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub start: String,
    pub end: String,
    pub video_url: Option<String>,
}

/// Broadcast schedule settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub slots: Vec<SlotConfig>,
    /// Remaining time at which the closing notice is pinned.
    pub closing_notice_secs: i64,
    pub closing_notice: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            slots: vec![
                SlotConfig { start: "14:00".into(), end: "17:00".into(), video_url: None },
                SlotConfig { start: "18:00".into(), end: "22:00".into(), video_url: None },
            ],
            closing_notice_secs: 15 * 60,
            closing_notice: "Only 15 minutes left in this broadcast!".to_string(),
        }
    }
}

impl LivecastConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: LivecastConfig = toml::from_str(s)?;
        Ok(cfg)
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) => Self::from_toml_str(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(LivecastError::Config(format!("{}: {e}", path.display()))),
        }
    }

    /// Apply `LIVECAST_BASE_URL`, `LIVECAST_STORAGE_PATH` and `LIVECAST_VIEWER`.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|k| std::env::var(k).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(url) = get("LIVECAST_BASE_URL") {
            self.gateway.base_url = url;
        }
        if let Some(path) = get("LIVECAST_STORAGE_PATH") {
            self.storage.path = if path.is_empty() { None } else { Some(PathBuf::from(path)) };
        }
        if let Some(name) = get("LIVECAST_VIEWER") {
            self.sync.viewer_name = name;
        }
    }

    /// Reject settings that would stall timers or make the generator panic.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(LivecastError::Config(msg.to_string()));
        if self.sync.poll_interval_ms == 0 {
            return bad("sync.poll_interval_ms must be > 0");
        }
        if self.sync.visible_window == 0 {
            return bad("sync.visible_window must be > 0");
        }
        if self.playback.staleness_secs == 0 {
            return bad("playback.staleness_secs must be > 0");
        }
        if self.playback.checkpoint_interval_ms == 0 {
            return bad("playback.checkpoint_interval_ms must be > 0");
        }
        if self.crowd.enabled && (self.crowd.names.is_empty() || self.crowd.phrases.is_empty()) {
            return bad("crowd.names and crowd.phrases must be non-empty when crowd is enabled");
        }
        if self.crowd.spacing_ms < 0 {
            return bad("crowd.spacing_ms must be >= 0");
        }
        for c in &self.crowd.counters {
            if c.min_interval_ms == 0 || c.min_interval_ms > c.max_interval_ms {
                return Err(LivecastError::Config(format!(
                    "counter '{}': interval band must satisfy 0 < min <= max",
                    c.name
                )));
            }
            if let CounterModel::RandomWalk { rise_probability, .. } = c.model {
                if !(0.0..=1.0).contains(&rise_probability) {
                    return Err(LivecastError::Config(format!(
                        "counter '{}': rise_probability must be within [0, 1]",
                        c.name
                    )));
                }
            }
        }
        match self.sync.retry {
            RetryPolicy::Fixed { interval_ms } if interval_ms == 0 => {
                return bad("sync.retry.interval_ms must be > 0");
            }
            RetryPolicy::Exponential { base_ms, max_ms, .. } if base_ms == 0 || max_ms < base_ms => {
                return bad("sync.retry must satisfy 0 < base_ms <= max_ms");
            }
            _ => {}
        }
        for slot in &self.schedule.slots {
            crate::schedule::BroadcastSlot::try_from(slot)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        LivecastConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = LivecastConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.sync.poll_interval_ms, 3_000);
        assert_eq!(cfg.sync.visible_window, 15);
        assert_eq!(cfg.crowd.batch_size, 10);
        assert_eq!(cfg.playback.staleness_secs, 300);
        assert_eq!(cfg.playback.mode, PlaybackMode::OnDemand);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let cfg = LivecastConfig::from_toml_str(
            r#"
            [playback]
            mode = "live"

            [sync]
            retry = { kind = "fixed", interval_ms = 5000 }

            [crowd]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.playback.mode, PlaybackMode::Live);
        assert_eq!(cfg.playback.staleness_secs, 300);
        assert_eq!(cfg.sync.retry, RetryPolicy::Fixed { interval_ms: 5_000 });
        assert!(!cfg.crowd.enabled);
        assert_eq!(cfg.crowd.batch_size, 10);
    }

    #[test]
    fn counters_parse_with_flattened_model() {
        let cfg = LivecastConfig::from_toml_str(
            r#"
            [[crowd.counters]]
            name = "online"
            model = "jitter"
            base = 500
            spread = 20
            floor = 450
            min_interval_ms = 1000
            max_interval_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.crowd.counters.len(), 1);
        assert_eq!(cfg.crowd.counters[0].model, CounterModel::Jitter { base: 500, spread: 20 });
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let mut cfg = LivecastConfig::default();
        cfg.sync.poll_interval_ms = 0;
        assert!(matches!(cfg.validate(), Err(LivecastError::Config(_))));
    }

    #[test]
    fn validate_rejects_inverted_counter_band() {
        let mut cfg = LivecastConfig::default();
        cfg.crowd.counters[0].min_interval_ms = 50_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_pools_only_when_enabled() {
        let mut cfg = LivecastConfig::default();
        cfg.crowd.names.clear();
        assert!(cfg.validate().is_err());
        cfg.crowd.enabled = false;
        cfg.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_slot() {
        let mut cfg = LivecastConfig::default();
        cfg.schedule.slots[0].start = "25:99".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("LIVECAST_BASE_URL", "http://chat.example/api"),
            ("LIVECAST_STORAGE_PATH", ""),
            ("LIVECAST_VIEWER", "Sara"),
        ]
        .into_iter()
        .collect();
        let mut cfg = LivecastConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.gateway.base_url, "http://chat.example/api");
        assert!(cfg.storage.path.is_none());
        assert_eq!(cfg.sync.viewer_name, "Sara");
    }

    #[test]
    fn exponential_retry_grows_and_caps() {
        let p = RetryPolicy::Exponential { base_ms: 1_000, factor: 2.0, max_ms: 5_000 };
        assert_eq!(p.delay_after(0), Duration::ZERO);
        assert_eq!(p.delay_after(1), Duration::from_millis(1_000));
        assert_eq!(p.delay_after(2), Duration::from_millis(2_000));
        assert_eq!(p.delay_after(3), Duration::from_millis(4_000));
        assert_eq!(p.delay_after(4), Duration::from_millis(5_000));
        assert_eq!(p.delay_after(40), Duration::from_millis(5_000));
    }

    #[test]
    fn fixed_retry_is_constant() {
        let p = RetryPolicy::Fixed { interval_ms: 750 };
        assert_eq!(p.delay_after(1), p.delay_after(9));
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LivecastConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.storage.namespace, "webinar");
    }
}
