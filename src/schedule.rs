//! Broadcast schedule: countdown to the webinar, the daily on-air slots, and
//! the pinned "closing soon" notice.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ScheduleConfig, SlotConfig};
use crate::error::LivecastError;

/// Session metadata as returned by `GET <base>/webinar`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebinarSchedule {
    pub title: String,
    #[serde(alias = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(alias = "endTime")]
    pub end_time: DateTime<Utc>,
    #[serde(default, alias = "isLive")]
    pub is_live: bool,
    #[serde(default, alias = "videoUrl")]
    pub video_url: Option<String>,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default, alias = "registeredCount")]
    pub registered_count: Option<u32>,
}

/// Where a scheduled session is relative to `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Upcoming { starts_in_secs: i64 },
    Live { remaining_secs: i64 },
    Ended,
}

impl WebinarSchedule {
    /// Seconds until start, never negative.
    pub fn countdown_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.start_time - now).num_seconds().max(0)
    }

    /// Seconds until end, never negative.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time - now).num_seconds().max(0)
    }

    pub fn phase(&self, now: DateTime<Utc>) -> SessionPhase {
        if now < self.start_time {
            SessionPhase::Upcoming { starts_in_secs: self.countdown_secs(now) }
        } else if now < self.end_time {
            SessionPhase::Live { remaining_secs: self.remaining_secs(now) }
        } else {
            SessionPhase::Ended
        }
    }

    /// Remaining seats, when the service reports both numbers.
    pub fn seats_left(&self) -> Option<u32> {
        Some(self.capacity?.saturating_sub(self.registered_count?))
    }
}

/// `HH:MM:SS`; hours grow past 24 rather than wrapping.
pub fn format_hms(secs: i64) -> String {
    let s = secs.max(0);
    format!("{:02}:{:02}:{:02}", s / 3_600, (s % 3_600) / 60, s % 60)
}

/// Whether the closing notice should be pinned.
pub fn closing_notice_due(remaining_secs: i64, threshold_secs: i64) -> bool {
    remaining_secs > 0 && remaining_secs <= threshold_secs
}

// ---------------------------------------------------------------------------
// Daily slots
// ---------------------------------------------------------------------------

/// A daily on-air window in local time, `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastSlot {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub video_url: Option<String>,
}

fn parse_hm(raw: &str) -> Result<NaiveTime, LivecastError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| LivecastError::Config(format!("slot time '{raw}': {e}")))
}

impl TryFrom<&SlotConfig> for BroadcastSlot {
    type Error = LivecastError;

    fn try_from(cfg: &SlotConfig) -> Result<Self, Self::Error> {
        let start = parse_hm(&cfg.start)?;
        let end = parse_hm(&cfg.end)?;
        if start >= end {
            return Err(LivecastError::Config(format!(
                "slot {}-{} must start before it ends",
                cfg.start, cfg.end
            )));
        }
        Ok(Self { start, end, video_url: cfg.video_url.clone() })
    }
}

impl BroadcastSlot {
    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }

    pub fn seconds_left(&self, t: NaiveTime) -> i64 {
        (self.end - t).num_seconds().max(0)
    }

    pub fn minutes_left(&self, t: NaiveTime) -> i64 {
        (self.end - t).num_minutes().max(0)
    }
}

/// On-air state at a given time of day.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotStatus<'a> {
    OffAir { next_start: Option<NaiveTime> },
    OnAir { slot: &'a BroadcastSlot, seconds_left: i64, notice: Option<&'a str> },
}

/// The configured set of daily slots.
#[derive(Debug, Clone)]
pub struct BroadcastCalendar {
    slots: Vec<BroadcastSlot>,
    closing_notice_secs: i64,
    closing_notice: String,
}

impl BroadcastCalendar {
    pub fn from_config(cfg: &ScheduleConfig) -> Result<Self, LivecastError> {
        let mut slots = cfg.slots.iter().map(BroadcastSlot::try_from).collect::<Result<Vec<_>, _>>()?;
        slots.sort_by_key(|s| s.start);
        Ok(Self {
            slots,
            closing_notice_secs: cfg.closing_notice_secs,
            closing_notice: cfg.closing_notice.clone(),
        })
    }

    pub fn slots(&self) -> &[BroadcastSlot] {
        &self.slots
    }

    pub fn active_slot(&self, t: NaiveTime) -> Option<&BroadcastSlot> {
        self.slots.iter().find(|s| s.contains(t))
    }

    pub fn minutes_left_in_slot(&self, t: NaiveTime) -> Option<i64> {
        self.active_slot(t).map(|s| s.minutes_left(t))
    }

    /// Crowd simulation runs only while a slot is on air.
    pub fn crowd_active(&self, t: NaiveTime) -> bool {
        self.active_slot(t).is_some()
    }

    pub fn status(&self, t: NaiveTime) -> SlotStatus<'_> {
        match self.active_slot(t) {
            Some(slot) => {
                let seconds_left = slot.seconds_left(t);
                let notice = closing_notice_due(seconds_left, self.closing_notice_secs)
                    .then_some(self.closing_notice.as_str());
                SlotStatus::OnAir { slot, seconds_left, notice }
            }
            None => SlotStatus::OffAir {
                next_start: self
                    .slots
                    .iter()
                    .map(|s| s.start)
                    .find(|start| *start > t)
                    .or_else(|| self.slots.first().map(|s| s.start)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn calendar() -> BroadcastCalendar {
        BroadcastCalendar::from_config(&ScheduleConfig::default()).unwrap()
    }

    #[test]
    fn schedule_parses_service_shape() {
        let raw = r#"{
            "title": "Growth Webinar",
            "start_time": "2024-05-01T10:00:00Z",
            "end_time": "2024-05-01T11:15:00Z",
            "video_url": "/video1.mp4",
            "capacity": 500,
            "registered_count": 320,
            "is_live": true
        }"#;
        let s: WebinarSchedule = serde_json::from_str(raw).unwrap();
        assert!(s.is_live);
        assert_eq!(s.seats_left(), Some(180));
        let now = s.start_time - chrono::Duration::seconds(90);
        assert_eq!(s.countdown_secs(now), 90);
        assert_eq!(s.phase(now), SessionPhase::Upcoming { starts_in_secs: 90 });
        assert_eq!(s.phase(s.end_time), SessionPhase::Ended);
    }

    #[rstest]
    #[case(0, "00:00:00")]
    #[case(59, "00:00:59")]
    #[case(3_661, "01:01:01")]
    #[case(-5, "00:00:00")]
    #[case(90_000, "25:00:00")]
    fn hms_formatting(#[case] secs: i64, #[case] expected: &str) {
        assert_eq!(format_hms(secs), expected);
    }

    #[rstest]
    #[case(hm(13, 59), false)]
    #[case(hm(14, 0), true)]
    #[case(hm(16, 59), true)]
    #[case(hm(17, 0), false)]
    #[case(hm(19, 30), true)]
    #[case(hm(23, 0), false)]
    fn default_slots(#[case] t: NaiveTime, #[case] on_air: bool) {
        assert_eq!(calendar().crowd_active(t), on_air);
    }

    #[test]
    fn minutes_left_and_notice() {
        let cal = calendar();
        assert_eq!(cal.minutes_left_in_slot(hm(16, 30)), Some(30));
        assert_eq!(cal.minutes_left_in_slot(hm(12, 0)), None);
        match cal.status(hm(21, 50)) {
            SlotStatus::OnAir { seconds_left, notice, .. } => {
                assert_eq!(seconds_left, 600);
                assert!(notice.is_some());
            }
            other => panic!("expected on air, got {other:?}"),
        }
        match cal.status(hm(20, 0)) {
            SlotStatus::OnAir { notice, .. } => assert!(notice.is_none()),
            other => panic!("expected on air, got {other:?}"),
        }
    }

    #[test]
    fn off_air_reports_next_start() {
        let cal = calendar();
        assert_eq!(cal.status(hm(17, 30)), SlotStatus::OffAir { next_start: Some(hm(18, 0)) });
        assert_eq!(cal.status(hm(23, 0)), SlotStatus::OffAir { next_start: Some(hm(14, 0)) });
    }

    #[test]
    fn inverted_slot_is_rejected() {
        let cfg = SlotConfig { start: "18:00".into(), end: "09:00".into(), video_url: None };
        assert!(BroadcastSlot::try_from(&cfg).is_err());
    }
}
